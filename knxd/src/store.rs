use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use common::event::{Event, ObjectReference};
use common::pod::ObjectMeta;
use common::{Namespace, PodTask};
use etcd_client::{Client, ConnectOptions};
use tokio::sync::Mutex;

use crate::config::StoreSection;

const PODS_PREFIX: &str = "/registry/pods/";
const NAMESPACES_PREFIX: &str = "/registry/namespaces/";
const EVENTS_PREFIX: &str = "/registry/events/";

/// Write-side store client: pod bindings, scheduling events, namespace
/// reads for the admission webhook.
pub struct NexusStore {
    client: Mutex<Client>,
}

impl NexusStore {
    pub async fn new(section: &StoreSection) -> Result<Self> {
        let endpoints: Vec<&str> = section.endpoints.iter().map(String::as_str).collect();
        let options = match (&section.username, &section.password) {
            (Some(user), Some(password)) => Some(ConnectOptions::new().with_user(user, password)),
            _ => None,
        };
        let client = Client::connect(&endpoints, options)
            .await
            .context("failed to connect to the store")?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    pub async fn get_pod(&self, pod_key: &str) -> Result<Option<PodTask>> {
        let key = format!("{PODS_PREFIX}{pod_key}");
        let mut client = self.client.lock().await;
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_yaml::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    /// Commit a binding: write `spec.nodeName` on the stored pod.
    pub async fn bind_pod(&self, pod_key: &str, node_name: &str) -> Result<()> {
        let mut pod = self
            .get_pod(pod_key)
            .await?
            .ok_or_else(|| anyhow!("pod {pod_key} vanished before bind"))?;
        if let Some(current) = pod.spec.node_name.as_deref()
            && !current.is_empty()
            && current != node_name
        {
            return Err(anyhow!(
                "pod {pod_key} already bound to {current}, refusing to rebind to {node_name}"
            ));
        }
        pod.spec.node_name = Some(node_name.to_string());

        let key = format!("{PODS_PREFIX}{pod_key}");
        let payload = serde_yaml::to_string(&pod)?;
        let mut client = self.client.lock().await;
        client.put(key, payload, None).await?;
        Ok(())
    }

    pub async fn namespace_labels(
        &self,
        name: &str,
    ) -> Result<Option<std::collections::HashMap<String, String>>> {
        let key = format!("{NAMESPACES_PREFIX}{name}");
        let mut client = self.client.lock().await;
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => {
                let ns: Namespace = serde_yaml::from_slice(kv.value())?;
                Ok(Some(ns.metadata.labels))
            }
            None => Ok(None),
        }
    }

    /// Surface a scheduling outcome as an event attached to the pod.
    pub async fn put_event(
        &self,
        pod_key: &str,
        reason: &str,
        message: &str,
        event_type: &str,
    ) -> Result<()> {
        let (namespace, pod_name) = pod_key
            .split_once('/')
            .unwrap_or(("default", pod_key));
        let now = Utc::now();
        let event_name = format!("{pod_name}.{:x}", now.timestamp_nanos_opt().unwrap_or(0));
        let event = Event {
            api_version: "v1".to_string(),
            kind: "Event".to_string(),
            metadata: ObjectMeta {
                name: event_name.clone(),
                namespace: namespace.to_string(),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: "Pod".to_string(),
                namespace: namespace.to_string(),
                name: pod_name.to_string(),
                uid: None,
            },
            reason: reason.to_string(),
            message: message.to_string(),
            event_type: event_type.to_string(),
            last_timestamp: Some(now),
        };
        let key = format!("{EVENTS_PREFIX}{namespace}/{event_name}");
        let payload = serde_yaml::to_string(&event)?;
        let mut client = self.client.lock().await;
        client.put(key, payload, None).await?;
        Ok(())
    }
}
