use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use libnexus::plugins::node_resources_fit::ScoringStrategy;
use libnexus::plugins::zone_spread::ZoneCountMode;
use libnexus::plugins::{PluginInfo, Plugins};
use libnexus::scheduler::SchedulerSettings;
use serde::Deserialize;

pub const DEFAULT_SCHEDULER_NAME: &str = "kube-nexus";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Pods name this scheduler via `spec.schedulerName`.
    #[serde(default)]
    pub scheduler_name: Option<String>,
    pub store: StoreSection,
    /// ip:port of the Prometheus metrics endpoint.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// Admission webhook listener; absent disables the webhook.
    #[serde(default)]
    pub webhook: Option<WebhookSection>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub permit_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    #[serde(default)]
    pub queue_burst: Option<u32>,
    #[serde(default)]
    pub scoring_strategy: Option<String>,
    #[serde(default)]
    pub zone_count_mode: Option<String>,
    #[serde(default)]
    pub plugins: Option<PluginsSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSection {
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSection {
    pub addr: String,
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginsSection {
    #[serde(default)]
    pub pre_filter: Option<Vec<PluginEntry>>,
    #[serde(default)]
    pub filter: Option<Vec<PluginEntry>>,
    #[serde(default)]
    pub post_filter: Option<Vec<PluginEntry>>,
    #[serde(default)]
    pub score: Option<Vec<PluginEntry>>,
    #[serde(default)]
    pub permit: Option<Vec<PluginEntry>>,
    #[serde(default)]
    pub post_bind: Option<Vec<PluginEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub weight: Option<i64>,
}

impl Config {
    pub fn scheduler_name(&self) -> String {
        self.scheduler_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SCHEDULER_NAME.to_string())
    }

    pub fn settings(&self) -> SchedulerSettings {
        let defaults = SchedulerSettings::default();
        SchedulerSettings {
            workers: self.workers.unwrap_or(defaults.workers),
            permit_timeout: self
                .permit_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.permit_timeout),
            max_parallelism: self.max_parallelism.unwrap_or(defaults.max_parallelism),
            queue_burst: self.queue_burst,
        }
    }

    pub fn scoring_strategy(&self) -> ScoringStrategy {
        match self.scoring_strategy.as_deref() {
            Some("mostAllocated") => ScoringStrategy::MostAllocated,
            _ => ScoringStrategy::LeastAllocated,
        }
    }

    pub fn zone_count_mode(&self) -> ZoneCountMode {
        match self.zone_count_mode.as_deref() {
            Some("podCount") => ZoneCountMode::PodCount,
            _ => ZoneCountMode::NodeCount,
        }
    }

    /// The enabled plugin set: configured phases replace the defaults,
    /// omitted phases keep them.
    pub fn plugins(&self) -> Plugins {
        let mut plugins = Plugins::default();
        let Some(section) = &self.plugins else {
            return plugins;
        };
        let convert = |entries: &Vec<PluginEntry>| -> Vec<PluginInfo> {
            entries
                .iter()
                .map(|e| match e.weight {
                    Some(weight) => PluginInfo::with_weight(&e.name, weight),
                    None => PluginInfo::new(&e.name),
                })
                .collect()
        };
        if let Some(entries) = &section.pre_filter {
            plugins.pre_filter = convert(entries);
        }
        if let Some(entries) = &section.filter {
            plugins.filter = convert(entries);
        }
        if let Some(entries) = &section.post_filter {
            plugins.post_filter = convert(entries);
        }
        if let Some(entries) = &section.score {
            plugins.score = convert(entries);
        }
        if let Some(entries) = &section.permit {
            plugins.permit = convert(entries);
        }
        if let Some(entries) = &section.post_bind {
            plugins.post_bind = convert(entries);
        }
        plugins
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg: Config = serde_yaml::from_str(
            r#"
store:
  endpoints: ["http://127.0.0.1:2379"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler_name(), DEFAULT_SCHEDULER_NAME);
        let settings = cfg.settings();
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.permit_timeout, Duration::from_secs(60));
        assert!(settings.queue_burst.is_none());
        assert_eq!(cfg.plugins().score.len(), Plugins::default().score.len());
    }

    #[test]
    fn test_full_config_overrides() {
        let cfg: Config = serde_yaml::from_str(
            r#"
schedulerName: kube-nexus-staging
store:
  endpoints: ["http://xline-0:2379", "http://xline-1:2379"]
metricsAddr: "0.0.0.0:9090"
webhook:
  addr: "0.0.0.0:9443"
  tlsCertFile: /etc/webhook/tls.crt
  tlsKeyFile: /etc/webhook/tls.key
workers: 4
permitTimeoutSeconds: 120
maxParallelism: 8
queueBurst: 50
scoringStrategy: mostAllocated
zoneCountMode: podCount
plugins:
  score:
    - name: ResourceFragmentation
      weight: 3
    - name: TenantHardwareAffinity
      weight: 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler_name(), "kube-nexus-staging");
        let settings = cfg.settings();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.permit_timeout, Duration::from_secs(120));
        assert_eq!(settings.max_parallelism, 8);
        assert_eq!(settings.queue_burst, Some(50));
        assert_eq!(cfg.scoring_strategy(), ScoringStrategy::MostAllocated);
        assert_eq!(cfg.zone_count_mode(), ZoneCountMode::PodCount);

        let plugins = cfg.plugins();
        assert_eq!(plugins.score.len(), 2);
        assert_eq!(plugins.score[0].name, "ResourceFragmentation");
        assert_eq!(plugins.score[0].weight, 3);
        // Unconfigured phases keep the defaults.
        assert_eq!(plugins.filter.len(), Plugins::default().filter.len());
    }
}
