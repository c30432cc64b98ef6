use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use axum_server::tls_rustls::RustlsConfig;
use log::info;
use prometheus::{Encoder, TextEncoder};

use crate::config::WebhookSection;
use crate::webhook::{self, WebhookState};

/// Prometheus text endpoint plus a liveness probe.
pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(|| async { "ok" }))
}

async fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return format!("# failed to encode metrics: {e}\n");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub async fn serve_metrics(addr: String) -> Result<()> {
    let addr: SocketAddr = addr.parse().context("invalid metrics address")?;
    info!("metrics listening on {addr}");
    axum_server::bind(addr)
        .serve(metrics_router().into_make_service())
        .await
        .context("metrics server failed")
}

/// The admission webhook listener; HTTPS when certificates are configured.
pub async fn serve_webhook(section: WebhookSection, state: WebhookState) -> Result<()> {
    let addr: SocketAddr = section.addr.parse().context("invalid webhook address")?;
    let app = webhook::router(state);
    match (&section.tls_cert_file, &section.tls_key_file) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("failed to load webhook TLS material")?;
            info!("admission webhook listening on {addr} (TLS)");
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await
                .context("webhook server failed")
        }
        _ => {
            info!("admission webhook listening on {addr} (plaintext)");
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await
                .context("webhook server failed")
        }
    }
}
