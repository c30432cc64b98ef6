mod cli;
mod config;
mod scheduler;
mod serve;
mod store;
mod webhook;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use libnexus::with_store::{StoreConfig, run_scheduler_with_store};
use log::{error, info};
use tokio::sync::mpsc;

use crate::config::load_config;
use crate::scheduler::SchedulerRunner;
use crate::store::NexusStore;
use crate::webhook::WebhookState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::init();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config.to_str().unwrap())?;
            let scheduler_name = cfg.scheduler_name();
            info!("starting scheduler {scheduler_name}");

            let store = Arc::new(
                NexusStore::new(&cfg.store)
                    .await
                    .context("failed to create store client")?,
            );

            let (unassume_tx, unassume_rx) = mpsc::unbounded_channel();
            let (pipeline, events_rx) = run_scheduler_with_store(
                StoreConfig {
                    endpoints: cfg.store.endpoints.clone(),
                    scheduler_name: scheduler_name.clone(),
                },
                cfg.settings(),
                cfg.plugins(),
                cfg.scoring_strategy(),
                cfg.zone_count_mode(),
                unassume_rx,
            )
            .await
            .context("failed to start scheduling pipeline")?;

            SchedulerRunner::new(events_rx, unassume_tx, store.clone()).run();

            if let Some(addr) = cfg.metrics_addr.clone() {
                tokio::spawn(async move {
                    if let Err(e) = serve::serve_metrics(addr).await {
                        error!("metrics endpoint exited: {e:?}");
                    }
                });
            }
            if let Some(webhook_cfg) = cfg.webhook.clone() {
                let state = WebhookState {
                    listers: pipeline.listers(),
                };
                tokio::spawn(async move {
                    if let Err(e) = serve::serve_webhook(webhook_cfg, state).await {
                        error!("admission webhook exited: {e:?}");
                    }
                });
            }

            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for shutdown signal")?;
                }
                _ = sigterm.recv() => {}
            }
            info!("shutdown signal received; draining");
            pipeline.shutdown().await;
            info!("scheduler {scheduler_name} stopped");
        }
    }

    Ok(())
}
