//! CLI command handling
//!
//! Dispatches CLI commands and formats their output.

use std::path::Path;
use std::sync::Arc;

use colored::Colorize;

use crate::cluster::list_members;
use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::ctl::{EtcdctlClient, EtcdctlFactory};
use crate::scenario::{Scenario, ScenarioSpec};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            scenario,
            config,
            keep_data,
        } => {
            let config = load_config(config.as_deref())?;
            let spec = match scenario {
                Some(path) => ScenarioSpec::load(&path)?,
                None => ScenarioSpec::default(),
            };

            let etcd = config.binaries.etcd()?;
            let etcdctl = config.binaries.etcdctl()?;
            tracing::debug!(etcd = %etcd.display(), etcdctl = %etcdctl.display(), "Resolved binaries");

            let clients = Arc::new(EtcdctlFactory::new(
                etcdctl,
                config.timeouts.command(),
                config.env.clone(),
            ));
            let scenario = Scenario::new(spec, config, etcd, clients).keep_data(keep_data);

            let cancel = scenario.cancel_token();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, stopping processes");
                    cancel.cancel();
                }
            });

            let report = scenario.run().await;
            interrupt.abort();
            let report = report?;

            for dir in &report.kept_data_dirs {
                println!("Kept data directory: {}", dir.display());
            }

            if report.passed {
                println!(
                    "{} {}/{} steps",
                    "Passed:".green(),
                    report.steps_run,
                    report.steps_total
                );
                Ok(())
            } else {
                report.print_failure();
                Err(Error::ScenarioFailed {
                    name: report.name.clone(),
                    step: report
                        .failed_step
                        .map(|s| format!("{} ({})", s.number(), s))
                        .unwrap_or_else(|| "unknown".to_string()),
                })
            }
        }

        Commands::Members { endpoints, config } => {
            let config = load_config(config.as_deref())?;
            let client = EtcdctlClient::new(
                config.binaries.etcdctl()?,
                &endpoints,
                config.timeouts.command(),
            )
            .with_env(config.env.clone());

            let members = list_members(&client).await?;
            if members.is_empty() {
                println!("No members");
                return Ok(());
            }

            println!(
                "{:<18} {:<12} {:<30} {}",
                "ID".bold(),
                "NAME".bold(),
                "PEER URLS".bold(),
                "CLIENT URLS".bold()
            );
            for m in &members {
                let name = if m.name.is_empty() {
                    "(unstarted)".dimmed().to_string()
                } else {
                    m.name.clone()
                };
                println!(
                    "{:<18x} {:<12} {:<30} {}",
                    m.id,
                    name,
                    m.peer_urls.join(","),
                    m.client_urls.join(",")
                );
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}
