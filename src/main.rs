//! `runpod-warden` CLI.
//!
//! Thin shell over the [`runpod_warden::RunPod`] facade: start an instance's
//! pod, run prune passes, refresh stats snapshots, and inspect guardrails.
//!
//! ## Usage
//!
//! ```text
//! runpod-warden start pymupdf
//! runpod-warden prune pymupdf
//! runpod-warden stats pymupdf
//! runpod-warden list
//! runpod-warden guardrails --check
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI output

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use runpod_warden::runpod_config::schedule_minutes;
use runpod_warden::{
    PruneOutcome, RunPod, RunpodClient, RunpodClientConfig, RunpodConfig, StartRequest,
};

#[derive(Parser)]
#[command(name = "runpod-warden", version, about = "RunPod pod control plane")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short = 'c', default_value = "runpod.toml", env = "RUNPOD_WARDEN_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ensure an instance's pod is up and print its URL.
    Start {
        /// Configured instance name.
        instance: String,
        /// Caller identity for state-file scoping.
        #[arg(long)]
        nickname: Option<String>,
    },
    /// Terminate pods idle past their inactivity threshold.
    Prune {
        /// Limit the pass to one instance; default is every instance.
        instance: Option<String>,
    },
    /// Refresh and print the stats snapshot for an instance.
    Stats {
        /// Limit to one instance; default is every instance.
        instance: Option<String>,
    },
    /// List configured instances.
    List,
    /// Inspect the usage guardrails.
    Guardrails {
        /// Evict the shared usage cache first.
        #[arg(long)]
        clear: bool,
        /// Validate current usage against the configured limits.
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunpodConfig::load(&cli.config)?;
    let client = RunpodClient::new(RunpodClientConfig::from_config(&config)?)?;
    let runpod = RunPod::new(config, Arc::new(client));

    match cli.command {
        Command::Start { instance, nickname } => {
            let mut request = StartRequest::new(&instance);
            if let Some(nickname) = nickname {
                request = request.nickname(nickname);
            }
            match runpod.start(&request).await? {
                Some(pod) => {
                    println!("Pod {} is up for instance '{instance}'", pod.pod_id);
                    println!("  {}", pod.url);
                    Ok(())
                }
                None => Err(format!(
                    "no pod could be ensured for instance '{instance}'; \
                     check image_name and the logs above"
                )
                .into()),
            }
        }

        Command::Prune { instance } => {
            let names = instance_selection(&runpod, instance);
            for name in names {
                match runpod.prune(&name).await? {
                    PruneOutcome::Pruned => println!("{name}: pruned inactive pod"),
                    PruneOutcome::StillActive => println!("{name}: pod still active"),
                    PruneOutcome::NothingToPrune => println!("{name}: nothing to prune"),
                }
            }
            Ok(())
        }

        Command::Stats { instance } => {
            let names = instance_selection(&runpod, instance);
            for name in names {
                match runpod.stats(&name).await? {
                    Some(snapshot) => {
                        let status = snapshot
                            .pod
                            .desiredStatus
                            .as_deref()
                            .unwrap_or("UNKNOWN");
                        println!(
                            "{name}: pod {} [{status}], prune in {}",
                            snapshot.pod.id, snapshot.time_until_prune
                        );
                    }
                    None => println!("{name}: no tracked pod"),
                }
            }
            Ok(())
        }

        Command::List => {
            let config = runpod.config();
            let mut names: Vec<_> = config.instances.keys().cloned().collect();
            names.sort();
            if names.is_empty() {
                println!("no instances configured");
                return Ok(());
            }
            for name in names {
                let pod = config.merged_pod_config(Some(&name))?;
                let schedule = config
                    .instances
                    .get(&name)
                    .and_then(|i| i.prune_schedule.as_deref())
                    .unwrap_or(&config.prune_schedule);
                println!(
                    "{name}: image={} prune=every {}m idle-threshold={}m",
                    pod.image_name.as_deref().unwrap_or("<unset>"),
                    schedule_minutes(schedule),
                    pod.inactivity_minutes
                );
            }
            Ok(())
        }

        Command::Guardrails { clear, check } => {
            if clear {
                runpod.clear_usage_cache();
                println!("usage cache cleared");
            }
            let usage = runpod.usage().await;
            println!(
                "pods={} running={} endpoints={} workers={} volumes={} storage={:.0}GB",
                usage.pods_count,
                usage.pods_running_count,
                usage.endpoints_count,
                usage.workers_total,
                usage.network_volumes_count,
                usage.storage_total_gb
            );
            if check {
                runpod.check_guardrails().await?;
                println!("all guardrails pass");
            }
            Ok(())
        }
    }
}

/// Resolve an optional instance argument to the list of instances to act on.
fn instance_selection(runpod: &RunPod, instance: Option<String>) -> Vec<String> {
    match instance {
        Some(name) => vec![name],
        None => {
            let mut names: Vec<_> = runpod.config().instances.keys().cloned().collect();
            names.sort();
            names
        }
    }
}
