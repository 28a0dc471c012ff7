use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::eyre;
use tracing_subscriber::EnvFilter;

use retune_service::{Collaborators, Orchestrator};
use retune_storage::jsonl::JsonlStore;

#[derive(Debug, Parser)]
#[command(
	version = retune_cli::VERSION,
	rename_all = "kebab",
	styles = retune_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	/// Run the tuning workflow once, print its report, and exit.
	#[arg(long)]
	pub once: bool,
	/// Overrides `workflow.window_days`.
	#[arg(long, value_name = "DAYS")]
	pub window_days: Option<u32>,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = retune_config::load(&args.config)?;

	init_tracing(&config);

	let store = Arc::new(JsonlStore::open(&config.storage.path).await?);
	let orchestrator = Arc::new(Orchestrator::new(&config, Collaborators::from_store(store)));

	if orchestrator.restore_policies().await? {
		tracing::info!(path = %config.storage.path.display(), "Loaded persisted policies.");
	}

	if args.once {
		let window_days = args.window_days.unwrap_or(config.workflow.window_days);
		let report = orchestrator.run_workflow(window_days).await?;

		println!("{}", serde_json::to_string_pretty(&report)?);

		if !report.succeeded() {
			return Err(eyre::eyre!("Policy tuning run failed: {}", report.errors.join("; ")));
		}

		return Ok(());
	}

	orchestrator.start();

	tracing::info!(
		interval_secs = config.workflow.interval_secs,
		window_days = config.workflow.window_days,
		"Tuning worker started."
	);

	tokio::signal::ctrl_c().await?;

	tracing::info!("Shutdown requested. Stopping tuning worker.");

	orchestrator.stop().await;

	Ok(())
}

fn init_tracing(config: &retune_config::Config) {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();
}
