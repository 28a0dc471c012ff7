use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = retune_worker::Args::parse();

	retune_worker::run(args).await
}
