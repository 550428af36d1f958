use anyhow::Result;
use clap::Parser;

use htcache::{cli::Cli, logging, metrics, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log)?;
    let print_metrics = cli.metrics;
    run(settings, cli.command).await?;
    if print_metrics {
        print!("{}", metrics::render()?);
    }
    Ok(())
}
