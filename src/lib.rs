pub mod cache;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod report;
pub mod rules;
pub mod settings;
pub mod store;
pub mod sweep;

use std::io::{self, Write};

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tracing::info;

use crate::{
    cli::Command,
    proxy::ProxyContext,
    settings::Settings,
    store::{DEFAULT_STORE, StorePool},
    sweep::SweepOptions,
};

/// Runs one maintenance command against the configured cache root and
/// metadata store.
pub async fn run(settings: Settings, command: Command) -> Result<()> {
    async_fs::create_dir_all(&settings.cache_root)
        .await
        .with_context(|| {
            format!(
                "failed to create cache root {}",
                settings.cache_root.display()
            )
        })?;

    let pool = StorePool::new();
    let ctx = ProxyContext::from_settings(&settings, &pool)?;
    let mut out = io::stdout();

    match &command {
        Command::InitDb => {
            info!(data = %settings.data.display(), "metadata schema ready");
        }
        Command::List => {
            let count = report::list_locations(&ctx.store, &mut out)?;
            info!(count, "listed resources");
        }
        Command::Record { url } => report::print_record(&ctx.store, url, &mut out)?,
        Command::Find { query } => {
            let found = report::find_records(&ctx.store, query, &mut out)?;
            info!(found, "end of search");
        }
        Command::Info { paths } => {
            report::print_info(&ctx.store, &settings.cache_root, paths, &mut out)?;
        }
        Command::CheckFiles { .. } => {
            let options = SweepOptions::from_settings(&settings, command.prune());
            let report = sweep::check_files(&ctx, &options).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        }
        Command::CheckCache { .. } => {
            let options = SweepOptions::from_settings(&settings, command.prune());
            let report = sweep::check_cache(&ctx, &options).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        }
        Command::Sweep { .. } => {
            let options = SweepOptions::from_settings(&settings, command.prune());
            let files = sweep::check_files(&ctx, &options).await?;
            let descriptors = sweep::check_cache(&ctx, &options).await?;
            let summary = serde_json::json!({ "files": files, "descriptors": descriptors });
            writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
        }
    }
    out.flush()?;
    pool.close(DEFAULT_STORE);
    Ok(())
}
