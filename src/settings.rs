use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::BackendKind;
use crate::cli::{Cli, LogFormat};
use crate::proxy::dates::{DEFAULT_ALT_DATE_FORMAT, DEFAULT_DATE_FORMAT, DateFormats};
use crate::rules::{RewriteRules, RuleConfig};

fn default_backend() -> BackendKind {
    BackendKind::FileTree
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_size_prune() -> u64 {
    11 * 1024 * 1024 // 11 MiB
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

fn default_alt_date_format() -> String {
    DEFAULT_ALT_DATE_FORMAT.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub cache_root: PathBuf,
    pub data: PathBuf,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub prune: bool,
    #[serde(default = "default_max_size_prune")]
    pub max_size_prune: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_alt_date_format")]
    pub date_alt_format: String,
    #[serde(default)]
    pub join: Vec<RuleConfig>,
    #[serde(default)]
    pub rewrite: Vec<RuleConfig>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("HTCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    /// The token this proxy appends to `Via` headers.
    pub fn via(&self) -> String {
        format!("1.1 {}:{}", self.hostname, self.port)
    }

    pub fn date_formats(&self) -> Result<DateFormats> {
        DateFormats::new(&self.date_format, &self.date_alt_format)
    }

    pub fn rewrite_rules(&self) -> Result<RewriteRules> {
        RewriteRules::compile(&self.join, &self.rewrite)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_root = absolutize(&self.cache_root, base_dir);
        self.data = absolutize(&self.data, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.hostname.trim().is_empty(),
            "hostname must not be empty"
        );
        ensure!(self.port > 0, "port must be greater than 0 (got {})", self.port);
        ensure!(
            self.max_size_prune > 0,
            "max_size_prune must be greater than 0 (got {})",
            self.max_size_prune
        );
        ensure!(
            !self.cache_root.as_os_str().is_empty(),
            "cache_root must not be empty"
        );
        self.date_formats()
            .context("invalid date_format/date_alt_format")?;
        self.rewrite_rules().context("invalid rewrite rules")?;
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/htcache/htcache.toml"),
        PathBuf::from("htcache.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
