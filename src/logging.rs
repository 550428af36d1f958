use std::time::Duration;

use anyhow::{Result, anyhow};
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One record per closed transaction.
#[derive(Debug, Clone)]
pub struct CacheLogEvent {
    pub url: String,
    pub key: Option<String>,
    pub state: Option<String>,
    pub conditional: String,
    pub outcome: String,
    pub durable: bool,
    pub phase: String,
    pub elapsed_ms: u128,
    pub error_reason: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct CacheLogBuilder {
    event: CacheLogEvent,
}

impl CacheLogBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            event: CacheLogEvent {
                url: url.into(),
                key: None,
                state: None,
                conditional: String::from("none"),
                outcome: String::from("UNKNOWN"),
                durable: false,
                phase: String::new(),
                elapsed_ms: 0,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.event.key = Some(key.into());
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.event.state = Some(state.into());
        self
    }

    pub fn conditional(mut self, kind: impl Into<String>) -> Self {
        self.event.conditional = kind.into();
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.event.outcome = outcome.into();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.event.durable = durable;
        self
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.event.phase = phase.into();
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.event.error_reason = Some(reason.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> CacheLogEvent {
        self.event
    }

    pub fn log(self) {
        log_cache_event(self.build());
    }
}

pub fn log_cache_event(event: CacheLogEvent) {
    let CacheLogEvent {
        url,
        key,
        state,
        conditional,
        outcome,
        durable,
        phase,
        elapsed_ms,
        error_reason,
        error_detail,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let key_field = key.as_deref();
    let state_field = state.as_deref();
    let error_reason_field = error_reason.as_deref();
    let error_detail_field = error_detail.as_deref();

    tracing::info!(
        target = "cache_log",
        ts,
        url,
        key = key_field,
        state = state_field,
        conditional,
        outcome,
        durable,
        phase,
        elapsed_ms,
        error_reason = error_reason_field,
        error_detail = error_detail_field
    );

    crate::metrics::record_transaction(&outcome, Duration::from_millis(elapsed_ms as u64));
}
