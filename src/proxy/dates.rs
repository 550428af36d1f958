use std::time::SystemTime;

use anyhow::{Context, Result};
use time::format_description::{self, OwnedFormatItem};
use time::{OffsetDateTime, PrimitiveDateTime};

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub const DEFAULT_DATE_FORMAT: &str =
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT";

/// asctime, e.g. `Sun Nov  6 08:49:37 1994`.
pub const DEFAULT_ALT_DATE_FORMAT: &str =
    "[weekday repr:short] [month repr:short] [day padding:space] [hour]:[minute]:[second] [year]";

const GMT_SUFFIX: &str = " GMT";

/// HTTP date formats tried when reading `Last-Modified`, and the one used
/// when writing it back.
#[derive(Debug)]
pub struct DateFormats {
    primary: OwnedFormatItem,
    primary_bare: Option<OwnedFormatItem>,
    alternate: OwnedFormatItem,
}

fn compile(description: &str) -> Result<OwnedFormatItem> {
    format_description::parse_owned::<1>(description)
        .with_context(|| format!("invalid date format '{description}'"))
}

impl DateFormats {
    pub fn new(primary: &str, alternate: &str) -> Result<Self> {
        let primary_bare = match primary.strip_suffix(GMT_SUFFIX) {
            Some(bare) => Some(compile(bare)?),
            None => None,
        };
        Ok(Self {
            primary: compile(primary)?,
            primary_bare,
            alternate: compile(alternate)?,
        })
    }

    /// Parses an HTTP date as UTC. Tries the primary format, then the
    /// primary format without its zone suffix, then the alternate format.
    pub fn parse(&self, value: &str) -> Option<SystemTime> {
        let value = value.trim();
        if let Ok(parsed) = PrimitiveDateTime::parse(value, &self.primary) {
            return Some(parsed.assume_utc().into());
        }
        if let Some(bare) = &self.primary_bare {
            let stripped = value.strip_suffix(GMT_SUFFIX).unwrap_or(value);
            if let Ok(parsed) = PrimitiveDateTime::parse(stripped, bare) {
                return Some(parsed.assume_utc().into());
            }
        }
        PrimitiveDateTime::parse(value, &self.alternate)
            .ok()
            .map(|parsed| parsed.assume_utc().into())
    }

    /// The stock pair: IMF-fixdate with asctime as the fallback.
    pub fn standard() -> Result<Self> {
        Self::new(DEFAULT_DATE_FORMAT, DEFAULT_ALT_DATE_FORMAT)
    }

    pub fn format(&self, when: SystemTime) -> Option<String> {
        OffsetDateTime::from(when).format(&self.primary).ok()
    }
}
