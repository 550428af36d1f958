//! Translation between entity headers and descriptor fields.
//!
//! Every entity header the proxy understands has an entry in [`HANDLERS`]:
//! either a bespoke setter or a plain descriptor field. Entity headers
//! without an entry are logged and skipped; non-entity headers are ignored.

use http::HeaderMap;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderValue, LAST_MODIFIED};
use tracing::{error, trace, warn};

use super::dates::DateFormats;
use super::error::MapError;
use super::headers::{quote_etag, strip_etag};
use crate::cache::CacheObject;
use crate::store::{Descriptor, Quality};

/// The pair of objects a response's entity headers are written into.
pub struct MappingTarget<'a> {
    pub descriptor: &'a mut Descriptor,
    pub cache: &'a mut dyn CacheObject,
}

type Setter = fn(&mut MappingTarget<'_>, &str, &DateFormats) -> Result<(), MapError>;

#[derive(Debug, Clone, Copy)]
enum Field {
    Language,
}

impl Field {
    fn assign(self, descriptor: &mut Descriptor, value: &str) {
        match self {
            Field::Language => descriptor.language = Some(value.to_string()),
        }
    }
}

#[derive(Clone, Copy)]
enum Handler {
    Setter(Setter),
    Field(Field),
}

const HANDLERS: &[(&str, Handler)] = &[
    ("content-length", Handler::Setter(set_content_length)),
    ("content-type", Handler::Setter(set_content_type)),
    ("etag", Handler::Setter(set_etag)),
    ("last-modified", Handler::Setter(set_last_modified)),
    ("content-language", Handler::Field(Field::Language)),
];

fn handler_for(name: &str) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(header, _)| *header == name)
        .map(|(_, handler)| *handler)
}

fn is_entity_header(name: &str) -> bool {
    name.starts_with("content-") || matches!(name, "etag" | "last-modified" | "expires" | "allow")
}

/// Content-Type parameters and what they set.
fn set_content_type_parameter(
    descriptor: &mut Descriptor,
    name: &str,
    value: &str,
    header: &str,
) -> Result<(), MapError> {
    match name {
        "qs" => {
            let quality = value.parse::<Quality>().map_err(|_| MapError::InvalidQuality {
                value: value.to_string(),
            })?;
            descriptor.quality = Some(quality);
        }
        "charset" => descriptor.charset = Some(value.to_string()),
        _ => {
            return Err(MapError::UnknownContentTypeParameter {
                name: name.to_string(),
                value: header.to_string(),
            });
        }
    }
    Ok(())
}

pub fn set_content_length(
    target: &mut MappingTarget<'_>,
    value: &str,
    _dates: &DateFormats,
) -> Result<(), MapError> {
    let size = value
        .trim()
        .parse::<u64>()
        .map_err(|_| MapError::InvalidContentLength {
            value: value.to_string(),
        })?;
    target.descriptor.size = Some(size);
    target.cache.set_size(size);
    Ok(())
}

pub fn set_content_type(
    target: &mut MappingTarget<'_>,
    value: &str,
    _dates: &DateFormats,
) -> Result<(), MapError> {
    let mut parts = value.split(';');
    let mediatype = parts.next().unwrap_or_default().trim();
    if !mediatype.is_empty() {
        target.descriptor.mediatype = Some(mediatype.to_string());
    }
    for param in parts.map(str::trim).filter(|param| !param.is_empty()) {
        let (name, raw) = param.split_once('=').unwrap_or((param, ""));
        let name = name.trim().to_ascii_lowercase();
        let raw = raw.trim().trim_matches('"');
        set_content_type_parameter(target.descriptor, &name, raw, value)?;
    }
    Ok(())
}

pub fn set_etag(
    target: &mut MappingTarget<'_>,
    value: &str,
    _dates: &DateFormats,
) -> Result<(), MapError> {
    let tag = strip_etag(value);
    target.descriptor.etag = (!tag.is_empty()).then_some(tag);
    Ok(())
}

/// A malformed date leaves the modification time unknown.
pub fn set_last_modified(
    target: &mut MappingTarget<'_>,
    value: &str,
    dates: &DateFormats,
) -> Result<(), MapError> {
    match dates.parse(value) {
        Some(mtime) => target.cache.set_mtime(Some(mtime)),
        None => {
            error!(value, path = target.cache.path(), "unparseable Last-Modified");
            target.cache.set_mtime(None);
        }
    }
    Ok(())
}

/// Applies the entity headers in `headers` to the descriptor and cache object.
pub fn map_to_data(
    headers: &HeaderMap,
    target: &mut MappingTarget<'_>,
    dates: &DateFormats,
) -> Result<(), MapError> {
    for (name, value) in headers {
        let name = name.as_str();
        let Some(handler) = handler_for(name) else {
            if is_entity_header(name) {
                warn!(header = name, path = target.cache.path(), "unmapped entity header");
            } else {
                trace!(header = name, "ignoring non-entity header");
            }
            continue;
        };
        let value = value.to_str().map_err(|_| MapError::InvalidHeaderValue {
            name: name.to_string(),
        })?;
        match handler {
            Handler::Setter(setter) => setter(target, value.trim(), dates)?,
            Handler::Field(field) => field.assign(target.descriptor, value.trim()),
        }
    }
    Ok(())
}

/// Rebuilds the entity headers for a response from stored metadata. Fields
/// that are unknown are left out.
pub fn map_to_headers(
    descriptor: &Descriptor,
    cache: &dyn CacheObject,
    dates: &DateFormats,
    headers: &mut HeaderMap,
) {
    if let Some(size) = descriptor.size {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
    }
    if let Some(mtime) = cache.mtime()
        && let Some(formatted) = dates.format(mtime)
        && let Ok(value) = HeaderValue::from_str(&formatted)
    {
        headers.insert(LAST_MODIFIED, value);
    }
    if let Some(mediatype) = &descriptor.mediatype {
        let mut content_type = mediatype.clone();
        if let Some(charset) = &descriptor.charset {
            content_type.push_str("; charset=");
            content_type.push_str(charset);
        }
        if let Some(quality) = &descriptor.quality {
            content_type.push_str("; qs=");
            content_type.push_str(quality.as_str());
        }
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    if let Some(etag) = &descriptor.etag
        && let Ok(value) = HeaderValue::from_str(&quote_etag(etag))
    {
        headers.insert(ETAG, value);
    }
}

/// Total length from a `Content-Range: bytes a-b/total` header.
pub fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(http::header::CONTENT_RANGE)?.to_str().ok()?;
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}
