use http::HeaderMap;
use http::header::{HeaderName, HeaderValue, VIA};

/// Relation hint sent by some clients alongside `Referer`.
pub const X_RELATIONSHIP: HeaderName = HeaderName::from_static("x-relationship");

/// Extends `Via` with `token`, keeping whatever earlier hops recorded.
pub fn append_via(headers: &mut HeaderMap, token: &str) {
    let existing = headers
        .get_all(VIA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();
    let combined = if existing.is_empty() {
        token.to_string()
    } else {
        format!("{}, {token}", existing.join(", "))
    };
    headers.remove(VIA);
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(VIA, value);
    }
}

/// Wraps an entity tag in quotes for the wire.
pub fn quote_etag(tag: &str) -> String {
    format!("\"{tag}\"")
}

/// Drops the quote characters from an entity tag before it is stored.
pub fn strip_etag(value: &str) -> String {
    value.trim().replace('"', "")
}

/// Returns the header as text if it is present and printable.
pub fn header_text<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}
