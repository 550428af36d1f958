use url::Url;

/// Marker every transaction URL starts with once its scheme is stripped.
pub const NETPATH_MARKER: &str = "//";

const DEFAULT_PORT: u16 = 80;

/// Turns a transaction URL (`//host[:port]/path?query`, or a full `http://`
/// URL as stored on older resources) into the network path the rewrite
/// rules consume: `host[:port]/path[?query]`. The port is omitted when it is
/// the default one.
///
/// Returns `None` for anything that does not parse as an HTTP location.
pub fn network_path(url: &str) -> Option<String> {
    let parsed = if url.starts_with(NETPATH_MARKER) {
        Url::parse(&format!("http:{url}")).ok()?
    } else {
        let parsed = Url::parse(url).ok()?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return None;
        }
        parsed
    };

    let host = parsed.host_str().filter(|host| !host.is_empty())?;
    let mut netpath = String::from(host);
    if let Some(port) = parsed.port().filter(|port| *port != DEFAULT_PORT) {
        netpath.push(':');
        netpath.push_str(&port.to_string());
    }
    netpath.push_str(parsed.path());
    if let Some(query) = parsed.query() {
        netpath.push('?');
        netpath.push_str(query);
    }
    Some(netpath)
}
