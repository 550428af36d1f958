//! Read-only queries over the metadata store, printed for operators.

use std::io::Write;
use std::path::Path;

use anyhow::{Result, bail};
use tracing::{error, info};

use crate::store::{Descriptor, MetadataStore, Record, Resource};

const MEDIATYPE_QUERY: &str = "mediatype:";

fn describe(descriptor: &Record<Descriptor>) -> String {
    let mut line = descriptor.path.clone();
    line.push(' ');
    line.push_str(descriptor.mediatype.as_deref().unwrap_or("-"));
    if let Some(charset) = &descriptor.charset {
        line.push_str(&format!("; charset={charset}"));
    }
    if let Some(language) = &descriptor.language {
        line.push_str(&format!(" lang={language}"));
    }
    match descriptor.size {
        Some(size) => line.push_str(&format!(" size={size}")),
        None => line.push_str(" size=?"),
    }
    if let Some(quality) = &descriptor.quality {
        line.push_str(&format!(" qs={quality}"));
    }
    if let Some(etag) = &descriptor.etag {
        line.push_str(&format!(" etag={etag}"));
    }
    line
}

fn write_resource(
    store: &MetadataStore,
    resource: &Record<Resource>,
    out: &mut impl Write,
) -> Result<()> {
    let id = resource.id().unwrap_or_default();
    writeln!(out, "{id} {}", resource.url)?;
    for descriptor in store.descriptors_for(id)? {
        writeln!(out, "\t{}", describe(&descriptor))?;
    }
    Ok(())
}

/// Every resource followed by its descriptors.
pub fn list_locations(store: &MetadataStore, out: &mut impl Write) -> Result<usize> {
    let resources = store.resources()?;
    for resource in &resources {
        write_resource(store, resource, out)?;
    }
    Ok(resources.len())
}

/// The resources recorded for exactly `url`.
pub fn print_record(store: &MetadataStore, url: &str, out: &mut impl Write) -> Result<()> {
    let resources = store.filter(&Resource::by_url(url))?;
    if resources.is_empty() {
        bail!("no resource recorded for {url}");
    }
    for resource in &resources {
        write_resource(store, resource, out)?;
    }
    Ok(())
}

/// Descriptors whose resource URL contains `query`, or whose media type
/// starts with the value of a `mediatype:<prefix>` query.
pub fn find_records(store: &MetadataStore, query: &str, out: &mut impl Write) -> Result<usize> {
    info!(query, "searching records");
    let mut found = 0;
    if let Some(prefix) = query.strip_prefix(MEDIATYPE_QUERY) {
        for descriptor in store.descriptors()? {
            let matches = descriptor
                .mediatype
                .as_deref()
                .is_some_and(|mediatype| mediatype.starts_with(prefix));
            if matches {
                writeln!(out, "{}", describe(&descriptor))?;
                found += 1;
            }
        }
        return Ok(found);
    }
    for resource in store.resources()? {
        if !resource.url.contains(query) {
            continue;
        }
        let Some(id) = resource.id() else { continue };
        for descriptor in store.descriptors_for(id)? {
            writeln!(out, "{} {}", describe(&descriptor), resource.url)?;
            found += 1;
        }
    }
    Ok(found)
}

/// Prints the descriptor stored for each cache path. Paths may be relative
/// to the cache root or absolute below it. Returns how many were found.
pub fn print_info(
    store: &MetadataStore,
    root: &Path,
    paths: &[String],
    out: &mut impl Write,
) -> Result<usize> {
    let mut found = 0;
    for path in paths {
        let key = match Path::new(path).strip_prefix(root) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => path.trim_start_matches('/').to_string(),
        };
        let descriptors = store.filter(&Descriptor::by_path(&key))?;
        if descriptors.is_empty() {
            error!(path = %key, "unknown cache location");
            continue;
        }
        for descriptor in &descriptors {
            writeln!(out, "{}", describe(descriptor))?;
            found += 1;
        }
    }
    info!(found, paths = paths.len(), "cache location lookup finished");
    Ok(found)
}
