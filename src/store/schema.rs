//! SQLite schema for the cache metadata store.
//!
//! Tables:
//! - `resources`: one row per fetched URL
//! - `descriptors`: one row per cached representation, joined to the cache
//!   tree by `path`
//! - `relations`: typed edges between resources

/// DDL for the metadata tables.
///
/// `descriptors.path` is indexed but not unique: the transaction layer keeps
/// one descriptor per path, and the integrity sweep reports rows that break
/// that rule instead of the insert failing.
pub const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    url  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resources_url ON resources(url);

CREATE TABLE IF NOT EXISTS descriptors (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id  INTEGER NOT NULL REFERENCES resources(id),
    path         TEXT NOT NULL,
    mediatype    TEXT NOT NULL,
    charset      TEXT,
    language     TEXT,
    size         INTEGER,
    quality      TEXT,
    etag         TEXT
);

CREATE INDEX IF NOT EXISTS idx_descriptors_path ON descriptors(path);
CREATE INDEX IF NOT EXISTS idx_descriptors_resource ON descriptors(resource_id);

CREATE TABLE IF NOT EXISTS relations (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    relate  TEXT NOT NULL,
    revuri  INTEGER NOT NULL REFERENCES resources(id),
    reluri  INTEGER NOT NULL REFERENCES resources(id)
);

CREATE INDEX IF NOT EXISTS idx_relations_revuri ON relations(revuri);
CREATE INDEX IF NOT EXISTS idx_relations_reluri ON relations(reluri);
"#;
