//! SQLite-backed metadata store for resources, descriptors and relations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, params, params_from_iter};
use thiserror::Error;
use tracing::{debug, info};

mod model;
mod schema;

pub use model::{Descriptor, Entity, Predicate, Quality, Record, Relation, Resource};
pub use schema::CACHE_SCHEMA;

/// Name of the connection used by the binary.
pub const DEFAULT_STORE: &str = "default";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no {entity} matching {predicate}")]
    NotFound {
        entity: &'static str,
        predicate: String,
    },

    #[error("ambiguous {entity} lookup: {count} rows match {predicate}")]
    Ambiguous {
        entity: &'static str,
        predicate: String,
        count: usize,
    },

    #[error("descriptor for '{path}' has no owning resource")]
    MissingResource { path: String },

    #[error("no open store connection named '{name}'")]
    UnknownConnection { name: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// SQLite-backed metadata store.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataStore {
    /// Open a file-backed store, creating the schema when `init` is set.
    pub fn open(path: &Path, init: bool) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn, init)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn, true)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection, init: bool) -> Result<(), StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()));
        if init {
            conn.execute_batch(CACHE_SCHEMA)?;
        }
        Ok(())
    }

    /// Persists `record`. A pending record is inserted and becomes stored;
    /// a stored one is written back under its id.
    pub fn commit<E: Entity>(&self, record: &mut Record<E>) -> Result<i64, StoreError> {
        record.check()?;
        let values = record.to_values();
        let columns = E::COLUMNS.join(", ");
        let conn = self.conn.lock();

        let id = match record.id() {
            None => {
                let placeholders = (1..=values.len())
                    .map(|idx| format!("?{idx}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                conn.execute(
                    &format!(
                        "INSERT INTO {} ({columns}) VALUES ({placeholders})",
                        E::TABLE
                    ),
                    params_from_iter(values.iter()),
                )?;
                conn.last_insert_rowid()
            }
            Some(id) => {
                let placeholders = (2..=values.len() + 1)
                    .map(|idx| format!("?{idx}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let updates = E::COLUMNS
                    .iter()
                    .map(|column| format!("{column} = excluded.{column}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "INSERT INTO {} (id, {columns}) VALUES (?1, {placeholders}) \
                     ON CONFLICT(id) DO UPDATE SET {updates}",
                    E::TABLE
                );
                let mut bound = Vec::with_capacity(values.len() + 1);
                bound.push(rusqlite::types::Value::Integer(id));
                bound.extend(values);
                conn.execute(&sql, params_from_iter(bound.iter()))?;
                id
            }
        };

        if !record.is_stored() {
            let entity = E::clone(&**record);
            *record = Record::Stored(id, entity);
        }
        debug!(entity = E::KIND, id, "committed record");
        Ok(id)
    }

    /// All rows matching `predicate`.
    pub fn filter<E: Entity>(&self, predicate: &Predicate<E>) -> Result<Vec<Record<E>>, StoreError> {
        let sql = format!(
            "SELECT id, {} FROM {} WHERE {} ORDER BY id",
            E::COLUMNS.join(", "),
            E::TABLE,
            predicate.where_clause()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(predicate.values()), |row| {
            Ok(Record::Stored(row.get(0)?, E::from_row(row)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The unique match, or `None` when nothing matches.
    pub fn find<E: Entity>(&self, predicate: &Predicate<E>) -> Result<Option<Record<E>>, StoreError> {
        let mut matches = self.filter(predicate)?;
        match matches.len() {
            0 => {
                info!(entity = E::KIND, predicate = %predicate, "no matching record");
                Ok(None)
            }
            1 => Ok(matches.pop()),
            count => Err(StoreError::Ambiguous {
                entity: E::KIND,
                predicate: predicate.to_string(),
                count,
            }),
        }
    }

    /// The unique match; a miss is an error.
    pub fn fetch<E: Entity>(&self, predicate: &Predicate<E>) -> Result<Record<E>, StoreError> {
        self.find(predicate)?.ok_or_else(|| StoreError::NotFound {
            entity: E::KIND,
            predicate: predicate.to_string(),
        })
    }

    pub fn get<E: Entity>(&self, id: i64) -> Result<Option<Record<E>>, StoreError> {
        let sql = format!(
            "SELECT id, {} FROM {} WHERE id = ?1",
            E::COLUMNS.join(", "),
            E::TABLE
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map([id], |row| {
            Ok(Record::Stored(row.get(0)?, E::from_row(row)?))
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn all<E: Entity>(&self) -> Result<Vec<Record<E>>, StoreError> {
        let sql = format!(
            "SELECT id, {} FROM {} ORDER BY id",
            E::COLUMNS.join(", "),
            E::TABLE
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(Record::Stored(row.get(0)?, E::from_row(row)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Removes the row with `id`; returns whether a row was deleted.
    pub fn delete<E: Entity>(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(&format!("DELETE FROM {} WHERE id = ?1", E::TABLE), [id])?;
        Ok(changed > 0)
    }

    pub fn resources(&self) -> Result<Vec<Record<Resource>>, StoreError> {
        self.all()
    }

    pub fn descriptors(&self) -> Result<Vec<Record<Descriptor>>, StoreError> {
        self.all()
    }

    pub fn descriptors_for(&self, resource_id: i64) -> Result<Vec<Record<Descriptor>>, StoreError> {
        self.filter(&Descriptor::by_resource(resource_id))
    }

    /// Distinct URLs of the resources whose descriptors claim `path`.
    pub fn owners(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT r.url
            FROM descriptors d
            JOIN resources r ON r.id = d.resource_id
            WHERE d.path = ?1
            ORDER BY r.url
            "#,
        )?;
        let rows = stmt.query_map([path], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Deletes a resource nothing refers to any more. Returns whether it was
    /// removed.
    pub fn prune_resource(&self, resource_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            DELETE FROM resources
            WHERE id = ?1
              AND NOT EXISTS (SELECT 1 FROM descriptors WHERE resource_id = ?1)
              AND NOT EXISTS (SELECT 1 FROM relations WHERE revuri = ?1 OR reluri = ?1)
            "#,
            params![resource_id],
        )?;
        Ok(changed > 0)
    }
}

/// Where a named store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRef {
    Memory,
    File(PathBuf),
}

/// Named store connections, created on first use and shared afterwards.
#[derive(Debug, Default)]
pub struct StorePool {
    stores: Mutex<HashMap<String, MetadataStore>>,
}

impl StorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store named `name`, opening it from `dbref` if this is the
    /// first request for that name. The pool lock is held across the open so
    /// concurrent first use cannot create two connections.
    pub fn open(&self, name: &str, dbref: &StoreRef, init: bool) -> Result<MetadataStore, StoreError> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(name) {
            return Ok(store.clone());
        }
        let store = match dbref {
            StoreRef::Memory => MetadataStore::memory()?,
            StoreRef::File(path) => MetadataStore::open(path, init)?,
        };
        debug!(name, ?dbref, "opened metadata store");
        stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    pub fn get(&self, name: &str) -> Result<MetadataStore, StoreError> {
        self.stores
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownConnection {
                name: name.to_string(),
            })
    }

    /// Drops the pool's handle for `name`. Clones held elsewhere stay usable.
    pub fn close(&self, name: &str) -> bool {
        self.stores.lock().remove(name).is_some()
    }
}
