use std::fmt;
use std::marker::PhantomData;
use std::num::ParseFloatError;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use rusqlite::Row;
use rusqlite::types::{Type, Value};

use super::StoreError;

/// An entity as seen by the store: either not yet persisted, or persisted
/// under a store-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub enum Record<E> {
    Pending(E),
    Stored(i64, E),
}

impl<E> Record<E> {
    pub fn id(&self) -> Option<i64> {
        match self {
            Record::Pending(_) => None,
            Record::Stored(id, _) => Some(*id),
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, Record::Stored(..))
    }

    pub fn into_inner(self) -> E {
        match self {
            Record::Pending(entity) | Record::Stored(_, entity) => entity,
        }
    }
}

impl<E> Deref for Record<E> {
    type Target = E;

    fn deref(&self) -> &E {
        match self {
            Record::Pending(entity) | Record::Stored(_, entity) => entity,
        }
    }
}

impl<E> DerefMut for Record<E> {
    fn deref_mut(&mut self) -> &mut E {
        match self {
            Record::Pending(entity) | Record::Stored(_, entity) => entity,
        }
    }
}

/// A row type the store can persist.
///
/// `COLUMNS` excludes `id`; [`Entity::to_values`] and [`Entity::from_row`]
/// follow the same order, with `id` at row index 0.
pub trait Entity: Clone + fmt::Debug + Send + 'static {
    const KIND: &'static str;
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn to_values(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Rejects entities the schema would not accept in a meaningful way.
    fn check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Column equality filter over one entity kind.
pub struct Predicate<E> {
    terms: Vec<(&'static str, Value)>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Predicate<E> {
    fn new(terms: Vec<(&'static str, Value)>) -> Self {
        Self {
            terms,
            _entity: PhantomData,
        }
    }

    pub(super) fn where_clause(&self) -> String {
        self.terms
            .iter()
            .enumerate()
            .map(|(idx, (column, _))| format!("{column} = ?{}", idx + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    pub(super) fn values(&self) -> impl Iterator<Item = &Value> {
        self.terms.iter().map(|(_, value)| value)
    }
}

impl<E> fmt::Display for Predicate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (column, value)) in self.terms.iter().enumerate() {
            if idx > 0 {
                f.write_str(" and ")?;
            }
            match value {
                Value::Text(text) => write!(f, "{column}='{text}'")?,
                Value::Integer(number) => write!(f, "{column}={number}")?,
                Value::Real(number) => write!(f, "{column}={number}")?,
                Value::Null => write!(f, "{column} is null")?,
                Value::Blob(_) => write!(f, "{column}=<blob>")?,
            }
        }
        Ok(())
    }
}

impl<E> fmt::Debug for Predicate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({self})")
    }
}

fn text(value: &Option<String>) -> Value {
    value.clone().map(Value::Text).unwrap_or(Value::Null)
}

/// A logical web resource, identified by the URL it was fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub url: String,
}

impl Resource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn by_url(url: &str) -> Predicate<Resource> {
        Predicate::new(vec![("url", Value::Text(url.to_string()))])
    }
}

impl Entity for Resource {
    const KIND: &'static str = "resource";
    const TABLE: &'static str = "resources";
    const COLUMNS: &'static [&'static str] = &["url"];

    fn to_values(&self) -> Vec<Value> {
        vec![Value::Text(self.url.clone())]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self { url: row.get(1)? })
    }
}

/// A `qs` content-negotiation quality. The text is kept as received so the
/// header can be rebuilt byte for byte.
#[derive(Debug, Clone, PartialEq)]
pub struct Quality {
    value: f64,
    text: String,
}

impl Quality {
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl FromStr for Quality {
    type Err = ParseFloatError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let value = text.parse::<f64>()?;
        Ok(Self {
            value,
            text: text.to_string(),
        })
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Metadata for one cached representation. `path` is the cache key of the
/// object it describes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Descriptor {
    pub resource_id: Option<i64>,
    pub path: String,
    pub mediatype: Option<String>,
    pub charset: Option<String>,
    pub language: Option<String>,
    pub size: Option<u64>,
    pub quality: Option<Quality>,
    pub etag: Option<String>,
}

impl Descriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn by_path(path: &str) -> Predicate<Descriptor> {
        Predicate::new(vec![("path", Value::Text(path.to_string()))])
    }

    pub fn by_resource(resource_id: i64) -> Predicate<Descriptor> {
        Predicate::new(vec![("resource_id", Value::Integer(resource_id))])
    }
}

impl Entity for Descriptor {
    const KIND: &'static str = "descriptor";
    const TABLE: &'static str = "descriptors";
    const COLUMNS: &'static [&'static str] = &[
        "resource_id",
        "path",
        "mediatype",
        "charset",
        "language",
        "size",
        "quality",
        "etag",
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.resource_id.map(Value::Integer).unwrap_or(Value::Null),
            Value::Text(self.path.clone()),
            text(&self.mediatype),
            text(&self.charset),
            text(&self.language),
            self.size
                .map(|size| Value::Integer(size as i64))
                .unwrap_or(Value::Null),
            self.quality
                .as_ref()
                .map(|quality| Value::Text(quality.to_string()))
                .unwrap_or(Value::Null),
            text(&self.etag),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            resource_id: row.get(1)?,
            path: row.get(2)?,
            mediatype: row.get(3)?,
            charset: row.get(4)?,
            language: row.get(5)?,
            size: row.get::<_, Option<i64>>(6)?.map(|size| size as u64),
            quality: row
                .get::<_, Option<String>>(7)?
                .map(|text| {
                    text.parse::<Quality>().map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(err))
                    })
                })
                .transpose()?,
            etag: row.get(8)?,
        })
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.resource_id.is_none() {
            return Err(StoreError::MissingResource {
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

/// A typed edge from one resource (`revuri`) to another (`reluri`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub relate: String,
    pub revuri: i64,
    pub reluri: i64,
}

impl Relation {
    pub fn by_endpoints(relate: &str, revuri: i64, reluri: i64) -> Predicate<Relation> {
        Predicate::new(vec![
            ("relate", Value::Text(relate.to_string())),
            ("revuri", Value::Integer(revuri)),
            ("reluri", Value::Integer(reluri)),
        ])
    }
}

impl Entity for Relation {
    const KIND: &'static str = "relation";
    const TABLE: &'static str = "relations";
    const COLUMNS: &'static [&'static str] = &["relate", "revuri", "reluri"];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.relate.clone()),
            Value::Integer(self.revuri),
            Value::Integer(self.reluri),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            relate: row.get(1)?,
            revuri: row.get(2)?,
            reluri: row.get(3)?,
        })
    }
}
