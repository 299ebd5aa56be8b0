use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{LineageError, LineageResult};

/// A resource name plus an optional subpath inside that resource.
///
/// Subpaths are stored without leading or trailing slashes, and an empty
/// subpath is the same as no subpath, so `ResourceRef::new("data", Some("/"))`
/// and `ResourceRef::whole("data")` are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RefRecord")]
pub struct ResourceRef {
    #[serde(rename = "resource_name")]
    name: String,
    subpath: Option<String>,
}

#[derive(Deserialize)]
struct RefRecord {
    resource_name: String,
    subpath: Option<String>,
}

impl From<RefRecord> for ResourceRef {
    fn from(record: RefRecord) -> Self {
        Self::new(record.resource_name, record.subpath.as_deref())
    }
}

impl ResourceRef {
    pub fn new(name: impl Into<String>, subpath: Option<&str>) -> Self {
        let subpath = subpath
            .map(|raw| raw.trim_matches('/'))
            .filter(|trimmed| !trimmed.is_empty())
            .map(ToOwned::to_owned);
        Self {
            name: name.into(),
            subpath,
        }
    }

    pub fn whole(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    pub fn subpath_of(name: impl Into<String>, subpath: &str) -> Self {
        Self::new(name, Some(subpath))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subpath(&self) -> Option<&str> {
        self.subpath.as_deref()
    }

    /// True when `self` is a strict ancestor of `other` within the same resource.
    pub fn covers(&self, other: &ResourceRef) -> bool {
        if self.name != other.name {
            return false;
        }
        match (&self.subpath, &other.subpath) {
            (None, Some(_)) => true,
            (Some(mine), Some(theirs)) => {
                mine != theirs
                    && theirs.starts_with(mine.as_str())
                    && theirs[mine.len()..].starts_with('/')
            }
            _ => false,
        }
    }

    /// `covers` in either direction.
    pub fn overlaps(&self, other: &ResourceRef) -> bool {
        self.covers(other) || other.covers(self)
    }

    /// Parses the `name` / `name:subpath` notation used on the command line.
    pub fn parse(raw: &str) -> LineageResult<Self> {
        let (name, subpath) = match raw.split_once(':') {
            Some((name, subpath)) => (name, Some(subpath)),
            None => (raw, None),
        };
        if name.is_empty() {
            return Err(LineageError::InvalidResourceName(raw.to_string()));
        }
        Ok(Self::new(name, subpath))
    }

    pub fn to_json(&self) -> Value {
        json!(self)
    }

    pub fn from_json(value: &Value) -> LineageResult<Self> {
        Self::deserialize(value).map_err(|err| LineageError::format(format!("resource ref: {err}")))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subpath {
            Some(subpath) => write!(f, "{}:{}", self.name, subpath),
            None => write!(f, "{}", self.name),
        }
    }
}
