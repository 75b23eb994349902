//! Endpoint paths and call arguments
//!
//! An endpoint is the ordered list of path segments used to invoke the API,
//! e.g. `["followers", "ids"]`. Its normalized form (`/followers/ids`) is the
//! key under which rate limits are tracked.

use std::collections::BTreeMap;
use std::fmt;

/// Ordered path segments identifying an API endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    segments: Vec<String>,
}

impl Endpoint {
    /// Creates an endpoint from its path segments
    ///
    /// Empty segments are dropped, so `["", "followers", "ids"]` and
    /// `["followers", "ids"]` name the same endpoint.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    /// Parses a slash-separated path such as `followers/ids` or `/followers/ids`
    pub fn parse(path: &str) -> Self {
        Self::new(path.split('/'))
    }

    /// Returns a new endpoint with one more segment appended
    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Normalized path used as the rate-limit key (`/followers/ids`)
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    /// Resource family the endpoint belongs to (`followers` for `/followers/ids`)
    pub fn family(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

impl From<&str> for Endpoint {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// Query arguments for a call, kept sorted for stable signing and logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    values: BTreeMap<String, String>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for CallArgs {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut args = Self::new();
        for (k, v) in iter {
            args.set(k, v);
        }
        args
    }
}
