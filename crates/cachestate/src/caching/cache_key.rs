use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::CacheEntry;

/// The opaque identity of one cached result.
///
/// Keys are cheap to clone and compare by their string contents. Two unrelated cached operations
/// must never derive the same key; the default derivation guarantees this by prefixing the key
/// with the identity and name of the operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Create a [`CacheKeyBuilder`] that starts with the default prefix of the given call site.
    pub fn builder(site: &CallSite) -> CacheKeyBuilder {
        CacheKeyBuilder {
            key: format!("{}_", site.prefix()),
        }
    }

    /// Derives the default key for a call: `<identity>#<operation>_<JSON of args>`.
    ///
    /// Arguments that serialize to `null` or to an empty sequence count as "no arguments" and
    /// contribute an empty suffix.
    pub fn from_args<A: Serialize + ?Sized>(site: &CallSite, args: &A) -> CacheEntry<Self> {
        let mut builder = Self::builder(site);
        builder.write_args(args)?;
        Ok(builder.build())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

/// The identity of a cached operation: the thing it belongs to, and its own name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub identity: Arc<str>,
    pub operation: Arc<str>,
}

impl CallSite {
    pub fn new(identity: impl Into<Arc<str>>, operation: impl Into<Arc<str>>) -> Self {
        Self {
            identity: identity.into(),
            operation: operation.into(),
        }
    }

    /// The default key prefix, `<identity>#<operation>`.
    pub fn prefix(&self) -> String {
        format!("{}#{}", self.identity, self.operation)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.identity, self.operation)
    }
}

/// The JSON serialization of `args`, or an empty string if they amount to "no arguments".
pub fn args_suffix<A: Serialize + ?Sized>(args: &A) -> CacheEntry<String> {
    let value = serde_json::to_value(args)?;
    let is_empty = match &value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if is_empty {
        return Ok(String::new());
    }
    Ok(serde_json::to_string(&value)?)
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait. Its input must be **stable**
/// for equivalent calls, otherwise repeated calls will not share a cached result.
pub struct CacheKeyBuilder {
    key: String,
}

impl CacheKeyBuilder {
    /// Appends the JSON serialization of `args`, unless they amount to "no arguments".
    pub fn write_args<A: Serialize + ?Sized>(&mut self, args: &A) -> CacheEntry<()> {
        self.key.push_str(&args_suffix(args)?);
        Ok(())
    }

    pub fn build(self) -> CacheKey {
        CacheKey::from(self.key)
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.key.push_str(s);
        Ok(())
    }
}
