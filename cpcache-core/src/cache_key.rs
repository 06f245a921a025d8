//! Mapping from HTTP request targets to cache-relative file paths.

use std::fmt;
use std::path::{Component, Path};

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// A request target rejected because it does not name a file inside the
/// cache (traversal attempt, undecodable escape, empty path).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request path {0:?} does not name a file inside the cache")]
pub struct InvalidCacheKey(pub String);

/// A validated, percent-decoded request path, relative to the cache root.
///
/// `CacheKey` is both the coordination key for the download registry and
/// the relative on-disk location of the cached file. Construction is the
/// single place where untrusted request targets are checked, so a
/// `CacheKey` can be joined under the cache directory without further
/// validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds a key from a raw HTTP request target.
    ///
    /// Strips any query string, percent-decodes the path, drops the
    /// leading slash and rejects anything that could escape the cache
    /// root.
    ///
    /// # Errors
    /// Returns [`InvalidCacheKey`] when the decoded path is empty,
    /// absolute, not valid UTF-8, or contains `.`/`..` components.
    pub fn from_request_target(target: &str) -> Result<Self, InvalidCacheKey> {
        let path = target.split('?').next().unwrap_or(target);
        let decoded = percent_decode_str(path)
            .decode_utf8()
            .map_err(|_| InvalidCacheKey(target.to_string()))?;
        let relative = decoded.trim_start_matches('/');
        if relative.is_empty() || relative.contains('\0') {
            return Err(InvalidCacheKey(target.to_string()));
        }
        let all_normal = Path::new(relative)
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !all_normal {
            return Err(InvalidCacheKey(target.to_string()));
        }
        Ok(Self(relative.to_string()))
    }

    /// The decoded path, relative to the cache root, without a leading
    /// slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final path segment, used to key the content-length table.
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Whether this key names a database index file, which is always
    /// redirected to a mirror instead of cached.
    pub fn is_database(&self) -> bool {
        self.basename().ends_with(".db")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_and_strips_leading_slash() {
        let key = CacheKey::from_request_target("/core/os/x86_64/linux-6.9.arch1-1.pkg.tar.zst")
            .unwrap();
        assert_eq!(key.as_str(), "core/os/x86_64/linux-6.9.arch1-1.pkg.tar.zst");
        assert_eq!(key.basename(), "linux-6.9.arch1-1.pkg.tar.zst");
        assert!(!key.is_database());
    }

    #[test]
    fn decodes_percent_escapes() {
        let key = CacheKey::from_request_target("/extra/os/x86_64/libsigc%2B%2B-2.12.pkg").unwrap();
        assert_eq!(key.as_str(), "extra/os/x86_64/libsigc++-2.12.pkg");
    }

    #[test]
    fn strips_query_string() {
        let key = CacheKey::from_request_target("/core/os/x86_64/core.files?ts=1").unwrap();
        assert_eq!(key.as_str(), "core/os/x86_64/core.files");
    }

    #[test]
    fn rejects_traversal() {
        assert!(CacheKey::from_request_target("/../etc/passwd").is_err());
        assert!(CacheKey::from_request_target("/core/../../etc/passwd").is_err());
        assert!(CacheKey::from_request_target("/core/%2e%2e/secret").is_err());
        assert!(CacheKey::from_request_target("//etc/passwd").is_ok()); // double slash collapses
        assert!(CacheKey::from_request_target("/").is_err());
        assert!(CacheKey::from_request_target("/a/./b").is_err());
    }

    #[test]
    fn database_detection_uses_basename() {
        assert!(CacheKey::from_request_target("/core/os/x86_64/core.db")
            .unwrap()
            .is_database());
        assert!(!CacheKey::from_request_target("/core.db/nested.pkg")
            .unwrap()
            .is_database());
    }
}
