//! Backend-qualified vault addresses.
//!
//! An address has the form `<scheme>://<native-path>` and locates exactly one
//! stored object without consulting any external state. Building and parsing
//! are pure functions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

const SEPARATOR: &str = "://";

/// The physical storage systems a vault object can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Object-storage bucket.
    Bucket,
    /// Personal hierarchical file store folder.
    Folder,
}

impl BackendKind {
    /// All variants, in a stable order.
    pub const ALL: [BackendKind; 2] = [BackendKind::Bucket, BackendKind::Folder];

    /// Address scheme emitted by `build`.
    pub fn scheme(&self) -> &'static str {
        match self {
            BackendKind::Bucket => "bucket",
            BackendKind::Folder => "drive",
        }
    }

    /// Resolve a scheme (or its alias) to a backend.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "bucket" => Some(BackendKind::Bucket),
            "drive" | "folder" => Some(BackendKind::Folder),
            _ => None,
        }
    }

    /// Short lowercase label used in logs and statistics.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Bucket => "bucket",
            BackendKind::Folder => "folder",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bucket" => Ok(BackendKind::Bucket),
            "folder" | "drive" => Ok(BackendKind::Folder),
            other => Err(Error::InvalidInput(format!("Unknown backend: {}", other))),
        }
    }
}

/// A parsed vault address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultAddress {
    backend: BackendKind,
    native_path: String,
}

impl VaultAddress {
    /// Create an address for an object on a backend.
    ///
    /// # Errors
    /// - `MalformedAddress` if `native_path` is empty
    pub fn new(backend: BackendKind, native_path: impl Into<String>) -> Result<Self> {
        let native_path = native_path.into();
        if native_path.is_empty() {
            return Err(Error::MalformedAddress(
                "Native path cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            backend,
            native_path,
        })
    }

    /// Parse `<scheme>://<native-path>`.
    ///
    /// # Errors
    /// - `MalformedAddress` on a missing separator, unknown scheme or empty path
    pub fn parse(address: &str) -> Result<Self> {
        let (scheme, path) = address.split_once(SEPARATOR).ok_or_else(|| {
            Error::MalformedAddress("Address has no scheme separator".to_string())
        })?;

        let backend = BackendKind::from_scheme(scheme)
            .ok_or_else(|| Error::MalformedAddress(format!("Unknown scheme '{}'", scheme)))?;

        if path.is_empty() {
            return Err(Error::MalformedAddress(format!(
                "Address '{}' has no path",
                scheme
            )));
        }

        Ok(Self {
            backend,
            native_path: path.to_string(),
        })
    }

    /// Backend this address points into.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Backend-native path or identifier.
    pub fn native_path(&self) -> &str {
        &self.native_path
    }

    /// Split into parts.
    pub fn into_parts(self) -> (BackendKind, String) {
        (self.backend, self.native_path)
    }
}

impl fmt::Display for VaultAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.backend.scheme(), SEPARATOR, self.native_path)
    }
}

impl FromStr for VaultAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Build an address string from its parts.
pub fn build(backend: BackendKind, native_path: &str) -> Result<String> {
    Ok(VaultAddress::new(backend, native_path)?.to_string())
}

/// Parse an address string into its parts.
pub fn parse(address: &str) -> Result<(BackendKind, String)> {
    Ok(VaultAddress::parse(address)?.into_parts())
}

/// Where one copy of a vault document lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Backend holding the object.
    pub backend: BackendKind,
    /// Backend-native path or identifier.
    pub native_path: String,
    /// When the backend accepted the object.
    pub stored_at: DateTime<Utc>,
}

impl StorageLocation {
    /// Create a location stamped with the current time.
    pub fn new(backend: BackendKind, native_path: impl Into<String>) -> Self {
        Self {
            backend,
            native_path: native_path.into(),
            stored_at: Utc::now(),
        }
    }

    /// The address resolving to this location.
    pub fn address(&self) -> VaultAddress {
        VaultAddress {
            backend: self.backend,
            native_path: self.native_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_build_bucket_address() {
        let addr = build(BackendKind::Bucket, "documents/f1/20240101T000000Z_a.txt").unwrap();
        assert_eq!(addr, "bucket://documents/f1/20240101T000000Z_a.txt");
    }

    #[test]
    fn test_build_folder_uses_drive_scheme() {
        let addr = build(BackendKind::Folder, "folder123/file456").unwrap();
        assert_eq!(addr, "drive://folder123/file456");
    }

    #[test]
    fn test_folder_alias_parses() {
        let (backend, path) = parse("folder://abc/def").unwrap();
        assert_eq!(backend, BackendKind::Folder);
        assert_eq!(path, "abc/def");
    }

    #[test]
    fn test_unknown_scheme_fails() {
        let err = parse("s3://bucket/key").unwrap_err();
        assert!(matches!(err, Error::MalformedAddress(_)));
    }

    #[test]
    fn test_missing_path_fails() {
        assert!(matches!(
            parse("bucket://").unwrap_err(),
            Error::MalformedAddress(_)
        ));
        assert!(matches!(
            parse("no-separator").unwrap_err(),
            Error::MalformedAddress(_)
        ));
    }

    #[test]
    fn test_empty_native_path_rejected_on_build() {
        assert!(build(BackendKind::Bucket, "").is_err());
    }

    #[test]
    fn test_location_address() {
        let loc = StorageLocation::new(BackendKind::Bucket, "documents/x");
        assert_eq!(loc.address().to_string(), "bucket://documents/x");
    }

    #[test]
    fn test_backend_kind_serde() {
        let json = serde_json::to_string(&BackendKind::Folder).unwrap();
        assert_eq!(json, "\"folder\"");
        let back: BackendKind = serde_json::from_str("\"bucket\"").unwrap();
        assert_eq!(back, BackendKind::Bucket);
    }

    fn backend_strategy() -> impl Strategy<Value = BackendKind> {
        prop_oneof![Just(BackendKind::Bucket), Just(BackendKind::Folder)]
    }

    proptest! {
        #[test]
        fn prop_build_parse_roundtrip(backend in backend_strategy(), path in "\\PC{1,64}") {
            let address = build(backend, &path).unwrap();
            let (parsed_backend, parsed_path) = parse(&address).unwrap();
            prop_assert_eq!(parsed_backend, backend);
            prop_assert_eq!(parsed_path, path);
        }
    }
}
