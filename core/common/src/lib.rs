//! Common utilities and types shared across ScanVault modules.
//!
//! This module provides the error taxonomy and the vault address scheme that
//! every other crate builds on.

pub mod address;
pub mod error;
pub mod types;

pub use address::{BackendKind, StorageLocation, VaultAddress};
pub use error::{Error, Result};
pub use types::{MetadataMap, SensitiveBytes};
