//! Storage backends for ScanVault.
//!
//! This module provides a trait-based interface over the physical storage
//! systems a vault writes to (a Cloud Storage bucket and a Drive folder),
//! plus the retry and cancellation handling shared by all of them.
//!
//! # Design Principles
//! - Backend isolation: no backend-specific logic in vault or crypto modules
//! - Opaque payloads: backends store sealed bytes and never see plaintext
//! - Unified error semantics: transient vs. permanent failures are classified
//!   the same way for every backend

pub mod backend;
pub mod credentials;
pub mod gcs;
pub mod gdrive;
mod http;
pub mod kms;
pub mod memory;
pub mod resilient;
pub mod retry;

pub use backend::{list_all, DeleteOutcome, ListPage, ObjectInfo, PutObject, StorageBackend};
pub use credentials::{CredentialProvider, Identity, OAuthRefreshCredentials, StaticCredentials};
pub use gcs::{BucketConfig, BucketPolicy, GcsBucketBackend};
pub use gdrive::{DriveFolderBackend, FolderConfig};
pub use kms::CloudKmsKeyWrapper;
pub use memory::{Fault, MemoryBackend};
pub use resilient::ResilientBackend;
pub use retry::{RetryConfig, RetryExecutor};
