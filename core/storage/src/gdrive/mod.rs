//! Google Drive folder backend.
//!
//! This module provides:
//! - A thin Drive v3 REST client with multipart and resumable uploads
//! - A `StorageBackend` that keeps every object in one restricted vault folder

pub mod client;
pub mod folder;

pub use client::{DriveClient, DriveFile};
pub use folder::{DriveFolderBackend, FolderConfig};
