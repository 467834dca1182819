//! Vault engine for ScanVault.
//!
//! This module provides:
//! - The vault manager façade: store, retrieve, list, delete, statistics
//! - A document catalog rebuildable from backend object metadata
//! - A tamper-evident audit log kept next to the stored documents
//! - The migration engine moving at-risk documents into the vault
//!
//! # Architecture
//! Writes flow from a migration decision through the sealer to each enabled
//! backend and then into the audit log. Reads resolve a vault address to one
//! backend and open the envelope found there.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod document;
pub mod manager;
pub mod migration;
pub mod sealer;

pub use audit::{AuditAction, AuditEntry, AuditFilter, AuditLog, AuditOutcome, PeriodVerification};
pub use catalog::{Catalog, CatalogStats, DocumentPage};
pub use config::{StoragePreference, VaultSettings};
pub use document::VaultDocument;
pub use manager::{
    BackendFailure, SecurityStatus, StoreOutcome, StoreRequest, VaultManager, VaultStatistics,
};
pub use migration::{
    evaluate, BatchReport, Classifier, FindingSummary, MigrationCandidate, MigrationDecision,
    MigrationEngine, MigrationOutcome, MigrationPolicy, MigrationSource, MigrationState, RiskLevel,
};
pub use sealer::{KeySource, Sealer};
