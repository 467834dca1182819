//! Migration of at-risk documents into the vault.
//!
//! Per document: `Discovered -> Evaluated -> {Skipped | Migrating -> Migrated | MigrationFailed}`.
//!
//! The decision depends only on the finding count and the configured
//! thresholds. Classifier likelihoods are carried through as metadata and
//! never mapped to risk.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEntry};
use crate::config::MigrationSettings;
use crate::document::VaultDocument;
use crate::manager::{BackendFailure, StoreOutcome, StoreRequest, VaultManager};
use scanvault_common::{Error, MetadataMap, Result};

/// Candidates migrated concurrently by `migrate_batch`.
const BATCH_CONCURRENCY: usize = 4;

/// What the external classifier reported for a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub count: u32,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub likelihoods: Vec<String>,
}

/// External sensitive-data detection service.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn inspect(&self, content: &[u8]) -> Result<FindingSummary>;
}

/// Insecure location documents are migrated out of.
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// Download a document's content.
    async fn fetch(&self, source_id: &str) -> Result<Vec<u8>>;

    /// Remove the source copy after a complete migration.
    async fn remove(&self, source_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds deciding which documents move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPolicy {
    pub min_findings: u32,
    pub high_risk_findings: u32,
    pub remove_source: bool,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self::from(&MigrationSettings::default())
    }
}

impl From<&MigrationSettings> for MigrationPolicy {
    fn from(settings: &MigrationSettings) -> Self {
        Self {
            min_findings: settings.min_findings,
            high_risk_findings: settings.high_risk_findings,
            remove_source: settings.remove_source,
        }
    }
}

impl MigrationPolicy {
    /// Risk rating for a finding count.
    pub fn risk_for(&self, count: u32) -> RiskLevel {
        if count == 0 {
            RiskLevel::None
        } else if count >= self.high_risk_findings {
            RiskLevel::High
        } else if count >= self.min_findings {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Ephemeral outcome of evaluating one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationDecision {
    pub finding_count: u32,
    pub risk: RiskLevel,
    pub must_migrate: bool,
}

/// Decide whether a document must move. Deterministic and side-effect free.
///
/// A missing summary (classifier unavailable) never migrates.
pub fn evaluate(summary: Option<&FindingSummary>, policy: &MigrationPolicy) -> MigrationDecision {
    let finding_count = summary.map_or(0, |s| s.count);
    MigrationDecision {
        finding_count,
        risk: policy.risk_for(finding_count),
        must_migrate: summary.is_some() && finding_count >= policy.min_findings,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    Discovered,
    Evaluated,
    Skipped,
    Migrating,
    Migrated,
    MigrationFailed,
}

impl MigrationState {
    /// Whether `self -> next` is a legal step within one attempt.
    pub fn can_transition(self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Discovered, Evaluated)
                | (Evaluated, Skipped)
                | (Evaluated, Migrating)
                | (Migrating, Migrated)
                | (Migrating, MigrationFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MigrationState::Skipped | MigrationState::Migrated | MigrationState::MigrationFailed
        )
    }
}

/// A document considered for migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCandidate {
    pub source_id: String,
    pub name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Classifier output, when already known.
    #[serde(default)]
    pub findings: Option<FindingSummary>,
    #[serde(default)]
    pub metadata: MetadataMap,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl MigrationCandidate {
    pub fn new(source_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            content_type: default_content_type(),
            findings: None,
            metadata: MetadataMap::new(),
        }
    }

    pub fn with_findings(mut self, findings: FindingSummary) -> Self {
        self.findings = Some(findings);
        self
    }
}

/// Result of migrating one document.
#[derive(Debug)]
pub enum MigrationOutcome {
    /// Below the threshold; nothing written.
    Skipped(MigrationDecision),
    /// Every enabled backend holds the document.
    Migrated {
        decision: MigrationDecision,
        document: VaultDocument,
    },
    /// Some backends hold the document. Migrating again fills in the rest.
    Partial {
        decision: MigrationDecision,
        document: VaultDocument,
        failures: Vec<BackendFailure>,
    },
}

impl MigrationOutcome {
    pub fn decision(&self) -> &MigrationDecision {
        match self {
            MigrationOutcome::Skipped(decision)
            | MigrationOutcome::Migrated { decision, .. }
            | MigrationOutcome::Partial { decision, .. } => decision,
        }
    }

    pub fn document(&self) -> Option<&VaultDocument> {
        match self {
            MigrationOutcome::Skipped(_) => None,
            MigrationOutcome::Migrated { document, .. }
            | MigrationOutcome::Partial { document, .. } => Some(document),
        }
    }

    pub fn state(&self) -> MigrationState {
        match self {
            MigrationOutcome::Skipped(_) => MigrationState::Skipped,
            MigrationOutcome::Migrated { .. } => MigrationState::Migrated,
            MigrationOutcome::Partial { .. } => MigrationState::MigrationFailed,
        }
    }
}

/// Summary of `migrate_batch`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub migrated: Vec<String>,
    pub partial: Vec<String>,
    pub skipped: Vec<String>,
    /// Source id and error message.
    pub failed: Vec<(String, String)>,
    /// Source copies removed after migration.
    pub removed: Vec<String>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.migrated.len() + self.partial.len() + self.skipped.len() + self.failed.len()
    }
}

/// One attempt's position in the state machine.
struct Attempt<'a> {
    engine: &'a MigrationEngine,
    source_id: String,
    state: MigrationState,
}

impl Attempt<'_> {
    async fn advance(&mut self, next: MigrationState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::InvalidInput(format!(
                "Illegal migration transition {:?} -> {:?} for '{}'",
                self.state, next, self.source_id
            )));
        }
        debug!(source_id = %self.source_id, from = ?self.state, to = ?next, "Migration state");
        self.state = next;
        self.engine
            .states
            .write()
            .await
            .insert(self.source_id.clone(), next);
        Ok(())
    }
}

/// Drives documents into the vault.
///
/// Concurrent migrations of different documents are independent. Two
/// concurrent migrations of the same document may both write; serialize them
/// upstream when at-most-once is required.
pub struct MigrationEngine {
    vault: Arc<VaultManager>,
    policy: MigrationPolicy,
    classifier: Option<Arc<dyn Classifier>>,
    states: RwLock<HashMap<String, MigrationState>>,
}

impl MigrationEngine {
    /// Create an engine using the vault's configured thresholds.
    pub fn new(vault: Arc<VaultManager>) -> Self {
        let policy = MigrationPolicy::from(&vault.settings().migration);
        Self::with_policy(vault, policy)
    }

    pub fn with_policy(vault: Arc<VaultManager>, policy: MigrationPolicy) -> Self {
        Self {
            vault,
            policy,
            classifier: None,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Classify candidates that arrive without findings.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn policy(&self) -> &MigrationPolicy {
        &self.policy
    }

    /// Last recorded state of a document.
    pub async fn state_of(&self, source_id: &str) -> Option<MigrationState> {
        self.states.read().await.get(source_id).copied()
    }

    /// Decide for one summary under this engine's policy.
    pub fn evaluate(&self, summary: Option<&FindingSummary>) -> MigrationDecision {
        evaluate(summary, &self.policy)
    }

    async fn begin(&self, source_id: &str) -> Attempt<'_> {
        self.states
            .write()
            .await
            .insert(source_id.to_string(), MigrationState::Discovered);
        Attempt {
            engine: self,
            source_id: source_id.to_string(),
            state: MigrationState::Discovered,
        }
    }

    /// Ask the classifier, treating an unavailable classifier as no findings.
    async fn classify(&self, source_id: &str, content: &[u8]) -> Option<FindingSummary> {
        let classifier = self.classifier.as_ref()?;
        match classifier.inspect(content).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(source_id, error = %err, "Classifier unavailable, not migrating");
                None
            }
        }
    }

    /// Migrate one document whose content is already in hand.
    ///
    /// Idempotent: migrating unchanged content again writes only to backends
    /// still missing a copy.
    ///
    /// # Errors
    /// - Sealing errors, or the backend error when no backend took a copy
    pub async fn migrate(
        &self,
        candidate: &MigrationCandidate,
        plaintext: &[u8],
    ) -> Result<MigrationOutcome> {
        let mut attempt = self.begin(&candidate.source_id).await;

        let findings = match &candidate.findings {
            Some(findings) => Some(findings.clone()),
            None => self.classify(&candidate.source_id, plaintext).await,
        };
        let decision = self.evaluate(findings.as_ref());
        attempt.advance(MigrationState::Evaluated).await?;

        if !decision.must_migrate {
            attempt.advance(MigrationState::Skipped).await?;
            debug!(source_id = %candidate.source_id, findings = decision.finding_count, "Migration skipped");
            return Ok(MigrationOutcome::Skipped(decision));
        }

        attempt.advance(MigrationState::Migrating).await?;
        let request = StoreRequest::new(
            candidate.source_id.clone(),
            candidate.name.clone(),
            plaintext.to_vec(),
        )
        .with_content_type(candidate.content_type.clone())
        .with_metadata(migration_metadata(candidate, findings.as_ref(), &decision));

        let result = self.vault.store_with(request, &CancellationToken::new()).await;

        let entry = AuditEntry::new(
            AuditAction::Migrate,
            &candidate.source_id,
            &self.vault.settings().actor,
        );
        let outcome = match result {
            Ok(StoreOutcome::Complete(document)) => {
                attempt.advance(MigrationState::Migrated).await?;
                self.vault.audit().record(entry);
                info!(source_id = %candidate.source_id, risk = %decision.risk, "Document migrated");
                MigrationOutcome::Migrated { decision, document }
            }
            Ok(StoreOutcome::Partial { document, failures }) => {
                attempt.advance(MigrationState::MigrationFailed).await?;
                let missing: Vec<String> =
                    failures.iter().map(|f| f.backend.to_string()).collect();
                self.vault
                    .audit()
                    .record(entry.failed(format!("partial migration, missing {}", missing.join(","))));
                warn!(source_id = %candidate.source_id, missing = ?missing, "Partial migration");
                MigrationOutcome::Partial {
                    decision,
                    document,
                    failures,
                }
            }
            Err(err) => {
                attempt.advance(MigrationState::MigrationFailed).await?;
                self.vault.audit().record(entry.failed(&err));
                return Err(err);
            }
        };
        Ok(outcome)
    }

    /// Migrate many documents, fetching content from `source` only when needed.
    ///
    /// With `remove_source` set, a source copy is removed only after every
    /// enabled backend holds the document.
    pub async fn migrate_batch(
        &self,
        candidates: Vec<MigrationCandidate>,
        source: &dyn MigrationSource,
    ) -> BatchReport {
        let results: Vec<(String, Result<MigrationOutcome>, bool)> = stream::iter(candidates)
            .map(|candidate| async move {
                let result = self.migrate_from(&candidate, source).await;
                let removed = match &result {
                    Ok(MigrationOutcome::Migrated { .. }) if self.policy.remove_source => {
                        match source.remove(&candidate.source_id).await {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(source_id = %candidate.source_id, error = %err, "Could not remove source copy");
                                false
                            }
                        }
                    }
                    _ => false,
                };
                (candidate.source_id, result, removed)
            })
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (source_id, result, removed) in results {
            if removed {
                report.removed.push(source_id.clone());
            }
            match result {
                Ok(MigrationOutcome::Migrated { .. }) => report.migrated.push(source_id),
                Ok(MigrationOutcome::Partial { .. }) => report.partial.push(source_id),
                Ok(MigrationOutcome::Skipped(_)) => report.skipped.push(source_id),
                Err(err) => report.failed.push((source_id, err.to_string())),
            }
        }

        info!(
            migrated = report.migrated.len(),
            partial = report.partial.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Batch migration finished"
        );
        report
    }

    async fn migrate_from(
        &self,
        candidate: &MigrationCandidate,
        source: &dyn MigrationSource,
    ) -> Result<MigrationOutcome> {
        // Candidates with known findings below the threshold are never downloaded.
        if let Some(findings) = &candidate.findings {
            let decision = self.evaluate(Some(findings));
            if !decision.must_migrate {
                let mut attempt = self.begin(&candidate.source_id).await;
                attempt.advance(MigrationState::Evaluated).await?;
                attempt.advance(MigrationState::Skipped).await?;
                return Ok(MigrationOutcome::Skipped(decision));
            }
        } else if self.classifier.is_none() {
            let decision = self.evaluate(None);
            let mut attempt = self.begin(&candidate.source_id).await;
            attempt.advance(MigrationState::Evaluated).await?;
            attempt.advance(MigrationState::Skipped).await?;
            return Ok(MigrationOutcome::Skipped(decision));
        }

        let content = source.fetch(&candidate.source_id).await?;
        self.migrate(candidate, &content).await
    }
}

fn migration_metadata(
    candidate: &MigrationCandidate,
    findings: Option<&FindingSummary>,
    decision: &MigrationDecision,
) -> MetadataMap {
    let mut metadata = candidate.metadata.clone();
    metadata.insert("findings".into(), decision.finding_count.to_string());
    metadata.insert("risk".into(), decision.risk.to_string());
    if let Some(findings) = findings {
        if !findings.types.is_empty() {
            metadata.insert("finding_types".into(), findings.types.join(","));
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(count: u32) -> FindingSummary {
        FindingSummary {
            count,
            types: vec!["US_SOCIAL_SECURITY_NUMBER".into()],
            likelihoods: vec!["LIKELY".into()],
        }
    }

    #[test]
    fn test_threshold_boundary() {
        let policy = MigrationPolicy::default();
        assert!(!evaluate(Some(&summary(0)), &policy).must_migrate);
        assert!(evaluate(Some(&summary(1)), &policy).must_migrate);
    }

    #[test]
    fn test_missing_summary_never_migrates() {
        let decision = evaluate(None, &MigrationPolicy::default());
        assert!(!decision.must_migrate);
        assert_eq!(decision.risk, RiskLevel::None);
    }

    #[test]
    fn test_risk_levels() {
        let policy = MigrationPolicy {
            min_findings: 3,
            high_risk_findings: 10,
            remove_source: false,
        };
        assert_eq!(policy.risk_for(0), RiskLevel::None);
        assert_eq!(policy.risk_for(2), RiskLevel::Low);
        assert_eq!(policy.risk_for(3), RiskLevel::Medium);
        assert_eq!(policy.risk_for(10), RiskLevel::High);
        assert!(!evaluate(Some(&summary(2)), &policy).must_migrate);
    }

    #[test]
    fn test_transitions() {
        use MigrationState::*;
        assert!(Discovered.can_transition(Evaluated));
        assert!(Evaluated.can_transition(Skipped));
        assert!(Migrating.can_transition(MigrationFailed));
        assert!(!Discovered.can_transition(Migrated));
        assert!(!Skipped.can_transition(Migrating));
        assert!(Migrated.is_terminal());
        assert!(!Migrating.is_terminal());
    }

    #[test]
    fn test_metadata_carries_decision() {
        let candidate = MigrationCandidate::new("f1", "a.txt");
        let decision = evaluate(Some(&summary(4)), &MigrationPolicy::default());
        let meta = migration_metadata(&candidate, Some(&summary(4)), &decision);
        assert_eq!(meta["findings"], "4");
        assert_eq!(meta["risk"], "medium");
        assert_eq!(meta["finding_types"], "US_SOCIAL_SECURITY_NUMBER");
    }

    #[test]
    fn test_candidate_from_json() {
        let candidate: MigrationCandidate = serde_json::from_str(
            r#"{ "source_id": "f1", "name": "a.txt", "findings": { "count": 2 } }"#,
        )
        .unwrap();
        assert_eq!(candidate.findings.unwrap().count, 2);
        assert_eq!(candidate.content_type, "application/octet-stream");
    }
}
