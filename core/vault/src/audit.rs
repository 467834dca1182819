//! Append-only audit trail.
//!
//! Entries are written as newline-delimited JSON to one object per day
//! (`<prefix>YYYY/MM/DD.ndjson`). Object stores cannot append, so the current
//! period is cached and the whole object is rewritten on each write.
//!
//! Each entry carries a sequence number and the hash of its predecessor, so
//! edits or removals inside a period object are detectable.
//!
//! Recording never waits on the backend. A failed write is logged locally and
//! counted, and its entries stay pending until a later write succeeds.

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use scanvault_common::{BackendKind, Error, Result};
use scanvault_storage::{list_all, PutObject, StorageBackend};

/// Current record schema version.
pub const AUDIT_FORMAT_VERSION: u32 = 1;

/// `prev_hash` of the first entry in a period.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const PERIOD_SUFFIX: &str = ".ndjson";
const PERIOD_FORMAT: &str = "%Y/%m/%d";
const AUDIT_CONTENT_TYPE: &str = "application/x-ndjson";

/// Entries that may wait for the writer before new ones are dropped.
pub const AUDIT_QUEUE_CAPACITY: usize = 10_000;

/// Audited vault operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Store,
    Retrieve,
    Delete,
    Migrate,
    List,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Store => "STORE",
            AuditAction::Retrieve => "RETRIEVE",
            AuditAction::Delete => "DELETE",
            AuditAction::Migrate => "MIGRATE",
            AuditAction::List => "LIST",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STORE" => Ok(AuditAction::Store),
            "RETRIEVE" => Ok(AuditAction::Retrieve),
            "DELETE" => Ok(AuditAction::Delete),
            "MIGRATE" => Ok(AuditAction::Migrate),
            "LIST" => Ok(AuditAction::List),
            other => Err(Error::InvalidInput(format!("Unknown audit action '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One audit record.
///
/// Serialized as a flat JSON object. `seq`, `prev_hash` and `hash` are
/// assigned when the entry is written to its period object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(rename = "v")]
    pub format_version: u32,
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Document source id or vault address.
    pub subject: String,
    pub action: AuditAction,
    pub actor: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub prev_hash: String,
    #[serde(default)]
    pub hash: String,
}

impl AuditEntry {
    /// A successful entry stamped now.
    pub fn new(action: AuditAction, subject: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            format_version: AUDIT_FORMAT_VERSION,
            seq: 0,
            timestamp: Utc::now(),
            subject: subject.into(),
            action,
            actor: actor.into(),
            outcome: AuditOutcome::Success,
            backend: None,
            address: None,
            error: None,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Mark the entry failed.
    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.error = Some(error.to_string());
        self
    }

    /// Record the outcome of `result`.
    pub fn outcome_of<T>(self, result: &Result<T>) -> Self {
        match result {
            Ok(_) => self,
            Err(err) => self.failed(err),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AuditOutcome::Success
    }

    /// Hash over every field except `hash` itself.
    pub fn compute_hash(&self) -> Result<String> {
        let canonical = AuditEntry {
            hash: String::new(),
            ..self.clone()
        };
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    fn chain(mut self, seq: u64, prev_hash: &str) -> Result<Self> {
        self.seq = seq;
        self.prev_hash = prev_hash.to_string();
        self.hash = self.compute_hash()?;
        Ok(self)
    }
}

/// Selects entries in `AuditLog::query`.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub subject: Option<String>,
    pub action: Option<AuditAction>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.subject.as_ref().map_or(true, |s| *s == entry.subject)
            && self.action.map_or(true, |a| a == entry.action)
            && self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp < t)
    }

    /// Whether a whole period can hold matching entries.
    fn covers(&self, period: NaiveDate) -> bool {
        self.since.map_or(true, |t| period >= t.date_naive())
            && self.until.map_or(true, |t| period <= t.date_naive())
    }
}

/// Result of re-checking one period's hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodVerification {
    pub period: String,
    pub entries: u64,
    /// Sequence number of the first entry that does not chain.
    pub broken_at: Option<u64>,
}

impl PeriodVerification {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }
}

/// Entry stream returned by `query`.
pub type AuditStream<'a> = Pin<Box<dyn Stream<Item = Result<AuditEntry>> + Send + 'a>>;

#[derive(Default)]
struct PeriodBuffer {
    /// Lines known to be in the backend object.
    committed: Vec<String>,
    last_seq: u64,
    last_hash: String,
    loaded: bool,
    /// Entries recorded but not yet written.
    pending: Vec<AuditEntry>,
    /// How many of `pending` were already reported as not durable.
    reported: usize,
}

/// Minimal view of a stored line, tolerant of newer schemas.
#[derive(Deserialize)]
struct ChainLink {
    seq: u64,
    hash: String,
}

enum WriterCommand {
    Record { period: String, entry: AuditEntry },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    write_failures: AtomicU64,
    pending: AtomicUsize,
}

/// Audit log writing period objects to one backend.
///
/// `record` only enqueues; a background writer task owns the period buffers
/// and does all backend I/O, so a slow or unreachable audit backend never
/// holds up the operation being audited.
pub struct AuditLog {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    queue: OnceLock<mpsc::Sender<WriterCommand>>,
    counters: Arc<Counters>,
}

impl AuditLog {
    /// Create an audit log storing period objects under `prefix`.
    ///
    /// The writer task is started on the first `record`.
    pub fn new(backend: Arc<dyn StorageBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            queue: OnceLock::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Backend holding the period objects.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Object key of the period containing `at`.
    pub fn period_key(&self, at: DateTime<Utc>) -> String {
        format!("{}{}{}", self.prefix, at.format(PERIOD_FORMAT), PERIOD_SUFFIX)
    }

    fn period_of(&self, key: &str) -> Option<NaiveDate> {
        let date = key.strip_prefix(&self.prefix)?.strip_suffix(PERIOD_SUFFIX)?;
        NaiveDate::parse_from_str(date, PERIOD_FORMAT).ok()
    }

    /// Number of failed period writes and dropped entries since start.
    pub fn write_failures(&self) -> u64 {
        self.counters.write_failures.load(Ordering::Relaxed)
    }

    /// Entries recorded but not yet durable.
    pub fn pending_entries(&self) -> usize {
        self.counters.pending.load(Ordering::SeqCst)
    }

    /// Append an entry. Returns at once and never fails.
    ///
    /// The entry is written by the background writer. If it cannot be queued
    /// it is logged locally and counted as a write failure.
    pub fn record(&self, entry: AuditEntry) {
        let Some(queue) = self.queue() else {
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            report_not_durable(&entry, "no runtime for audit writer");
            return;
        };

        let period = self.period_key(entry.timestamp);
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = queue.try_send(WriterCommand::Record { period, entry }) {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            let (reason, command) = match err {
                TrySendError::Full(command) => ("audit queue full", command),
                TrySendError::Closed(command) => ("audit writer stopped", command),
            };
            if let WriterCommand::Record { entry, .. } = command {
                report_not_durable(&entry, reason);
            }
        }
    }

    /// Wait until every entry recorded so far has had a write attempt.
    ///
    /// Entries whose write failed stay pending; check `pending_entries`.
    pub async fn flush(&self) {
        let Some(queue) = self.queue() else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if queue.send(WriterCommand::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    fn queue(&self) -> Option<&mpsc::Sender<WriterCommand>> {
        if let Some(queue) = self.queue.get() {
            return Some(queue);
        }
        let runtime = Handle::try_current().ok()?;
        Some(self.queue.get_or_init(|| {
            let (sender, receiver) = mpsc::channel(AUDIT_QUEUE_CAPACITY);
            let writer = PeriodWriter {
                backend: self.backend.clone(),
                periods: BTreeMap::new(),
                counters: self.counters.clone(),
            };
            runtime.spawn(writer.run(receiver));
            sender
        }))
    }

    /// Lazily scan period objects for entries matching `filter`.
    ///
    /// Periods are read one at a time in chronological order. Entries still
    /// pending a write are not included. Lines with a newer format version
    /// are skipped.
    pub fn query(&self, filter: AuditFilter) -> AuditStream<'_> {
        let backend = self.backend.as_ref();
        let filter = Arc::new(filter);
        let period_filter = filter.clone();

        let entries = list_all(backend, &self.prefix, 100)
            .try_filter(move |info| {
                let keep = self
                    .period_of(&info.key)
                    .map_or(false, |period| period_filter.covers(period));
                async move { keep }
            })
            .and_then(move |info| async move {
                let bytes = backend.get(&info.location.native_path).await?;
                let entries: Vec<Result<AuditEntry>> = split_lines(&bytes)?
                    .iter()
                    .filter_map(|line| parse_entry(line))
                    .collect();
                Ok(stream::iter(entries))
            })
            .try_flatten()
            .try_filter(move |entry| {
                let keep = filter.matches(entry);
                async move { keep }
            });

        Box::pin(entries)
    }

    /// Collect every entry matching `filter`.
    pub async fn entries(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>> {
        self.query(filter).try_collect().await
    }

    /// Recompute the hash chain of the period containing `day`.
    pub async fn verify_period(&self, day: NaiveDate) -> Result<PeriodVerification> {
        let key = format!("{}{}{}", self.prefix, day.format(PERIOD_FORMAT), PERIOD_SUFFIX);
        let lines = load_lines(self.backend.as_ref(), &key).await?;

        let mut prev_hash = GENESIS_HASH.to_string();
        let mut broken_at = None;
        for (index, line) in lines.iter().enumerate() {
            let expected_seq = index as u64 + 1;
            let entry: AuditEntry = serde_json::from_str(line)?;
            let intact = entry.seq == expected_seq
                && entry.prev_hash == prev_hash
                && entry.compute_hash()? == entry.hash;
            if !intact {
                broken_at = Some(expected_seq);
                break;
            }
            prev_hash = entry.hash;
        }

        Ok(PeriodVerification {
            period: key,
            entries: lines.len() as u64,
            broken_at,
        })
    }
}

/// Owns the period buffers and performs every audit write.
struct PeriodWriter {
    backend: Arc<dyn StorageBackend>,
    periods: BTreeMap<String, PeriodBuffer>,
    counters: Arc<Counters>,
}

impl PeriodWriter {
    async fn run(mut self, mut commands: mpsc::Receiver<WriterCommand>) {
        while let Some(command) = commands.recv().await {
            let mut waiters = Vec::new();
            self.accept(command, &mut waiters);
            // Batch whatever queued up while the last write was in flight.
            while let Ok(command) = commands.try_recv() {
                self.accept(command, &mut waiters);
            }
            self.write_pending().await;
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        // Last chance for entries left pending by a failed write.
        self.write_pending().await;
    }

    fn accept(&mut self, command: WriterCommand, waiters: &mut Vec<oneshot::Sender<()>>) {
        match command {
            WriterCommand::Record { period, entry } => {
                self.periods.entry(period).or_default().pending.push(entry);
            }
            WriterCommand::Flush(done) => waiters.push(done),
        }
    }

    async fn write_pending(&mut self) {
        for (key, buffer) in self.periods.iter_mut() {
            if buffer.pending.is_empty() {
                continue;
            }
            match write_period(self.backend.as_ref(), key, buffer).await {
                Ok(written) => {
                    self.counters.pending.fetch_sub(written, Ordering::SeqCst);
                }
                Err(err) => {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        period = %key,
                        pending = buffer.pending.len(),
                        error = %err,
                        "Audit period write failed"
                    );
                    for entry in &buffer.pending[buffer.reported..] {
                        report_not_durable(entry, "audit backend write failed");
                    }
                    buffer.reported = buffer.pending.len();
                }
            }
        }

        // Older periods are only kept while they still have pending entries.
        let newest = self.periods.keys().next_back().cloned();
        self.periods
            .retain(|key, buffer| Some(key) == newest.as_ref() || !buffer.pending.is_empty());
    }
}

/// Chain and write a period's pending entries, returning how many were written.
async fn write_period(
    backend: &dyn StorageBackend,
    key: &str,
    buffer: &mut PeriodBuffer,
) -> Result<usize> {
    if !buffer.loaded {
        let lines = load_lines(backend, key).await?;
        let (last_seq, last_hash) = match lines.last() {
            Some(line) => {
                let link: ChainLink = serde_json::from_str(line)?;
                (link.seq, link.hash)
            }
            None => (0, GENESIS_HASH.to_string()),
        };
        buffer.committed = lines;
        buffer.last_seq = last_seq;
        buffer.last_hash = last_hash;
        buffer.loaded = true;
    }

    let mut seq = buffer.last_seq;
    let mut prev_hash = buffer.last_hash.clone();
    let mut new_lines = Vec::with_capacity(buffer.pending.len());
    for entry in &buffer.pending {
        seq += 1;
        let chained = entry.clone().chain(seq, &prev_hash)?;
        prev_hash = chained.hash.clone();
        new_lines.push(serde_json::to_string(&chained)?);
    }

    let mut body = String::new();
    for line in buffer.committed.iter().chain(new_lines.iter()) {
        body.push_str(line);
        body.push('\n');
    }

    backend
        .put(PutObject::new(key, body.into_bytes(), AUDIT_CONTENT_TYPE))
        .await?;

    let written = new_lines.len();
    debug!(period = %key, written, "Audit period written");
    buffer.committed.extend(new_lines);
    buffer.last_seq = seq;
    buffer.last_hash = prev_hash;
    buffer.pending.clear();
    buffer.reported = 0;
    Ok(written)
}

/// Read a period object's lines; a missing object is an empty period.
async fn load_lines(backend: &dyn StorageBackend, key: &str) -> Result<Vec<String>> {
    let Some(info) = backend.find(key).await? else {
        return Ok(Vec::new());
    };
    let bytes = match backend.get(&info.location.native_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.is_not_found() => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    split_lines(&bytes)
}

fn report_not_durable(entry: &AuditEntry, reason: &str) {
    warn!(
        reason,
        timestamp = %entry.timestamp,
        subject = %entry.subject,
        action = %entry.action,
        actor = %entry.actor,
        outcome = ?entry.outcome,
        backend = ?entry.backend,
        address = ?entry.address,
        error = ?entry.error,
        "Audit entry not yet durable"
    );
}

fn split_lines(bytes: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Format(format!("Audit object is not UTF-8: {}", e)))?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_entry(line: &str) -> Option<Result<AuditEntry>> {
    let version = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("v").and_then(serde_json::Value::as_u64));
    match version {
        Some(v) if v > u64::from(AUDIT_FORMAT_VERSION) => {
            debug!(version = v, "Skipping audit record with newer format");
            None
        }
        _ => Some(serde_json::from_str(line).map_err(Error::from)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scanvault_storage::{Fault, MemoryBackend};
    use std::time::{Duration, Instant};

    fn log_on(backend: Arc<MemoryBackend>) -> AuditLog {
        AuditLog::new(backend, "audit_logs/")
    }

    fn entry_at(action: AuditAction, subject: &str, at: DateTime<Utc>) -> AuditEntry {
        AuditEntry {
            timestamp: at,
            ..AuditEntry::new(action, subject, "tester")
        }
    }

    #[tokio::test]
    async fn test_period_key_layout() {
        let log = log_on(Arc::new(MemoryBackend::bucket()));
        let at = Utc.with_ymd_and_hms(2024, 2, 9, 23, 59, 0).unwrap();
        assert_eq!(log.period_key(at), "audit_logs/2024/02/09.ndjson");
    }

    #[tokio::test]
    async fn test_records_are_appended_as_ndjson() {
        let backend = Arc::new(MemoryBackend::bucket());
        let log = log_on(backend.clone());

        log.record(AuditEntry::new(AuditAction::Store, "doc-1", "tester"));
        log.record(AuditEntry::new(AuditAction::Retrieve, "doc-1", "tester").failed("boom"));
        log.flush().await;

        let key = log.period_key(Utc::now());
        let body = String::from_utf8(backend.get(&key).await.unwrap()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"action\":\"STORE\""));
        assert!(lines[1].contains("\"outcome\":\"failure\""));
        assert!(lines[1].contains("\"v\":1"));
    }

    #[tokio::test]
    async fn test_existing_period_object_is_extended() {
        let backend = Arc::new(MemoryBackend::bucket());
        let first = log_on(backend.clone());
        first.record(AuditEntry::new(AuditAction::Store, "a", "tester"));
        first.flush().await;

        // A fresh process must not overwrite what is already stored.
        let log = log_on(backend.clone());
        log.record(AuditEntry::new(AuditAction::Delete, "a", "tester"));
        log.flush().await;

        let entries = log.entries(AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].seq, 2);
        assert!(log.verify_period(Utc::now().date_naive()).await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_failed_write_is_kept_and_flushed_later() {
        let backend = Arc::new(MemoryBackend::bucket());
        let log = log_on(backend.clone());

        backend.set_fault(Fault::Rejecting).await;
        log.record(AuditEntry::new(AuditAction::Store, "a", "tester"));
        log.flush().await;
        assert_eq!(log.write_failures(), 1);
        assert_eq!(log.pending_entries(), 1);

        backend.set_fault(Fault::Healthy).await;
        log.record(AuditEntry::new(AuditAction::Store, "b", "tester"));
        log.flush().await;
        assert_eq!(log.pending_entries(), 0);

        let entries = log.entries(AuditFilter::default()).await.unwrap();
        let subjects: Vec<&str> = entries.iter().map(|e| e.subject.as_str()).collect();
        assert_eq!(subjects, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let log = log_on(Arc::new(MemoryBackend::bucket()));
        let day1 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();

        log.record(entry_at(AuditAction::Store, "a", day1));
        log.record(entry_at(AuditAction::Delete, "a", day1));
        log.record(entry_at(AuditAction::Store, "b", day2));
        log.flush().await;

        let stores = log
            .entries(AuditFilter::default().action(AuditAction::Store))
            .await
            .unwrap();
        assert_eq!(stores.len(), 2);

        let for_a = log.entries(AuditFilter::default().subject("a")).await.unwrap();
        assert_eq!(for_a.len(), 2);

        let day2_only = log
            .entries(AuditFilter::default().between(day2, day2 + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(day2_only.len(), 1);
        assert_eq!(day2_only[0].subject, "b");
    }

    #[tokio::test]
    async fn test_tampering_breaks_chain() {
        let backend = Arc::new(MemoryBackend::bucket());
        let log = log_on(backend.clone());
        for subject in ["a", "b", "c"] {
            log.record(AuditEntry::new(AuditAction::Store, subject, "tester"));
        }
        log.flush().await;

        let key = log.period_key(Utc::now());
        let body = String::from_utf8(backend.get(&key).await.unwrap()).unwrap();
        let tampered = body.replacen("\"subject\":\"b\"", "\"subject\":\"x\"", 1);
        backend
            .put(PutObject::new(key.clone(), tampered.into_bytes(), AUDIT_CONTENT_TYPE))
            .await
            .unwrap();

        let report = log.verify_period(Utc::now().date_naive()).await.unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.broken_at, Some(2));
    }

    #[tokio::test]
    async fn test_newer_format_lines_are_skipped() {
        let backend = Arc::new(MemoryBackend::bucket());
        let log = log_on(backend.clone());
        let key = log.period_key(Utc::now());
        backend
            .put(PutObject::new(
                key,
                b"{\"v\":99,\"anything\":true}\n".to_vec(),
                AUDIT_CONTENT_TYPE,
            ))
            .await
            .unwrap();

        assert!(log.entries(AuditFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_does_not_wait_for_slow_backend() {
        let backend = Arc::new(MemoryBackend::bucket());
        backend.set_put_delay(Some(Duration::from_millis(300))).await;
        let log = log_on(backend.clone());

        let started = Instant::now();
        for subject in ["a", "b", "c"] {
            log.record(AuditEntry::new(AuditAction::Store, subject, "tester"));
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(log.pending_entries(), 3);

        log.flush().await;
        assert_eq!(log.pending_entries(), 0);
        let entries = log.entries(AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].seq, 3);
    }

    #[tokio::test]
    async fn test_restart_on_folder_backend_keeps_earlier_entries() {
        let backend = Arc::new(MemoryBackend::folder());
        let yesterday = Utc::now() - chrono::Duration::days(1);

        let first = log_on(backend.clone());
        first.record(entry_at(AuditAction::Store, "older", yesterday));
        first.record(AuditEntry::new(AuditAction::Store, "a", "tester"));
        first.record(AuditEntry::new(AuditAction::Retrieve, "a", "tester"));
        first.flush().await;
        drop(first);

        let second = log_on(backend.clone());
        second.record(AuditEntry::new(AuditAction::Delete, "a", "tester"));
        second.flush().await;

        let today = second
            .entries(AuditFilter::default().subject("a"))
            .await
            .unwrap();
        let seqs: Vec<u64> = today.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(today[2].action, AuditAction::Delete);
        let report = second.verify_period(Utc::now().date_naive()).await.unwrap();
        assert_eq!(report.entries, 3);
        assert!(report.is_intact());
    }

    #[test]
    fn test_hash_ignores_own_field() {
        let entry = AuditEntry::new(AuditAction::List, "prefix", "tester");
        let chained = entry.clone().chain(1, GENESIS_HASH).unwrap();
        assert_eq!(chained.compute_hash().unwrap(), chained.hash);
        assert_ne!(chained.hash, entry.compute_hash().unwrap());
    }
}
