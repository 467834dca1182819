//! ScanVault CLI - Command line interface for the hybrid encrypted vault.
//!
//! This tool stores, retrieves, lists and deletes vault documents, drives
//! batch migration of at-risk files, and inspects the audit trail.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use scanvault_common::{MetadataMap, SensitiveBytes};
use scanvault_storage::{
    CredentialProvider, DeleteOutcome, Identity, OAuthRefreshCredentials, StaticCredentials,
};
use scanvault_vault::{
    AuditAction, AuditFilter, MigrationCandidate, MigrationEngine, MigrationSource, StoreOutcome,
    VaultManager, VaultSettings,
};

/// How long to wait for pending audit writes before exiting.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "scanvault")]
#[command(about = "ScanVault - Hybrid encrypted document vault")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (JSON). Environment overrides apply on top.
    #[arg(short, long, env = "SCANVAULT_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    auth: AuthArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AuthArgs {
    /// Pre-obtained OAuth2 access token.
    #[arg(long, env = "SCANVAULT_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// OAuth2 refresh token, exchanged for access tokens as needed.
    #[arg(long, env = "SCANVAULT_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// OAuth2 client id used with the refresh token.
    #[arg(long, env = "SCANVAULT_CLIENT_ID")]
    client_id: Option<String>,

    /// OAuth2 client secret used with the refresh token.
    #[arg(long, env = "SCANVAULT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Act on behalf of this user instead of the service identity.
    #[arg(long)]
    impersonate: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file into the vault.
    Store {
        /// Identity of the document in its originating system.
        #[arg(short, long)]
        source_id: String,

        /// File to store.
        #[arg(short, long)]
        file: PathBuf,

        /// Display name (default: the file name).
        #[arg(short, long)]
        name: Option<String>,

        /// Content type recorded with the document.
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,

        /// Metadata entries as key=value.
        #[arg(short, long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// Decrypt a stored object.
    Retrieve {
        /// Vault address (bucket://... or drive://...).
        address: String,

        /// Destination file.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List vault documents.
    List {
        /// Source id prefix.
        #[arg(short, long, default_value = "")]
        prefix: String,

        /// Token from a previous page.
        #[arg(short = 't', long)]
        page_token: Option<String>,

        /// Documents per page (default: from settings).
        #[arg(short = 'n', long)]
        page_size: Option<usize>,
    },

    /// Delete one stored copy, or every copy of a document.
    Delete {
        /// Vault address of the copy to delete.
        #[arg(conflicts_with = "document", required_unless_present = "document")]
        address: Option<String>,

        /// Delete every copy of this source id.
        #[arg(short, long)]
        document: Option<String>,
    },

    /// Show document counts.
    Stats,

    /// Show encryption and backend security settings.
    Status,

    /// Migrate candidates listed in a JSON file.
    Migrate {
        /// JSON array of candidates (source_id, name, findings, metadata).
        #[arg(short, long)]
        candidates: PathBuf,

        /// Directory holding each candidate's content, named by source id.
        #[arg(short, long)]
        source_dir: PathBuf,

        /// Remove source files once every enabled backend holds them.
        #[arg(long)]
        remove_source: bool,
    },

    /// Query or verify the audit trail.
    Audit {
        /// Only entries for this subject.
        #[arg(short, long)]
        subject: Option<String>,

        /// Only entries for this action (STORE, RETRIEVE, DELETE, MIGRATE, LIST).
        #[arg(short, long)]
        action: Option<AuditAction>,

        /// Only entries at or after this RFC 3339 time.
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only entries before this RFC 3339 time.
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Verify the hash chain of this day (YYYY-MM-DD) instead of listing.
        #[arg(long, conflicts_with_all = ["subject", "action", "since", "until"])]
        verify: Option<NaiveDate>,
    },

    /// Rebuild the document index from backend metadata.
    RebuildIndex,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let vault = Arc::new(open_vault(&cli).await?);

    let result = match cli.command {
        Commands::Store {
            source_id,
            file,
            name,
            content_type,
            metadata,
        } => cmd_store(&vault, &source_id, &file, name, content_type, metadata).await,

        Commands::Retrieve { address, output } => cmd_retrieve(&vault, &address, &output).await,

        Commands::List {
            prefix,
            page_token,
            page_size,
        } => cmd_list(&vault, &prefix, page_token.as_deref(), page_size).await,

        Commands::Delete { address, document } => cmd_delete(&vault, address, document).await,

        Commands::Stats => cmd_stats(&vault).await,

        Commands::Status => print_json(&vault.security_status().await),

        Commands::Migrate {
            candidates,
            source_dir,
            remove_source,
        } => cmd_migrate(vault.clone(), &candidates, source_dir, remove_source).await,

        Commands::Audit {
            subject,
            action,
            since,
            until,
            verify,
        } => {
            let filter = AuditFilter {
                subject,
                action,
                since,
                until,
            };
            cmd_audit(&vault, filter, verify).await
        }

        Commands::RebuildIndex => vault
            .rebuild_index()
            .await
            .context("Failed to rebuild index")
            .map(|count| println!("Indexed {} documents.", count)),
    };

    drain_audit(&vault).await;
    result
}

/// Give queued audit entries a bounded chance to reach the audit backend.
async fn drain_audit(vault: &VaultManager) {
    let audit = vault.audit();
    if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, audit.flush()).await.is_err() {
        warn!(
            pending = audit.pending_entries(),
            "Audit backend did not respond before exit"
        );
    } else if audit.pending_entries() > 0 {
        warn!(
            pending = audit.pending_entries(),
            failures = audit.write_failures(),
            "Audit entries were not written"
        );
    }
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prompt for the vault passphrase securely.
fn prompt_passphrase() -> Result<SensitiveBytes> {
    let passphrase =
        rpassword::prompt_password("Vault passphrase: ").context("Failed to read passphrase")?;
    Ok(SensitiveBytes::new(passphrase.into_bytes()))
}

fn credentials(auth: &AuthArgs, identity: &Identity) -> Result<Arc<dyn CredentialProvider>> {
    if let Some(refresh_token) = &auth.refresh_token {
        let client_id = auth
            .client_id
            .clone()
            .context("--client-id is required with --refresh-token")?;
        let client_secret = auth
            .client_secret
            .clone()
            .context("--client-secret is required with --refresh-token")?;
        let provider = OAuthRefreshCredentials::new(client_id, client_secret)?
            .with_refresh_token(identity.clone(), refresh_token.clone());
        return Ok(Arc::new(provider));
    }

    let token = auth
        .access_token
        .clone()
        .context("An access token or refresh token is required")?;
    let provider = match identity {
        Identity::Service => StaticCredentials::service(token),
        Identity::Impersonated(_) => {
            StaticCredentials::service(token.clone()).with_token(identity.clone(), token)
        }
    };
    Ok(Arc::new(provider))
}

async fn open_vault(cli: &Cli) -> Result<VaultManager> {
    let settings = match &cli.config {
        Some(path) => VaultSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => VaultSettings::default(),
    }
    .apply_env()
    .context("Invalid environment override")?;

    let identity = Identity::from_subject(cli.auth.impersonate.as_deref());
    let credentials = credentials(&cli.auth, &identity)?;

    let passphrase = if settings.kms_key_name.is_none() {
        Some(match std::env::var("SCANVAULT_PASSPHRASE") {
            Ok(passphrase) => SensitiveBytes::new(passphrase.into_bytes()),
            Err(_) => prompt_passphrase()?,
        })
    } else {
        None
    };

    info!(preference = %settings.storage_preference, identity = %identity, "Connecting to vault");
    VaultManager::connect(settings, credentials, identity, passphrase)
        .await
        .context("Failed to open vault")
}

/// Store a file.
async fn cmd_store(
    vault: &VaultManager,
    source_id: &str,
    file: &Path,
    name: Option<String>,
    content_type: String,
    metadata: Vec<(String, String)>,
) -> Result<()> {
    let content = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = name
        .or_else(|| file.file_name().map(|n| n.to_string_lossy().to_string()))
        .context("Cannot derive a name from the file path")?;

    vault.rebuild_index().await.context("Failed to load index")?;

    let request = scanvault_vault::StoreRequest::new(source_id, name, content)
        .with_content_type(content_type)
        .with_metadata(metadata.into_iter().collect::<MetadataMap>());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight uploads");
            on_interrupt.cancel();
        }
    });

    let outcome = vault
        .store_with(request, &cancel)
        .await
        .context("Failed to store document")?;

    match &outcome {
        StoreOutcome::Complete(document) => {
            println!("Stored {} ({} bytes)", document.source_id, document.size);
        }
        StoreOutcome::Partial { document, failures } => {
            println!("Partially stored {} ({} bytes)", document.source_id, document.size);
            for failure in failures {
                println!("  failed on {}: {}", failure.backend, failure.error);
            }
        }
    }
    for address in outcome.document().addresses() {
        println!("  {}", address);
    }
    Ok(())
}

/// Decrypt one object to a file.
async fn cmd_retrieve(vault: &VaultManager, address: &str, output: &Path) -> Result<()> {
    let content = vault
        .retrieve(address)
        .await
        .with_context(|| format!("Failed to retrieve {}", address))?;

    tokio::fs::write(output, &content)
        .await
        .context("Failed to write output file")?;

    println!("Retrieved {} bytes to {}", content.len(), output.display());
    Ok(())
}

async fn cmd_list(
    vault: &VaultManager,
    prefix: &str,
    page_token: Option<&str>,
    page_size: Option<usize>,
) -> Result<()> {
    vault.rebuild_index().await.context("Failed to load index")?;
    let page_size = page_size.unwrap_or(vault.settings().list_page_size);
    let page = vault
        .list_page(prefix, page_token, page_size)
        .await
        .context("Failed to list documents")?;
    print_json(&page)
}

async fn cmd_delete(
    vault: &VaultManager,
    address: Option<String>,
    document: Option<String>,
) -> Result<()> {
    if let Some(source_id) = document {
        vault.rebuild_index().await.context("Failed to load index")?;
        let outcomes = vault
            .delete_document(&source_id)
            .await
            .with_context(|| format!("Failed to delete {}", source_id))?;
        for (address, outcome) in outcomes {
            println!("{}: {:?}", address, outcome);
        }
        return Ok(());
    }

    let address = address.context("An address or --document is required")?;
    match vault.delete(&address).await.context("Failed to delete")? {
        DeleteOutcome::Deleted => println!("Deleted {}", address),
        DeleteOutcome::NotFound => println!("Not found: {}", address),
    }
    Ok(())
}

async fn cmd_stats(vault: &VaultManager) -> Result<()> {
    vault.rebuild_index().await.context("Failed to load index")?;
    print_json(&vault.get_statistics().await)
}

/// Candidate content read from files named by source id.
struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    fn path_for(&self, source_id: &str) -> scanvault_common::Result<PathBuf> {
        scanvault_vault::document::validate_source_id(source_id)?;
        Ok(self.root.join(source_id))
    }
}

#[async_trait]
impl MigrationSource for DirectorySource {
    async fn fetch(&self, source_id: &str) -> scanvault_common::Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path_for(source_id)?).await?)
    }

    async fn remove(&self, source_id: &str) -> scanvault_common::Result<()> {
        Ok(tokio::fs::remove_file(self.path_for(source_id)?).await?)
    }
}

async fn cmd_migrate(
    vault: Arc<VaultManager>,
    candidates: &Path,
    source_dir: PathBuf,
    remove_source: bool,
) -> Result<()> {
    let json = tokio::fs::read_to_string(candidates)
        .await
        .with_context(|| format!("Failed to read {}", candidates.display()))?;
    let candidates: Vec<MigrationCandidate> =
        serde_json::from_str(&json).context("Invalid candidates file")?;

    vault.rebuild_index().await.context("Failed to load index")?;

    let mut policy = scanvault_vault::MigrationPolicy::from(&vault.settings().migration);
    policy.remove_source |= remove_source;
    let engine = MigrationEngine::with_policy(vault, policy);

    let source = DirectorySource { root: source_dir };
    let report = engine.migrate_batch(candidates, &source).await;
    print_json(&report)
}

async fn cmd_audit(vault: &VaultManager, filter: AuditFilter, verify: Option<NaiveDate>) -> Result<()> {
    if let Some(day) = verify {
        let report = vault
            .audit()
            .verify_period(day)
            .await
            .context("Failed to verify audit period")?;
        print_json(&report)?;
        if !report.is_intact() {
            anyhow::bail!("Audit chain for {} is broken", day);
        }
        return Ok(());
    }

    let entries = vault
        .audit()
        .entries(filter)
        .await
        .context("Failed to read audit log")?;
    for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("findings=3").unwrap(),
            ("findings".to_string(), "3".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_delete_requires_target() {
        assert!(Cli::try_parse_from(["scanvault", "delete"]).is_err());
        assert!(Cli::try_parse_from(["scanvault", "delete", "bucket://x"]).is_ok());
        assert!(Cli::try_parse_from(["scanvault", "delete", "--document", "f1"]).is_ok());
    }

    #[test]
    fn test_audit_action_parses() {
        let cli = Cli::try_parse_from(["scanvault", "audit", "--action", "store"]).unwrap();
        match cli.command {
            Commands::Audit { action, .. } => assert_eq!(action, Some(AuditAction::Store)),
            _ => panic!("expected audit"),
        }
    }

    #[tokio::test]
    async fn test_directory_source_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f1"), b"content").unwrap();
        let source = DirectorySource {
            root: dir.path().to_path_buf(),
        };

        assert_eq!(source.fetch("f1").await.unwrap(), b"content");
        assert!(source.fetch("../etc").await.is_err());
        source.remove("f1").await.unwrap();
        assert!(source.fetch("f1").await.is_err());
    }
}
