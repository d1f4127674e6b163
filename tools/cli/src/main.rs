//! FieldSync CLI - inspect and manage an offline sync queue.
//!
//! Operates on the engine state persisted in a data directory. No remote is
//! attached, so passes are only run by the in-memory `demo` command.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fieldsync_common::{EntityId, EntityType, Error, OperationKind};
use fieldsync_storage::{LocalStore, MemoryStore};
use fieldsync_sync::{
    ConflictStrategy, MemoryApplier, MemoryTransport, PendingOperation, RemoteChange,
    SendOutcome, SyncConfigUpdate, SyncEngine, SyncResult, SyncTransport,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - offline-first sync queue management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the persisted engine state.
    #[arg(short, long, default_value = ".fieldsync")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity, queue and conflict counts.
    Status,

    /// Queue a local mutation.
    Enqueue {
        /// Mutation kind.
        #[arg(short, long, value_enum)]
        kind: KindArg,

        /// Entity type, e.g. "dailyLog".
        #[arg(short = 't', long)]
        entity_type: EntityType,

        /// Entity identifier.
        #[arg(short, long)]
        id: String,

        /// JSON payload.
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Operation IDs that must complete first.
        #[arg(long)]
        depends_on: Vec<String>,
    },

    /// List queued operations.
    Pending {
        /// Only show operations that used up their retries.
        #[arg(long)]
        stalled: bool,
    },

    /// List conflicts.
    Conflicts {
        /// Include resolved conflicts.
        #[arg(short, long)]
        all: bool,
    },

    /// Resolve a conflict.
    Resolve {
        /// Conflict ID.
        #[arg(short, long)]
        id: String,

        /// Side to keep.
        #[arg(short, long, value_enum, conflicts_with = "merged")]
        keep: Option<Side>,

        /// Merged JSON data to push instead of either side.
        #[arg(short, long)]
        merged: Option<String>,
    },

    /// Give a stalled operation a fresh set of retries.
    Retry {
        /// Operation ID.
        #[arg(short, long)]
        id: String,
    },

    /// Drop a queued operation without sending it.
    Discard {
        /// Operation ID.
        #[arg(short, long)]
        id: String,
    },

    /// Show or change the sync configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run a scripted session against an in-memory remote.
    Demo,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the active configuration.
    Show,

    /// Change configuration values.
    Set {
        #[arg(long)]
        auto_sync: Option<bool>,
        #[arg(long)]
        sync_interval_minutes: Option<u64>,
        #[arg(long)]
        sync_on_connect: Option<bool>,
        /// One of local-wins, remote-wins, newest-wins, manual.
        #[arg(long)]
        conflict_strategy: Option<ConflictStrategy>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        retry_backoff_multiplier: Option<f64>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        throttle_ms: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Create,
    Update,
    Delete,
}

impl From<KindArg> for OperationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Create => OperationKind::Create,
            KindArg::Update => OperationKind::Update,
            KindArg::Delete => OperationKind::Delete,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Side {
    Local,
    Remote,
}

/// Transport for a queue with no remote attached.
struct Detached;

#[async_trait]
impl SyncTransport for Detached {
    fn name(&self) -> &str {
        "detached"
    }

    async fn send(&self, _operation: &PendingOperation) -> fieldsync_common::Result<SendOutcome> {
        Err(Error::Transport("No remote configured".to_string()))
    }

    async fn pull(
        &self,
        _since: Option<DateTime<Utc>>,
    ) -> fieldsync_common::Result<Vec<RemoteChange>> {
        Err(Error::Transport("No remote configured".to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG takes precedence over --verbose.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let data_dir = cli.data_dir;
    match cli.command {
        Commands::Status => cmd_status(&open_engine(&data_dir).await?).await,
        Commands::Enqueue {
            kind,
            entity_type,
            id,
            payload,
            depends_on,
        } => {
            let engine = open_engine(&data_dir).await?;
            cmd_enqueue(&engine, kind, entity_type, &id, &payload, depends_on).await
        }
        Commands::Pending { stalled } => cmd_pending(&open_engine(&data_dir).await?, stalled).await,
        Commands::Conflicts { all } => cmd_conflicts(&open_engine(&data_dir).await?, all).await,
        Commands::Resolve { id, keep, merged } => {
            let engine = open_engine(&data_dir).await?;
            cmd_resolve(&engine, &id, keep, merged.as_deref()).await
        }
        Commands::Retry { id } => cmd_retry(&open_engine(&data_dir).await?, &id).await,
        Commands::Discard { id } => cmd_discard(&open_engine(&data_dir).await?, &id).await,
        Commands::Config { action } => cmd_config(&open_engine(&data_dir).await?, action).await,
        Commands::Demo => cmd_demo().await,
    }
}

async fn open_engine(data_dir: &Path) -> Result<SyncEngine<Detached>> {
    let store = LocalStore::new(data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
    SyncEngine::new(Arc::new(Detached), Arc::new(store))
        .await
        .context("Failed to load sync state")
}

/// Show queue status.
async fn cmd_status(engine: &SyncEngine<Detached>) -> Result<()> {
    let state = engine.get_state().await;
    let stalled = engine.stalled_operations().await.len();

    println!("Sync Status:");
    println!("  Online: {}", state.online);
    println!("  Pending operations: {}", state.pending_count());
    println!("  Stalled operations: {}", stalled);
    println!("  Active conflicts: {}", state.active_conflicts().count());
    println!("  Consecutive failures: {}", state.consecutive_failures);
    match state.last_sync_time {
        Some(at) => println!("  Last sync: {}", at),
        None => println!("  Last sync: never"),
    }

    Ok(())
}

/// Queue a mutation.
async fn cmd_enqueue(
    engine: &SyncEngine<Detached>,
    kind: KindArg,
    entity_type: EntityType,
    id: &str,
    payload: &str,
    depends_on: Vec<String>,
) -> Result<()> {
    let entity_id = EntityId::new(id)?;
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let op = engine
        .enqueue(kind.into(), entity_type, entity_id, payload, depends_on)
        .await
        .context("Failed to queue operation")?;

    info!("Queued {} {} v{}", op.kind, op.entity_id, op.local_version);
    println!("{}", op.id);
    Ok(())
}

/// List queued operations.
async fn cmd_pending(engine: &SyncEngine<Detached>, stalled_only: bool) -> Result<()> {
    let operations = if stalled_only {
        engine.stalled_operations().await
    } else {
        engine.get_state().await.pending_operations
    };

    if operations.is_empty() {
        println!("(no operations)");
        return Ok(());
    }

    for op in operations {
        let status = match &op.last_error {
            Some(err) => format!("{} attempts, last error: {}", op.attempts, err),
            None => "not attempted".to_string(),
        };
        println!(
            "  {} {} {} v{} ({})",
            op.id, op.kind, op.entity_type, op.local_version, status
        );
        if !op.depends_on.is_empty() {
            let deps: Vec<&str> = op.depends_on.iter().map(String::as_str).collect();
            println!("    depends on: {}", deps.join(", "));
        }
    }

    Ok(())
}

/// List conflicts.
async fn cmd_conflicts(engine: &SyncEngine<Detached>, all: bool) -> Result<()> {
    let conflicts = if all {
        engine.conflict_history().await
    } else {
        engine.conflicts().await
    };

    if conflicts.is_empty() {
        println!("(no conflicts)");
        return Ok(());
    }

    for conflict in conflicts {
        println!(
            "  {} {} {}: local v{} vs remote v{}",
            conflict.id,
            conflict.entity_type,
            conflict.entity_id,
            conflict.local.version,
            conflict.remote.version
        );
        if let Some(resolution) = conflict.resolution {
            println!("    resolved: {:?}", resolution);
        }
    }

    Ok(())
}

/// Resolve a conflict.
async fn cmd_resolve(
    engine: &SyncEngine<Detached>,
    id: &str,
    keep: Option<Side>,
    merged: Option<&str>,
) -> Result<()> {
    match (keep, merged) {
        (Some(side), None) => engine
            .resolve_conflict_manually(id, side == Side::Local)
            .await
            .context("Failed to resolve conflict")?,
        (None, Some(merged)) => {
            let data: Value =
                serde_json::from_str(merged).context("Merged data is not valid JSON")?;
            engine
                .resolve_conflict_merged(id, data)
                .await
                .context("Failed to resolve conflict")?
        }
        _ => bail!("Specify exactly one of --keep or --merged"),
    }

    println!("Conflict {} resolved", id);
    Ok(())
}

/// Re-arm a stalled operation.
async fn cmd_retry(engine: &SyncEngine<Detached>, id: &str) -> Result<()> {
    engine
        .retry_stalled(id)
        .await
        .context("Failed to re-arm operation")?;
    println!("Operation {} will be retried on the next pass", id);
    Ok(())
}

/// Drop a queued operation.
async fn cmd_discard(engine: &SyncEngine<Detached>, id: &str) -> Result<()> {
    let op = engine
        .discard_operation(id)
        .await
        .context("Failed to discard operation")?;
    println!("Discarded {} {} {}", op.kind, op.entity_type, op.entity_id);
    Ok(())
}

/// Show or update configuration.
async fn cmd_config(engine: &SyncEngine<Detached>, action: ConfigAction) -> Result<()> {
    let config = match action {
        ConfigAction::Show => engine.config().await,
        ConfigAction::Set {
            auto_sync,
            sync_interval_minutes,
            sync_on_connect,
            conflict_strategy,
            max_retries,
            retry_backoff_multiplier,
            batch_size,
            throttle_ms,
        } => {
            let update = SyncConfigUpdate {
                auto_sync,
                sync_interval_minutes,
                sync_on_connect,
                conflict_strategy,
                max_retries,
                retry_backoff_multiplier,
                batch_size,
                throttle_ms,
            };
            if update.is_empty() {
                bail!("Nothing to change");
            }
            let config = engine
                .update_config(update)
                .await
                .context("Failed to update configuration")?;
            // Nothing runs passes in this process.
            engine.stop_auto_sync().await;
            config
        }
    };

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Walk through an offline session against an in-memory remote.
async fn cmd_demo() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    let applier = Arc::new(MemoryApplier::new());
    let engine =
        SyncEngine::with_applier(transport.clone(), Arc::new(MemoryStore::new()), applier.clone())
            .await?;
    engine
        .update_config(SyncConfigUpdate {
            throttle_ms: Some(0),
            conflict_strategy: Some(ConflictStrategy::Manual),
            ..Default::default()
        })
        .await?;

    info!("Going offline and queueing work");
    engine.set_online(false).await?;
    let project = engine
        .enqueue(
            OperationKind::Create,
            EntityType::Project,
            EntityId::new("bridge-7")?,
            json!({"name": "Bridge 7 retrofit"}),
            [],
        )
        .await?;
    engine
        .enqueue(
            OperationKind::Create,
            EntityType::DailyLog,
            EntityId::new("log-2024-06-01")?,
            json!({"project": "bridge-7", "crew": 6}),
            [project.id.clone()],
        )
        .await?;
    println!("Queued {} operations while offline", engine.pending_count().await);

    // Another device edits the project while this one is offline.
    transport
        .seed_remote(
            EntityType::Project,
            EntityId::new("bridge-7")?,
            json!({"name": "Bridge 7"}),
            1,
            Utc::now(),
        )
        .await;

    if let Some(result) = engine.set_online(true).await? {
        print_result("Reconnect", &result);
    }

    for conflict in engine.conflicts().await {
        println!(
            "Conflict on {}: keeping local over remote v{}",
            conflict.entity_id, conflict.remote.version
        );
        engine.resolve_conflict_manually(&conflict.id, true).await?;
    }

    let result = engine.sync().await;
    print_result("Follow-up", &result);
    println!("Pending after demo: {}", engine.pending_count().await);
    println!("Remote records applied locally: {}", applier.len().await);

    Ok(())
}

fn print_result(label: &str, result: &SyncResult) {
    println!(
        "{} pass: {} attempted, {} completed, {} failed, {} deferred, {} conflicts, {} pulled",
        label,
        result.operations_attempted,
        result.operations_completed,
        result.operations_failed,
        result.operations_deferred,
        result.conflicts_detected,
        result.changes_pulled
    );
}
