//! wavectl: command-line access to Wave content storage.
//!
//! The backend and its settings come from the environment (STORAGE_BACKEND,
//! LOCAL_STORAGE_PATH, S3_*); a `.env` file is honoured.

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use wave_core::StorageConfig;
use wave_infra::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use wave_storage::{create_storage, shard, OperationContext, Storage, StorageError};

#[derive(Parser, Debug)]
#[command(name = "wavectl", about = "Wave content storage CLI")]
struct Cli {
    /// Abort the operation after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Check whether a key is stored
    Exists { key: String },
    /// Check whether a derivative of a source is stored
    ExistsLinked { derivative: String, source: String },
    /// Upload a file under a key
    Upload { key: String, file: PathBuf },
    /// Upload a derivative of a source
    UploadLinked {
        derivative: String,
        source: String,
        file: PathBuf,
    },
    /// Download a key (to stdout unless --output is given)
    Get {
        key: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Download a derivative of a source
    GetLinked {
        derivative: String,
        source: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Delete a key and all of its derivatives
    Delete { key: String },
    /// Delete a single derivative
    DeleteCache { derivative: String, source: String },
    /// Report total stored bytes
    Usage,
    /// Print the sharded location of a key
    Shard { key: String },
}

#[derive(Serialize)]
struct KeyReport<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

impl<'a> KeyReport<'a> {
    fn new(key: &'a str) -> Self {
        KeyReport {
            key,
            exists: None,
            size_bytes: None,
            output: None,
        }
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize response")?;
    println!("{}", out);
    Ok(())
}

fn operation_context(timeout_secs: Option<u64>, token: CancellationToken) -> OperationContext {
    let ctx = OperationContext::new().with_token(token);
    match timeout_secs {
        Some(secs) => ctx.with_timeout(Duration::from_secs(secs)),
        None => ctx,
    }
}

async fn read_payload(file: &PathBuf) -> anyhow::Result<Bytes> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    Ok(Bytes::from(data))
}

async fn write_payload(key: &str, data: Bytes, output: Option<PathBuf>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            print_json(&KeyReport {
                size_bytes: Some(data.len()),
                output: Some(path.display().to_string()),
                ..KeyReport::new(key)
            })
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await.context("Write to stdout")?;
            stdout.flush().await.context("Flush stdout")?;
            Ok(())
        }
    }
}

async fn run(storage: Arc<dyn Storage>, ctx: &OperationContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Exists { key } => {
            let exists = storage.exists(ctx, &key).await?;
            print_json(&KeyReport {
                exists: Some(exists),
                ..KeyReport::new(&key)
            })?;
        }
        Commands::ExistsLinked { derivative, source } => {
            let exists = storage.exists_linked(ctx, &derivative, &source).await?;
            let key = wave_storage::derive_key(&derivative, &source)?;
            print_json(&KeyReport {
                exists: Some(exists),
                ..KeyReport::new(&key)
            })?;
        }
        Commands::Upload { key, file } => {
            let data = read_payload(&file).await?;
            let size = data.len();
            storage.upload(ctx, &key, data).await?;
            print_json(&KeyReport {
                size_bytes: Some(size),
                ..KeyReport::new(&key)
            })?;
        }
        Commands::UploadLinked {
            derivative,
            source,
            file,
        } => {
            let data = read_payload(&file).await?;
            let size = data.len();
            storage.upload_linked(ctx, &derivative, &source, data).await?;
            let key = wave_storage::derive_key(&derivative, &source)?;
            print_json(&KeyReport {
                size_bytes: Some(size),
                ..KeyReport::new(&key)
            })?;
        }
        Commands::Get { key, output } => {
            let data = storage.get(ctx, &key).await?;
            write_payload(&key, data, output).await?;
        }
        Commands::GetLinked {
            derivative,
            source,
            output,
        } => {
            let data = storage.get_linked(ctx, &derivative, &source).await?;
            let key = wave_storage::derive_key(&derivative, &source)?;
            write_payload(&key, data, output).await?;
        }
        Commands::Delete { key } => {
            storage.delete(ctx, &key).await?;
            print_json(&serde_json::json!({ "success": true, "message": format!("{} deleted", key) }))?;
        }
        Commands::DeleteCache { derivative, source } => {
            storage.delete_cache(ctx, &derivative, &source).await?;
            let key = wave_storage::derive_key(&derivative, &source)?;
            print_json(&serde_json::json!({ "success": true, "message": format!("{} deleted", key) }))?;
        }
        Commands::Usage => match storage.space_usage(ctx).await {
            Ok(bytes) => print_json(&serde_json::json!({
                "backend": storage.backend_type(),
                "supported": true,
                "size_bytes": bytes,
            }))?,
            Err(StorageError::Unsupported(reason)) => print_json(&serde_json::json!({
                "backend": storage.backend_type(),
                "supported": false,
                "reason": reason,
            }))?,
            Err(e) => return Err(e.into()),
        },
        Commands::Shard { key } => run_shard(&key)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(&TelemetryConfig::from_env())?;

    let cli = Cli::parse();

    // Pure key arithmetic needs no backend.
    if let Commands::Shard { key } = &cli.command {
        return run_shard(key);
    }

    let config = StorageConfig::from_env().context("Invalid storage configuration")?;
    let storage = create_storage(&config)
        .await
        .context("Failed to create storage backend")?;

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling storage operation");
            ctrl_c_token.cancel();
        }
    });

    let ctx = operation_context(cli.timeout_secs, token);
    let result = run(storage, &ctx, cli.command).await;

    shutdown_telemetry().await;
    result
}

fn run_shard(key: &str) -> anyhow::Result<()> {
    wave_storage::keys::validate_key(key)?;
    print_json(&serde_json::json!({ "key": key, "path": shard(key) }))
}
