//! busq CLI: operator interface to the message bus.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use busq::config::Config;
use busq::db::Db;
use busq::debug::{StoreSink, TracingSink};
use busq::engine::Bus;
use busq::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::json;

#[derive(Parser)]
#[command(name = "busq", about = "Durable point-to-point message bus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Enqueue an envelope read from a file (or `-` for stdin)
    Enqueue {
        /// Path to a JSON envelope
        file: PathBuf,
    },
    /// Claim the next pending envelope for an owner
    Dequeue {
        /// Destination owner to claim for
        #[arg(long)]
        owner: String,
        /// Claimant identity (defaults to the owner)
        #[arg(long)]
        claimed_by: Option<String>,
    },
    /// Mark an envelope DONE (1) or DEAD (9)
    Finalize {
        bus_id: String,
        /// Terminal state: 1, 9, DONE or DEAD
        q_state: String,
    },
    /// Compare an envelope's columns with its stored copy
    Inspect {
        bus_id: String,
        /// Re-run the mirror before reporting
        #[arg(long)]
        repair: bool,
    },
    /// Show recent debug events
    DebugEvents {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    let db = Db::connect(config.database_url.expose_secret())
        .await?
        .with_claim_strategy(config.claim_strategy);
    db.migrate().await?;
    let db = Arc::new(db);

    let bus = if config.debug_events {
        Bus::new(Arc::clone(&db)).with_debug_sink(Arc::new(StoreSink::new(Arc::clone(&db))))
    } else {
        Bus::new(Arc::clone(&db)).with_debug_sink(Arc::new(TracingSink))
    };

    let result = match cli.command {
        Command::Migrate => Ok(json!({ "ok": true, "migrated": true })),
        Command::Enqueue { file } => {
            let raw = read_input(&file)?;
            to_json(bus.enqueue_raw(&raw).await)
        }
        Command::Dequeue { owner, claimed_by } => {
            to_json(bus.dequeue(&owner, claimed_by.as_deref()).await)
        }
        Command::Finalize { bus_id, q_state } => {
            let q_state = q_state
                .parse::<i64>()
                .map(serde_json::Value::from)
                .unwrap_or_else(|_| serde_json::Value::String(q_state));
            to_json(
                bus.finalize(&json!({ "bus_id": bus_id, "q_state": q_state }))
                    .await,
            )
        }
        Command::Inspect { bus_id, repair } => to_json(bus.inspect(&bus_id, repair).await),
        Command::DebugEvents { limit } => to_json(
            db.debug_events(limit)
                .await
                .map(|events| json!({ "ok": true, "events": events })),
        ),
    };

    match result {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.to_body())?);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn to_json<T: Serialize>(result: busq::error::Result<T>) -> busq::error::Result<serde_json::Value> {
    result.and_then(|value| {
        serde_json::to_value(value)
            .map_err(|e| busq::error::Error::Other(format!("failed to render response: {e}")))
    })
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        Ok(raw)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}
