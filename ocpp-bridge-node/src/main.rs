//! OCPP Bridge Node - CLI charge point
//!
//! Opens one OCPP 1.6 session to a central system, runs a command over it
//! and prints the JSON outcome.
//!
//! # Usage
//!
//! ```bash
//! # Heartbeat against a local SteVe
//! ocpp-bridge-node --station CP001 heartbeat
//!
//! # Start and stop a transaction
//! ocpp-bridge-node start --connector 1 --id-tag TAG001
//! ocpp-bridge-node stop --transaction 42 --meter-stop 1500
//!
//! # Any action with a raw payload
//! ocpp-bridge-node call DataTransfer '{"vendorId":"Vendor_Y"}'
//!
//! # Interactive: one `Action {json}` per line
//! ocpp-bridge-node repl
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use ocpp_bridge::ocpp::{ChargePointStatus, DataTransferRequest, Reason};
use ocpp_bridge::{Bridge, BridgeConfig, ErrorCode, IncomingRequest};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// OCPP 1.6 charge point bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Central system WebSocket URL (station ID is appended)
    #[arg(
        long,
        env = "WEBSOCKET_URL_LOCALHOST",
        default_value = "ws://localhost:8180/steve/websocket/CentralSystemService"
    )]
    url: String,

    /// Charge point identity
    #[arg(short, long, env = "CHARGE_POINT_ID", default_value = "CP001")]
    station: String,

    /// Vendor name
    #[arg(long, env = "CHARGE_POINT_VENDOR", default_value = "Vendor_Y")]
    vendor: String,

    /// Model name
    #[arg(long, env = "CHARGE_POINT_MODEL", default_value = "Model_X")]
    model: String,

    /// Seconds to wait for the session to become ready
    #[arg(long, default_value = "30")]
    ready_timeout: u64,

    /// Seconds to wait for each response
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a Heartbeat
    Heartbeat,

    /// Send a StatusNotification
    Status {
        #[arg(long, default_value = "1")]
        connector: u32,

        /// OCPP status, e.g. Available, Charging, Faulted
        #[arg(long, default_value = "Available")]
        status: String,
    },

    /// Authorize an id tag
    Authorize {
        #[arg(long)]
        id_tag: String,
    },

    /// Send a StartTransaction
    Start {
        #[arg(long, default_value = "1")]
        connector: u32,

        #[arg(long)]
        id_tag: String,

        #[arg(long, default_value = "0")]
        meter_start: i32,
    },

    /// Send a StopTransaction
    Stop {
        #[arg(long)]
        transaction: i32,

        #[arg(long, default_value = "0")]
        meter_stop: i32,

        /// OCPP stop reason, e.g. Local, Remote
        #[arg(long)]
        reason: Option<String>,
    },

    /// Send a DataTransfer
    DataTransfer {
        #[arg(long)]
        vendor_id: String,

        #[arg(long)]
        message_id: Option<String>,

        #[arg(long)]
        data: Option<String>,
    },

    /// Send any action with a raw JSON payload
    Call {
        action: String,

        #[arg(default_value = "{}")]
        payload: String,
    },

    /// Read `Action {json}` lines from stdin
    Repl,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Print banner (stdout carries the JSON outcome)
    eprintln!();
    eprintln!("╔══════════════════════════════════════════════════════════════╗");
    eprintln!("║              OCPP Bridge Node - OCPP 1.6 Charge Point        ║");
    eprintln!("╠══════════════════════════════════════════════════════════════╣");
    eprintln!("║  Station:  {:<50} ║", args.station);
    eprintln!("║  URL:      {:<50} ║", truncate(&args.url, 50));
    eprintln!("║  Vendor:   {:<50} ║", truncate(&format!("{} / {}", args.vendor, args.model), 50));
    eprintln!("╚══════════════════════════════════════════════════════════════╝");
    eprintln!();

    let config = BridgeConfig::new(&args.station, &args.url)
        .with_vendor(&args.vendor, &args.model)
        .with_request_timeout(Duration::from_secs(args.timeout));

    let (bridge, incoming) = Bridge::new(config);
    tokio::spawn(refuse_incoming(bridge.clone(), incoming));

    bridge.start()?;
    info!("Waiting for the session to become ready...");
    if let Err(e) = bridge.wait_ready(Duration::from_secs(args.ready_timeout)).await {
        bridge.close().await;
        return Err(e.into());
    }

    let outcome = run_command(&bridge, args.command).await;
    bridge.close().await;

    let value = outcome?;
    if !value.is_null() {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

async fn run_command(
    bridge: &Bridge,
    command: Command,
) -> Result<Value, Box<dyn std::error::Error>> {
    let value = match command {
        Command::Heartbeat => serde_json::to_value(bridge.heartbeat().await?)?,
        Command::Status { connector, status } => {
            let status: ChargePointStatus = serde_json::from_value(Value::String(status))?;
            serde_json::to_value(bridge.status_notification(connector, status).await?)?
        }
        Command::Authorize { id_tag } => serde_json::to_value(bridge.authorize(&id_tag).await?)?,
        Command::Start {
            connector,
            id_tag,
            meter_start,
        } => serde_json::to_value(
            bridge
                .start_transaction(connector, &id_tag, meter_start)
                .await?,
        )?,
        Command::Stop {
            transaction,
            meter_stop,
            reason,
        } => {
            let reason: Option<Reason> = reason
                .map(|r| serde_json::from_value(Value::String(r)))
                .transpose()?;
            serde_json::to_value(
                bridge
                    .stop_transaction(transaction, meter_stop, reason)
                    .await?,
            )?
        }
        Command::DataTransfer {
            vendor_id,
            message_id,
            data,
        } => {
            let request = DataTransferRequest {
                vendor_id,
                message_id,
                data,
            };
            serde_json::to_value(bridge.data_transfer(&request).await?)?
        }
        Command::Call { action, payload } => {
            let payload: Value = serde_json::from_str(&payload)?;
            bridge.request(&action, payload).await?
        }
        Command::Repl => {
            repl(bridge).await?;
            Value::Null
        }
    };

    Ok(value)
}

/// Relay `Action {json}` lines until stdin closes
async fn repl(bridge: &Bridge) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (action, payload) = line.split_once(' ').unwrap_or((line, "{}"));
        let payload: Value = match serde_json::from_str(payload) {
            Ok(payload) => payload,
            Err(e) => {
                println!("{}", json!({"error": format!("invalid payload: {}", e)}));
                continue;
            }
        };

        match bridge.request(action, payload).await {
            Ok(result) => println!("{}", json!({"action": action, "result": result})),
            Err(e) => println!("{}", json!({"action": action, "error": e.to_string()})),
        }
    }

    Ok(())
}

/// This node has no handlers for central-system requests
async fn refuse_incoming(bridge: Bridge, mut incoming: mpsc::Receiver<IncomingRequest>) {
    while let Some(request) = incoming.recv().await {
        warn!("Refusing central system request {} ({})", request.action, request.message_id);
        let reply = request.error(
            ErrorCode::NotSupported,
            format!("{} is not supported by this node", request.action),
        );
        if let Err(e) = bridge.respond_error(reply).await {
            warn!("Failed to answer {}: {}", request.message_id, e);
        }
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
