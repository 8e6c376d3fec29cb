//! tallyctl - Command-line client for tallyd
//!
//! Prints every response and event as pretty JSON.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use tally_api::Command;
use tally_ipc::IpcClient;
use tally_util::{MeterId, SeriesId, default_socket_path};

#[derive(Parser, Debug)]
#[command(name = "tallyctl")]
#[command(about = "Inspect and operate a running tallyd", long_about = None)]
struct Args {
    /// Socket path
    #[arg(short, long, env = "TALLY_SOCKET", default_value_os_t = default_socket_path())]
    socket: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show every series
    State,

    /// Show one series
    Series { series_id: String },

    /// Push a reading, increment or heartbeat to a meter
    Push { meter_id: String, value: String },

    /// Set the activity condition of a meter
    Condition {
        meter_id: String,
        #[arg(value_parser = parse_on_off)]
        active: bool,
    },

    /// Overwrite the accumulated value of a series
    Calibrate { series_id: String, value: Decimal },

    /// Reset a series now, or at an RFC 3339 instant
    Reset {
        series_id: String,
        #[arg(long)]
        at: Option<DateTime<FixedOffset>>,
    },

    /// Stream events until interrupted
    Watch,

    Health,

    Ping,
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        other => Err(format!("expected on or off, got '{other}'")),
    }
}

impl Cmd {
    /// The request to send. `None` for the event stream.
    fn into_command(self) -> Option<Command> {
        let command = match self {
            Cmd::State => Command::GetState,
            Cmd::Series { series_id } => Command::GetSeries {
                series_id: SeriesId::new(series_id),
            },
            Cmd::Push { meter_id, value } => Command::PushValue {
                meter_id: MeterId::new(meter_id),
                value,
            },
            Cmd::Condition { meter_id, active } => Command::SetCondition {
                meter_id: MeterId::new(meter_id),
                active,
            },
            Cmd::Calibrate { series_id, value } => Command::Calibrate {
                series_id: SeriesId::new(series_id),
                value,
            },
            Cmd::Reset { series_id, at } => Command::Reset {
                series_id: SeriesId::new(series_id),
                at,
            },
            Cmd::Watch => return None,
            Cmd::Health => Command::GetHealth,
            Cmd::Ping => Command::Ping,
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut client = IpcClient::connect(&args.socket)
        .await
        .with_context(|| format!("Failed to connect to tallyd at {:?}", args.socket))?;

    let Some(command) = args.command.into_command() else {
        let mut events = client.subscribe().await?;
        loop {
            let event = events.next().await?;
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
    };

    let response = client.send(command).await?;
    println!("{}", serde_json::to_string_pretty(&response.result)?);

    if let tally_api::ResponseResult::Err(e) = response.result {
        bail!("{:?}: {}", e.code, e.message);
    }
    Ok(())
}
