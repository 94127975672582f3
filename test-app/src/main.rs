// rigranger command line tool -- drives a radio through a rigranger session
// (launching rigctld, or attaching to a running one) from the terminal.
//
// Usage:
//   rigranger-cli --model 3073 --device /dev/ttyUSB0 freq get
//   rigranger-cli --model 3073 --device /dev/ttyUSB0 freq set 14250000
//   rigranger-cli --no-launch --port 4532 mode set USB --passband 2400
//   rigranger-cli --config ~/.config/rigranger/config.json info
//   rigranger-cli --no-launch raw '\get_level STRENGTH'
//   rigranger-cli monitor --duration 30
//
// Logging is controlled with RUST_LOG (e.g. RUST_LOG=rigranger_protocol=trace).

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use rigranger::{RadioSession, SessionBuilder, SessionConfig};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// rigranger command line tool -- radio control through rigctld.
#[derive(Parser)]
#[command(name = "rigranger-cli", version, about)]
struct Cli {
    /// JSON configuration file; its `hamlib` section provides defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hamlib rig model number (1 = dummy rig).
    #[arg(long)]
    model: Option<i32>,

    /// Radio device (e.g. /dev/ttyUSB0, COM3).
    #[arg(long)]
    device: Option<String>,

    /// Serial speed passed to rigctld.
    #[arg(long)]
    baud: Option<u32>,

    /// rigctld control host.
    #[arg(long)]
    host: Option<String>,

    /// rigctld control port.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the rigctld binary (searched for when omitted).
    #[arg(long)]
    rigctld: Option<PathBuf>,

    /// Attach to an already running rigctld instead of launching one.
    #[arg(long)]
    no_launch: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the session status as JSON.
    Status,

    /// Print model, device, frequency and mode.
    Info,

    /// Frequency operations.
    Freq {
        #[command(subcommand)]
        action: FreqAction,
    },

    /// Mode operations.
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },

    /// PTT operations.
    Ptt {
        #[command(subcommand)]
        action: PttAction,
    },

    /// Level operations (STRENGTH, RFPOWER, AF, ...).
    Level {
        #[command(subcommand)]
        action: LevelAction,
    },

    /// Send a raw rigctld command and print the response.
    Raw {
        /// Command line, e.g. '\get_freq'.
        command: String,
    },

    /// Print session events in real time.
    Monitor {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },
}

#[derive(Subcommand)]
enum FreqAction {
    /// Read the current frequency.
    Get,
    /// Set the frequency in Hz.
    Set { freq_hz: f64 },
}

#[derive(Subcommand)]
enum ModeAction {
    /// Read the current mode and passband.
    Get,
    /// Set the mode (USB, LSB, CW, FM, PKTUSB, ...).
    Set {
        mode: String,
        /// Passband in Hz (0 = rig default).
        #[arg(long, default_value_t = 0)]
        passband: i64,
    },
}

#[derive(Subcommand)]
enum PttAction {
    /// Read the PTT state.
    Get,
    /// Key the transmitter.
    On,
    /// Unkey the transmitter.
    Off,
}

#[derive(Subcommand)]
enum LevelAction {
    /// Read a level.
    Get { name: String },
    /// Set a level.
    Set { name: String, value: f64 },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Format a frequency in Hz as a human-readable MHz string.
fn format_freq(hz: f64) -> String {
    format!("{:.6} MHz", hz / 1_000_000.0)
}

/// Prompt the user for y/N confirmation. Returns true only if "y" or "Y" entered.
fn confirm(prompt: &str) -> bool {
    print!("{prompt}");
    io::stdout().flush().ok();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    matches!(input.trim(), "y" | "Y")
}

fn init_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

/// Merge the configuration file (if any) with command line overrides.
fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(device) = &cli.device {
        config.device = Some(device.clone());
    }
    if let Some(baud) = cli.baud {
        config.baud = Some(baud);
    }
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = &cli.rigctld {
        config.binary_path = Some(path.clone());
    }
    Ok(config)
}

fn build_session(cli: &Cli) -> Result<RadioSession> {
    let config = session_config(cli)?;
    SessionBuilder::from_config(config)
        .launch_daemon(!cli.no_launch)
        .build()
        .context("invalid session configuration")
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_status(session: &RadioSession) -> Result<()> {
    let status = session.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_info(session: &RadioSession) -> Result<()> {
    let info = session.get_info().await?;

    println!("Radio Information");
    println!("  Model:      {}", info.model);
    println!("  Device:     {}", info.device.as_deref().unwrap_or("-"));
    match info.frequency {
        Some(hz) => println!("  Frequency:  {}", format_freq(hz)),
        None => println!("  Frequency:  unavailable"),
    }
    match (&info.mode, info.passband) {
        (Some(mode), Some(passband)) => println!("  Mode:       {mode} ({passband} Hz)"),
        (Some(mode), None) => println!("  Mode:       {mode}"),
        _ => println!("  Mode:       unavailable"),
    }
    Ok(())
}

async fn cmd_freq_get(session: &RadioSession) -> Result<()> {
    let hz = session.get_frequency().await?;
    println!("{}", format_freq(hz));
    Ok(())
}

async fn cmd_freq_set(session: &RadioSession, hz: f64) -> Result<()> {
    if !hz.is_finite() || hz <= 0.0 {
        bail!("frequency must be a positive number of Hz, got {hz}");
    }
    session.set_frequency(hz).await?;
    println!("set to {}", format_freq(hz));
    Ok(())
}

async fn cmd_mode_get(session: &RadioSession) -> Result<()> {
    let mode = session.get_mode().await?;
    println!("{} ({} Hz)", mode.mode, mode.passband);
    Ok(())
}

async fn cmd_mode_set(session: &RadioSession, mode: &str, passband: i64) -> Result<()> {
    session.set_mode(mode, passband).await?;
    println!("mode set to {mode} ({passband} Hz)");
    Ok(())
}

async fn cmd_ptt_get(session: &RadioSession) -> Result<()> {
    if session.get_ptt().await? {
        println!("PTT: ON (transmitting)");
    } else {
        println!("PTT: OFF (receiving)");
    }
    Ok(())
}

async fn cmd_ptt_on(session: &RadioSession) -> Result<()> {
    println!("WARNING: This will key the transmitter.");
    println!("Ensure an antenna or dummy load is connected.");
    if !confirm("Continue? [y/N] ") {
        println!("Aborted.");
        return Ok(());
    }
    session.set_ptt(true).await?;
    println!("PTT: ON");
    Ok(())
}

async fn cmd_ptt_off(session: &RadioSession) -> Result<()> {
    session.set_ptt(false).await?;
    println!("PTT: OFF");
    Ok(())
}

async fn cmd_level_get(session: &RadioSession, name: &str) -> Result<()> {
    let value = session.get_level(name).await?;
    println!("{name}: {value}");
    Ok(())
}

async fn cmd_level_set(session: &RadioSession, name: &str, value: f64) -> Result<()> {
    session.set_level(name, value).await?;
    println!("{name} set to {value}");
    Ok(())
}

async fn cmd_raw(session: &RadioSession, command: &str) -> Result<()> {
    let response = session.execute_raw(command).await?;
    println!("{response}");
    Ok(())
}

async fn cmd_monitor(session: &RadioSession, duration_secs: u64) -> Result<()> {
    let mut event_rx = session.events().subscribe();

    println!("Monitoring session events (Ctrl-C to stop)...");

    let deadline = if duration_secs > 0 {
        Some(Instant::now() + Duration::from_secs(duration_secs))
    } else {
        None
    };

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Monitor duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted.");
                break;
            }
            received = tokio::time::timeout(timeout, event_rx.recv()) => match received {
                Ok(Ok(event)) => println!("[event] {}", serde_json::to_string(&event)?),
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                    println!("[warning] missed {n} events (consumer too slow)");
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                    println!("Event channel closed.");
                    break;
                }
                Err(_) => {
                    if deadline.is_some() {
                        println!("Monitor duration elapsed.");
                        break;
                    }
                }
            },
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let session = build_session(&cli)?;
    session.start().await.context("failed to start rigctld")?;

    // `status` and `monitor` are useful while disconnected; everything
    // else needs a live connection.
    let needs_link = !matches!(cli.command, Command::Status | Command::Monitor { .. });
    if needs_link && !session.is_connected() {
        session.stop().await;
        let status = session.status();
        bail!("not connected to rigctld at {}:{}", status.host, status.port);
    }

    let result = match &cli.command {
        Command::Status => cmd_status(&session),
        Command::Info => cmd_info(&session).await,
        Command::Freq { action } => match action {
            FreqAction::Get => cmd_freq_get(&session).await,
            FreqAction::Set { freq_hz } => cmd_freq_set(&session, *freq_hz).await,
        },
        Command::Mode { action } => match action {
            ModeAction::Get => cmd_mode_get(&session).await,
            ModeAction::Set { mode, passband } => cmd_mode_set(&session, mode, *passband).await,
        },
        Command::Ptt { action } => match action {
            PttAction::Get => cmd_ptt_get(&session).await,
            PttAction::On => cmd_ptt_on(&session).await,
            PttAction::Off => cmd_ptt_off(&session).await,
        },
        Command::Level { action } => match action {
            LevelAction::Get { name } => cmd_level_get(&session, name).await,
            LevelAction::Set { name, value } => cmd_level_set(&session, name, *value).await,
        },
        Command::Raw { command } => cmd_raw(&session, command).await,
        Command::Monitor { duration } => cmd_monitor(&session, *duration).await,
    };

    session.stop().await;
    result
}
