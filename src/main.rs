//! CLI Entry Point for sem-scan
//!
//! Provides command-line interface for:
//! - An interactive console that drives the scan controller from stdin
//! - One-shot recording of a single frame to a TIFF file
//!
//! Both run against the simulated analog port; the controller itself is hardware
//! agnostic and only sees the `AnalogPort` capability.
//!
//! # Usage
//!
//! Interactive console:
//! ```bash
//! sem-scan console --preview live.png
//! ```
//!
//! Record one 512x512 frame:
//! ```bash
//! sem-scan record --preset 3 --output frame.tif
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sem_scan::config::Settings;
use sem_scan::display::{DisplayRefresher, DisplaySink, LoggingSink};
use sem_scan::export;
use sem_scan::hardware::{AnalogPort, SimulatedPort};
use sem_scan::logging::{self, OutputFormat};
use sem_scan::scan::{Direction, ScanController, ScanMode};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sem-scan")]
#[command(about = "Software-paced SEM raster scan control", long_about = None)]
struct Cli {
    /// Settings file (TOML); missing file means defaults
    #[arg(long, global = true, default_value = sem_scan::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json); overrides the settings file
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    /// Simulated per-read latency in microseconds
    #[arg(long, global = true, default_value = "0")]
    latency_us: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive command console on stdin
    Console {
        /// Write each refreshed display frame to this PNG
        #[arg(long)]
        preview: Option<PathBuf>,
    },

    /// Acquire a single frame and save it
    Record {
        /// Scan rate preset id
        #[arg(long, default_value = "4")]
        preset: u8,

        /// Output TIFF; defaults to a timestamped name next to the export path
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    if let Some(format) = cli.log_format {
        settings.application.log_format = format;
    }
    logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
    info!(name = %settings.application.name, "starting");

    let port: Arc<dyn AnalogPort> = Arc::new(
        SimulatedPort::new(settings.wiring)
            .with_code_range(settings.scan.code_min, settings.scan.code_max)
            .with_latency(Duration::from_micros(cli.latency_us)),
    );

    match cli.command {
        Commands::Console { preview } => run_console(settings, port, preview).await,
        Commands::Record { preset, output } => {
            tokio::task::spawn_blocking(move || record_once(&settings, port, preset, output))
                .await
                .context("record task failed")?
        }
    }
}

fn record_once(
    settings: &Settings,
    port: Arc<dyn AnalogPort>,
    preset: u8,
    output: Option<PathBuf>,
) -> Result<()> {
    let chosen = settings
        .preset(preset)
        .with_context(|| format!("unknown preset {preset}"))?;
    info!(
        preset,
        resolution = chosen.resolution,
        dwell = chosen.dwell,
        "recording single frame"
    );
    let mut controller = ScanController::new(port, settings)?;
    controller.select_preset(preset)?;
    controller.record()?;

    let poll = settings.scan.frame_pause().max(Duration::from_millis(10));
    while controller.status().loop_alive {
        thread::sleep(poll);
    }
    if let Some(e) = controller.take_last_error() {
        return Err(e).context("acquisition failed");
    }

    let path = output.unwrap_or_else(|| {
        let dir = settings
            .export
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        export::timestamped_path(dir, chrono::Local::now())
    });
    controller
        .save(&path)
        .with_context(|| format!("saving {}", path.display()))?;
    controller.quit()?;
    println!("Saved {}", path.display());
    Ok(())
}

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Preset(u8),
    Run,
    Record,
    PartialField,
    Move(Direction),
    Gain(i16),
    Save(Option<PathBuf>),
    Status,
    Display,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Err("empty command".to_string());
    };
    let arg = words.next();
    let input = match word.to_lowercase().as_str() {
        "1" | "2" | "3" | "4" => Input::Preset(word.parse().map_err(|_| "bad preset")?),
        "preset" => Input::Preset(
            arg.ok_or("preset needs an id")?
                .parse()
                .map_err(|_| "preset id must be a number")?,
        ),
        "run" => Input::Run,
        "record" | "rec" => Input::Record,
        "pf" => Input::PartialField,
        "n" => Input::Move(Direction::North),
        "s" => Input::Move(Direction::South),
        "e" => Input::Move(Direction::East),
        "w" => Input::Move(Direction::West),
        "gain" => Input::Gain(
            arg.ok_or("gain needs a value")?
                .parse()
                .map_err(|_| "gain must be a number")?,
        ),
        "save" => Input::Save(arg.map(PathBuf::from)),
        "status" => Input::Status,
        "img" => Input::Display,
        "help" | "?" => Input::Help,
        "quit" | "q" | "exit" => Input::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(input)
}

const HELP: &str = "\
commands:
  1-4            select scan rate preset (restarts continuous scan)
  run            start/stop continuous scan
  record         acquire a single frame
  pf             toggle partial field (restarts continuous scan)
  n s e w        move partial field (restarts continuous scan)
  gain N         change detector gain
  img            toggle display refresh
  save [PATH]    save raw intensity map
  status         show scan state
  quit";

async fn run_console(
    settings: Settings,
    port: Arc<dyn AnalogPort>,
    preview: Option<PathBuf>,
) -> Result<()> {
    let sink = match preview {
        Some(path) => LoggingSink::new().with_preview(path),
        None => LoggingSink::new(),
    };
    let sink: Arc<dyn DisplaySink> = Arc::new(sink);
    let controller = ScanController::new(port, &settings)?.with_display(Arc::clone(&sink));

    let mut refresher =
        DisplayRefresher::new(controller.shared(), sink, settings.display.refresh_interval());
    if !settings.display.enabled {
        refresher = refresher.start_disabled();
    }
    let display = refresher.spawn();

    let (tx, rx) = mpsc::channel::<Input>(16);
    let export_path = settings.export.path.clone();
    let worker = tokio::task::spawn_blocking(move || controller_worker(controller, rx, export_path));

    println!("{HELP}");
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(Result::ok) {
                if line_tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawning stdin reader")?;

    loop {
        let input = tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match parse_input(&line) {
                    Ok(input) => input,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                },
                None => Input::Quit,
            },
            _ = tokio::signal::ctrl_c() => Input::Quit,
        };
        match input {
            Input::Display => {
                let enabled = display.toggle();
                println!("display refresh {}", if enabled { "on" } else { "off" });
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => {
                let _ = tx.send(Input::Quit).await;
                break;
            }
            other => {
                if tx.send(other).await.is_err() {
                    break;
                }
            }
        }
    }

    let result = worker.await.context("controller worker failed")?;
    let presented = display.shutdown().await;
    info!(presented, "display stopped");
    result
}

/// Owns the controller; every command runs here so the blocking handshakes never
/// stall the async side.
fn controller_worker(
    mut controller: ScanController,
    mut rx: mpsc::Receiver<Input>,
    export_path: PathBuf,
) -> Result<()> {
    while let Some(input) = rx.blocking_recv() {
        let outcome = match input {
            Input::Preset(id) => controller.select_preset(id),
            Input::Run => controller.toggle_run(),
            Input::Record => controller.record(),
            Input::PartialField => controller.toggle_partial_field(),
            Input::Move(direction) => controller.move_partial_field(direction).map(|moved| {
                if !moved {
                    println!("partial field not moved");
                }
            }),
            Input::Gain(gain) => controller.set_gain(gain),
            Input::Save(path) => {
                let path = path.unwrap_or_else(|| export_path.clone());
                controller
                    .save(&path)
                    .map(|()| println!("saved {}", path.display()))
            }
            Input::Status => {
                let status = controller.status();
                println!(
                    "mode={} resolution={} window={:?} gain={} loop_alive={} frames={}",
                    status.mode,
                    status.resolution,
                    status.window,
                    status.gain,
                    status.loop_alive,
                    status.frames_completed
                );
                Ok(())
            }
            Input::Quit => break,
            Input::Display | Input::Help => Ok(()),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "command failed");
            println!("error: {e}");
        }
        if let Some(e) = controller.take_last_error() {
            println!("scan stopped: {e}");
        }
    }

    controller.quit()?;
    if controller.mode() != ScanMode::Idle {
        warn!(mode = %controller.mode(), "controller did not return to idle");
    }
    info!("controller stopped");
    Ok(())
}
