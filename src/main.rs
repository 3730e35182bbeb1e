//! CLI Entry Point for colosseum
//!
//! Provides a command-line interface for:
//! - Running a fraction collection (interactive pause/resume/stop on stdin)
//! - Planning a run from flow rate, total time or volume, and fraction size
//! - Printing the wire frames a run would send
//! - Showing the effective configuration
//!
//! # Usage
//!
//! Dry run against the simulated collector:
//! ```bash
//! colosseum run --simulate --size 1 --size-unit mL --flow 30 --flow-unit mL/hr --fractions 10
//! ```
//!
//! Plan a 2 hour run at 500 uL/hr split into 1 mL fractions:
//! ```bash
//! colosseum plan --flow 500 --flow-unit uL/hr --total-time 2 --time-unit hr --size 1 --size-unit mL
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colosseum::config::AppConfig;
use colosseum::experiment::{RunController, RunParameters, RunState, RunStatus};
use colosseum::protocol::Command;
use colosseum::sequence::build_sequence;
use colosseum::timing::{self, FlowUnit, SizeUnit, TimeUnit, VolumeUnit};
use colosseum::{logging, CollectorError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "colosseum")]
#[command(about = "Serial control for the Colosseum fraction collector", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect fractions (type pause, resume, stop or status while running)
    Run(RunArgs),

    /// Work out dwell time, fraction count or fraction size for a run
    Plan(PlanArgs),

    /// Print the frames a run sends
    Frames {
        /// Angle table file (one angle per line)
        #[arg(long)]
        angles: Option<PathBuf>,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Fraction size
    #[arg(long)]
    size: f64,

    /// Fraction size unit (uL, mL)
    #[arg(long, value_parser = parse_unit::<SizeUnit>)]
    size_unit: SizeUnit,

    /// Pump flow rate
    #[arg(long)]
    flow: f64,

    /// Flow rate unit (uL/sec, uL/min, uL/hr, mL/sec, mL/min, mL/hr)
    #[arg(long, value_parser = parse_unit::<FlowUnit>)]
    flow_unit: FlowUnit,

    /// Number of fractions
    #[arg(long)]
    fractions: usize,

    /// Serial port (overrides the configuration)
    #[arg(long)]
    port: Option<String>,

    /// Use the simulated collector instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Angle table file (one angle per line)
    #[arg(long)]
    angles: Option<PathBuf>,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct PlanArgs {
    /// Pump flow rate
    #[arg(long)]
    flow: f64,

    #[arg(long, value_parser = parse_unit::<FlowUnit>)]
    flow_unit: FlowUnit,

    /// Total collection time
    #[arg(long, conflicts_with = "total_volume", required_unless_present = "total_volume")]
    total_time: Option<f64>,

    #[arg(long, value_parser = parse_unit::<TimeUnit>, default_value = "min")]
    time_unit: TimeUnit,

    /// Total volume to collect
    #[arg(long)]
    total_volume: Option<f64>,

    #[arg(long, value_parser = parse_unit::<VolumeUnit>, default_value = "mL")]
    volume_unit: VolumeUnit,

    /// Fraction size
    #[arg(long, conflicts_with = "fractions", required_unless_present = "fractions")]
    size: Option<f64>,

    #[arg(long, value_parser = parse_unit::<SizeUnit>, default_value = "mL")]
    size_unit: SizeUnit,

    /// Number of fractions
    #[arg(long)]
    fractions: Option<usize>,
}

fn parse_unit<T: FromStr<Err = CollectorError>>(s: &str) -> Result<T, String> {
    s.parse().map_err(|e: CollectorError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_collection(args).await,
        Commands::Plan(args) => plan_run(&args),
        Commands::Frames { angles, config } => print_frames(angles, config),
        Commands::Config { config } => {
            let config = load_config(config)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => AppConfig::load().context("Failed to load configuration"),
    }
}

async fn run_collection(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config)?;
    if let Some(port) = args.port {
        config.serial.port = Some(port);
    }
    if args.simulate {
        config.serial.simulate = true;
    }
    if let Some(angles) = args.angles {
        config.angles.path = Some(angles);
    }
    logging::init(&config.logging)?;

    let table = config
        .angles
        .load_table()
        .context("Failed to load angle table")?;
    let params = RunParameters::new(
        args.size,
        args.size_unit,
        args.flow,
        args.flow_unit,
        args.fractions,
    );
    // Reject bad input before waiting for the firmware to boot.
    let dwell = params.validate(table.max_fraction_count())?;

    println!(
        "Collecting {} x {} {} at {} {} ({} per tube, {} moves)",
        params.fraction_count,
        params.size_value,
        params.size_unit,
        params.flow_value,
        params.flow_unit,
        format_duration(dwell),
        params.command_count()
    );

    let controller = RunController::open(
        &config.channel_settings(),
        build_sequence(&table),
        config.controller_settings(),
    )
    .await
    .context("Failed to connect to collector")?;

    controller.start(params)?;
    println!("Run started. Commands: pause, resume, stop, status");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut last = controller.status();

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match line.trim() {
                    "pause" => controller.pause(),
                    "resume" => {
                        if let Err(e) = controller.resume() {
                            eprintln!("Cannot resume: {}", e);
                        }
                    }
                    "stop" => {
                        controller.stop().await;
                        break;
                    }
                    "status" => print_status(&controller.status()),
                    "" => {}
                    other => eprintln!("Unknown command '{}' (pause, resume, stop, status)", other),
                },
                None => stdin_open = false,
            },
            _ = ticker.tick() => {
                let status = controller.status();
                if status.state != last.state || status.position != last.position {
                    print_status(&status);
                }
                let finished = status.state.is_terminal();
                last = status;
                if finished {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, stopping collector");
                controller.stop().await;
                break;
            }
        }
    }

    controller.stop().await;
    let status = controller.status();
    print_status(&status);
    if status.state == RunState::Failed {
        bail!(
            "Run failed: {}",
            status.last_error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}

fn print_status(status: &RunStatus) {
    match status.remaining_time() {
        Some(left) if status.state == RunState::Running => {
            println!("{} (at least {} left)", status, format_duration(left))
        }
        _ => println!("{}", status),
    }
}

fn plan_run(args: &PlanArgs) -> Result<()> {
    let (total_volume, volume_unit) = match (args.total_time, args.total_volume) {
        (Some(time), None) => (
            timing::volume_from_time(
                args.flow,
                args.flow_unit,
                time,
                args.time_unit,
                args.volume_unit,
            )?,
            args.volume_unit,
        ),
        (None, Some(volume)) => (volume, args.volume_unit),
        _ => bail!("Pass exactly one of --total-time or --total-volume"),
    };
    let total_time = timing::time_from_volume(
        args.flow,
        args.flow_unit,
        total_volume,
        volume_unit,
        args.time_unit,
    )?;

    let (size, count) = match (args.size, args.fractions) {
        (Some(size), None) => (
            size,
            timing::fraction_count(total_volume, volume_unit, size, args.size_unit)?,
        ),
        (None, Some(count)) => (
            timing::fraction_size(total_volume, volume_unit, count as f64, args.size_unit)?,
            count as f64,
        ),
        _ => bail!("Pass exactly one of --size or --fractions"),
    };
    let dwell = timing::dwell_time(size, args.size_unit, args.flow, args.flow_unit)?;

    println!("Flow rate:      {} {}", args.flow, args.flow_unit);
    println!("Total volume:   {:.3} {}", total_volume, volume_unit);
    println!("Total time:     {:.3} {}", total_time, args.time_unit);
    println!("Fraction size:  {:.3} {}", size, args.size_unit);
    println!("Fractions:      {:.2}", count);
    println!("Dwell per tube: {}", format_duration(dwell));
    Ok(())
}

fn print_frames(angles: Option<PathBuf>, config: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(angles) = angles {
        config.angles.path = Some(angles);
    }
    let table = config
        .angles
        .load_table()
        .context("Failed to load angle table")?;

    println!("# setup");
    for command in Command::setup_sequence() {
        println!("{}", command);
    }
    println!("# run (position: frame)");
    for (position, command) in build_sequence(&table).iter().enumerate() {
        println!("{:>3}: {}", position, command);
    }
    println!("# stop");
    println!("{}", Command::stop());
    Ok(())
}

fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = total - hours * 3600.0 - minutes * 60.0;
    if hours > 0.0 {
        format!("{}h {:02}m {:04.1}s", hours, minutes, seconds)
    } else if minutes > 0.0 {
        format!("{}m {:04.1}s", minutes, seconds)
    } else {
        format!("{:.1}s", seconds)
    }
}
