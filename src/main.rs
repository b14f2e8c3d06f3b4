//! CLI Entry Point for plasma-daq
//!
//! Provides command-line interface for:
//! - Constant treatments (one power/flow pair for a fixed duration)
//! - Multistep runs over a shuffled power×flow grid
//! - Warming up the jet before a session
//! - Regenerating artifacts from a backup snapshot
//!
//! # Usage
//!
//! Simulated constant treatment:
//! ```bash
//! plasma-daq run --power 2.5 --flow 1.5 --duration 60 --simulate
//! ```
//!
//! Multistep grid on the real jet (telemetry on the configured serial port):
//! ```bash
//! plasma-daq multistep --step-length 20 --config config/run.toml
//! ```
//!
//! Warm up the jet (ignite, hold for 15 minutes, switch off):
//! ```bash
//! plasma-daq warmup --hold-minutes 15
//! ```
//!
//! Print the effective settings (file plus `PLASMA_DAQ_*` overrides):
//! ```bash
//! plasma-daq config --config config/run.toml
//! ```
//!
//! Resave a run:
//! ```bash
//! plasma-daq resave data/2024-05-01_10.00.00_OL_data/OL_data_backup.json
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use plasma_daq::config::{RunConfig, RunSettings, DEFAULT_CONFIG_PATH};
use plasma_daq::data::storage::{resave_from_backup, ArtifactOutcome, PersistReport};
use plasma_daq::experiment::plans::{self, seconds, GridSpec, InputSequence};
use plasma_daq::experiment::{warm_up, RunEngine, WarmupPlan};
use plasma_daq::hardware::mock::MockRig;
use plasma_daq::hardware::DeviceRegistry;
use plasma_daq::tracing_setup;

#[derive(Parser)]
#[command(name = "plasma-daq")]
#[command(about = "Deadline-bound acquisition and actuation for plasma jet experiments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RigArgs {
    /// Settings file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated instruments
    #[arg(long)]
    simulate: bool,

    /// Simulated device latency in milliseconds
    #[arg(long, default_value = "100")]
    latency_ms: u64,

    /// Run label, overriding the settings file
    #[arg(long)]
    label: Option<String>,

    /// Free-form run note as key=value (repeatable)
    #[arg(long = "note", value_parser = parse_note)]
    notes: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Hold one power/flow pair for a fixed duration
    Run {
        #[command(flatten)]
        rig: RigArgs,

        /// Power setpoint, W
        #[arg(long)]
        power: f64,

        /// Flow setpoint, slm
        #[arg(long)]
        flow: f64,

        /// Treatment duration, seconds
        #[arg(long)]
        duration: f64,
    },

    /// Step through a shuffled power×flow grid
    Multistep {
        #[command(flatten)]
        rig: RigArgs,

        /// Time spent on each grid level, seconds
        #[arg(long, default_value = "20")]
        step_length: f64,

        #[arg(long, default_value = "1.5")]
        power_min: f64,

        #[arg(long, default_value = "5.0")]
        power_max: f64,

        #[arg(long, default_value = "1.5")]
        flow_min: f64,

        #[arg(long, default_value = "5.0")]
        flow_max: f64,

        /// Grid spacing on both axes
        #[arg(long, default_value = "0.25")]
        grid_step: f64,

        /// Shuffle seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Ignite the jet, hold it at a moderate setpoint, then switch it off
    Warmup {
        #[command(flatten)]
        rig: RigArgs,

        /// Ignition power, W
        #[arg(long, default_value = "4.0")]
        ignition_power: f64,

        /// Ignition flow, slm
        #[arg(long, default_value = "3.0")]
        ignition_flow: f64,

        /// Seconds at the ignition setpoint
        #[arg(long, default_value = "4")]
        ignition_secs: f64,

        /// Holding power, W
        #[arg(long, default_value = "2.0")]
        hold_power: f64,

        /// Holding flow, slm
        #[arg(long, default_value = "2.0")]
        hold_flow: f64,

        /// Minutes at the holding setpoint
        #[arg(long, default_value = "15")]
        hold_minutes: f64,
    },

    /// Print the effective settings as TOML
    Config {
        /// Settings file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Regenerate every artifact from a backup snapshot
    Resave {
        /// Backup JSON file
        backup: PathBuf,

        /// Output directory (defaults to the backup's directory)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Settings file (logging only)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn parse_note(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            rig,
            power,
            flow,
            duration,
        } => {
            let settings = load_settings(&rig.config, rig.label.as_deref())?;
            let seq = plans::constant(
                power,
                flow,
                seconds("duration", duration)?,
                settings.sampling_period(),
            )?;
            run(rig, settings, seq).await
        }
        Commands::Multistep {
            rig,
            step_length,
            power_min,
            power_max,
            flow_min,
            flow_max,
            grid_step,
            seed,
        } => {
            let settings = load_settings(&rig.config, rig.label.as_deref())?;
            let grid = GridSpec {
                power_min,
                power_max,
                flow_min,
                flow_max,
                step: grid_step,
            };
            let levels = plans::shuffled_grid(&grid, seed);
            info!(levels = levels.len(), seed, "Built multistep grid");
            let seq = plans::multistep(
                &levels,
                seconds("step_length", step_length)?,
                settings.sampling_period(),
            )?;
            run(rig, settings, seq).await
        }
        Commands::Warmup {
            rig,
            ignition_power,
            ignition_flow,
            ignition_secs,
            hold_power,
            hold_flow,
            hold_minutes,
        } => {
            let settings = load_settings(&rig.config, rig.label.as_deref())?;
            let plan = WarmupPlan {
                ignition_power,
                ignition_flow,
                ignition_hold: seconds("ignition_secs", ignition_secs)?,
                hold_power,
                hold_flow,
                hold: seconds("hold_minutes", hold_minutes * 60.0)?,
                duty_cycle: settings.duty_cycle,
                ..WarmupPlan::default()
            };
            let registry = build_registry(&rig, &settings).await?;
            warm_up(&registry, &plan).await?;
            println!("Warm-up complete");
            Ok(())
        }
        Commands::Config { config } => {
            let settings = RunSettings::load_from(&config)
                .with_context(|| format!("Failed to load settings from {}", config.display()))?;
            settings.validate()?;
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Commands::Resave {
            backup,
            out,
            config,
        } => {
            load_settings(&config, None)?;
            let out = out.unwrap_or_else(|| {
                backup
                    .parent()
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
            });
            let report = resave_from_backup(&backup, &out)
                .with_context(|| format!("Failed to resave from {}", backup.display()))?;
            print_report(&report);
            Ok(())
        }
    }
}

/// Load the settings file and start logging as it configures.
fn load_settings(path: &Path, label: Option<&str>) -> Result<RunSettings> {
    let mut settings = RunSettings::load_from(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(label) = label {
        settings.storage.run_label = label.to_string();
    }
    tracing_setup::init_from_settings(&settings.logging).map_err(anyhow::Error::msg)?;
    Ok(settings)
}

async fn run(rig: RigArgs, settings: RunSettings, seq: InputSequence) -> Result<()> {
    let registry = build_registry(&rig, &settings).await?;

    let (power, flow) = seq.into_parts();
    let mut config = RunConfig::new(settings, power, flow)?;
    for (key, value) in rig.notes {
        config = config.with_metadata(key, value);
    }
    if rig.simulate {
        config = config.with_metadata("simulated", "true");
    }

    let engine = RunEngine::new(registry, config);
    let outcome = engine.run().await?;

    println!(
        "Run finished: {} ticks, {} overruns, output in {}",
        outcome.record.niter,
        outcome.record.overruns.len(),
        outcome.output_dir.display()
    );
    print_report(&outcome.report);
    Ok(())
}

async fn build_registry(rig: &RigArgs, settings: &RunSettings) -> Result<DeviceRegistry> {
    if rig.simulate {
        let mock = MockRig::new(Duration::from_millis(rig.latency_ms));
        info!(latency_ms = rig.latency_ms, "Using simulated instruments");
        return Ok(mock.registry());
    }
    open_serial_registry(settings).await
}

#[cfg(feature = "tokio_serial")]
async fn open_serial_registry(settings: &RunSettings) -> Result<DeviceRegistry> {
    use std::sync::Arc;

    use plasma_daq::hardware::telemetry::SerialTelemetry;

    let port = settings
        .telemetry
        .port
        .as_deref()
        .context("telemetry.port must be set unless --simulate is used")?;
    let link = Arc::new(SerialTelemetry::open(port, settings.telemetry.baud_rate).await?);
    // Camera, spectrometer and oscilloscope drivers are registered by the
    // host application; collect flags for them must be off here.
    Ok(DeviceRegistry::new()
        .with_telemetry(link.clone())
        .with_actuator(link))
}

#[cfg(not(feature = "tokio_serial"))]
async fn open_serial_registry(_settings: &RunSettings) -> Result<DeviceRegistry> {
    Err(plasma_daq::error::DaqError::FeatureNotEnabled("tokio_serial".to_string()).into())
}

fn print_report(report: &PersistReport) {
    for (artifact, outcome) in report.iter() {
        match outcome {
            ArtifactOutcome::Written { path, duration } => {
                println!("  {:<13} written  {} ({:?})", artifact.to_string(), path.display(), duration)
            }
            ArtifactOutcome::Skipped => println!("  {:<13} skipped", artifact.to_string()),
            ArtifactOutcome::Failed(e) => println!("  {:<13} FAILED   {}", artifact.to_string(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn resave_takes_a_settings_file() {
        let cli = Cli::try_parse_from([
            "plasma-daq",
            "resave",
            "run/OL_data_backup.json",
            "--config",
            "lab.toml",
        ])
        .unwrap();
        match cli.command {
            Commands::Resave { backup, out, config } => {
                assert_eq!(backup, PathBuf::from("run/OL_data_backup.json"));
                assert!(out.is_none());
                assert_eq!(config, PathBuf::from("lab.toml"));
            }
            _ => panic!("expected resave"),
        }
    }

    #[test]
    fn warmup_defaults_match_the_ignition_routine() {
        let cli = Cli::try_parse_from(["plasma-daq", "warmup", "--simulate"]).unwrap();
        match cli.command {
            Commands::Warmup {
                rig,
                ignition_power,
                ignition_flow,
                hold_power,
                hold_flow,
                hold_minutes,
                ..
            } => {
                assert!(rig.simulate);
                assert_eq!((ignition_power, ignition_flow), (4.0, 3.0));
                assert_eq!((hold_power, hold_flow), (2.0, 2.0));
                assert_eq!(hold_minutes, 15.0);
            }
            _ => panic!("expected warmup"),
        }
    }

    #[test]
    fn negative_duration_is_an_error_not_a_panic() {
        let cli = Cli::try_parse_from([
            "plasma-daq", "run", "--power", "2", "--flow", "1.5", "--duration=-5",
        ])
        .unwrap();
        let Commands::Run { duration, .. } = cli.command else {
            panic!("expected run");
        };
        assert!(seconds("duration", duration).is_err());
    }
}
