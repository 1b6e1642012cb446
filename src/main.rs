//! CLI entry point for the RBS fixture.
//!
//! ```bash
//! # long-running daemon: trigger listener plus camera acquisition
//! rbs-fixtured daemon --config config/fixture.toml
//!
//! # one run, summary printed on completion
//! rbs-fixtured run --side 2
//!
//! # everything against simulated controllers and cameras
//! rbs-fixtured --simulate run
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rbs_fixture::config::{FixtureConfig, DEFAULT_CONFIG_PATH};
use rbs_fixture::controller::Controller;
use rbs_fixture::hardware::camera::{CameraManager, Rotation};
use rbs_fixture::hardware::mock::{synthetic_pattern, MockController, MockControllerOptions, SyntheticFrameSource};
use rbs_fixture::logging;
use rbs_fixture::plan::TestPlan;
use rbs_fixture::sequencer::FixtureSide;
use rbs_fixture::vision::process::{PROCESS_HEIGHT, PROCESS_WIDTH};
use rbs_fixture::ChannelRole;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rbs-fixtured")]
#[command(about = "Remote-control test fixture orchestrator", long_about = None)]
struct Cli {
    /// Configuration file (TOML format)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Replace the serial controllers (and unconfigured cameras) with
    /// simulated ones
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for the physical trigger and run on demand
    Daemon,

    /// Execute one run and print its summary
    Run {
        /// Fixture side (1 or 2); defaults to the configured side
        #[arg(long)]
        side: Option<u8>,
    },

    /// Load and validate the configuration and test plan
    CheckConfig,

    /// List candidate serial ports
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = FixtureConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::Ports => list_ports(),
        Commands::Daemon => {
            let controller = build(&config, cli.simulate).await?;
            daemon(controller).await
        }
        Commands::Run { side } => {
            let controller = build(&config, cli.simulate).await?;
            run_once(controller, side).await
        }
    }
}

fn check_config(config: &FixtureConfig) -> Result<()> {
    let plan = TestPlan::load(&config.storage.plan_file)
        .with_context(|| format!("loading plan {}", config.storage.plan_file.display()))?;
    println!("Configuration OK");
    println!("  cameras:  {}", config.cameras.len());
    println!("  buttons:  {}", plan.len());
    println!("  side:     {}", config.sequencer.run.side);
    println!("  infrared: {}", if config.infrared.enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = rbs_core::serial::list_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port:?}");
    }
    Ok(())
}

async fn build(config: &FixtureConfig, simulate: bool) -> Result<Controller> {
    let plan = TestPlan::load(&config.storage.plan_file)
        .with_context(|| format!("loading plan {}", config.storage.plan_file.display()))?;

    let mut builder = Controller::builder(config.clone()).plan(plan);
    if simulate && config.cameras.is_empty() {
        let cameras = (1..=2u8)
            .map(|index| {
                let frame = synthetic_pattern(PROCESS_WIDTH, PROCESS_HEIGHT, u32::from(index));
                CameraManager::new(
                    index,
                    Box::new(SyntheticFrameSource::new(frame)),
                    config.camera.settings(Rotation::None),
                )
            })
            .collect();
        builder = builder.cameras(cameras);
    }
    let controller = builder.build()?;

    if simulate {
        for role in [ChannelRole::Motion, ChannelRole::Relay] {
            let (port, _mock) = MockController::spawn(role, MockControllerOptions::default());
            controller.attach_channel(role, port, "simulated").await;
        }
        info!("simulated controllers attached");
    } else {
        let connected = controller.connect_configured().await;
        info!(connected, "serial channels connected");
    }
    match controller.infrared_status().await {
        Ok(Some(status)) => info!(%status, "infrared service reachable"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "infrared service unreachable, captures will fail until it is up"),
    }
    controller.start_cameras();
    Ok(controller)
}

async fn daemon(controller: Controller) -> Result<()> {
    let trigger = controller.spawn_trigger_listener();
    if trigger.is_none() {
        info!("trigger listener disabled");
    }
    info!("daemon running, press Ctrl+C to stop");

    signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(trigger) = trigger {
        trigger.stop().await;
    }
    controller.shutdown().await;
    Ok(())
}

async fn run_once(controller: Controller, side: Option<u8>) -> Result<()> {
    let handle = match side {
        Some(side) => controller.start_run_on(FixtureSide::try_from(side).map_err(anyhow::Error::msg)?)?,
        None => controller.start_run()?,
    };
    info!(run = handle.run_index(), id = %handle.run_id(), "run started");

    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result,
        _ = signal::ctrl_c() => {
            controller.interrupt();
            info!("interrupt requested, finishing the current button");
            wait.await
        }
    };
    controller.shutdown().await;

    let report = result?;
    println!("Run {} ({})", report.metadata.run_index, report.metadata.photo_dir.display());
    for (group, summary) in &report.groups {
        println!(
            "  group {group}: {:?} {}/{} approved ({} buttons){}",
            summary.status,
            summary.approved_count,
            summary.validated,
            summary.total,
            if summary.approved { "" } else { "  REJECTED" }
        );
    }
    println!("{}", report.summary.text);
    Ok(())
}
