//! CLI entry point for ereg-control
//!
//! Provides:
//! - `info`: model number, metadata and stored defaults
//! - `monitor`: stream polled pressure until Ctrl-C
//! - `sweep`: run one stepped pressure sweep
//! - `bleed`: blip the supply line until Ctrl-C
//!
//! # Usage
//!
//! ```bash
//! ereg-control --host 192.168.1.100 info
//! ereg-control --mock monitor
//! ereg-control sweep --from 1000 --span 400 --rate 2 --direction H2L
//! ereg-control bleed --rate 12 --setpoint 1500
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ereg_control::config::{Settings, DEFAULT_CONFIG_PATH};
use ereg_control::tracing_setup::{self, OutputFormat, TracingConfig};
use ereg_control::{Controller, ControllerEvent, OperateMode, SweepDirection};
use ereg_driver::units::psi_to_mbar;
use ereg_driver::{EReg, MockEReg};
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "ereg-control")]
#[command(about = "Headless controller for an e-Reg pressure regulator", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Regulator address, overrides the configuration
    #[arg(long, global = true)]
    host: Option<String>,

    /// Regulator port, overrides the configuration
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Talk to an in-process mock regulator instead of hardware
    #[arg(long, global = true)]
    mock: bool,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print model number, metadata and stored defaults
    Info,

    /// Stream pressure readings until Ctrl-C
    Monitor,

    /// Run a stepped pressure sweep
    Sweep {
        /// Number of 1 mBar steps
        #[arg(long)]
        span: i32,

        /// Steps per second
        #[arg(long, default_value = "1")]
        rate: u32,

        /// H2L (high-to-low) or L2H
        #[arg(long, default_value = "L2H")]
        direction: String,

        /// Starting pressure in mBar
        #[arg(long)]
        from: f64,
    },

    /// Blip the supply line until Ctrl-C
    Bleed {
        /// Blips per hour (1-60)
        #[arg(long)]
        rate: u32,

        /// Setpoint to hold between blips, in mBar
        #[arg(long)]
        setpoint: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut settings = Settings::load_from(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    let format: OutputFormat = cli
        .log_format
        .parse()
        .map_err(anyhow::Error::msg)?;
    let tracing_config = TracingConfig::from_settings(&settings)
        .map_err(anyhow::Error::msg)?
        .with_format(format);
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    if let Some(host) = cli.host.clone() {
        settings.instrument.host = host;
    }
    if let Some(port) = cli.port {
        settings.instrument.port = port;
    }

    // Held for the whole run so the mock keeps listening
    let _mock = if cli.mock {
        let mock = MockEReg::spawn().await.context("starting mock regulator")?;
        settings.instrument.host = mock.host();
        settings.instrument.port = mock.port();
        Some(mock)
    } else {
        None
    };

    match cli.command {
        Commands::Info => show_info(&settings).await,
        Commands::Monitor => monitor(settings).await,
        Commands::Sweep {
            span,
            rate,
            direction,
            from,
        } => run_sweep(settings, span, rate, SweepDirection::parse(&direction), from).await,
        Commands::Bleed { rate, setpoint } => run_bleed(settings, rate, setpoint).await,
    }
}

async fn show_info(settings: &Settings) -> Result<()> {
    let instrument = &settings.instrument;
    let ereg = EReg::new();
    ereg.open_connection(&instrument.host, instrument.port, instrument.timeout())
        .await
        .with_context(|| format!("connecting to {}:{}", instrument.host, instrument.port))?;

    let model = ereg.model_number().await?;
    let metadata = ereg.metadata().await?;
    let defaults = ereg.defaults().await?;
    ereg.close_connection().await;

    println!("Model:                {}", model);
    println!("Serial number:        {}", metadata.serial_number);
    println!("Software version:     {}", metadata.software_version);
    println!("Board revision:       {}", metadata.board_revision);
    println!("Samples taken:        {}", defaults.samples_taken);
    println!("Sample rate:          {} ms", defaults.sample_rate);
    println!("Heartbeat:            {} ms", defaults.heartbeat);
    println!("Fault pressure:       {} psi", defaults.fault_pressure);
    println!("Relay timeout:        {} ms", defaults.relay_timeout);
    println!("Calibration pressure: {} psi", defaults.calibration_pressure);
    Ok(())
}

async fn connected_controller(settings: Settings) -> Result<Controller> {
    let controller = Controller::new(settings);
    let connected = controller
        .start_up()
        .await
        .context("connecting to the regulator")?;
    if !connected {
        controller
            .connect_default()
            .await
            .context("connecting to the regulator")?;
    }
    Ok(controller)
}

async fn monitor(settings: Settings) -> Result<()> {
    let controller = connected_controller(settings).await?;
    let mut events = controller.subscribe();

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ControllerEvent::PressureUpdate(psi)) => {
                    println!("{:>8.2} psi  {:>7.0} mBar", psi, psi_to_mbar(psi));
                }
                Ok(ControllerEvent::ConnectionLost(message)) => {
                    break Err(anyhow::anyhow!("connection lost: {}", message));
                }
                Ok(ControllerEvent::UnexpectedError(message))
                | Ok(ControllerEvent::DeviceRejected(message)) => {
                    break Err(anyhow::anyhow!("polling stopped: {}", message));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
            _ = signal::ctrl_c() => break Ok(()),
        }
    };

    controller.shutdown().await;
    outcome
}

async fn run_sweep(
    settings: Settings,
    span: i32,
    rate: u32,
    direction: SweepDirection,
    from: f64,
) -> Result<()> {
    let controller = connected_controller(settings).await?;
    let mut events = controller.subscribe();

    controller.set_mode(OperateMode::Pressurize).await?;
    controller.set_setpoint_mbar(from).await?;
    controller.set_operate(true).await?;
    let params = controller.start_sweep(span, rate, direction).await?;
    println!(
        "Sweeping {} -> {} mBar at {} steps/s",
        params.start_mbar,
        params.target_mbar(),
        params.rate
    );

    let mut stop_requested = false;
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ControllerEvent::SweepProgress { steps_taken, current_pressure }) => {
                    println!(
                        "step {:>5}/{}  {:>5} mBar",
                        steps_taken, params.span, current_pressure
                    );
                }
                Ok(ControllerEvent::SweepFinished { steps_taken, current_pressure, cancelled }) => {
                    println!(
                        "Sweep {} after {} steps at {} mBar",
                        if cancelled { "stopped" } else { "finished" },
                        steps_taken,
                        current_pressure
                    );
                    break Ok(());
                }
                Ok(ControllerEvent::ConnectionLost(message)) => {
                    break Err(anyhow::anyhow!("connection lost: {}", message));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
            _ = signal::ctrl_c(), if !stop_requested => {
                stop_requested = true;
                controller.stop_sweep().await;
            }
        }
    };

    if outcome.is_ok() {
        controller.set_operate(false).await?;
    }
    controller.shutdown().await;
    outcome
}

async fn run_bleed(settings: Settings, rate: u32, setpoint: f64) -> Result<()> {
    let controller = connected_controller(settings).await?;
    let mut events = controller.subscribe();

    controller.set_mode(OperateMode::Pressurize).await?;
    controller.set_setpoint_mbar(setpoint).await?;
    controller.set_operate(true).await?;
    let period = controller.start_bleed(rate).await?;
    println!(
        "Bleeding every {:.0} s around {} mBar, Ctrl-C to stop",
        period.as_secs_f64(),
        setpoint
    );

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ControllerEvent::ConnectionLost(message)) => {
                    break Err(anyhow::anyhow!("connection lost: {}", message));
                }
                Ok(ControllerEvent::DeviceRejected(message))
                | Ok(ControllerEvent::UnexpectedError(message)) => {
                    tracing::warn!("{}", message);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
            _ = signal::ctrl_c() => break Ok(()),
        }
    };

    controller.stop_bleed().await;
    if outcome.is_ok() {
        controller.set_operate(false).await?;
    }
    controller.shutdown().await;
    outcome
}
