use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio::sync::{mpsc, watch};

mod config;
mod console;
mod dispatcher;
mod error;
mod event_log;
mod hub;
mod messages;
mod monitor;
mod mqtt;
mod parser;
mod serial;
mod state;

/// Watches an RF tripwire over its serial console and fans its state out to observers.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Serial device, overriding `serial.device`
    #[arg(short, long)]
    device: Option<String>,

    /// Print every notification to stdout as JSON lines
    #[arg(long)]
    console: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::env::var_os("RUST_LOG").is_none() {
        let level = if args.verbose { "debug" } else { "info" };
        pretty_env_logger::formatted_timed_builder()
            .parse_filters(level)
            .init();
    } else {
        pretty_env_logger::init_timed();
    }

    let mut config = config::AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(device) = args.device {
        config.serial.device = device;
    }
    config.validate().context("invalid configuration")?;

    info!(
        "Monitoring {} at {} baud",
        config.serial.device,
        config.serial.baud_rate()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stop_reader = Arc::new(AtomicBool::new(false));
    let mut tasks = Vec::new();

    let link = Arc::new(serial::SerialLink::new(config.serial.device.clone()));
    let hub = Arc::new(hub::BroadcastHub::new(config.broadcast().capacity()));

    let (dispatcher, worker) = dispatcher::Dispatcher::spawn(
        Arc::clone(&link),
        dispatcher::DispatcherSettings::from(&config),
        shutdown_rx.clone(),
    );
    tasks.push(worker);

    let (reader_tx, reader_rx) = mpsc::channel(256);
    let reader = serial::LineReader::new(
        Arc::clone(&link),
        config.serial.clone(),
        reader_tx,
        Arc::clone(&stop_reader),
    )
    .spawn()
    .context("starting serial reader thread")?;

    let (monitor, handle) = monitor::Monitor::new(
        monitor::MonitorSettings::from(&config),
        Arc::clone(&hub),
        dispatcher,
        reader_rx,
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(monitor.run()));

    if args.console {
        let (observer, snapshot) = handle
            .subscribe()
            .await
            .context("monitor stopped during startup")?;
        tasks.push(hub.attach(
            observer,
            snapshot,
            console::ConsoleSink::stdout(),
            shutdown_rx.clone(),
        ));
    }

    if let Some(mqtt_config) = &config.mqtt {
        let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
        let (observer, snapshot) = handle
            .subscribe()
            .await
            .context("monitor stopped during startup")?;
        tasks.push(hub.attach(observer, snapshot, mqtt_client.clone(), shutdown_rx.clone()));

        let monitor = handle.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            mqtt_client.event_loop(&mut eventloop, monitor, shutdown).await;
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Shutting down");

    stop_reader.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(true);
    drop(handle);

    for result in futures::future::join_all(tasks).await {
        if let Err(err) = result {
            error!("Task failed during shutdown: {}", err);
        }
    }
    match tokio::task::spawn_blocking(move || reader.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => error!("Serial reader thread panicked"),
        Err(err) => error!("Serial reader did not stop cleanly: {}", err),
    }
    link.close();

    info!("Stopped");
    Ok(())
}
