//! Bus test client - exercises a warden message channel from either end.
//!
//! In `--host` mode it plays the watchdog: hosts the channel, probes the
//! peer with health pings and prints everything the peer publishes. Without
//! `--host` it plays the worker: connects, answers pings and relays a
//! heartbeat of metric snapshots.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use warden_message_system::{
    current_timestamp, standard_registry, BufferPool, ChatLine, HealthPing, HealthPong, LogLine,
    MessageBus, MetricSnapshot, PacketDistributor, StreamChannel,
};

mod config;
mod logging;

use config::{load_config, AppConfig, Args};

fn main() -> Result<()> {
    let args = Args::parse();

    if let Err(e) = logging::setup_logging(&args) {
        error!("Failed to initialize logging: {}", e);
        return Err(e);
    }

    info!("Starting bus test client v{}", env!("CARGO_PKG_VERSION"));
    let config = load_config(&args)?;
    info!(
        "Channel: {} in {}",
        config.bus.channel_name,
        config.bus.channel_dir.display()
    );

    let pool = BufferPool::new(config.bus.initial_buffer_capacity);
    let distributor = Arc::new(PacketDistributor::new());

    let channel = if args.host {
        info!("Hosting channel, waiting for a peer...");
        StreamChannel::host(&config.bus, pool.clone(), Arc::clone(&distributor))
            .context("Failed to host channel")?
    } else {
        info!("Connecting to hosted channel...");
        StreamChannel::connect(&config.bus, pool.clone(), Arc::clone(&distributor))
            .context("Failed to connect; is a host running?")?
    };

    let bus = Arc::new(MessageBus::new(
        Arc::new(standard_registry().context("standard registry")?),
        distributor,
        pool,
        channel.sender(),
        &config.bus,
    ));

    if args.host {
        run_watchdog_side(&bus, &config, args.count)
    } else {
        run_worker_side(&bus, &config, args.count)
    }
}

/// Watchdog role: print incoming traffic and probe the peer periodically.
fn run_watchdog_side(bus: &Arc<MessageBus>, config: &AppConfig, count: u64) -> Result<()> {
    let _chat = bus.subscribe(|line: ChatLine| {
        info!("[chat/{}] {}: {}", line.channel, line.sender, line.text);
        Ok(())
    })?;
    let _logs = bus.subscribe(|line: LogLine| {
        info!("[{}] {}", line.level, line.line);
        Ok(())
    })?;
    let _metrics = bus.subscribe(|snapshot: MetricSnapshot| {
        info!(
            "tick {:.1}ms, {} players, {} MiB heap",
            snapshot.tick_millis,
            snapshot.players_online,
            snapshot.heap_bytes >> 20
        );
        Ok(())
    })?;

    let interval = Duration::from_millis(config.ping_interval_ms);
    let mut sequence: u64 = 0;
    loop {
        sequence += 1;
        let probe = sequence;
        let result = bus.request::<HealthPong, u64, _, _>(
            |bus| {
                bus.send(HealthPing {
                    sequence: probe,
                    timestamp: current_timestamp(),
                })
            },
            move |pong| (pong.sequence == probe).then_some(pong.sequence),
            interval,
        );
        match result {
            Ok(_) => info!("Ping {} answered", probe),
            Err(e) => warn!("Ping {} unanswered: {}", probe, e),
        }
        if count > 0 && sequence >= count {
            info!("Done after {} pings", sequence);
            return Ok(());
        }
        std::thread::sleep(interval);
    }
}

/// Worker role: answer pings and publish a metric heartbeat.
fn run_worker_side(bus: &Arc<MessageBus>, config: &AppConfig, count: u64) -> Result<()> {
    let responder_bus = Arc::clone(bus);
    let _pings = bus.subscribe(move |ping: HealthPing| {
        responder_bus.send(HealthPong {
            sequence: ping.sequence,
            timestamp: current_timestamp(),
        })?;
        responder_bus.flush()
    })?;

    let interval = Duration::from_millis(config.ping_interval_ms);
    let mut beats: u64 = 0;
    loop {
        beats += 1;
        bus.send(MetricSnapshot {
            tick_millis: 16.6,
            players_online: 0,
            heap_bytes: 0,
            timestamp: current_timestamp(),
        })?;
        bus.flush()?;
        if count > 0 && beats >= count {
            info!("Done after {} heartbeats", beats);
            return Ok(());
        }
        std::thread::sleep(interval);
    }
}
