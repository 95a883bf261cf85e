//! peercoms - peer-to-peer group messaging node
//!
//! Runs a coordinator over the TCP mesh with a small set of demo handlers:
//! `test.key` and `peer.status` log what they receive, `perf.echo` answers
//! with the measured one-way latency.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde_json::json;
use tracing::{debug, error, info, warn};

use peercoms::cli::{Cli, Commands, ConfigSubcommand};
use peercoms::config::{self, NodeConfig};
use peercoms::coordinator::{Coordinator, CoordinatorConfig, CoordinatorEvent, HandlerResult};
use peercoms::error::{Error, Result};
use peercoms::logging::{self, LogGuards};
use peercoms::protocol::{Message, MsgType, Payload};
use peercoms::transport::TcpTransport;

fn main() {
    if let Err(e) = run() {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("peercoms {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Run {
            config,
            name,
            group,
            listen_port,
            seeds,
            status_interval,
        } => {
            let mut cfg = NodeConfig::load(config.as_deref())?;

            // CLI overrides
            if name.is_some() {
                cfg.node.name = name;
            }
            if let Some(group) = group {
                cfg.node.group = group;
            }
            if let Some(port) = listen_port {
                cfg.transport.listen_port = port;
            }
            if !seeds.is_empty() {
                cfg.transport.seeds = seeds;
            }
            cfg.validate()?;

            let _log_guards = init_logging_from_config(&cfg, cli.verbose, cli.quiet)?;
            info!(version = env!("CARGO_PKG_VERSION"), "Starting peercoms node");

            run_node(cfg, Duration::from_secs(status_interval))
        }
    }
}

/// Initialize logging from configuration
fn init_logging_from_config(config: &NodeConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

/// Build the runtime and run the node until Ctrl+C
fn run_node(config: NodeConfig, status_interval: Duration) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("peercoms")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_node_main(config, status_interval))
}

async fn async_node_main(config: NodeConfig, status_interval: Duration) -> Result<()> {
    let node_name = config.node_name();
    let transport = Arc::new(TcpTransport::new(
        config.tcp_config(),
        node_name.clone(),
        config.node.id_hint.clone(),
    ));

    let coordinator = Arc::new(Coordinator::new(transport.clone(), CoordinatorConfig::from(&config)));
    register_demo_handlers(&coordinator)?;

    let mut event_rx = coordinator.start().await?;
    info!(
        peer = %coordinator.id(),
        name = %node_name,
        group = %config.node.group,
        listen = ?transport.listen_addr(),
        seeds = ?config.transport.seeds,
        "Node running"
    );

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let mut status_timer = tokio::time::interval(if status_interval.is_zero() {
        Duration::from_secs(3600)
    } else {
        status_interval
    });
    status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut tick: usize = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }

            event = event_rx.recv() => {
                match event {
                    Some(event) => log_event(event),
                    None => {
                        warn!("Coordinator event channel closed");
                        break;
                    }
                }
            }

            _ = status_timer.tick(), if !status_interval.is_zero() => {
                tick = tick.wrapping_add(1);
                if let Err(e) = shout_status(&coordinator).await {
                    debug!(error = %e, "Status shout failed");
                }

                let echo_peers = coordinator.peers_supporting("perf.echo");
                if !echo_peers.is_empty() {
                    let peer = echo_peers[tick % echo_peers.len()].clone();
                    let coordinator = Arc::clone(&coordinator);
                    tokio::spawn(async move {
                        echo_request(&coordinator, &peer).await;
                    });
                }
            }
        }
    }

    coordinator.stop().await?;
    let stats = coordinator.stats();
    info!(
        received = stats.received,
        handled = stats.handled,
        failed = stats.handler_failed,
        dropped = stats.dropped,
        replies = stats.replies_sent,
        "Node stopped"
    );
    Ok(())
}

fn register_demo_handlers(coordinator: &Coordinator) -> Result<()> {
    coordinator.register_handler("test.key", |msg: &Message, sender: &str| -> HandlerResult {
        info!(
            peer = %sender,
            msg_type = %msg.msg_type(),
            req_id = %msg.req_id(),
            key = %msg.key(),
            payload = %serde_json::Value::Object(msg.payload().clone()),
            "Received test message"
        );
        Ok(None)
    })?;

    coordinator.register_handler("peer.status", |msg: &Message, sender: &str| -> HandlerResult {
        debug!(
            peer = %sender,
            status = ?msg.field("status"),
            "Peer status"
        );
        Ok(None)
    })?;

    coordinator.register_handler("perf.echo", |msg: &Message, sender: &str| -> HandlerResult {
        let sent_time = msg.field("sent_time").and_then(|v| v.as_f64());
        let rtt = sent_time.map(|sent| (unix_seconds() - sent).max(0.0)).unwrap_or(0.0);
        debug!(peer = %sender, req_id = %msg.req_id(), rtt, "Echo request");

        let mut result = Payload::new();
        result.insert("rtt".to_string(), json!(rtt));
        result.insert("echoed".to_string(), json!(true));
        Ok(Some(result))
    })?;

    Ok(())
}

async fn shout_status(coordinator: &Coordinator) -> Result<()> {
    let msg = coordinator
        .builder()
        .with_type(MsgType::Shout)
        .with_key("peer.status")
        .with_field("status", "alive")
        .with_field("name", coordinator.name())
        .with_field("timestamp", unix_seconds())
        .build()?;
    coordinator.send(&msg).await
}

async fn echo_request(coordinator: &Coordinator, peer: &str) {
    let msg = match coordinator
        .builder()
        .with_type(MsgType::Whisper)
        .with_key("perf.echo")
        .with_destination(peer)
        .with_field("sent_time", unix_seconds())
        .build()
    {
        Ok(msg) => msg,
        Err(e) => {
            error!(error = %e, "Failed to build echo request");
            return;
        }
    };

    let started = std::time::Instant::now();
    match coordinator.request(msg).await {
        Ok(reply) => info!(
            peer = %peer,
            rtt_ms = started.elapsed().as_secs_f64() * 1000.0,
            one_way = ?reply.field("rtt"),
            "Echo reply"
        ),
        Err(e) => warn!(peer = %peer, error = %e, "Echo request failed"),
    }
}

fn log_event(event: CoordinatorEvent) {
    match event {
        CoordinatorEvent::PeerEntered { peer_id, name } => {
            info!(peer = %peer_id, name = %name, "Peer joined");
        }
        CoordinatorEvent::PeerExited { peer_id } => {
            info!(peer = %peer_id, "Peer left");
        }
        CoordinatorEvent::CapabilitiesUpdated { peer_id, keys } => {
            info!(peer = %peer_id, keys = ?keys, "Peer capabilities");
        }
        CoordinatorEvent::HandlerFailed { req_id, key, error } => {
            warn!(req_id = %req_id, key = %key, error = %error, "Handler failure");
        }
        CoordinatorEvent::Dropped { peer_id, key, capacity } => {
            warn!(peer = %peer_id, key = %key, capacity, "Message dropped");
        }
        CoordinatorEvent::DecodeFailed { peer_id, error } => {
            warn!(peer = %peer_id, error = %error, "Undecodable message");
        }
        CoordinatorEvent::TransportFailed { error } => {
            warn!(error = %error, "Transport failure");
        }
        other => debug!(event = ?other, "Coordinator event"),
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = NodeConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            NodeConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
