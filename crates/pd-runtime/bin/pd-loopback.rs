//! Loopback demo: a source and a sink port negotiating over an in-process wire.
//!
//! Optionally injects a reset after the first contract, or leaves the sink
//! unconnected with Hard Reset signalling that never completes, walking it
//! into the unusable state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use pd_core::{
    Capabilities, Contract, DevicePolicy, PolicyRequest, PortConfig, PortId, PortSnapshot,
    PortState, PowerDataObject, PowerRole, ReadyState, RequestObject, SystemConfig,
};
use pd_runtime::{LoopbackWire, PortParts, PortRuntime};
use tracing_subscriber::EnvFilter;

const SOURCE: PortId = PortId(0);
const SINK: PortId = PortId(1);

/// Reset to inject once the first contract is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Inject {
    None,
    Soft,
    Hard,
}

/// USB PD loopback demo.
#[derive(Parser, Debug, Clone)]
#[command(name = "pd-loopback")]
#[command(about = "Run a source and a sink port back to back")]
#[command(version)]
struct Cli {
    /// Consecutive failures tolerated before a soft reset.
    #[arg(long, default_value_t = 3)]
    max_retries: u8,

    /// Voltage of the extra fixed PDO the source offers, in mV.
    #[arg(long, default_value_t = 9000)]
    voltage_mv: u32,

    /// Maximum current of the extra PDO, in mA.
    #[arg(long, default_value_t = 3000)]
    current_ma: u32,

    /// Reset to inject after the first contract.
    #[arg(long, value_enum, default_value_t = Inject::None)]
    inject: Inject,

    /// Leave the sink unconnected and never confirm its hard resets.
    #[arg(long)]
    disconnect: bool,

    /// Seconds to wait for each milestone.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Policy that offers a fixed PDO set, picks the highest voltage and logs
/// every outcome.
#[derive(Clone)]
struct LoggingPolicy {
    offered: Capabilities,
    contracts: Arc<AtomicUsize>,
}

impl DevicePolicy for LoggingPolicy {
    fn source_capabilities(&mut self, _port: PortId) -> Capabilities {
        self.offered.clone()
    }

    fn select_capability(&mut self, port: PortId, offered: &Capabilities) -> RequestObject {
        let (position, pdo) = offered
            .0
            .iter()
            .enumerate()
            .max_by_key(|(_, pdo)| pdo.voltage_mv())
            .map(|(index, pdo)| (index + 1, *pdo))
            .unwrap_or((1, PowerDataObject::fixed(5000, 0)));
        tracing::info!("{}: requesting {} mV", port, pdo.voltage_mv());
        let position = u8::try_from(position).unwrap_or(1);
        RequestObject::fixed(position, pdo.max_current_ma(), pdo.max_current_ma())
    }

    fn capabilities_ready(&mut self, port: PortId, contract: &Contract) {
        self.contracts.fetch_add(1, Ordering::SeqCst);
        match contract.selected() {
            Some(pdo) => tracing::info!(
                "{}: contract at {} mV / {} mA",
                port,
                pdo.voltage_mv(),
                contract.request.operating_current_ma()
            ),
            None => tracing::warn!("{}: contract names no offered PDO", port),
        }
    }

    fn port_reset(&mut self, port: PortId) {
        tracing::info!("{}: port reset", port);
    }

    fn port_unusable(&mut self, port: PortId) {
        tracing::error!("{}: port unusable", port);
    }
}

fn ready(snapshot: &PortSnapshot) -> bool {
    snapshot.state == PortState::Ready(ReadyState::Idle) && snapshot.contract.is_some()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::info!("pd-loopback v{}", env!("CARGO_PKG_VERSION"));

    let port_config = |role| PortConfig {
        max_retries: cli.max_retries,
        ..PortConfig::with_role(role)
    };
    let config = SystemConfig::new(vec![
        port_config(PowerRole::Source),
        port_config(PowerRole::Sink),
    ]);

    let policy = LoggingPolicy {
        offered: Capabilities::new(vec![
            PowerDataObject::fixed(5000, 3000),
            PowerDataObject::fixed(cli.voltage_mv, cli.current_ma),
        ]),
        contracts: Arc::new(AtomicUsize::new(0)),
    };
    let contracts = policy.contracts.clone();

    let runtime = PortRuntime::start(config, |_port, ingress| {
        let wire = if cli.disconnect {
            let wire = LoopbackWire::new(ingress.clone());
            wire.stall_hard_reset(SINK);
            wire
        } else {
            LoopbackWire::pair(ingress.clone(), SOURCE, SINK)
        };
        PortParts::new(wire, policy.clone())
    })?;
    let limit = Duration::from_secs(cli.timeout_secs);

    if cli.disconnect {
        let snapshot = tokio::time::timeout(
            limit,
            runtime.wait_for(SINK, |s| s.state == PortState::Unusable),
        )
        .await
        .context("sink never gave up")??;
        tracing::info!(
            "{}: unusable after {} unconfirmed hard resets",
            SINK,
            snapshot.hard_reset_attempts
        );
        runtime.shutdown().await?;
        return Ok(());
    }

    tokio::time::timeout(limit, runtime.wait_for(SINK, ready))
        .await
        .context("no contract")??;

    let request = match cli.inject {
        Inject::None => None,
        Inject::Soft => Some(PolicyRequest::SoftReset),
        Inject::Hard => Some(PolicyRequest::HardReset),
    };
    if let Some(request) = request {
        // Each port reports its own contract.
        let seen = contracts.load(Ordering::SeqCst);
        tracing::info!("{}: injecting {:?}", SINK, request);
        runtime.request(SINK, request)?;

        tokio::time::timeout(limit, async {
            while contracts.load(Ordering::SeqCst) < seen + 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .context("no contract after reset")?;
    }

    let sink = runtime.snapshot(SINK)?;
    if !ready(&sink) {
        bail!("{}: ended in {:?}", SINK, sink.state);
    }
    runtime.shutdown().await?;
    Ok(())
}
