//! Runtime tests over the loopback wire, on tokio's paused clock.

use std::future::Future;
use std::time::Duration;

use pd_core::mock::{LinkRecord, MockLink, MockPolicy, PolicySignal};
use pd_core::{
    AmsOwner, DataMessage, Message, MessageKind, PendingReset, PolicyRequest, PortConfig,
    PortId, PortSnapshot, PortState, PowerRole, ProtocolLink, ReadyState, SystemConfig,
    TransmitType,
};
use pd_runtime::{Error, LoopbackWire, PortParts, PortRuntime, RuntimeConfig};

const SOURCE: PortId = PortId(0);
const SINK: PortId = PortId(1);

struct Bench {
    runtime: PortRuntime,
    wires: Vec<LoopbackWire>,
    policies: Vec<MockPolicy>,
}

fn system() -> SystemConfig {
    SystemConfig::new(vec![
        PortConfig::with_role(PowerRole::Source),
        PortConfig::with_role(PowerRole::Sink),
    ])
}

fn start(config: SystemConfig, connected: bool) -> Bench {
    let mut wires = Vec::new();
    let mut policies = Vec::new();
    let runtime = PortRuntime::start(config, |_port, ingress| {
        let wire = if connected {
            LoopbackWire::pair(ingress.clone(), SOURCE, SINK)
        } else {
            LoopbackWire::new(ingress.clone())
        };
        let policy = MockPolicy::default();
        wires.push(wire.clone());
        policies.push(policy.clone());
        PortParts::new(wire, policy)
    })
    .unwrap();
    Bench {
        runtime,
        wires,
        policies,
    }
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

fn ready_with_contract(snapshot: &PortSnapshot) -> bool {
    snapshot.state == PortState::Ready(ReadyState::Idle) && snapshot.contract.is_some()
}

fn count_ready(policy: &MockPolicy) -> usize {
    policy
        .signals()
        .iter()
        .filter(|s| matches!(s, PolicySignal::CapabilitiesReady(_, _)))
        .count()
}

async fn until(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
}

impl Bench {
    async fn negotiated(&self) -> (PortSnapshot, PortSnapshot) {
        let source = within(self.runtime.wait_for(SOURCE, ready_with_contract))
            .await
            .unwrap();
        let sink = within(self.runtime.wait_for(SINK, ready_with_contract))
            .await
            .unwrap();
        (source, sink)
    }
}

#[tokio::test(start_paused = true)]
async fn test_source_and_sink_negotiate() {
    let bench = start(system(), true);
    let (source, sink) = bench.negotiated().await;

    assert_eq!(source.contract, sink.contract);
    assert_eq!(sink.ams_owner, AmsOwner::None);
    assert!(!bench.runtime.is_in_local_ams(SOURCE).unwrap());
    assert_eq!(count_ready(&bench.policies[0]), 1);
    assert_eq!(count_ready(&bench.policies[1]), 1);

    bench.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_port_is_rejected() {
    let bench = start(system(), true);
    assert!(matches!(
        bench.runtime.snapshot(PortId(2)),
        Err(Error::Core(pd_core::Error::InvalidPort { .. }))
    ));
    assert!(bench.runtime.ingress().message_sent(PortId(9)).is_err());
    bench.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lost_request_is_retried() {
    let bench = start(system(), true);
    bench.wires[SINK.index()].drop_next(SINK, 2);

    let (_, sink) = bench.negotiated().await;
    assert_eq!(sink.retry_count, 0);
    assert!(sink.last_error.is_none());
    assert_eq!(count_ready(&bench.policies[1]), 1);

    bench.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repeated_loss_recovers_through_soft_reset() {
    let bench = start(system(), true);
    bench.wires[SINK.index()].drop_next(SINK, 3);

    let (source, sink) = bench.negotiated().await;
    assert_eq!(source.contract, sink.contract);
    assert_eq!(sink.pending_reset, PendingReset::None);

    bench.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_soft_reset_request_renegotiates() {
    let bench = start(system(), true);
    bench.negotiated().await;

    bench
        .runtime
        .request(SINK, PolicyRequest::SoftReset)
        .unwrap();
    let sink_policy = bench.policies[1].clone();
    until(|| count_ready(&sink_policy) == 2).await;

    let (_, sink) = bench.negotiated().await;
    assert_eq!(sink.pending_reset, PendingReset::None);
    bench.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hard_reset_request_resets_both_ports() {
    let bench = start(system(), true);
    bench.negotiated().await;

    bench
        .runtime
        .request(SOURCE, PolicyRequest::HardReset)
        .unwrap();
    let policies = bench.policies.clone();
    until(|| {
        policies
            .iter()
            .enumerate()
            .all(|(i, p)| p.signals().contains(&PolicySignal::PortReset(PortId(i))))
    })
    .await;
    until(|| policies.iter().all(|p| count_ready(p) == 2)).await;

    let (source, sink) = bench.negotiated().await;
    assert_eq!(source.contract, sink.contract);
    bench.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unconnected_sink_keeps_resetting() {
    let config = SystemConfig::uniform(1, PortConfig::with_role(PowerRole::Sink));
    let bench = start(config, false);
    let policy = bench.policies[0].clone();

    until(|| {
        policy
            .signals()
            .iter()
            .filter(|s| matches!(s, PolicySignal::PortReset(_)))
            .count()
            >= 4
    })
    .await;

    let snapshot = bench.runtime.snapshot(PortId(0)).unwrap();
    assert_ne!(snapshot.state, PortState::Unusable);
    assert_eq!(snapshot.hard_reset_attempts, 0);
    bench.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_hard_reset_makes_sink_unusable() {
    let config = SystemConfig::uniform(1, PortConfig::with_role(PowerRole::Sink));
    let bench = start(config, false);
    let port = PortId(0);
    bench.wires[0].stall_hard_reset(port);

    let snapshot = within(
        bench
            .runtime
            .wait_for(port, |s| s.state == PortState::Unusable),
    )
    .await
    .unwrap();
    assert_eq!(snapshot.hard_reset_attempts, 2);
    assert!(bench.policies[0]
        .signals()
        .contains(&PolicySignal::PortUnusable(port)));

    assert!(matches!(
        bench.runtime.request(port, PolicyRequest::Ping),
        Err(Error::Core(pd_core::Error::PortUnusable(_)))
    ));
    bench.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_zero_queue_depth_is_rejected() {
    let result = PortRuntime::start_with(
        system(),
        RuntimeConfig { queue_depth: 0 },
        |_port, ingress| PortParts::new(LoopbackWire::new(ingress.clone()), MockPolicy::default()),
    );
    assert!(matches!(
        result,
        Err(Error::Core(pd_core::Error::InvalidConfig(_)))
    ));
}

/// Loopback wire that also records every call on a shared tap.
#[derive(Clone)]
struct TappedWire {
    wire: LoopbackWire,
    tap: MockLink,
}

impl ProtocolLink for TappedWire {
    fn request_transmit(&mut self, port: PortId, message: &Message, transmit_type: TransmitType) {
        self.tap.request_transmit(port, message, transmit_type);
        self.wire.request_transmit(port, message, transmit_type);
    }

    fn request_hard_reset(&mut self, port: PortId) {
        self.tap.request_hard_reset(port);
        self.wire.request_hard_reset(port);
    }
}

#[tokio::test(start_paused = true)]
async fn test_capabilities_right_after_hard_reset_are_kept() {
    let tap = MockLink::new();
    let mut policies = Vec::new();
    let config = SystemConfig::new(vec![
        PortConfig {
            max_retries: 1,
            ..PortConfig::with_role(PowerRole::Source)
        },
        PortConfig {
            max_retries: 1,
            ..PortConfig::with_role(PowerRole::Sink)
        },
    ]);
    let runtime = PortRuntime::start(config, |_port, ingress| {
        let policy = MockPolicy::default();
        policies.push(policy.clone());
        let wire = TappedWire {
            wire: LoopbackWire::pair(ingress.clone(), SOURCE, SINK),
            tap: tap.clone(),
        };
        PortParts::new(wire, policy)
    })
    .unwrap();
    within(runtime.wait_for(SINK, ready_with_contract))
        .await
        .unwrap();
    tap.take();

    runtime.request(SOURCE, PolicyRequest::HardReset).unwrap();
    until(|| policies.iter().all(|p| count_ready(p) == 2)).await;

    let records = tap.take();
    assert_eq!(records[0], LinkRecord::HardReset { port: SOURCE });
    let offers = records
        .iter()
        .filter(|r| {
            matches!(
                r,
                LinkRecord::Transmit {
                    port: SOURCE,
                    message: Message {
                        kind: MessageKind::Data(DataMessage::SourceCapabilities(_)),
                        ..
                    },
                    ..
                }
            )
        })
        .count();
    assert_eq!(offers, 1);
    assert_eq!(
        runtime.snapshot(SINK).unwrap().pending_reset,
        PendingReset::None
    );
    runtime.shutdown().await.unwrap();
}
