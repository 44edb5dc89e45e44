//! Protocol scenarios driven through the synchronous machine.
//!
//! Each scenario sets up a port with recording mocks, latches events the way
//! the transport would, and checks the observable port state after each pass.

use std::time::{Duration, Instant};

use pd_core::mock::{LinkRecord, MockLink, MockPolicy, PolicySignal};
use pd_core::{
    AmsOwner, Capabilities, CapabilityState, ControlMessage, DataMessage, Error, Fault,
    HardResetPhase, Message, MessageId, MessageKind, PendingReset, PolicyRequest, PortConfig,
    PortEvent, PortId, PortMachine, PortRegistry, PortState, PowerDataObject, PowerRole,
    ReadyState, ResetEpisode, ResetKind, SoftResetPhase, StartupState, SystemConfig,
    TransmitFailure, TransmitType,
};

struct Port {
    machine: PortMachine,
    link: MockLink,
    policy: MockPolicy,
    now: Instant,
    next_rx_id: u8,
}

impl Port {
    fn new(role: PowerRole) -> Self {
        let mut port = Self {
            machine: PortMachine::new(PortId(0), PortConfig::with_role(role)),
            link: MockLink::new(),
            policy: MockPolicy::default(),
            now: Instant::now(),
            next_rx_id: 0,
        };
        port.settle();
        port
    }

    /// Sink with a negotiated contract, idle.
    fn ready_sink() -> Self {
        let mut port = Self::new(PowerRole::Sink);
        port.receive(MessageKind::Data(DataMessage::SourceCapabilities(offer())));
        port.deliver(PortEvent::MessageSent);
        port.receive(MessageKind::Control(ControlMessage::Accept));
        port.receive(MessageKind::Control(ControlMessage::PsRdy));
        assert_eq!(port.state(), PortState::Ready(ReadyState::Idle));
        port.link.take();
        port.policy.take_signals();
        port
    }

    /// Sink whose Request is in flight and acknowledged.
    fn selecting_sink() -> Self {
        let mut port = Self::new(PowerRole::Sink);
        port.receive(MessageKind::Data(DataMessage::SourceCapabilities(offer())));
        port.deliver(PortEvent::MessageSent);
        assert_eq!(
            port.state(),
            PortState::CapabilityExchange(CapabilityState::SelectCapability)
        );
        port
    }

    fn pass(&mut self) -> bool {
        self.machine
            .evaluate(self.now, &mut self.link, &mut self.policy)
    }

    fn settle(&mut self) {
        for _ in 0..64 {
            if !self.machine.has_pending_work(self.now) {
                return;
            }
            self.pass();
        }
        panic!("port did not settle");
    }

    fn latch(&mut self, event: PortEvent) {
        assert!(self.machine.latch(event));
    }

    fn deliver(&mut self, event: PortEvent) {
        self.latch(event);
        self.settle();
    }

    fn received(&mut self, kind: MessageKind) -> PortEvent {
        let id = self.next_rx_id;
        self.next_rx_id = (self.next_rx_id + 1) % 8;
        PortEvent::MessageReceived {
            message: Message::new(kind, MessageId::new(id)),
            transmit_type: TransmitType::Sop,
        }
    }

    fn receive(&mut self, kind: MessageKind) {
        let event = self.received(kind);
        self.deliver(event);
    }

    fn advance(&mut self, ms: u64) {
        self.now += Duration::from_millis(ms);
        self.settle();
    }

    fn state(&self) -> PortState {
        self.machine.current_state()
    }
}

fn offer() -> Capabilities {
    Capabilities::new(vec![
        PowerDataObject::fixed(5000, 3000),
        PowerDataObject::fixed(9000, 3000),
    ])
}

fn no_response() -> PortEvent {
    PortEvent::ProtocolError {
        kind: TransmitFailure::NoResponse,
        transmit_type: TransmitType::Sop,
    }
}

#[cfg(test)]
mod recovery_scenarios {
    use super::*;

    /// Unexpected message while idle: Soft Reset without retrying.
    #[test]
    fn test_unexpected_message_in_ready_requests_soft_reset() {
        let mut port = Port::ready_sink();
        port.latch(PortEvent::ProtocolError {
            kind: TransmitFailure::UnexpectedMessage,
            transmit_type: TransmitType::Sop,
        });
        port.pass();

        assert_eq!(port.machine.pending_reset(), PendingReset::SoftRequested);
        assert_eq!(
            port.state(),
            PortState::Reset(ResetEpisode::Soft(SoftResetPhase::Requested))
        );
        assert_eq!(port.machine.retry_count(), 0);
        assert_eq!(
            port.machine.last_error().unwrap().fault,
            Fault::Transmit(TransmitFailure::UnexpectedMessage)
        );
    }

    /// Retry limit reached during capability exchange.
    #[test]
    fn test_retry_limit_escalates_to_soft_reset() {
        let mut port = Port::selecting_sink();
        let request = port.link.last_transmitted().unwrap();

        port.deliver(no_response());
        assert_eq!(port.machine.retry_count(), 1);
        port.deliver(no_response());
        assert_eq!(port.machine.retry_count(), 2);
        assert_eq!(port.machine.pending_reset(), PendingReset::None);

        port.latch(no_response());
        port.pass();
        assert_eq!(port.machine.pending_reset(), PendingReset::SoftRequested);
        assert_eq!(port.machine.retry_count(), 0);

        // Original transmission plus two resends, all with the same id.
        let requests: Vec<Message> = port
            .link
            .transmitted()
            .into_iter()
            .filter(|m| matches!(m.kind, MessageKind::Data(DataMessage::Request(_))))
            .collect();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|m| *m == request));
    }

    /// Failure during an active soft reset escalates to Hard Reset.
    #[test]
    fn test_failure_during_soft_reset_escalates_to_hard_reset() {
        let mut port = Port::ready_sink();
        port.deliver(PortEvent::Request(PolicyRequest::SoftReset));
        port.deliver(PortEvent::MessageSent);
        assert_eq!(
            port.state(),
            PortState::Reset(ResetEpisode::Soft(SoftResetPhase::AwaitAccept))
        );
        assert_eq!(port.machine.pending_reset(), PendingReset::SoftInProgress);

        port.latch(no_response());
        port.pass();
        assert_eq!(port.machine.pending_reset(), PendingReset::HardRequested);
        assert_eq!(
            port.state(),
            PortState::Reset(ResetEpisode::Hard(HardResetPhase::Requested))
        );

        // No second Soft_Reset goes out for the same episode.
        port.settle();
        let soft_resets = port
            .link
            .transmitted()
            .iter()
            .filter(|m| m.kind.is_control(ControlMessage::SoftReset))
            .count();
        assert_eq!(soft_resets, 1);
        assert_eq!(port.link.hard_resets(), 1);
    }

    /// Local sequence requested while the partner owns the AMS.
    #[test]
    fn test_local_sequence_during_remote_ams_is_a_violation() {
        let mut port = Port::new(PowerRole::Sink);
        let caps = port.received(MessageKind::Data(DataMessage::SourceCapabilities(offer())));
        port.latch(caps);
        port.pass();
        assert_eq!(port.machine.context().ams_owner(), AmsOwner::Remote);

        let err = port.machine.acquire_local().unwrap_err();
        assert_eq!(err, Error::AmsBusy(AmsOwner::Remote));
        assert_eq!(port.machine.pending_reset(), PendingReset::SoftRequested);
        assert_eq!(
            port.machine.last_error().unwrap().fault,
            Fault::SequenceViolation
        );
        // Still owned by the partner; never overridden.
        assert_eq!(port.machine.context().ams_owner(), AmsOwner::Remote);
    }

    #[test]
    fn test_policy_request_during_remote_ams_is_a_violation() {
        let mut port = Port::new(PowerRole::Sink);
        let caps = port.received(MessageKind::Data(DataMessage::SourceCapabilities(offer())));
        port.latch(caps);
        port.pass();

        port.latch(PortEvent::Request(PolicyRequest::Ping));
        port.pass();
        assert_eq!(port.machine.pending_reset(), PendingReset::SoftRequested);
    }

    #[test]
    fn test_soft_reset_targets_failing_transmit_type() {
        let mut port = Port::ready_sink();
        port.deliver(PortEvent::ProtocolError {
            kind: TransmitFailure::UnexpectedMessage,
            transmit_type: TransmitType::SopPrime,
        });
        match port.link.take().last() {
            Some(LinkRecord::Transmit {
                message,
                transmit_type,
                ..
            }) => {
                assert!(message.kind.is_control(ControlMessage::SoftReset));
                assert_eq!(*transmit_type, TransmitType::SopPrime);
            }
            other => panic!("expected Soft_Reset, got {:?}", other),
        }
    }

    #[test]
    fn test_soft_reset_timeout_escalates_to_hard_reset() {
        let mut port = Port::ready_sink();
        port.deliver(PortEvent::Request(PolicyRequest::SoftReset));
        port.deliver(PortEvent::MessageSent);
        port.advance(31);

        assert_eq!(
            port.machine.last_error().unwrap().fault,
            Fault::ResetTimeout(ResetKind::Soft)
        );
        assert_eq!(port.machine.pending_reset(), PendingReset::HardInProgress);
        assert_eq!(port.link.hard_resets(), 1);
    }

    #[test]
    fn test_soft_reset_acked_renegotiates() {
        let mut port = Port::ready_sink();
        port.deliver(PortEvent::Request(PolicyRequest::SoftReset));
        port.deliver(PortEvent::MessageSent);
        port.next_rx_id = 0;
        port.receive(MessageKind::Control(ControlMessage::Accept));

        assert_eq!(port.machine.pending_reset(), PendingReset::None);
        assert_eq!(port.machine.retry_count(), 0);
        assert_eq!(
            port.state(),
            PortState::CapabilityExchange(CapabilityState::AwaitCapabilities)
        );
        // The previous contract stays in place until replaced.
        assert!(port.machine.contract().is_some());
    }
}

#[cfg(test)]
mod hard_reset_scenarios {
    use super::*;

    fn assert_startup_defaults(port: &Port) {
        assert!(matches!(port.state(), PortState::Startup(_)));
        assert_eq!(port.machine.retry_count(), 0);
        assert!(port.machine.is_ams_free());
        assert_eq!(port.machine.pending_reset(), PendingReset::None);
        assert!(port.machine.last_error().is_none());
    }

    /// Hard Reset received from any state lands in startup after one pass.
    #[test]
    fn test_hard_reset_received_from_any_state() {
        let mut setups: Vec<Port> = Vec::new();

        setups.push(Port::new(PowerRole::Sink));
        setups.push(Port::new(PowerRole::Source));
        setups.push(Port::ready_sink());
        setups.push(Port::selecting_sink());

        let mut retrying = Port::selecting_sink();
        retrying.latch(no_response());
        retrying.pass();
        setups.push(retrying);

        let mut soft = Port::ready_sink();
        soft.deliver(PortEvent::SoftResetReceived);
        setups.push(soft);

        let mut hard = Port::ready_sink();
        hard.deliver(PortEvent::Request(PolicyRequest::HardReset));
        setups.push(hard);

        for mut port in setups {
            let before = port.state();
            port.latch(PortEvent::HardResetReceived);
            port.pass();
            assert_eq!(
                port.state(),
                PortState::Startup(StartupState::Init),
                "from {:?}",
                before
            );
            assert_startup_defaults(&port);
            assert!(port
                .policy
                .signals()
                .contains(&PolicySignal::PortReset(PortId(0))));
        }
    }

    /// Hard Reset wins over Soft Reset latched in the same pass.
    #[test]
    fn test_hard_reset_wins_over_soft_reset() {
        let mut port = Port::ready_sink();
        port.latch(PortEvent::SoftResetReceived);
        port.latch(PortEvent::HardResetReceived);
        port.latch(no_response());
        port.pass();

        assert_startup_defaults(&port);
        assert!(port.link.transmitted().is_empty());
    }

    /// A completed Hard Reset drops a policy request latched alongside it.
    #[test]
    fn test_hard_reset_clears_latched_policy_request() {
        let mut port = Port::ready_sink();
        port.latch(PortEvent::Request(PolicyRequest::Ping));
        port.latch(PortEvent::HardResetReceived);
        port.settle();

        assert!(!port
            .machine
            .is_latched(&PortEvent::Request(PolicyRequest::Ping)));
        assert_eq!(
            port.state(),
            PortState::CapabilityExchange(CapabilityState::AwaitCapabilities)
        );
        assert!(port.link.transmitted().is_empty());
    }

    #[test]
    fn test_partner_soft_reset_ignored_during_hard_reset() {
        let mut port = Port::ready_sink();
        port.deliver(PortEvent::Request(PolicyRequest::HardReset));
        assert_eq!(port.machine.pending_reset(), PendingReset::HardInProgress);

        port.deliver(PortEvent::SoftResetReceived);
        assert_eq!(port.machine.pending_reset(), PendingReset::HardInProgress);
        assert!(port.link.transmitted().is_empty());
    }

    #[test]
    fn test_repeated_hard_reset_failure_makes_port_unusable() {
        let mut port = Port::ready_sink();
        port.deliver(PortEvent::Request(PolicyRequest::HardReset));
        port.advance(6);
        port.advance(6);

        assert_eq!(port.state(), PortState::Unusable);
        assert_eq!(port.link.hard_resets(), 2);
        assert!(port
            .policy
            .signals()
            .contains(&PolicySignal::PortUnusable(PortId(0))));

        // Nothing but a hard reset leaves the unusable state.
        port.deliver(PortEvent::SoftResetReceived);
        port.deliver(no_response());
        assert_eq!(port.state(), PortState::Unusable);

        port.deliver(PortEvent::Request(PolicyRequest::HardReset));
        assert_eq!(port.link.hard_resets(), 3);
        port.deliver(PortEvent::HardResetSent);
        assert_eq!(
            port.state(),
            PortState::CapabilityExchange(CapabilityState::AwaitCapabilities)
        );
    }
}

#[cfg(test)]
mod ingestion_scenarios {
    use super::*;

    /// Delivering the same event twice before evaluation equals delivering it once.
    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut once = Port::selecting_sink();
        let mut twice = Port::selecting_sink();

        assert!(once.machine.latch(no_response()));
        assert!(twice.machine.latch(no_response()));
        assert!(!twice.machine.latch(no_response()));

        once.settle();
        twice.settle();
        assert_eq!(once.machine.snapshot(), twice.machine.snapshot());
        assert_eq!(once.link.transmitted(), twice.link.transmitted());
    }

    #[test]
    fn test_retransmitted_message_is_dropped() {
        let mut port = Port::ready_sink();
        let ping = PortEvent::MessageReceived {
            message: Message::control(ControlMessage::GetSinkCap, MessageId::new(5)),
            transmit_type: TransmitType::Sop,
        };
        port.deliver(ping.clone());
        port.deliver(PortEvent::MessageSent);
        assert_eq!(port.link.transmitted().len(), 1);

        port.deliver(ping);
        assert_eq!(port.link.transmitted().len(), 1);
        assert_eq!(port.state(), PortState::Ready(ReadyState::Idle));
    }

    #[test]
    fn test_cable_messages_do_not_disturb_negotiation() {
        let mut port = Port::selecting_sink();
        port.deliver(PortEvent::MessageReceived {
            message: Message::control(ControlMessage::Accept, MessageId::new(3)),
            transmit_type: TransmitType::SopPrime,
        });
        assert_eq!(
            port.state(),
            PortState::CapabilityExchange(CapabilityState::SelectCapability)
        );
    }

    #[test]
    fn test_sink_renegotiates_from_last_offer() {
        let mut port = Port::ready_sink();
        port.deliver(PortEvent::Request(PolicyRequest::Renegotiate));
        assert!(port.machine.is_in_local_ams());
        assert!(matches!(
            port.link.last_transmitted().unwrap().kind,
            MessageKind::Data(DataMessage::Request(_))
        ));
        port.deliver(PortEvent::MessageSent);
        port.receive(MessageKind::Control(ControlMessage::Accept));
        port.receive(MessageKind::Control(ControlMessage::PsRdy));
        assert_eq!(port.state(), PortState::Ready(ReadyState::Idle));
        assert!(port.machine.is_ams_free());
    }

    #[test]
    fn test_sink_get_source_caps_leads_to_new_contract() {
        let mut port = Port::ready_sink();
        port.policy = MockPolicy::default().with_max_voltage(5000);
        port.deliver(PortEvent::Request(PolicyRequest::GetSourceCapabilities));
        assert_eq!(port.state(), PortState::Ready(ReadyState::LocalAms));
        port.deliver(PortEvent::MessageSent);
        port.receive(MessageKind::Data(DataMessage::SourceCapabilities(offer())));
        port.deliver(PortEvent::MessageSent);
        port.receive(MessageKind::Control(ControlMessage::Accept));
        port.receive(MessageKind::Control(ControlMessage::PsRdy));

        let contract = port.machine.contract().unwrap();
        assert_eq!(contract.selected().unwrap().voltage_mv(), 5000);
    }

    #[test]
    fn test_sink_keeps_contract_after_reject() {
        let mut port = Port::ready_sink();
        port.deliver(PortEvent::Request(PolicyRequest::Renegotiate));
        port.deliver(PortEvent::MessageSent);
        port.receive(MessageKind::Control(ControlMessage::Reject));
        assert_eq!(port.state(), PortState::Ready(ReadyState::Idle));
        assert!(port.machine.contract().is_some());
        assert!(port.machine.is_ams_free());
    }
}

#[cfg(test)]
mod back_to_back {
    use super::*;

    const SOURCE: PortId = PortId(0);
    const SINK: PortId = PortId(1);

    struct Pair {
        registry: PortRegistry,
        link: MockLink,
        policies: [MockPolicy; 2],
        now: Instant,
    }

    impl Pair {
        fn new() -> Self {
            let config = SystemConfig::new(vec![
                PortConfig::with_role(PowerRole::Source),
                PortConfig::with_role(PowerRole::Sink),
            ]);
            Self {
                registry: PortRegistry::new(config).unwrap(),
                link: MockLink::new(),
                policies: [MockPolicy::default(), MockPolicy::default()],
                now: Instant::now(),
            }
        }

        fn settle_all(&mut self) {
            for index in 0..2 {
                self.registry
                    .settle(
                        PortId(index),
                        self.now,
                        &mut self.link,
                        &mut self.policies[index],
                    )
                    .unwrap();
            }
        }

        /// Deliver every transmission to the peer until the wire is quiet.
        fn pump(&mut self) {
            for _ in 0..64 {
                self.settle_all();
                let records = self.link.take();
                if records.is_empty() {
                    return;
                }
                for record in records {
                    match record {
                        LinkRecord::Transmit {
                            port,
                            message,
                            transmit_type,
                        } => {
                            let peer = PortId(1 - port.index());
                            self.registry.message_sent(port).unwrap();
                            if message.kind.is_control(ControlMessage::SoftReset) {
                                self.registry.soft_reset_received(peer).unwrap();
                            } else {
                                self.registry
                                    .message_received(peer, message, transmit_type)
                                    .unwrap();
                            }
                        }
                        LinkRecord::HardReset { port } => {
                            let peer = PortId(1 - port.index());
                            self.registry.hard_reset_sent(port).unwrap();
                            self.registry.hard_reset_received(peer).unwrap();
                        }
                    }
                    self.settle_all();
                }
            }
            panic!("wire did not go quiet");
        }

        fn state(&self, port: PortId) -> PortState {
            self.registry.machine(port).unwrap().current_state()
        }

        fn assert_contract(&self) {
            for port in [SOURCE, SINK] {
                assert_eq!(self.state(port), PortState::Ready(ReadyState::Idle));
                assert!(!self.registry.is_in_local_ams(port).unwrap());
            }
            let source = self.registry.machine(SOURCE).unwrap().contract().cloned();
            let sink = self.registry.machine(SINK).unwrap().contract().cloned();
            assert!(source.is_some());
            assert_eq!(source, sink);
        }
    }

    #[test]
    fn test_source_and_sink_negotiate() {
        let mut pair = Pair::new();
        pair.pump();
        pair.assert_contract();

        let contract = pair.registry.machine(SINK).unwrap().contract().unwrap();
        assert_eq!(contract.selected().unwrap().voltage_mv(), 15_000);
        for policy in &pair.policies {
            assert!(matches!(
                policy.signals().as_slice(),
                [PolicySignal::CapabilitiesReady(_, _)]
            ));
        }
    }

    #[test]
    fn test_soft_reset_renegotiates_both_sides() {
        let mut pair = Pair::new();
        pair.pump();
        pair.registry
            .request(SINK, PolicyRequest::SoftReset)
            .unwrap();
        pair.pump();
        pair.assert_contract();
        for port in [SOURCE, SINK] {
            assert_eq!(
                pair.registry.snapshot(port).unwrap().pending_reset,
                PendingReset::None
            );
        }
    }

    #[test]
    fn test_hard_reset_renegotiates_both_sides() {
        let mut pair = Pair::new();
        pair.pump();
        pair.registry
            .request(SOURCE, PolicyRequest::HardReset)
            .unwrap();
        pair.pump();
        pair.assert_contract();
        for (index, policy) in pair.policies.iter().enumerate() {
            assert!(policy
                .signals()
                .contains(&PolicySignal::PortReset(PortId(index))));
        }
    }

    #[test]
    fn test_sink_pings_source() {
        let mut pair = Pair::new();
        pair.pump();
        pair.registry.request(SINK, PolicyRequest::Ping).unwrap();
        pair.pump();
        pair.assert_contract();
    }

    #[test]
    fn test_unusable_port_rejects_policy_requests() {
        let mut pair = Pair::new();
        pair.pump();
        pair.registry
            .request(SINK, PolicyRequest::HardReset)
            .unwrap();
        // Sink signals Hard Reset but the wire never confirms it.
        pair.settle_all();
        pair.link.take();
        for _ in 0..2 {
            pair.now += Duration::from_millis(6);
            pair.settle_all();
        }
        assert_eq!(pair.state(SINK), PortState::Unusable);
        assert_eq!(
            pair.registry.request(SINK, PolicyRequest::Ping),
            Err(Error::PortUnusable(SINK))
        );
        assert!(pair
            .registry
            .request(SINK, PolicyRequest::HardReset)
            .is_ok());
    }
}
