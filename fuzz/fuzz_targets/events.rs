#![no_main]

use std::time::{Duration, Instant};

use libfuzzer_sys::fuzz_target;
use pd_core::mock::{MockLink, MockPolicy};
use pd_core::{
    Capabilities, ControlMessage, DataMessage, Message, MessageId, PolicyRequest, PortConfig,
    PortEvent, PortId, PortRegistry, PortState, PowerDataObject, PowerRole, RequestObject,
    SystemConfig, TransmitFailure, TransmitType,
};

fn transmit_type(byte: u8) -> TransmitType {
    TransmitType::ALL[usize::from(byte) % TransmitType::ALL.len()]
}

fn message(kind: u8, id: u8) -> Message {
    let id = MessageId::new(id);
    match kind % 10 {
        0 => Message::control(ControlMessage::Accept, id),
        1 => Message::control(ControlMessage::Reject, id),
        2 => Message::control(ControlMessage::PsRdy, id),
        3 => Message::control(ControlMessage::Wait, id),
        4 => Message::control(ControlMessage::Ping, id),
        5 => Message::control(ControlMessage::GetSourceCap, id),
        6 => Message::control(ControlMessage::NotSupported, id),
        7 => Message::data(
            DataMessage::SourceCapabilities(Capabilities::new(vec![
                PowerDataObject::fixed(5000, 3000),
                PowerDataObject::fixed(9000, 2000),
            ])),
            id,
        ),
        8 => Message::data(
            DataMessage::Request(RequestObject::fixed(1 + id.value() % 3, 1000, 2000)),
            id,
        ),
        _ => Message::data(DataMessage::VendorDefined(vec![u32::from(kind)]), id),
    }
}

fn event(op: u8, arg: u8) -> Option<PortEvent> {
    let event = match op % 12 {
        0 => PortEvent::MessageSent,
        1 | 2 => PortEvent::MessageReceived {
            message: message(arg, arg >> 4),
            transmit_type: transmit_type(arg >> 3),
        },
        3 => PortEvent::HardResetSent,
        4 => PortEvent::HardResetReceived,
        5 => PortEvent::SoftResetReceived,
        6 => PortEvent::ProtocolError {
            kind: match arg % 3 {
                0 => TransmitFailure::NoResponse,
                1 => TransmitFailure::UnexpectedMessage,
                _ => TransmitFailure::Malformed,
            },
            transmit_type: transmit_type(arg),
        },
        7 => PortEvent::Request(match arg % 6 {
            0 => PolicyRequest::GetSourceCapabilities,
            1 => PolicyRequest::Renegotiate,
            2 => PolicyRequest::Ping,
            3 => PolicyRequest::SoftReset,
            4 => PolicyRequest::HardReset,
            _ => PolicyRequest::Ping,
        }),
        _ => return None,
    };
    Some(event)
}

fuzz_target!(|data: &[u8]| {
    // Every event sequence must leave the port in a consistent state
    let config = SystemConfig::new(vec![
        PortConfig::with_role(PowerRole::Source),
        PortConfig::with_role(PowerRole::Sink),
    ]);
    let Ok(mut registry) = PortRegistry::new(config) else {
        return;
    };
    let mut link = MockLink::new();
    let mut policy = MockPolicy::default();
    let mut now = Instant::now();

    for chunk in data.chunks_exact(3) {
        let port = PortId(usize::from(chunk[0] & 1));
        match event(chunk[1], chunk[2]) {
            Some(event) => {
                let _ = registry.notify(port, event);
            }
            None => now += Duration::from_millis(u64::from(chunk[2]) * 4),
        }
        let _ = registry.settle(port, now, &mut link, &mut policy);
        link.take();

        let Ok(snapshot) = registry.snapshot(port) else {
            continue;
        };
        if snapshot.state == PortState::Unusable {
            assert!(!snapshot.pending_reset.is_active());
        }
        if let PortState::Reset(_) = snapshot.state {
            assert!(snapshot.pending_reset.is_active());
        }
    }
});
