//! Seams to the layers around the port machine.
//!
//! The transport layer sits below (`ProtocolLink`) and reports back through
//! the inbound events of [`crate::event::PortEvent`]. Device policy sits above
//! (`DevicePolicy`) and decides what to negotiate, never how.

use crate::message::{Capabilities, Contract, Message, RequestObject, TransmitType};
use crate::port::PortId;

/// Outbound side of the transport layer.
///
/// Both calls are fire-and-forget. Completion is observed asynchronously via
/// `MessageSent` / `HardResetSent` or `ProtocolError`.
pub trait ProtocolLink {
    /// Ask the transport to send `message` on `transmit_type`.
    fn request_transmit(&mut self, port: PortId, message: &Message, transmit_type: TransmitType);

    /// Ask the transport to signal Hard Reset.
    fn request_hard_reset(&mut self, port: PortId);
}

/// Device-policy layer.
///
/// Receives only coarse outcomes: a contract is ready, the port was reset,
/// or the port is unusable.
pub trait DevicePolicy {
    /// Source: capabilities to offer.
    fn source_capabilities(&mut self, port: PortId) -> Capabilities;

    /// Sink: choose a request from the offered capabilities.
    fn select_capability(&mut self, port: PortId, offered: &Capabilities) -> RequestObject;

    /// Source: accept or reject a sink request.
    ///
    /// The default accepts any request that names an offered PDO and stays
    /// within its current limit.
    fn evaluate_request(
        &mut self,
        _port: PortId,
        request: RequestObject,
        offered: &Capabilities,
    ) -> bool {
        match offered.at_position(request.object_position()) {
            Some(pdo) => request.operating_current_ma() <= pdo.max_current_ma(),
            None => false,
        }
    }

    /// Capability exchange completed.
    fn capabilities_ready(&mut self, port: PortId, contract: &Contract);

    /// The port was reset and renegotiates from startup.
    fn port_reset(&mut self, port: PortId);

    /// Hard reset could not complete; the port is out of service.
    fn port_unusable(&mut self, port: PortId);
}

impl<T: ProtocolLink + ?Sized> ProtocolLink for Box<T> {
    fn request_transmit(&mut self, port: PortId, message: &Message, transmit_type: TransmitType) {
        (**self).request_transmit(port, message, transmit_type)
    }

    fn request_hard_reset(&mut self, port: PortId) {
        (**self).request_hard_reset(port)
    }
}

impl<T: DevicePolicy + ?Sized> DevicePolicy for Box<T> {
    fn source_capabilities(&mut self, port: PortId) -> Capabilities {
        (**self).source_capabilities(port)
    }

    fn select_capability(&mut self, port: PortId, offered: &Capabilities) -> RequestObject {
        (**self).select_capability(port, offered)
    }

    fn evaluate_request(
        &mut self,
        port: PortId,
        request: RequestObject,
        offered: &Capabilities,
    ) -> bool {
        (**self).evaluate_request(port, request, offered)
    }

    fn capabilities_ready(&mut self, port: PortId, contract: &Contract) {
        (**self).capabilities_ready(port, contract)
    }

    fn port_reset(&mut self, port: PortId) {
        (**self).port_reset(port)
    }

    fn port_unusable(&mut self, port: PortId) {
        (**self).port_unusable(port)
    }
}
