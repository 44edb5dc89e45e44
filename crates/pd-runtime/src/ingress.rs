//! Inbound event handle shared with the transport layer.

use std::sync::Arc;

use pd_core::{Message, PolicyRequest, PortEvent, PortId, TransmitFailure, TransmitType};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{Error, Result};

/// Cloneable handle that queues events for port tasks.
///
/// Every call only enqueues; the port task latches and evaluates later.
/// Calls never block, so they are safe from inside a [`pd_core::ProtocolLink`].
#[derive(Debug, Clone)]
pub struct Ingress {
    senders: Arc<Vec<mpsc::Sender<PortEvent>>>,
}

impl Ingress {
    pub(crate) fn new(senders: Vec<mpsc::Sender<PortEvent>>) -> Self {
        Self {
            senders: Arc::new(senders),
        }
    }

    /// Number of ports served.
    pub fn port_count(&self) -> usize {
        self.senders.len()
    }

    fn sender(&self, port: PortId) -> Result<&mpsc::Sender<PortEvent>> {
        self.senders.get(port.index()).ok_or(Error::Core(pd_core::Error::InvalidPort {
            port,
            port_count: self.senders.len(),
        }))
    }

    /// Queue `event` for `port`.
    pub fn notify(&self, port: PortId, event: PortEvent) -> Result<()> {
        self.sender(port)?.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull(port),
            TrySendError::Closed(_) => Error::ChannelClosed(port),
        })
    }

    /// Queue `event` for `port`, waiting for queue capacity.
    pub async fn send(&self, port: PortId, event: PortEvent) -> Result<()> {
        self.sender(port)?
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed(port))
    }

    /// The last outbound message was acknowledged.
    pub fn message_sent(&self, port: PortId) -> Result<()> {
        self.notify(port, PortEvent::MessageSent)
    }

    /// A message arrived from the partner.
    pub fn message_received(
        &self,
        port: PortId,
        message: Message,
        transmit_type: TransmitType,
    ) -> Result<()> {
        self.notify(
            port,
            PortEvent::MessageReceived {
                message,
                transmit_type,
            },
        )
    }

    /// Hard Reset signalling finished.
    pub fn hard_reset_sent(&self, port: PortId) -> Result<()> {
        self.notify(port, PortEvent::HardResetSent)
    }

    /// Partner signalled Hard Reset.
    pub fn hard_reset_received(&self, port: PortId) -> Result<()> {
        self.notify(port, PortEvent::HardResetReceived)
    }

    /// Partner sent Soft_Reset.
    pub fn soft_reset_received(&self, port: PortId) -> Result<()> {
        self.notify(port, PortEvent::SoftResetReceived)
    }

    /// Transport reported a failure.
    pub fn protocol_error(
        &self,
        port: PortId,
        kind: TransmitFailure,
        transmit_type: TransmitType,
    ) -> Result<()> {
        self.notify(
            port,
            PortEvent::ProtocolError {
                kind,
                transmit_type,
            },
        )
    }

    /// Device-policy request.
    pub fn request(&self, port: PortId, request: PolicyRequest) -> Result<()> {
        self.notify(port, PortEvent::Request(request))
    }
}
