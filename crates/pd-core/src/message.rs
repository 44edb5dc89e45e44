//! Message model exchanged with the transport layer.
//!
//! Only the parts of a PD message the port machine acts on are modelled:
//! - Message type (control or data) with its 5-bit type code
//! - The 3-bit MessageID used for retransmission detection
//! - Fixed-supply power data objects and request data objects
//!
//! Framing, CRC and the remaining header fields belong to the transport.

use core::fmt;

/// Number of distinct MessageID values (3-bit field).
pub const MESSAGE_ID_COUNT: u8 = 8;

/// Number of SOP* transmit types tracked per port.
pub const TRANSMIT_TYPE_COUNT: usize = 5;

/// Highest PDO position a request object can address.
pub const MAX_OBJECT_POSITION: u8 = 7;

/// SOP* packet class a message is sent or received on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransmitType {
    /// Port partner.
    #[default]
    Sop,
    /// Cable plug nearest the source.
    SopPrime,
    /// Cable plug farthest from the source.
    SopPrimePrime,
    /// Debug accessory, SOP' position.
    SopDebugPrime,
    /// Debug accessory, SOP'' position.
    SopDebugPrimePrime,
}

impl TransmitType {
    /// All transmit types in index order.
    pub const ALL: [TransmitType; TRANSMIT_TYPE_COUNT] = [
        TransmitType::Sop,
        TransmitType::SopPrime,
        TransmitType::SopPrimePrime,
        TransmitType::SopDebugPrime,
        TransmitType::SopDebugPrimePrime,
    ];

    /// Dense index for per-type tables.
    pub fn index(self) -> usize {
        match self {
            TransmitType::Sop => 0,
            TransmitType::SopPrime => 1,
            TransmitType::SopPrimePrime => 2,
            TransmitType::SopDebugPrime => 3,
            TransmitType::SopDebugPrimePrime => 4,
        }
    }
}

/// 3-bit MessageID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(u8);

impl MessageId {
    /// Create a message id, wrapping into the 3-bit range.
    pub fn new(value: u8) -> Self {
        Self(value % MESSAGE_ID_COUNT)
    }

    /// Raw value (0-7).
    pub fn value(self) -> u8 {
        self.0
    }

    fn next(self) -> Self {
        Self::new(self.0.wrapping_add(1))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates MessageIDs for outbound messages.
///
/// At most one message is awaiting acknowledgment at a time; the counter
/// never hands out that id again until it is acknowledged or the counter is
/// reset.
#[derive(Debug, Clone, Default)]
pub struct MessageIdCounter {
    next: MessageId,
    outstanding: Option<MessageId>,
}

impl MessageIdCounter {
    /// Create a counter starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the id for a new outbound message.
    ///
    /// A previously outstanding id is superseded by the new message.
    pub fn allocate(&mut self) -> MessageId {
        let mut id = self.next;
        if self.outstanding == Some(id) {
            id = id.next();
        }
        self.outstanding = Some(id);
        self.next = id.next();
        id
    }

    /// Mark `id` as acknowledged by the partner.
    pub fn acknowledge(&mut self, id: MessageId) {
        if self.outstanding == Some(id) {
            self.outstanding = None;
        }
    }

    /// Id still awaiting acknowledgment, if any.
    pub fn outstanding(&self) -> Option<MessageId> {
        self.outstanding
    }

    /// Return to id 0 with nothing outstanding (soft and hard reset).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Last MessageID seen per transmit type, used to drop retransmissions.
#[derive(Debug, Clone, Default)]
pub struct ReceivedIds {
    last: [Option<MessageId>; TRANSMIT_TYPE_COUNT],
}

impl ReceivedIds {
    /// Record `id` for `transmit_type`.
    ///
    /// Returns `false` when it repeats the previously stored id, which means
    /// the partner retransmitted a message already processed.
    pub fn record(&mut self, transmit_type: TransmitType, id: MessageId) -> bool {
        let slot = &mut self.last[transmit_type.index()];
        if *slot == Some(id) {
            return false;
        }
        *slot = Some(id);
        true
    }

    /// Forget every stored id.
    pub fn reset(&mut self) {
        self.last = [None; TRANSMIT_TYPE_COUNT];
    }
}

/// Control message types (no data objects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlMessage {
    /// GoodCRC (0x01).
    GoodCrc = 0x01,
    /// Accept (0x03).
    Accept = 0x03,
    /// Reject (0x04).
    Reject = 0x04,
    /// Ping (0x05).
    Ping = 0x05,
    /// PS_RDY (0x06).
    PsRdy = 0x06,
    /// Get_Source_Cap (0x07).
    GetSourceCap = 0x07,
    /// Get_Sink_Cap (0x08).
    GetSinkCap = 0x08,
    /// Wait (0x0C).
    Wait = 0x0C,
    /// Soft_Reset (0x0D).
    SoftReset = 0x0D,
    /// Not_Supported (0x10).
    NotSupported = 0x10,
}

impl ControlMessage {
    /// Convert to the 5-bit type code.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from the 5-bit type code.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::GoodCrc),
            0x03 => Some(Self::Accept),
            0x04 => Some(Self::Reject),
            0x05 => Some(Self::Ping),
            0x06 => Some(Self::PsRdy),
            0x07 => Some(Self::GetSourceCap),
            0x08 => Some(Self::GetSinkCap),
            0x0C => Some(Self::Wait),
            0x0D => Some(Self::SoftReset),
            0x10 => Some(Self::NotSupported),
            _ => None,
        }
    }
}

/// Data message types with their payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
    /// Source_Capabilities (0x01).
    SourceCapabilities(Capabilities),
    /// Request (0x02).
    Request(RequestObject),
    /// Vendor_Defined (0x0F), payload left opaque.
    VendorDefined(Vec<u32>),
}

impl DataMessage {
    /// Convert to the 5-bit type code.
    pub fn to_u8(&self) -> u8 {
        match self {
            DataMessage::SourceCapabilities(_) => 0x01,
            DataMessage::Request(_) => 0x02,
            DataMessage::VendorDefined(_) => 0x0F,
        }
    }

    /// Number of 32-bit data objects carried.
    pub fn object_count(&self) -> usize {
        match self {
            DataMessage::SourceCapabilities(caps) => caps.len(),
            DataMessage::Request(_) => 1,
            DataMessage::VendorDefined(objects) => objects.len(),
        }
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Control message.
    Control(ControlMessage),
    /// Data message.
    Data(DataMessage),
}

impl MessageKind {
    /// True for the given control message.
    pub fn is_control(&self, control: ControlMessage) -> bool {
        matches!(self, MessageKind::Control(c) if *c == control)
    }
}

/// A PD message as handed to or received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message body.
    pub kind: MessageKind,
    /// MessageID from the header.
    pub id: MessageId,
}

impl Message {
    /// Create a message.
    pub fn new(kind: MessageKind, id: MessageId) -> Self {
        Self { kind, id }
    }

    /// Create a control message.
    pub fn control(control: ControlMessage, id: MessageId) -> Self {
        Self::new(MessageKind::Control(control), id)
    }

    /// Create a data message.
    pub fn data(data: DataMessage, id: MessageId) -> Self {
        Self::new(MessageKind::Data(data), id)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MessageKind::Control(c) => write!(f, "{:?}#{}", c, self.id),
            MessageKind::Data(DataMessage::SourceCapabilities(caps)) => {
                write!(f, "SourceCapabilities[{}]#{}", caps.len(), self.id)
            }
            MessageKind::Data(DataMessage::Request(rdo)) => {
                write!(f, "Request(pos={})#{}", rdo.object_position(), self.id)
            }
            MessageKind::Data(DataMessage::VendorDefined(_)) => {
                write!(f, "VendorDefined#{}", self.id)
            }
        }
    }
}

// Fixed supply PDO layout
const PDO_VOLTAGE_SHIFT: u32 = 10;
const PDO_FIELD_MASK: u32 = 0x3FF;
const PDO_VOLTAGE_UNIT_MV: u32 = 50;
const PDO_CURRENT_UNIT_MA: u32 = 10;

// Fixed supply RDO layout
const RDO_POSITION_SHIFT: u32 = 28;
const RDO_POSITION_MASK: u32 = 0x7;
const RDO_OPERATING_SHIFT: u32 = 10;

/// Fixed-supply Power Data Object.
///
/// Bits 19..10 carry voltage in 50 mV units, bits 9..0 maximum current in
/// 10 mA units. Supply type bits are left at zero (fixed supply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PowerDataObject(pub u32);

impl PowerDataObject {
    /// Build a fixed-supply PDO. Values are truncated to the field resolution.
    pub fn fixed(voltage_mv: u32, max_current_ma: u32) -> Self {
        let voltage = (voltage_mv / PDO_VOLTAGE_UNIT_MV) & PDO_FIELD_MASK;
        let current = (max_current_ma / PDO_CURRENT_UNIT_MA) & PDO_FIELD_MASK;
        Self((voltage << PDO_VOLTAGE_SHIFT) | current)
    }

    /// Voltage in millivolts.
    pub fn voltage_mv(self) -> u32 {
        ((self.0 >> PDO_VOLTAGE_SHIFT) & PDO_FIELD_MASK) * PDO_VOLTAGE_UNIT_MV
    }

    /// Maximum current in milliamps.
    pub fn max_current_ma(self) -> u32 {
        (self.0 & PDO_FIELD_MASK) * PDO_CURRENT_UNIT_MA
    }
}

/// Ordered list of PDOs offered by a source (1 to 7 entries on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities(pub Vec<PowerDataObject>);

impl Capabilities {
    /// Create from a list of PDOs.
    pub fn new(objects: Vec<PowerDataObject>) -> Self {
        Self(objects)
    }

    /// Number of PDOs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no PDO is offered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// PDO at a 1-based object position, as used by request objects.
    pub fn at_position(&self, position: u8) -> Option<PowerDataObject> {
        let index = usize::from(position).checked_sub(1)?;
        self.0.get(index).copied()
    }
}

/// Fixed-supply Request Data Object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestObject(pub u32);

impl RequestObject {
    /// Build a fixed-supply request for the PDO at `position` (1-based).
    pub fn fixed(position: u8, operating_current_ma: u32, max_current_ma: u32) -> Self {
        let position = u32::from(position) & RDO_POSITION_MASK;
        let operating = (operating_current_ma / PDO_CURRENT_UNIT_MA) & PDO_FIELD_MASK;
        let max = (max_current_ma / PDO_CURRENT_UNIT_MA) & PDO_FIELD_MASK;
        Self((position << RDO_POSITION_SHIFT) | (operating << RDO_OPERATING_SHIFT) | max)
    }

    /// 1-based object position of the requested PDO.
    pub fn object_position(self) -> u8 {
        ((self.0 >> RDO_POSITION_SHIFT) & RDO_POSITION_MASK) as u8
    }

    /// Operating current in milliamps.
    pub fn operating_current_ma(self) -> u32 {
        ((self.0 >> RDO_OPERATING_SHIFT) & PDO_FIELD_MASK) * PDO_CURRENT_UNIT_MA
    }

    /// Maximum operating current in milliamps.
    pub fn max_current_ma(self) -> u32 {
        (self.0 & PDO_FIELD_MASK) * PDO_CURRENT_UNIT_MA
    }
}

/// Explicit contract established by a completed capability exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    /// Capabilities the source offered.
    pub capabilities: Capabilities,
    /// Request the sink made against them.
    pub request: RequestObject,
}

impl Contract {
    /// The PDO the contract was negotiated on.
    pub fn selected(&self) -> Option<PowerDataObject> {
        self.capabilities.at_position(self.request.object_position())
    }
}
