//! Wire format field packing.
//!
//! Config read/write packets carry one packed address word after the route:
//! ```text
//! ┌──────┬───────┬─────────┬────────┬──────────┐
//! │ 31-29│ 28-27 │ 26-25   │ 24-19  │ 18-13    │ 12-0
//! │ rsvd │ seq   │ space   │ adapter│ dwords   │ offset
//! └──────┴───────┴─────────┴────────┴──────────┘
//! ```
//!
//! Notification and hot-plug packets carry one event word instead:
//! ```text
//! ┌───────┬──────────┬──────────┬──────────┐
//! │ 31-30 │ 29-14    │ 13-8     │ 7-0      │
//! │ plug  │ reserved │ adapter  │ event    │
//! └───────┴──────────┴──────────┴──────────┘
//! ```
//!
//! All words are Big Endian on the wire.

use std::fmt;

use crate::error::{Result, TbError};

/// Largest config-space dword offset the address word can express.
pub const MAX_OFFSET: u16 = 0x1fff;

/// Largest transfer length in dwords for a single read or write.
pub const MAX_DWORDS: u8 = 60;

/// Largest adapter number the address word can express.
pub const MAX_ADAPTER: u8 = 0x3f;

/// Address word field masks and shifts.
pub mod addr {
    pub const OFFSET_MASK: u32 = 0x0000_1fff;
    pub const DWORDS_SHIFT: u32 = 13;
    pub const DWORDS_MASK: u32 = 0x3f << DWORDS_SHIFT;
    pub const ADAPTER_SHIFT: u32 = 19;
    pub const ADAPTER_MASK: u32 = 0x3f << ADAPTER_SHIFT;
    pub const SPACE_SHIFT: u32 = 25;
    pub const SPACE_MASK: u32 = 0x3 << SPACE_SHIFT;
    pub const SEQ_SHIFT: u32 = 27;
    pub const SEQ_MASK: u32 = 0x3 << SEQ_SHIFT;
}

/// Event word field masks and shifts.
pub mod event {
    pub const CODE_MASK: u32 = 0x0000_00ff;
    pub const ADAPTER_SHIFT: u32 = 8;
    pub const ADAPTER_MASK: u32 = 0x3f << ADAPTER_SHIFT;
    /// Set by the router in a hot-plug packet when the adapter was unplugged.
    pub const UNPLUG: u32 = 1 << 31;
    /// Plug-event field of a hot-plug acknowledgment: plugged.
    pub const PG_PLUG: u32 = 0x2 << 30;
    /// Plug-event field of a hot-plug acknowledgment: unplugged.
    pub const PG_UNPLUG: u32 = 0x3 << 30;
    pub const PG_MASK: u32 = 0x3 << 30;
}

/// Config space selected by a read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    /// Path configuration space of an adapter.
    Path = 0,
    /// Adapter configuration space.
    Adapter = 1,
    /// Router configuration space.
    Router = 2,
    /// Counters space of an adapter.
    Counters = 3,
}

impl Space {
    /// Decode the 2-bit space field.
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Space::Path,
            1 => Space::Adapter,
            2 => Space::Router,
            _ => Space::Counters,
        }
    }
}

/// Transport packet type (protocol defined field) of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pdf {
    /// Config read request / read response.
    Read = 1,
    /// Config write request / write response.
    Write = 2,
    /// Error or event notification (and hot-plug acknowledgment).
    Notify = 3,
    /// Hot-plug event.
    Hotplug = 4,
}

impl Pdf {
    /// Decode a raw packet type value.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Pdf::Read),
            2 => Some(Pdf::Write),
            3 => Some(Pdf::Notify),
            4 => Some(Pdf::Hotplug),
            _ => None,
        }
    }
}

/// Packed address attributes of a config read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigAddress {
    /// Target config space.
    pub space: Space,
    /// Adapter number (0 for router space).
    pub adapter: u8,
    /// Dword offset within the space.
    pub offset: u16,
    /// Transfer length in dwords.
    pub dwords: u8,
    /// 2-bit sequence number echoed by the far end.
    pub seq: u8,
}

impl ConfigAddress {
    /// Create and validate an address.
    pub fn new(space: Space, adapter: u8, offset: u16, dwords: u8) -> Result<Self> {
        if adapter > MAX_ADAPTER {
            return Err(TbError::InvalidArgument(format!(
                "adapter {} exceeds {}",
                adapter, MAX_ADAPTER
            )));
        }
        if offset > MAX_OFFSET {
            return Err(TbError::InvalidArgument(format!(
                "offset {:#x} exceeds {:#x}",
                offset, MAX_OFFSET
            )));
        }
        if dwords == 0 || dwords > MAX_DWORDS {
            return Err(TbError::InvalidArgument(format!(
                "length of {} dwords outside 1..={}",
                dwords, MAX_DWORDS
            )));
        }
        if offset as u32 + dwords as u32 > MAX_OFFSET as u32 + 1 {
            return Err(TbError::InvalidArgument(format!(
                "{} dwords at {:#x} run past the end of the space",
                dwords, offset
            )));
        }
        Ok(Self {
            space,
            adapter,
            offset,
            dwords,
            seq: 0,
        })
    }

    /// Same address with a different sequence number.
    #[inline]
    pub fn with_seq(mut self, seq: u8) -> Self {
        self.seq = seq & 0x3;
        self
    }

    /// Pack into the wire word.
    pub fn encode(&self) -> u32 {
        (self.offset as u32 & addr::OFFSET_MASK)
            | ((self.dwords as u32) << addr::DWORDS_SHIFT) & addr::DWORDS_MASK
            | ((self.adapter as u32) << addr::ADAPTER_SHIFT) & addr::ADAPTER_MASK
            | ((self.space as u32) << addr::SPACE_SHIFT) & addr::SPACE_MASK
            | ((self.seq as u32) << addr::SEQ_SHIFT) & addr::SEQ_MASK
    }

    /// Unpack a wire word. Never fails; reserved bits are ignored.
    pub fn decode(word: u32) -> Self {
        Self {
            space: Space::from_bits((word & addr::SPACE_MASK) >> addr::SPACE_SHIFT),
            adapter: ((word & addr::ADAPTER_MASK) >> addr::ADAPTER_SHIFT) as u8,
            offset: (word & addr::OFFSET_MASK) as u16,
            dwords: ((word & addr::DWORDS_MASK) >> addr::DWORDS_SHIFT) as u8,
            seq: ((word & addr::SEQ_MASK) >> addr::SEQ_SHIFT) as u8,
        }
    }
}

/// Notification codes that interrupt an inflight command.
///
/// Codes outside this set are logged and otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyEvent {
    /// Adapter is not connected.
    ConnectionError,
    /// Link error on the path.
    LinkError,
    /// Invalid config space address.
    AddressError,
    /// Invalid adapter number.
    AdapterError,
    /// Router is not enumerated.
    EnumerationError,
    /// Adapter is not in use.
    NotUsedAdapter,
    /// Invalid packet length.
    LengthError,
    /// Header error check failure.
    HeaderError,
    /// Flow control error.
    FlowControlError,
    /// Unexpected plug state.
    PlugError,
    /// Config space is locked.
    LockError,
    /// Hot-plug acknowledgment.
    HotplugAck,
    /// DisplayPort bandwidth change.
    BandwidthChange,
}

impl NotifyEvent {
    /// Wire code of the event.
    pub const fn code(&self) -> u8 {
        match self {
            NotifyEvent::ConnectionError => 0x00,
            NotifyEvent::LinkError => 0x01,
            NotifyEvent::AddressError => 0x02,
            NotifyEvent::AdapterError => 0x04,
            NotifyEvent::HotplugAck => 0x07,
            NotifyEvent::EnumerationError => 0x08,
            NotifyEvent::NotUsedAdapter => 0x09,
            NotifyEvent::LengthError => 0x0b,
            NotifyEvent::HeaderError => 0x0c,
            NotifyEvent::FlowControlError => 0x0d,
            NotifyEvent::PlugError => 0x0e,
            NotifyEvent::LockError => 0x0f,
            NotifyEvent::BandwidthChange => 0x20,
        }
    }

    /// Look up a recognized event by wire code.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => NotifyEvent::ConnectionError,
            0x01 => NotifyEvent::LinkError,
            0x02 => NotifyEvent::AddressError,
            0x04 => NotifyEvent::AdapterError,
            0x07 => NotifyEvent::HotplugAck,
            0x08 => NotifyEvent::EnumerationError,
            0x09 => NotifyEvent::NotUsedAdapter,
            0x0b => NotifyEvent::LengthError,
            0x0c => NotifyEvent::HeaderError,
            0x0d => NotifyEvent::FlowControlError,
            0x0e => NotifyEvent::PlugError,
            0x0f => NotifyEvent::LockError,
            0x20 => NotifyEvent::BandwidthChange,
            _ => return None,
        })
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotifyEvent::ConnectionError => "connection error",
            NotifyEvent::LinkError => "link error",
            NotifyEvent::AddressError => "address error",
            NotifyEvent::AdapterError => "adapter error",
            NotifyEvent::EnumerationError => "enumeration error",
            NotifyEvent::NotUsedAdapter => "adapter not in use",
            NotifyEvent::LengthError => "length error",
            NotifyEvent::HeaderError => "header error",
            NotifyEvent::FlowControlError => "flow control error",
            NotifyEvent::PlugError => "plug error",
            NotifyEvent::LockError => "lock error",
            NotifyEvent::HotplugAck => "hot-plug acknowledgment",
            NotifyEvent::BandwidthChange => "bandwidth change",
        };
        f.write_str(name)
    }
}

/// Pack an event word.
#[inline]
pub fn encode_event_word(code: u8, adapter: u8, plug_bits: u32) -> u32 {
    code as u32
        | ((adapter as u32) << event::ADAPTER_SHIFT) & event::ADAPTER_MASK
        | plug_bits & event::PG_MASK
}

/// Event code of an event word.
#[inline]
pub fn event_code(word: u32) -> u8 {
    (word & event::CODE_MASK) as u8
}

/// Adapter number of an event word.
#[inline]
pub fn event_adapter(word: u32) -> u8 {
    ((word & event::ADAPTER_MASK) >> event::ADAPTER_SHIFT) as u8
}
