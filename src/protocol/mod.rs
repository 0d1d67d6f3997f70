//! Protocol module - routes, wire format, framing, and register layouts.
//!
//! This module implements the control-packet protocol spoken with routers:
//! - Route strings and hop arithmetic
//! - Address and event word packing
//! - CRC-32C-sealed big-endian framing with typed packets
//! - Router/adapter register and capability header layouts

mod frame;
mod route;
mod wire_format;

pub mod regs;

pub use frame::{
    checksum, open, seal, HotplugPacket, NotifyPacket, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse, WORD_SIZE,
};
pub use route::{Route, MAX_DEPTH, ROUTE_MARKER};
pub use wire_format::{
    addr, encode_event_word, event, event_adapter, event_code, ConfigAddress, NotifyEvent, Pdf,
    Space, MAX_ADAPTER, MAX_DWORDS, MAX_OFFSET,
};
