//! Packet framing and typed packet encode/decode.
//!
//! Every control packet is a sequence of big-endian 32-bit words followed by
//! a trailing CRC-32C (Castagnoli) word computed over all preceding bytes:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┬─────────────┬───────┐
//! │ route hi │ route lo │ address/event│ data words  │ CRC32C│
//! └──────────┴──────────┴──────────────┴─────────────┴───────┘
//! ```
//!
//! # Example
//!
//! ```
//! use tbcfg::protocol::{ConfigAddress, ReadRequest, Route, Space};
//!
//! let addr = ConfigAddress::new(Space::Router, 0, 0, 9).unwrap();
//! let bytes = ReadRequest { route: Route::ROOT, addr }.encode();
//! assert_eq!(bytes.len(), 4 * 4);
//!
//! let decoded = ReadRequest::decode(&bytes).unwrap();
//! assert_eq!(decoded.addr, addr);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::route::Route;
use super::wire_format::{
    encode_event_word, event, event_adapter, event_code, ConfigAddress, NotifyEvent,
    MAX_DWORDS,
};
use crate::error::{Result, TbError};

/// Size of one wire word in bytes.
pub const WORD_SIZE: usize = 4;

/// Route words plus address word.
const HEADER_WORDS: usize = 3;

/// Compute the packet checksum (CRC-32C) over `bytes`.
#[inline]
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// Serialize `words` big-endian and append the checksum word.
pub fn seal(words: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity((words.len() + 1) * WORD_SIZE);
    for &word in words {
        buf.put_u32(word);
    }
    let crc = checksum(&buf);
    buf.put_u32(crc);
    buf.freeze()
}

/// Verify the trailing checksum and return the payload words before it.
pub fn open(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() < 2 * WORD_SIZE || bytes.len() % WORD_SIZE != 0 {
        return Err(TbError::Protocol(format!(
            "packet length {} is not a whole number of words",
            bytes.len()
        )));
    }

    let (body, tail) = bytes.split_at(bytes.len() - WORD_SIZE);
    let expected = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = checksum(body);
    if expected != actual {
        return Err(TbError::Protocol(format!(
            "checksum mismatch: packet carries {:#010x}, computed {:#010x}",
            expected, actual
        )));
    }

    Ok(body
        .chunks_exact(WORD_SIZE)
        .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

fn require_words(words: &[u32], min: usize, what: &str) -> Result<()> {
    if words.len() < min {
        return Err(TbError::Protocol(format!(
            "{} needs at least {} words, got {}",
            what,
            min,
            words.len()
        )));
    }
    Ok(())
}

/// Outbound config read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub route: Route,
    pub addr: ConfigAddress,
}

impl ReadRequest {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        seal(&[self.route.hi(), self.route.lo(), self.addr.encode()])
    }

    /// Decode wire bytes (used by the far end and by tests).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let words = open(bytes)?;
        require_words(&words, HEADER_WORDS, "read request")?;
        Ok(Self {
            route: Route::from_words(words[0], words[1]),
            addr: ConfigAddress::decode(words[2]),
        })
    }
}

/// Outbound config write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub route: Route,
    pub addr: ConfigAddress,
    pub data: Vec<u32>,
}

impl WriteRequest {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut words = Vec::with_capacity(HEADER_WORDS + self.data.len());
        words.extend_from_slice(&[self.route.hi(), self.route.lo(), self.addr.encode()]);
        words.extend_from_slice(&self.data);
        seal(&words)
    }

    /// Decode wire bytes. The data length must agree with the address word.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let words = open(bytes)?;
        require_words(&words, HEADER_WORDS, "write request")?;
        let addr = ConfigAddress::decode(words[2]);
        let data = words[HEADER_WORDS..].to_vec();
        if data.len() != addr.dwords as usize {
            return Err(TbError::Protocol(format!(
                "write request declares {} dwords but carries {}",
                addr.dwords,
                data.len()
            )));
        }
        Ok(Self {
            route: Route::from_words(words[0], words[1]),
            addr,
            data,
        })
    }
}

/// Inbound config read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub route: Route,
    pub addr: ConfigAddress,
    pub data: Vec<u32>,
}

impl ReadResponse {
    /// Encode to wire bytes, setting the route marker bit.
    pub fn encode(&self) -> Bytes {
        let mut words = Vec::with_capacity(HEADER_WORDS + self.data.len());
        words.extend_from_slice(&[
            self.route.hi() | super::route::ROUTE_MARKER,
            self.route.lo(),
            self.addr.encode(),
        ]);
        words.extend_from_slice(&self.data);
        seal(&words)
    }

    /// Decode wire bytes.
    ///
    /// The data is truncated to the smaller of the declared length and the
    /// words actually present.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let words = open(bytes)?;
        require_words(&words, HEADER_WORDS, "read response")?;
        let addr = ConfigAddress::decode(words[2]);
        let present = &words[HEADER_WORDS..];
        let len = present.len().min(addr.dwords as usize).min(MAX_DWORDS as usize);
        Ok(Self {
            route: Route::from_words(words[0], words[1]),
            addr,
            data: present[..len].to_vec(),
        })
    }
}

/// Inbound config write response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    pub route: Route,
    pub addr: ConfigAddress,
}

impl WriteResponse {
    /// Encode to wire bytes, setting the route marker bit.
    pub fn encode(&self) -> Bytes {
        seal(&[
            self.route.hi() | super::route::ROUTE_MARKER,
            self.route.lo(),
            self.addr.encode(),
        ])
    }

    /// Decode wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let words = open(bytes)?;
        require_words(&words, HEADER_WORDS, "write response")?;
        Ok(Self {
            route: Route::from_words(words[0], words[1]),
            addr: ConfigAddress::decode(words[2]),
        })
    }
}

/// Notification packet (inbound events, outbound hot-plug acknowledgments).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyPacket {
    pub route: Route,
    /// Raw event code; may be outside the recognized [`NotifyEvent`] set.
    pub code: u8,
    pub adapter: u8,
    /// Raw plug-event bits (31:30).
    pub plug: u32,
}

impl NotifyPacket {
    /// Build the acknowledgment for a hot-plug event.
    pub fn hotplug_ack(event: &HotplugPacket) -> Self {
        Self {
            route: event.route,
            code: NotifyEvent::HotplugAck.code(),
            adapter: event.adapter,
            plug: if event.unplug {
                event::PG_UNPLUG
            } else {
                event::PG_PLUG
            },
        }
    }

    /// Recognized event, if any.
    #[inline]
    pub fn event(&self) -> Option<NotifyEvent> {
        NotifyEvent::from_code(self.code)
    }

    /// Check if the plug bits mark an unplug acknowledgment.
    #[inline]
    pub fn is_unplug(&self) -> bool {
        self.plug & event::PG_MASK == event::PG_UNPLUG
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        seal(&[
            self.route.hi(),
            self.route.lo(),
            encode_event_word(self.code, self.adapter, self.plug),
        ])
    }

    /// Decode wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let words = open(bytes)?;
        require_words(&words, HEADER_WORDS, "notification")?;
        Ok(Self {
            route: Route::from_words(words[0], words[1]),
            code: event_code(words[2]),
            adapter: event_adapter(words[2]),
            plug: words[2] & event::PG_MASK,
        })
    }
}

/// Inbound hot-plug event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugPacket {
    pub route: Route,
    pub adapter: u8,
    pub unplug: bool,
}

impl HotplugPacket {
    /// Encode to wire bytes (far end / tests).
    pub fn encode(&self) -> Bytes {
        let mut word = self.adapter as u32 & 0x3f;
        if self.unplug {
            word |= event::UNPLUG;
        }
        seal(&[self.route.hi() | super::route::ROUTE_MARKER, self.route.lo(), word])
    }

    /// Decode wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let words = open(bytes)?;
        require_words(&words, HEADER_WORDS, "hot-plug event")?;
        Ok(Self {
            route: Route::from_words(words[0], words[1]),
            adapter: (words[2] & 0x3f) as u8,
            unplug: words[2] & event::UNPLUG != 0,
        })
    }
}
