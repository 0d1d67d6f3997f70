//! Hierarchical route strings.
//!
//! A route is a packed sequence of one-byte hop indices. The lowest-order
//! byte is the adapter taken out of the root router, the next byte the
//! adapter taken out of that router, and so on:
//!
//! ```text
//! bits:   63 .. 56 | ... | 15 .. 8 | 7 .. 0
//! hop:    depth 8  | ... | depth 2 | depth 1
//! ```
//!
//! On the wire a route travels as two big-endian words, high word first.
//! Bit 31 of the high word is set by the far end in responses and
//! notifications and is not part of the route.

use std::fmt;

use crate::error::{Result, TbError};

/// Marker bit in the high route word of inbound packets.
pub const ROUTE_MARKER: u32 = 0x8000_0000;

/// Deepest level a router may sit at below the host router.
pub const MAX_DEPTH: u8 = 6;

/// A route string identifying one router in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Route(u64);

impl Route {
    /// The host router's route.
    pub const ROOT: Route = Route(0);

    /// Create a route from its raw 64-bit value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Create a route from its two wire words, dropping the marker bit.
    #[inline]
    pub const fn from_words(hi: u32, lo: u32) -> Self {
        Self((((hi & !ROUTE_MARKER) as u64) << 32) | lo as u64)
    }

    /// Build a route from a list of hops, first hop out of the root first.
    pub fn from_hops(hops: &[u8]) -> Result<Self> {
        if hops.len() > MAX_DEPTH as usize {
            return Err(TbError::InvalidRoute(format!(
                "{} hops exceed maximum depth {}",
                hops.len(),
                MAX_DEPTH
            )));
        }
        let mut raw = 0u64;
        for (level, &hop) in hops.iter().enumerate() {
            if hop == 0 {
                return Err(TbError::InvalidRoute(format!(
                    "adapter 0 used as hop {}",
                    level + 1
                )));
            }
            raw |= (hop as u64) << (8 * level);
        }
        Ok(Self(raw))
    }

    /// Raw 64-bit value.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// High wire word.
    #[inline]
    pub const fn hi(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Low wire word.
    #[inline]
    pub const fn lo(&self) -> u32 {
        self.0 as u32
    }

    /// Number of hops from the root.
    #[inline]
    pub const fn depth(&self) -> u8 {
        8 - (self.0.leading_zeros() / 8) as u8
    }

    /// Check if this is the root route.
    #[inline]
    pub const fn is_root(&self) -> bool {
        self.0 == 0
    }

    /// Adapter index taken at `level` (0 = out of the root router).
    #[inline]
    pub const fn hop(&self, level: u8) -> u8 {
        if level >= 8 {
            0
        } else {
            (self.0 >> (8 * level as u32)) as u8
        }
    }

    /// Adapter on the parent router through which this router is reached.
    ///
    /// Returns `None` for the root.
    pub fn last_hop(&self) -> Option<u8> {
        match self.depth() {
            0 => None,
            depth => Some(self.hop(depth - 1)),
        }
    }

    /// Route of the router one level up.
    pub fn parent(&self) -> Option<Route> {
        match self.depth() {
            0 => None,
            depth => Some(Route(self.0 & !(0xffu64 << (8 * (depth - 1) as u32)))),
        }
    }

    /// Route of the router reached through `adapter` on this router.
    pub fn child(&self, adapter: u8) -> Result<Route> {
        let depth = self.depth();
        if adapter == 0 {
            return Err(TbError::InvalidRoute(
                "adapter 0 is the upstream interface".to_string(),
            ));
        }
        if depth >= MAX_DEPTH {
            return Err(TbError::InvalidRoute(format!(
                "route {} is already at maximum depth",
                self
            )));
        }
        Ok(Route(self.0 | (adapter as u64) << (8 * depth as u32)))
    }

    /// Check that every hop up to the depth is a real adapter.
    pub fn validate(&self) -> Result<()> {
        let depth = self.depth();
        if depth > MAX_DEPTH {
            return Err(TbError::InvalidRoute(format!(
                "route {} exceeds maximum depth {}",
                self, MAX_DEPTH
            )));
        }
        for level in 0..depth {
            if self.hop(level) == 0 {
                return Err(TbError::InvalidRoute(format!(
                    "route {} has adapter 0 at hop {}",
                    self,
                    level + 1
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}{:08x}", self.hi(), self.lo())
    }
}

impl From<u64> for Route {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
