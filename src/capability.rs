//! Capability chain walker.
//!
//! Router and adapter config spaces carry a singly linked list of
//! capability blocks. Each block starts with a header dword:
//!
//! ```text
//! ┌───────────┬───────────┬───────────┬───────────┐
//! │ 31-24     │ 23-16     │ 15-8      │ 7-0       │
//! │ vsc len   │ vsc id    │ cap id    │ next      │
//! └───────────┴───────────┴───────────┴───────────┘
//! ```
//!
//! Vendor-specific blocks (cap id 0x05) come in two shapes. A short block
//! (VSC) has a non-zero length in the header. A long block (VSEC) has a
//! length of zero and a second header dword holding a 16-bit next pointer
//! and its length, which lets the chain continue above offset 0xff.
//!
//! The walk stops with `NotFound` at a zero next pointer or one beyond the
//! bound of the header it came from, and with `Protocol` after
//! [`cap::MAX_CHAIN_LEN`] headers (a cyclic chain).

use tracing::debug;

use crate::error::{Result, TbError};
use crate::protocol::regs::{cap, ADAPTER_BASIC_DWORDS, ADP_CS_1, ADP_NEXT_CAP_MASK, ROUTER_CS_1};
use crate::protocol::regs::cs1::NEXT_CAP_MASK;
use crate::protocol::Space;
use crate::topology::{Router, Topology};

/// Source of config-space dwords for one router or adapter.
pub trait ConfigSpaceRead {
    fn read_dwords(&self, offset: u16, len: u8) -> Result<Vec<u32>>;
}

/// What a walk is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityTarget {
    /// A capability with this id (not vendor-specific).
    Basic(u8),
    /// A short vendor-specific block with this vendor id.
    Vsc(u8),
    /// A long vendor-specific block with this vendor id.
    Vsec(u8),
    /// A vendor-specific block of either shape with this vendor id.
    Vendor(u8),
}

/// Position of a walk: the header found at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityCursor {
    /// Offset the header was read from.
    pub offset: u16,
    /// Capability id.
    pub id: u8,
    /// Vendor id of a vendor-specific block.
    pub vendor_id: Option<u8>,
    /// True for a long (VSEC) vendor-specific header.
    pub extended: bool,
    /// Offset of the next header; 0 ends the chain.
    pub next: u16,
}

impl CapabilityCursor {
    /// Read and decode the header at `offset`.
    pub fn read(reader: &impl ConfigSpaceRead, offset: u16) -> Result<Self> {
        let header = first_word(reader.read_dwords(offset, 1)?, offset)?;
        let id = (header >> cap::ID_SHIFT) as u8;
        let mut cursor = Self {
            offset,
            id,
            vendor_id: None,
            extended: false,
            next: (header & cap::NEXT_MASK) as u16,
        };

        if id == cap::VENDOR_SPECIFIC {
            cursor.vendor_id = Some((header >> cap::VSC_ID_SHIFT) as u8);
            if header >> cap::VSC_LEN_SHIFT == 0 {
                let long = first_word(reader.read_dwords(offset + 1, 1)?, offset + 1)?;
                cursor.extended = true;
                cursor.next = (long & cap::VSEC_NEXT_MASK) as u16;
            }
        }
        Ok(cursor)
    }

    /// Largest next pointer this header may legally hold.
    #[inline]
    pub fn next_limit(&self) -> u16 {
        if self.extended {
            cap::VSEC_OFFSET_MAX
        } else {
            cap::OFFSET_MAX
        }
    }

    /// Check if this header is what `target` names.
    pub fn matches(&self, target: CapabilityTarget) -> bool {
        match target {
            CapabilityTarget::Basic(id) => self.id == id && self.vendor_id.is_none(),
            CapabilityTarget::Vsc(id) => self.vendor_id == Some(id) && !self.extended,
            CapabilityTarget::Vsec(id) => self.vendor_id == Some(id) && self.extended,
            CapabilityTarget::Vendor(id) => self.vendor_id == Some(id),
        }
    }
}

fn first_word(words: Vec<u32>, offset: u16) -> Result<u32> {
    words.first().copied().ok_or_else(|| {
        TbError::Protocol(format!("empty read of capability header at {:#x}", offset))
    })
}

/// Walk the chain starting at `start` until `target` is found.
///
/// Returns the cursor of the matching header.
pub fn find_capability(
    reader: &impl ConfigSpaceRead,
    start: u16,
    target: CapabilityTarget,
) -> Result<CapabilityCursor> {
    let mut offset = start;
    let mut limit = cap::OFFSET_MAX;
    let mut visited = 0usize;

    while offset != 0 && offset <= limit {
        visited += 1;
        if visited > cap::MAX_CHAIN_LEN {
            return Err(TbError::Protocol(format!(
                "capability chain longer than {} headers",
                cap::MAX_CHAIN_LEN
            )));
        }

        let cursor = CapabilityCursor::read(reader, offset)?;
        if cursor.matches(target) {
            return Ok(cursor);
        }
        offset = cursor.next;
        limit = cursor.next_limit();
    }

    if offset != 0 {
        debug!(offset, limit, "capability next pointer out of bounds");
    }
    Err(TbError::NotFound)
}

/// Reads through a topology, in router or adapter space.
struct SpaceReader<'a> {
    topology: &'a Topology,
    router: &'a Router,
    space: Space,
    adapter: u8,
}

impl ConfigSpaceRead for SpaceReader<'_> {
    fn read_dwords(&self, offset: u16, len: u8) -> Result<Vec<u32>> {
        self.topology
            .read(self.router, self.space, self.adapter, offset, len)
    }
}

impl Topology {
    fn router_chain(&self, router: &Router, target: CapabilityTarget) -> Result<u16> {
        let cs1 = first_word(self.router_read(router, ROUTER_CS_1, 1)?, ROUTER_CS_1)?;
        let reader = SpaceReader {
            topology: self,
            router,
            space: Space::Router,
            adapter: 0,
        };
        find_capability(&reader, (cs1 & NEXT_CAP_MASK) as u16, target).map(|c| c.offset)
    }

    /// Offset of router capability `id`.
    pub fn find_router_capability(&self, router: &Router, id: u8) -> Result<u16> {
        self.router_chain(router, CapabilityTarget::Basic(id))
    }

    /// Offset of the short vendor-specific block `vendor_id`.
    pub fn find_router_vsc(&self, router: &Router, vendor_id: u8) -> Result<u16> {
        self.router_chain(router, CapabilityTarget::Vsc(vendor_id))
    }

    /// Offset of the long vendor-specific block `vendor_id`.
    pub fn find_router_vsec(&self, router: &Router, vendor_id: u8) -> Result<u16> {
        self.router_chain(router, CapabilityTarget::Vsec(vendor_id))
    }

    /// Offset of capability `id` in the config space of `adapter`.
    pub fn find_adapter_capability(&self, router: &Router, adapter: u8, id: u8) -> Result<u16> {
        if let Some(identity) = router.identity() {
            if adapter == 0 || adapter > identity.max_adapter {
                return Err(TbError::InvalidArgument(format!(
                    "adapter {} outside 1..={}",
                    adapter, identity.max_adapter
                )));
            }
        }

        let words = self.adapter_read(router, adapter, 0, ADAPTER_BASIC_DWORDS)?;
        let cs1 = words.get(ADP_CS_1 as usize).copied().ok_or_else(|| {
            TbError::Protocol(format!("short read of adapter {} header", adapter))
        })?;
        let reader = SpaceReader {
            topology: self,
            router,
            space: Space::Adapter,
            adapter,
        };
        find_capability(
            &reader,
            (cs1 & ADP_NEXT_CAP_MASK) as u16,
            CapabilityTarget::Basic(id),
        )
        .map(|c| c.offset)
    }

    /// UUID held in the link-controller block of an Intel router.
    ///
    /// Routers of the generic flavour have no such block and report
    /// `NotFound`.
    pub fn link_controller_uuid(&self, router: &Router) -> Result<[u32; 4]> {
        let identity = router.identity().ok_or(TbError::NotFound)?;
        let vsec = identity
            .flavor
            .link_controller_vsec()
            .ok_or(TbError::NotFound)?;
        let base = self.find_router_vsec(router, vsec)?;

        let words = self.router_read(router, base + cap::LC_UUID, cap::LC_UUID_DWORDS)?;
        let mut uuid = [0u32; 4];
        if words.len() != uuid.len() {
            return Err(TbError::Protocol(format!(
                "link controller uuid: expected {} dwords, got {}",
                uuid.len(),
                words.len()
            )));
        }
        uuid.copy_from_slice(&words);
        Ok(uuid)
    }
}
