//! Router and adapter register layouts used by the engine.

/// ROUTER_CS_0: vendor id (15:0), device id (31:16).
pub const ROUTER_CS_0: u16 = 0;
/// ROUTER_CS_1: next capability, upstream adapter, max adapter, depth, revision.
pub const ROUTER_CS_1: u16 = 1;
/// ROUTER_CS_5: sleep and wake control.
pub const ROUTER_CS_5: u16 = 5;
/// ROUTER_CS_6: sleep status.
pub const ROUTER_CS_6: u16 = 6;
/// ROUTER_CS_7: UUID low word.
pub const ROUTER_CS_7: u16 = 7;
/// ROUTER_CS_8: UUID high word.
pub const ROUTER_CS_8: u16 = 8;

/// Dwords read from offset 0 during discovery (ROUTER_CS_0..ROUTER_CS_8).
pub const ROUTER_BASIC_DWORDS: u8 = 9;

/// Upper bound on the adapter count taken from ROUTER_CS_1.
pub const ROUTER_MAX_ADAPTERS: u8 = 64;

/// Intel's PCI vendor id; selects the Intel capability flavour.
pub const VENDOR_INTEL: u16 = 0x8086;

/// ROUTER_CS_1 fields.
pub mod cs1 {
    pub const NEXT_CAP_MASK: u32 = 0x0000_00ff;
    pub const UPSTREAM_SHIFT: u32 = 8;
    pub const UPSTREAM_MASK: u32 = 0x3f << UPSTREAM_SHIFT;
    pub const MAX_ADAPTER_SHIFT: u32 = 14;
    pub const MAX_ADAPTER_MASK: u32 = 0x3f << MAX_ADAPTER_SHIFT;
    pub const DEPTH_SHIFT: u32 = 20;
    pub const DEPTH_MASK: u32 = 0x7 << DEPTH_SHIFT;
    pub const REVISION_SHIFT: u32 = 24;
    pub const REVISION_MASK: u32 = 0xff << REVISION_SHIFT;
}

/// ROUTER_CS_5 bits.
pub mod cs5 {
    /// Enter sleep.
    pub const SLP: u32 = 1 << 0;
    /// Wake on PCIe.
    pub const WOP: u32 = 1 << 1;
    /// Wake on USB3.
    pub const WOU: u32 = 1 << 2;
    /// Wake on DisplayPort.
    pub const WOD: u32 = 1 << 3;
}

/// ROUTER_CS_6 bits.
pub mod cs6 {
    /// Sleep ready.
    pub const SLPR: u32 = 1 << 0;
}

/// ADP_CS_1: first capability offset in bits 7:0.
pub const ADP_CS_1: u16 = 1;
/// Dwords read from adapter offset 0 to reach ADP_CS_1.
pub const ADAPTER_BASIC_DWORDS: u8 = 2;
pub const ADP_NEXT_CAP_MASK: u32 = 0x0000_00ff;

/// Capability ids and header layout.
pub mod cap {
    /// Time management unit.
    pub const TMU: u8 = 0x03;
    /// Vendor-specific capability (short VSC or long VSEC header).
    pub const VENDOR_SPECIFIC: u8 = 0x05;

    /// Largest offset a basic header's next pointer may hold.
    pub const OFFSET_MAX: u16 = 0xff;
    /// Largest offset a long (VSEC) header's next pointer may hold.
    pub const VSEC_OFFSET_MAX: u16 = crate::protocol::MAX_OFFSET;
    /// Headers visited before a chain is declared cyclic.
    pub const MAX_CHAIN_LEN: usize = 64;

    /// Header dword 0: next (7:0), id (15:8), vsc id (23:16), vsc length (31:24).
    pub const NEXT_MASK: u32 = 0x0000_00ff;
    pub const ID_SHIFT: u32 = 8;
    pub const VSC_ID_SHIFT: u32 = 16;
    pub const VSC_LEN_SHIFT: u32 = 24;
    /// Long header dword 1: next (15:0), length (31:16).
    pub const VSEC_NEXT_MASK: u32 = 0x0000_ffff;
    pub const VSEC_LEN_SHIFT: u32 = 16;

    /// Intel link-controller VSEC id.
    pub const INTEL_VSEC_LC: u8 = 0x06;
    /// Offset of the UUID inside the link-controller block.
    pub const LC_UUID: u16 = 0x03;
    pub const LC_UUID_DWORDS: u8 = 4;
}

/// Basic router registers decoded during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterBasic {
    pub vendor_id: u16,
    pub device_id: u16,
    pub next_cap: u16,
    pub upstream_adapter: u8,
    pub max_adapter: u8,
    pub depth: u8,
    pub revision: u8,
    pub uuid_lo: u32,
    pub uuid_hi: u32,
}

impl RouterBasic {
    /// Decode ROUTER_CS_0..ROUTER_CS_8. Returns `None` if fewer words given.
    pub fn decode(words: &[u32]) -> Option<Self> {
        if words.len() < ROUTER_BASIC_DWORDS as usize {
            return None;
        }
        let cs0 = words[ROUTER_CS_0 as usize];
        let cs1 = words[ROUTER_CS_1 as usize];
        Some(Self {
            vendor_id: cs0 as u16,
            device_id: (cs0 >> 16) as u16,
            next_cap: (cs1 & cs1::NEXT_CAP_MASK) as u16,
            upstream_adapter: ((cs1 & cs1::UPSTREAM_MASK) >> cs1::UPSTREAM_SHIFT) as u8,
            max_adapter: ((cs1 & cs1::MAX_ADAPTER_MASK) >> cs1::MAX_ADAPTER_SHIFT) as u8,
            depth: ((cs1 & cs1::DEPTH_MASK) >> cs1::DEPTH_SHIFT) as u8,
            revision: ((cs1 & cs1::REVISION_MASK) >> cs1::REVISION_SHIFT) as u8,
            uuid_lo: words[ROUTER_CS_7 as usize],
            uuid_hi: words[ROUTER_CS_8 as usize],
        })
    }

    /// Pack ROUTER_CS_1 (far-end simulation and tests).
    pub fn encode_cs1(next_cap: u8, upstream: u8, max_adapter: u8, depth: u8, revision: u8) -> u32 {
        next_cap as u32
            | ((upstream as u32) << cs1::UPSTREAM_SHIFT) & cs1::UPSTREAM_MASK
            | ((max_adapter as u32) << cs1::MAX_ADAPTER_SHIFT) & cs1::MAX_ADAPTER_MASK
            | ((depth as u32) << cs1::DEPTH_SHIFT) & cs1::DEPTH_MASK
            | ((revision as u32) << cs1::REVISION_SHIFT)
    }
}

/// Pack a capability header dword 0.
pub fn encode_cap_header(next: u8, id: u8, vsc_id: u8, vsc_len: u8) -> u32 {
    next as u32
        | (id as u32) << cap::ID_SHIFT
        | (vsc_id as u32) << cap::VSC_ID_SHIFT
        | (vsc_len as u32) << cap::VSC_LEN_SHIFT
}

/// Pack a long (VSEC) header dword 1.
pub fn encode_vsec_header(next: u16, len: u16) -> u32 {
    next as u32 | (len as u32) << cap::VSEC_LEN_SHIFT
}
