//! Router nodes.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::protocol::regs::{cap, RouterBasic, VENDOR_INTEL};
use crate::protocol::Route;
use crate::scheduler::CommandQueue;
use crate::transport::NodeId;

/// Capability-index enumeration a router uses for vendor-specific blocks.
///
/// Chosen once at discovery from the vendor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityFlavor {
    /// Intel routers: vendor-specific ids follow Intel's VSEC numbering.
    Intel,
    /// Any other vendor: generic USB4 numbering.
    Usb4,
}

impl CapabilityFlavor {
    pub fn from_vendor(vendor_id: u16) -> Self {
        if vendor_id == VENDOR_INTEL {
            CapabilityFlavor::Intel
        } else {
            CapabilityFlavor::Usb4
        }
    }

    /// VSEC id of the link-controller block, if this flavour has one.
    pub fn link_controller_vsec(&self) -> Option<u8> {
        match self {
            CapabilityFlavor::Intel => Some(cap::INTEL_VSEC_LC),
            CapabilityFlavor::Usb4 => None,
        }
    }
}

/// Identity fields read from ROUTER_CS_0..8 at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision: u8,
    pub upstream_adapter: u8,
    /// Highest adapter number, clamped to the configured maximum.
    pub max_adapter: u8,
    pub depth: u8,
    /// Offset of the first router capability.
    pub first_capability: u16,
    pub uuid: [u32; 4],
    pub flavor: CapabilityFlavor,
}

impl RouterIdentity {
    pub(crate) fn from_basic(basic: &RouterBasic, max_adapters: u8) -> Self {
        Self {
            vendor_id: basic.vendor_id,
            device_id: basic.device_id,
            revision: basic.revision,
            upstream_adapter: basic.upstream_adapter,
            max_adapter: basic.max_adapter.min(max_adapters),
            depth: basic.depth,
            first_capability: basic.next_cap,
            uuid: [basic.uuid_lo, basic.uuid_hi, 0xffff_ffff, 0xffff_ffff],
            flavor: CapabilityFlavor::from_vendor(basic.vendor_id),
        }
    }
}

/// Snapshot of a router's command counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Frames accepted by the transport.
    pub submitted: u64,
    /// Attempts that reached a terminal state through the dispatcher.
    pub completed: u64,
    /// Attempts abandoned after their timeout.
    pub timeouts: u64,
    /// Submissions the transport pushed back with Busy.
    pub busy_deferrals: u64,
    /// Completions discarded because no matching attempt was inflight.
    pub stale_discards: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    timeouts: AtomicU64,
    busy_deferrals: AtomicU64,
    stale_discards: AtomicU64,
}

impl StatCounters {
    #[inline]
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_busy(&self) {
        self.busy_deferrals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_stale(&self) {
        self.stale_discards.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RouterStats {
        RouterStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            busy_deferrals: self.busy_deferrals.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
        }
    }
}

/// One router of the topology.
///
/// Handed out as `Arc<Router>`; tree links live in the topology's arena.
#[derive(Debug)]
pub struct Router {
    id: NodeId,
    route: Route,
    identity: OnceLock<RouterIdentity>,
    suspended: AtomicBool,
    detached: AtomicBool,
    seq: AtomicU8,
    queue: Mutex<CommandQueue>,
    pub(crate) stats: StatCounters,
}

impl Router {
    pub(crate) fn new(id: NodeId, route: Route) -> Self {
        Self {
            id,
            route,
            identity: OnceLock::new(),
            suspended: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            seq: AtomicU8::new(0),
            queue: Mutex::new(CommandQueue::new()),
            stats: StatCounters::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn route(&self) -> Route {
        self.route
    }

    /// Hops from the host router.
    #[inline]
    pub fn depth(&self) -> u8 {
        self.route.depth()
    }

    /// Identity read at discovery; `None` while discovery is running.
    #[inline]
    pub fn identity(&self) -> Option<&RouterIdentity> {
        self.identity.get()
    }

    pub(crate) fn set_identity(&self, identity: RouterIdentity) {
        let _ = self.identity.set(identity);
    }

    /// UUID pair read from ROUTER_CS_7/8, padded to four words.
    pub fn uuid(&self) -> Option<[u32; 4]> {
        self.identity.get().map(|id| id.uuid)
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Check if the router has been removed from its topology.
    #[inline]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Sequence number for the next attempt against this router.
    pub(crate) fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::Relaxed) & 0x3
    }

    pub(crate) fn queue(&self) -> &Mutex<CommandQueue> {
        &self.queue
    }

    /// Commands queued or inflight.
    pub fn outstanding(&self) -> usize {
        let queue = self.queue.lock();
        queue.pending_len() + usize::from(queue.inflight().is_some())
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_clamps_and_pads() {
        let basic = RouterBasic {
            vendor_id: VENDOR_INTEL,
            device_id: 0x15ef,
            next_cap: 0x15,
            upstream_adapter: 1,
            max_adapter: 63,
            depth: 0,
            revision: 1,
            uuid_lo: 0x1111_2222,
            uuid_hi: 0x3333_4444,
        };
        let identity = RouterIdentity::from_basic(&basic, 16);
        assert_eq!(identity.max_adapter, 16);
        assert_eq!(identity.uuid, [0x1111_2222, 0x3333_4444, 0xffff_ffff, 0xffff_ffff]);
        assert_eq!(identity.flavor, CapabilityFlavor::Intel);
        assert_eq!(identity.flavor.link_controller_vsec(), Some(cap::INTEL_VSEC_LC));
    }

    #[test]
    fn test_flavor_from_vendor() {
        assert_eq!(CapabilityFlavor::from_vendor(0x8087), CapabilityFlavor::Usb4);
        assert_eq!(CapabilityFlavor::Usb4.link_controller_vsec(), None);
    }

    #[test]
    fn test_fresh_router() {
        let router = Router::new(NodeId(4), Route::new(0x0301));
        assert_eq!(router.depth(), 2);
        assert!(router.identity().is_none());
        assert!(!router.is_suspended());
        assert_eq!(router.outstanding(), 0);
        assert_eq!(router.stats(), RouterStats::default());
    }
}
