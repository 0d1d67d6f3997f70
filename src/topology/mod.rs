//! Topology owner, builder, and tree maintenance.
//!
//! A [`Topology`] owns the router arena and the transport shared by all of
//! its routers. It is created by attaching the host router to a transport:
//!
//! ```ignore
//! use std::time::Duration;
//! use tbcfg::Topology;
//!
//! let topology = Topology::builder()
//!     .retries(2)
//!     .timeout(Duration::from_millis(500))
//!     .attach_root(transport)?;
//!
//! let root = topology.root().expect("host router");
//! let device = topology.attach_child(&root, Route::from_hops(&[1])?)?;
//! println!("{:x?}", device.uuid());
//! ```
//!
//! Attaching a router links it under its parent first and then reads its
//! basic registers with polled reads; the adapter table is only allocated
//! once the router's adapter count is known. A failed discovery unlinks the
//! router again.

mod router;
mod tree;

pub use router::{CapabilityFlavor, Router, RouterIdentity, RouterStats};
pub use tree::RouterTree;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandKind, Outcome};
use crate::config::EngineConfig;
use crate::dispatch::{self, HotplugEvent};
use crate::error::{Result, TbError};
use crate::protocol::regs::{RouterBasic, ROUTER_BASIC_DWORDS, ROUTER_CS_0};
use crate::protocol::{ConfigAddress, Route, Space};
use crate::scheduler::{self, Drained};
use crate::transport::{CommandId, FrameTransport, NodeId};

/// State shared between a [`Topology`] handle and the transport's
/// completion handlers.
pub(crate) struct TopologyInner {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Arc<dyn FrameTransport>,
    pub(crate) tree: RwLock<RouterTree<Arc<Router>>>,
    /// Routers whose head command was pushed back by the transport.
    deferred: Mutex<Vec<NodeId>>,
    next_command: AtomicU64,
    pub(crate) hotplug_tx: Mutex<Option<mpsc::UnboundedSender<HotplugEvent>>>,
}

impl TopologyInner {
    pub(crate) fn router(&self, id: NodeId) -> Option<Arc<Router>> {
        self.tree.read().get(id).cloned()
    }

    pub(crate) fn resolve(&self, route: Route) -> Result<Arc<Router>> {
        let tree = self.tree.read();
        let id = tree.lookup(route)?;
        tree.get(id).cloned().ok_or(TbError::NotFound)
    }

    /// Build a command against `router`.
    pub(crate) fn command(
        &self,
        router: &Router,
        kind: CommandKind,
        addr: ConfigAddress,
        payload: Vec<u32>,
    ) -> Result<Arc<Command>> {
        if router.is_detached() {
            return Err(TbError::NotFound);
        }
        if router.is_suspended() {
            return Err(TbError::Suspended);
        }
        let id = CommandId(self.next_command.fetch_add(1, Ordering::Relaxed));
        let command = Command::new(
            id,
            router.id(),
            router.route(),
            kind,
            addr,
            payload,
            self.transport.clone(),
        )?;
        Ok(Arc::new(command))
    }

    /// Queue a prepared attempt and try to drain the router.
    pub(crate) fn submit(&self, router: &Router, command: Arc<Command>) -> Result<()> {
        {
            // Detach takes the write lock, so a router cannot gain a command
            // once detach has checked its queue.
            let _tree = self.tree.read();
            if router.is_detached() {
                return Err(TbError::NotFound);
            }
            router.queue().lock().enqueue(command);
        }
        self.drain(router);
        Ok(())
    }

    fn drain(&self, router: &Router) {
        if scheduler::drain(router, self.transport.as_ref()) == Drained::Deferred {
            let mut deferred = self.deferred.lock();
            if !deferred.contains(&router.id()) {
                deferred.push(router.id());
            }
        }
    }

    /// Retry routers that were waiting for transport capacity.
    fn kick_deferred(&self) {
        let waiting = std::mem::take(&mut *self.deferred.lock());
        for id in waiting {
            if let Some(router) = self.router(id) {
                self.drain(&router);
            }
        }
    }

    /// Finish an attempt claimed by a completion signal.
    ///
    /// The slot is released only if `command` still holds it with the same
    /// generation; otherwise the completion is stale and dropped.
    pub(crate) fn complete(
        &self,
        router: &Router,
        command: &Arc<Command>,
        generation: u64,
        outcome: Outcome,
    ) {
        let claimed = router.queue().lock().complete(command, generation);
        if !claimed {
            router.stats.record_stale();
            warn!(
                route = %router.route(),
                generation,
                "discarding completion for a command no longer inflight"
            );
            return;
        }

        router.stats.record_completed();
        debug!(route = %router.route(), seq = command.seq(), ?outcome, "command complete");
        command.finish(outcome);

        self.drain(router);
        self.kick_deferred();
    }

    /// Withdraw a command whose waiter gave up on the current attempt.
    ///
    /// Returns false when a completion already claimed the attempt.
    ///
    /// A command that has held the slot past the timeout while `command`
    /// waited behind it is expired and finished with `TimedOut`.
    pub(crate) fn abandon(&self, router: &Router, command: &Arc<Command>) -> bool {
        let (withdrawn, expired) = {
            let mut queue = router.queue().lock();
            let withdrawn = queue.abandon(command);
            let expired = if withdrawn {
                queue.expire_inflight(self.config.timeout())
            } else {
                None
            };
            (withdrawn, expired)
        };
        if !withdrawn {
            return false;
        }

        router.stats.record_timeout();
        if let Some(expired) = expired {
            self.expire(router, &expired);
        }
        self.drain(router);
        self.kick_deferred();
        true
    }

    /// Finish a command whose slot was released by `expire_inflight`.
    pub(crate) fn expire(&self, router: &Router, command: &Arc<Command>) {
        router.stats.record_timeout();
        warn!(
            route = %router.route(),
            seq = command.seq(),
            kind = ?command.kind(),
            "inflight command expired"
        );
        command.finish(Outcome::TimedOut);
    }

    fn discover(&self, router: &Arc<Router>) -> Result<()> {
        let addr = ConfigAddress::new(Space::Router, 0, ROUTER_CS_0, ROUTER_BASIC_DWORDS)?;
        let words = crate::access::run_polled(self, router, CommandKind::Read, addr, Vec::new())?;
        let basic = RouterBasic::decode(&words).ok_or_else(|| {
            TbError::Protocol(format!(
                "router basic registers: expected {} dwords, got {}",
                ROUTER_BASIC_DWORDS,
                words.len()
            ))
        })?;

        if basic.depth != router.depth() {
            return Err(TbError::Protocol(format!(
                "router at {} reports depth {}, route has depth {}",
                router.route(),
                basic.depth,
                router.depth()
            )));
        }

        let identity = RouterIdentity::from_basic(&basic, self.config.max_adapters);
        self.tree
            .write()
            .set_adapter_count(router.id(), identity.max_adapter)?;
        router.set_identity(identity);

        info!(
            route = %router.route(),
            vendor = format_args!("{:#06x}", identity.vendor_id),
            device = format_args!("{:#06x}", identity.device_id),
            max_adapter = identity.max_adapter,
            flavor = ?identity.flavor,
            "router discovered"
        );
        Ok(())
    }

    /// Run discovery and unlink the router again if it fails.
    fn discover_or_unlink(&self, router: &Arc<Router>) -> Result<()> {
        if let Err(err) = self.discover(router) {
            warn!(route = %router.route(), error = %err, "router discovery failed");
            router.mark_detached();
            if let Err(remove_err) = self.tree.write().remove(router.id()) {
                warn!(
                    route = %router.route(),
                    error = %remove_err,
                    "unlinking undiscovered router failed"
                );
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Handle to one topology instance. Cheap to clone.
#[derive(Clone)]
pub struct Topology {
    pub(crate) inner: Arc<TopologyInner>,
}

impl Topology {
    /// Create a builder with default configuration.
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    /// Attach the host router on `transport` with default configuration.
    pub fn attach_root(transport: Arc<dyn FrameTransport>) -> Result<Self> {
        TopologyBuilder::new().attach_root(transport)
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The host router, unless it has been detached.
    pub fn root(&self) -> Option<Arc<Router>> {
        let tree = self.inner.tree.read();
        tree.root().and_then(|id| tree.get(id).cloned())
    }

    /// Resolve a route to its router.
    pub fn lookup(&self, route: Route) -> Result<Arc<Router>> {
        self.inner.resolve(route)
    }

    /// Router by handle.
    pub fn router(&self, id: NodeId) -> Option<Arc<Router>> {
        self.inner.router(id)
    }

    /// Parent of `router`; `None` for the host router.
    pub fn parent(&self, router: &Router) -> Option<Arc<Router>> {
        let tree = self.inner.tree.read();
        tree.parent(router.id()).and_then(|id| tree.get(id).cloned())
    }

    /// Routers directly below `router`, with the adapter each hangs off.
    pub fn children(&self, router: &Router) -> Vec<(u8, Arc<Router>)> {
        let tree = self.inner.tree.read();
        tree.children(router.id())
            .into_iter()
            .filter_map(|(adapter, id)| tree.get(id).map(|r| (adapter, r.clone())))
            .collect()
    }

    /// Number of attached routers.
    pub fn len(&self) -> usize {
        self.inner.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tree.read().is_empty()
    }

    /// Link a router one hop below `parent` and discover it.
    pub fn attach_child(&self, parent: &Router, route: Route) -> Result<Arc<Router>> {
        let router = {
            let mut tree = self.inner.tree.write();
            let id = tree.allocate_id();
            let router = Arc::new(Router::new(id, route));
            tree.insert(parent.id(), id, route, router.clone())?;
            router
        };
        debug!(route = %route, parent = %parent.route(), "router linked");

        self.inner.discover_or_unlink(&router)?;
        Ok(router)
    }

    /// Remove `router` and everything below it.
    ///
    /// Inflight commands older than the timeout are expired first. Fails
    /// with `Busy` and leaves the topology unchanged if any router of the
    /// subtree still has queued or inflight commands.
    pub fn detach(&self, router: &Router) -> Result<()> {
        let mut expired = Vec::new();
        let result = self.detach_locked(router, &mut expired);

        for (router, command) in &expired {
            self.inner.expire(router, command);
        }
        if result.is_err() {
            for (router, _) in &expired {
                self.inner.drain(router);
            }
            self.inner.kick_deferred();
        }
        result
    }

    fn detach_locked(
        &self,
        router: &Router,
        expired: &mut Vec<(Arc<Router>, Arc<Command>)>,
    ) -> Result<()> {
        let mut tree = self.inner.tree.write();
        let ids = tree.subtree(router.id());
        if ids.is_empty() {
            return Err(TbError::NotFound);
        }

        let routers: Vec<Arc<Router>> = ids.iter().filter_map(|&id| tree.get(id).cloned()).collect();
        let timeout = self.inner.config.timeout();
        for router in &routers {
            if let Some(command) = router.queue().lock().expire_inflight(timeout) {
                expired.push((router.clone(), command));
            }
        }
        if let Some(busy) = routers.iter().find(|r| r.outstanding() > 0) {
            warn!(route = %busy.route(), "detach refused, commands outstanding");
            return Err(TbError::Busy);
        }

        for (id, router) in ids.into_iter().zip(routers) {
            router.mark_detached();
            tree.remove(id)?;
            info!(route = %router.route(), "router detached");
        }
        Ok(())
    }

    /// Stream of hot-plug events received from the fabric.
    ///
    /// Events are acknowledged whether or not a receiver exists. Calling
    /// this again replaces the previous receiver.
    pub fn hotplug_events(&self) -> mpsc::UnboundedReceiver<HotplugEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.hotplug_tx.lock() = Some(tx);
        rx
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("routers", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Fluent configuration of a topology before its host router is attached.
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    config: EngineConfig,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Resubmissions after a timed-out attempt.
    /// Default: 3
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Per-attempt response timeout.
    /// Default: 2s
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = millis(timeout);
        self
    }

    /// Sleep step of polled waits.
    /// Default: 100ms
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = millis(interval);
        self
    }

    /// Wait after requesting sleep before the first sleep-ready check.
    /// Default: 50ms
    pub fn sleep_ready_wait(mut self, wait: Duration) -> Self {
        self.config.sleep_ready_wait_ms = millis(wait);
        self
    }

    /// Sleep-ready checks before suspend gives up.
    /// Default: 10
    pub fn sleep_ready_attempts(mut self, attempts: u32) -> Self {
        self.config.sleep_ready_attempts = attempts;
        self
    }

    /// Clamp for the adapter count routers report.
    /// Default: 64
    pub fn max_adapters(mut self, max: u8) -> Self {
        self.config.max_adapters = max;
        self
    }

    /// Register completion handlers on `transport` and discover the host
    /// router.
    pub fn attach_root(self, transport: Arc<dyn FrameTransport>) -> Result<Topology> {
        self.config.validate()?;

        let inner = Arc::new(TopologyInner {
            config: self.config,
            transport,
            tree: RwLock::new(RouterTree::new()),
            deferred: Mutex::new(Vec::new()),
            next_command: AtomicU64::new(1),
            hotplug_tx: Mutex::new(None),
        });
        dispatch::register(&inner)?;

        let root = {
            let mut tree = inner.tree.write();
            let id = tree.allocate_id();
            let root = Arc::new(Router::new(id, Route::ROOT));
            tree.insert_root(id, root.clone())?;
            root
        };

        inner.discover_or_unlink(&root)?;
        Ok(Topology { inner })
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
