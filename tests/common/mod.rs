//! Simulated router fabric for integration tests.
//!
//! Implements `FrameTransport` over a set of in-memory config spaces. A
//! worker thread plays the interrupt context: for every accepted request it
//! delivers the transmit completion and then the response (or an injected
//! notification), in order.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use tbcfg::protocol::regs::{
    cap, cs5, cs6, encode_cap_header, encode_vsec_header, RouterBasic, ROUTER_CS_0, ROUTER_CS_1,
    ROUTER_CS_5, ROUTER_CS_6, ROUTER_CS_7, ROUTER_CS_8,
};
use tbcfg::protocol::{
    HotplugPacket, NotifyPacket, Pdf, ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};
use tbcfg::{
    CompletedFrame, FrameHandler, FrameTransport, NotifyEvent, PdfDispatch, Route, Space,
    TransportError, TxFrame,
};

pub const FRAME_POOL: usize = 64;

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type SpaceKey = (Route, Space, u8);

enum Job {
    Tx(CompletedFrame),
    Rx {
        pdf: Pdf,
        payload: Bytes,
        delay: Duration,
        answers: Option<Route>,
    },
}

#[derive(Default)]
struct Handlers {
    tx: HashMap<Pdf, FrameHandler>,
    rx: HashMap<Pdf, FrameHandler>,
}

#[derive(Default)]
struct Faults {
    busy: usize,
    fail: Option<TransportError>,
    drop_responses: usize,
    delay: Duration,
    event: Option<NotifyEvent>,
    sleep_ready: bool,
}

#[derive(Default)]
struct Fabric {
    spaces: HashMap<SpaceKey, HashMap<u16, u32>>,
    routers: Vec<Route>,
    requests: Vec<(Pdf, Route, u16, Vec<u32>)>,
    acks: Vec<NotifyPacket>,
    outstanding: HashMap<Route, usize>,
    max_outstanding: HashMap<Route, usize>,
}

struct Shared {
    handlers: Mutex<Handlers>,
    fabric: Mutex<Fabric>,
    pending_jobs: Mutex<usize>,
    idle: Condvar,
}

/// In-memory fabric of routers.
pub struct SimFabric {
    shared: Arc<Shared>,
    faults: Mutex<Faults>,
    jobs: Mutex<mpsc::Sender<Job>>,
    frames_out: AtomicUsize,
    next_index: AtomicUsize,
}

impl SimFabric {
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(Shared {
            handlers: Mutex::new(Handlers::default()),
            fabric: Mutex::new(Fabric::default()),
            pending_jobs: Mutex::new(0),
            idle: Condvar::new(),
        });
        let (tx, rx) = mpsc::channel::<Job>();

        let worker = shared.clone();
        thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                worker.run(job);
                let mut pending = worker.pending_jobs.lock();
                *pending -= 1;
                if *pending == 0 {
                    worker.idle.notify_all();
                }
            }
        });

        Arc::new(Self {
            shared,
            faults: Mutex::new(Faults {
                sleep_ready: true,
                ..Faults::default()
            }),
            jobs: Mutex::new(tx),
            frames_out: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
        })
    }

    /// Add a router with the given vendor and adapter count. Its depth is
    /// taken from the route.
    pub fn add_router(&self, route: Route, vendor_id: u16, max_adapter: u8) {
        let mut fabric = self.shared.fabric.lock();
        let space = fabric
            .spaces
            .entry((route, Space::Router, 0))
            .or_default();
        space.insert(ROUTER_CS_0, 0x15ef_0000 | vendor_id as u32);
        space.insert(
            ROUTER_CS_1,
            RouterBasic::encode_cs1(0, 1, max_adapter, route.depth(), 0x01),
        );
        space.insert(ROUTER_CS_7, 0x5000_0000 | route.raw() as u32);
        space.insert(ROUTER_CS_8, 0x0a0b_0c0d);
        fabric.routers.push(route);
    }

    /// Remove a router; requests to it go unanswered.
    pub fn unplug(&self, route: Route) {
        let mut fabric = self.shared.fabric.lock();
        fabric.routers.retain(|r| *r != route);
    }

    pub fn set_router_words(&self, route: Route, offset: u16, words: &[u32]) {
        self.set_words(route, Space::Router, 0, offset, words);
    }

    pub fn set_adapter_words(&self, route: Route, adapter: u8, offset: u16, words: &[u32]) {
        self.set_words(route, Space::Adapter, adapter, offset, words);
    }

    fn set_words(&self, route: Route, space: Space, adapter: u8, offset: u16, words: &[u32]) {
        let mut fabric = self.shared.fabric.lock();
        let map = fabric.spaces.entry((route, space, adapter)).or_default();
        for (i, word) in words.iter().enumerate() {
            map.insert(offset + i as u16, *word);
        }
    }

    pub fn router_word(&self, route: Route, offset: u16) -> u32 {
        let fabric = self.shared.fabric.lock();
        fabric
            .spaces
            .get(&(route, Space::Router, 0))
            .and_then(|m| m.get(&offset).copied())
            .unwrap_or(0)
    }

    /// Install a router capability chain starting at `first`:
    /// `(offset, header words)` per block, linked in the order given.
    pub fn set_router_chain(&self, route: Route, first: u8, blocks: &[(u16, Vec<u32>)]) {
        let cs1 = self.router_word(route, ROUTER_CS_1);
        self.set_router_words(route, ROUTER_CS_1, &[(cs1 & !0xff) | first as u32]);
        for (offset, words) in blocks {
            self.set_router_words(route, *offset, words);
        }
    }

    /// Install an Intel link-controller VSEC at `offset` holding `uuid`.
    pub fn set_link_controller(&self, route: Route, offset: u16, uuid: [u32; 4]) {
        self.set_router_chain(
            route,
            offset as u8,
            &[(
                offset,
                vec![
                    encode_cap_header(0, cap::VENDOR_SPECIFIC, cap::INTEL_VSEC_LC, 0),
                    encode_vsec_header(0, 0x10),
                ],
            )],
        );
        self.set_router_words(route, offset + cap::LC_UUID, &uuid);
    }

    /// Refuse the next `count` submissions with Busy.
    pub fn set_busy(&self, count: usize) {
        self.faults.lock().busy = count;
    }

    /// Refuse the next submission with `err`.
    pub fn fail_next(&self, err: TransportError) {
        self.faults.lock().fail = Some(err);
    }

    /// Transmit the next `count` requests but never answer them.
    pub fn drop_responses(&self, count: usize) {
        self.faults.lock().drop_responses = count;
    }

    /// Delay every response by `delay`.
    pub fn set_response_delay(&self, delay: Duration) {
        self.faults.lock().delay = delay;
    }

    /// Answer the next request with a notification instead of a response.
    pub fn event_on_next(&self, event: NotifyEvent) {
        self.faults.lock().event = Some(event);
    }

    /// Whether writing ROUTER_CS_5.SLP sets ROUTER_CS_6.SLPR.
    pub fn set_sleep_ready(&self, ready: bool) {
        self.faults.lock().sleep_ready = ready;
    }

    /// Deliver a hot-plug event from `route`.
    pub fn inject_hotplug(&self, route: Route, adapter: u8, unplug: bool) {
        let packet = HotplugPacket {
            route,
            adapter,
            unplug,
        };
        self.inject(Pdf::Hotplug, packet.encode());
    }

    /// Deliver a notification from `route`.
    pub fn inject_notify(&self, route: Route, code: u8, adapter: u8) {
        let packet = NotifyPacket {
            route,
            code,
            adapter,
            plug: 0,
        };
        self.inject(Pdf::Notify, packet.encode());
    }

    /// Deliver raw packet bytes as a receive completion.
    pub fn inject(&self, pdf: Pdf, payload: Bytes) {
        self.queue(Job::Rx {
            pdf,
            payload,
            delay: Duration::ZERO,
            answers: None,
        });
    }

    /// Block until every queued completion has been delivered.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending_jobs.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Hot-plug acknowledgments received so far.
    pub fn acks(&self) -> Vec<NotifyPacket> {
        self.shared.fabric.lock().acks.clone()
    }

    /// Accepted requests as `(pdf, route, offset, data)`.
    pub fn requests(&self) -> Vec<(Pdf, Route, u16, Vec<u32>)> {
        self.shared.fabric.lock().requests.clone()
    }

    /// Most requests ever awaiting an answer at once for `route`.
    pub fn max_outstanding(&self, route: Route) -> usize {
        self.shared
            .fabric
            .lock()
            .max_outstanding
            .get(&route)
            .copied()
            .unwrap_or(0)
    }

    /// Frames allocated and not yet freed.
    pub fn frames_in_use(&self) -> usize {
        self.frames_out.load(Ordering::SeqCst)
    }

    fn queue(&self, job: Job) {
        *self.shared.pending_jobs.lock() += 1;
        let _ = self.jobs.lock().send(job);
    }

    /// Build the far end's answer to a request, if it sends one.
    fn answer(&self, frame: &TxFrame) -> Result<Option<(Pdf, Bytes, Route)>, TransportError> {
        let mut faults = self.faults.lock();
        let mut fabric = self.shared.fabric.lock();

        let (route, addr, reply) = match frame.pdf {
            Pdf::Read => {
                let req = ReadRequest::decode(&frame.data)
                    .map_err(|e| TransportError::Failed(e.to_string()))?;
                fabric
                    .requests
                    .push((Pdf::Read, req.route, req.addr.offset, Vec::new()));
                let space = fabric.spaces.get(&(req.route, req.addr.space, req.addr.adapter));
                let data = (0..req.addr.dwords as u16)
                    .map(|i| {
                        space
                            .and_then(|m| m.get(&(req.addr.offset + i)).copied())
                            .unwrap_or(0)
                    })
                    .collect();
                let reply = ReadResponse {
                    route: req.route,
                    addr: req.addr,
                    data,
                }
                .encode();
                (req.route, req.addr, reply)
            }
            Pdf::Write => {
                let req = WriteRequest::decode(&frame.data)
                    .map_err(|e| TransportError::Failed(e.to_string()))?;
                fabric
                    .requests
                    .push((Pdf::Write, req.route, req.addr.offset, req.data.clone()));
                if fabric.routers.contains(&req.route) {
                    let map = fabric
                        .spaces
                        .entry((req.route, req.addr.space, req.addr.adapter))
                        .or_default();
                    for (i, word) in req.data.iter().enumerate() {
                        map.insert(req.addr.offset + i as u16, *word);
                    }
                    let sleep = req.addr.space == Space::Router
                        && req.addr.offset == ROUTER_CS_5
                        && req.data.first().is_some_and(|w| w & cs5::SLP != 0);
                    if sleep && faults.sleep_ready {
                        let cs6 = map.get(&ROUTER_CS_6).copied().unwrap_or(0);
                        map.insert(ROUTER_CS_6, cs6 | cs6::SLPR);
                    }
                }
                let reply = WriteResponse {
                    route: req.route,
                    addr: req.addr,
                }
                .encode();
                (req.route, req.addr, reply)
            }
            Pdf::Notify => {
                let ack = NotifyPacket::decode(&frame.data)
                    .map_err(|e| TransportError::Failed(e.to_string()))?;
                fabric.acks.push(ack);
                return Ok(None);
            }
            Pdf::Hotplug => return Ok(None),
        };

        if !fabric.routers.contains(&route) {
            return Ok(None);
        }
        if faults.drop_responses > 0 {
            faults.drop_responses -= 1;
            return Ok(None);
        }
        if let Some(event) = faults.event.take() {
            let notify = NotifyPacket {
                route,
                code: event.code(),
                adapter: addr.adapter,
                plug: 0,
            };
            return Ok(Some((Pdf::Notify, notify.encode(), route)));
        }

        let count = fabric.outstanding.entry(route).or_default();
        *count += 1;
        let current = *count;
        let max = fabric.max_outstanding.entry(route).or_default();
        *max = (*max).max(current);
        Ok(Some((frame.pdf, reply, route)))
    }
}

impl Shared {
    fn run(&self, job: Job) {
        match job {
            Job::Tx(frame) => {
                let handler = self.handlers.lock().tx.get(&frame.pdf).cloned();
                if let Some(handler) = handler {
                    handler(&frame);
                }
            }
            Job::Rx {
                pdf,
                payload,
                delay,
                answers,
            } => {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                if let Some(route) = answers {
                    if let Some(count) = self.fabric.lock().outstanding.get_mut(&route) {
                        *count = count.saturating_sub(1);
                    }
                }
                let handler = self.handlers.lock().rx.get(&pdf).cloned();
                if let Some(handler) = handler {
                    handler(&CompletedFrame::received(pdf, payload));
                }
            }
        }
    }
}

impl FrameTransport for SimFabric {
    fn allocate_frame(&self) -> Result<TxFrame, TransportError> {
        if self.frames_out.load(Ordering::SeqCst) >= FRAME_POOL {
            return Err(TransportError::Busy);
        }
        self.frames_out.fetch_add(1, Ordering::SeqCst);
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        Ok(TxFrame::new(index as u32))
    }

    fn free_frame(&self, _frame: TxFrame) {
        self.frames_out.fetch_sub(1, Ordering::SeqCst);
    }

    fn submit(&self, frame: &TxFrame) -> Result<(), TransportError> {
        {
            let mut faults = self.faults.lock();
            if faults.busy > 0 {
                faults.busy -= 1;
                return Err(TransportError::Busy);
            }
            if let Some(err) = faults.fail.take() {
                return Err(err);
            }
        }

        let delay = self.faults.lock().delay;
        let answer = self.answer(frame)?;

        if matches!(frame.pdf, Pdf::Read | Pdf::Write) {
            self.queue(Job::Tx(CompletedFrame::transmitted(frame)));
        }
        if let Some((pdf, payload, route)) = answer {
            let answers = (pdf != Pdf::Notify).then_some(route);
            self.queue(Job::Rx {
                pdf,
                payload,
                delay,
                answers,
            });
        }
        Ok(())
    }

    fn register_pdf(
        &self,
        tx: Vec<PdfDispatch>,
        rx: Vec<PdfDispatch>,
    ) -> Result<(), TransportError> {
        let mut handlers = self.shared.handlers.lock();
        for dispatch in tx {
            handlers.tx.insert(dispatch.pdf, dispatch.handler);
        }
        for dispatch in rx {
            handlers.rx.insert(dispatch.pdf, dispatch.handler);
        }
        Ok(())
    }
}

/// Route from a list of hops, for brevity in tests.
pub fn route(hops: &[u8]) -> Route {
    Route::from_hops(hops).expect("valid hops")
}
