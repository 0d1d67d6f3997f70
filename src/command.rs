//! Command objects: one config read or write transaction.
//!
//! A command owns its transport frame for its whole life and re-encodes it
//! before every attempt with a fresh sequence number. Completion needs two
//! independent signals from the transport, the transmit completion of the
//! request frame and the response packet, and whichever arrives second
//! finishes the command:
//!
//! ```text
//!            begin_attempt
//!  Idle ─────────────────────► Queued ──drain──► Inflight ──┬─ REQ+RESP ─► Done
//!   ▲                            ▲                 │        └─ event ────► Done
//!   └──── abandon (timeout) ─────┴─────── Busy ────┘
//! ```
//!
//! Waiters block on a per-command condition variable (or poll a flag), so a
//! late completion for an abandoned attempt can be told apart by its
//! generation without touching any other command.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TbError, TransportError};
use crate::protocol::{ConfigAddress, NotifyEvent, Pdf, ReadRequest, Route, WriteRequest, WORD_SIZE};
use crate::transport::{CommandId, FrameContext, FrameTransport, NodeId, TxFrame};

/// Completion flag bits.
pub mod flags {
    /// Transmit completion of the request frame was seen.
    pub const REQ_COMPLETE: u8 = 0x01;
    /// Response packet was seen.
    pub const RESP_COMPLETE: u8 = 0x02;
    pub const BOTH: u8 = REQ_COMPLETE | RESP_COMPLETE;
}

/// Packet header plus CRC word, in dwords.
const FRAME_OVERHEAD_DWORDS: usize = 4;

/// Callback invoked with the terminal result of an asynchronous command.
pub type CommandCallback = Box<dyn FnOnce(Result<Vec<u32>>) + Send + 'static>;

/// Operation kind of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Read,
    Write,
}

impl CommandKind {
    /// Packet type the request and its response travel with.
    #[inline]
    pub fn pdf(&self) -> Pdf {
        match self {
            CommandKind::Read => Pdf::Read,
            CommandKind::Write => Pdf::Write,
        }
    }
}

/// Lifecycle phase of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created or abandoned; not known to any queue.
    Idle,
    /// Waiting in a router's FIFO.
    Queued,
    /// Holding the router's inflight slot.
    Inflight,
    /// Terminal state reached for the current attempt.
    Done,
}

/// Terminal state of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Response received; read data (empty for writes).
    Completed(Vec<u32>),
    /// An asynchronous notification interrupted the attempt.
    Event(NotifyEvent),
    /// The transport refused the request frame.
    Failed(TransportError),
    /// The attempt held its router's slot past the timeout and was
    /// released to let queued commands through.
    TimedOut,
}

impl Outcome {
    /// Caller-visible result. An event overrides any data received.
    pub fn into_result(self) -> Result<Vec<u32>> {
        match self {
            Outcome::Completed(data) => Ok(data),
            Outcome::Event(event) => Err(TbError::AsyncEvent(event)),
            Outcome::Failed(err) => Err(err.into()),
            Outcome::TimedOut => Err(TbError::Timeout),
        }
    }
}

#[derive(Debug)]
struct CommandState {
    phase: Phase,
    inflight_since: Option<Instant>,
    response: Option<Vec<u32>>,
    outcome: Option<Outcome>,
}

/// One config-space transaction against one router.
pub struct Command {
    id: CommandId,
    node: NodeId,
    route: Route,
    kind: CommandKind,
    addr: ConfigAddress,
    payload: Vec<u32>,
    generation: AtomicU64,
    seq: AtomicU8,
    flags: AtomicU8,
    poll_complete: AtomicBool,
    state: Mutex<CommandState>,
    done: Condvar,
    callback: Mutex<Option<CommandCallback>>,
    frame: Mutex<Option<TxFrame>>,
    transport: Arc<dyn FrameTransport>,
}

impl Command {
    /// Create a command and take a frame for it from the transport pool.
    ///
    /// Fails with `ResourceExhausted` when the pool is empty.
    pub fn new(
        id: CommandId,
        node: NodeId,
        route: Route,
        kind: CommandKind,
        addr: ConfigAddress,
        payload: Vec<u32>,
        transport: Arc<dyn FrameTransport>,
    ) -> Result<Self> {
        if kind == CommandKind::Write && payload.len() != addr.dwords as usize {
            return Err(TbError::InvalidArgument(format!(
                "write of {} dwords carries {} data words",
                addr.dwords,
                payload.len()
            )));
        }

        let frame = match transport.allocate_frame() {
            Ok(frame) => frame,
            Err(TransportError::Busy) => return Err(TbError::ResourceExhausted),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            id,
            node,
            route,
            kind,
            addr,
            payload,
            generation: AtomicU64::new(0),
            seq: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            poll_complete: AtomicBool::new(false),
            state: Mutex::new(CommandState {
                phase: Phase::Idle,
                inflight_since: None,
                response: None,
                outcome: None,
            }),
            done: Condvar::new(),
            callback: Mutex::new(None),
            frame: Mutex::new(Some(frame)),
            transport,
        })
    }

    #[inline]
    pub fn id(&self) -> CommandId {
        self.id
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[inline]
    pub fn route(&self) -> Route {
        self.route
    }

    #[inline]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    #[inline]
    pub fn addr(&self) -> ConfigAddress {
        self.addr
    }

    /// Attempt counter; 0 before the first attempt.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Sequence number carried on the wire by the current attempt.
    #[inline]
    pub fn seq(&self) -> u8 {
        self.seq.load(Ordering::Acquire)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let mut state = self.state.lock();
        state.phase = phase;
        state.inflight_since = (phase == Phase::Inflight).then(Instant::now);
    }

    /// How long the current attempt has held its router's slot.
    pub fn inflight_for(&self) -> Option<Duration> {
        self.state.lock().inflight_since.map(|since| since.elapsed())
    }

    /// Install the completion callback (asynchronous mode).
    pub(crate) fn set_callback(&self, callback: CommandCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Reset per-attempt state and re-encode the request frame with `seq`.
    ///
    /// Returns the new generation.
    pub(crate) fn begin_attempt(&self, seq: u8) -> u64 {
        let seq = seq & 0x3;
        // Completion marks check the generation under the same lock.
        let generation = {
            let mut state = self.state.lock();
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            self.seq.store(seq, Ordering::Release);
            self.flags.store(0, Ordering::Release);
            self.poll_complete.store(false, Ordering::Release);
            state.phase = Phase::Idle;
            state.inflight_since = None;
            state.response = None;
            state.outcome = None;
            generation
        };

        let addr = self.addr.with_seq(seq);
        let data = match self.kind {
            CommandKind::Read => ReadRequest {
                route: self.route,
                addr,
            }
            .encode(),
            CommandKind::Write => WriteRequest {
                route: self.route,
                addr,
                data: self.payload.clone(),
            }
            .encode(),
        };
        let resp_len = match self.kind {
            CommandKind::Read => (self.addr.dwords as usize + FRAME_OVERHEAD_DWORDS) * WORD_SIZE,
            CommandKind::Write => FRAME_OVERHEAD_DWORDS * WORD_SIZE,
        };

        if let Some(frame) = self.frame.lock().as_mut() {
            frame.pdf = self.kind.pdf();
            frame.data = data;
            frame.resp_len = resp_len;
            frame.context = FrameContext::Command {
                node: self.node,
                command: self.id,
                generation,
            };
        }
        generation
    }

    /// Run `f` on the request frame.
    pub(crate) fn with_frame<R>(
        &self,
        f: impl FnOnce(&TxFrame) -> std::result::Result<R, TransportError>,
    ) -> std::result::Result<R, TransportError> {
        match self.frame.lock().as_ref() {
            Some(frame) => f(frame),
            None => Err(TransportError::Failed("command frame released".to_string())),
        }
    }

    /// Record one completion signal for attempt `generation`, storing
    /// `response` with it.
    ///
    /// Returns true for exactly one caller: the one whose signal made the
    /// attempt complete. Signals for any other attempt are ignored.
    pub(crate) fn mark(&self, generation: u64, bit: u8, response: Option<Vec<u32>>) -> bool {
        let mut state = self.state.lock();
        if self.generation() != generation {
            return false;
        }
        if response.is_some() {
            state.response = response;
        }
        let prev = self.flags.fetch_or(bit, Ordering::AcqRel);
        prev != flags::BOTH && (prev | bit) == flags::BOTH
    }

    /// Force both completion flags of attempt `generation` (events,
    /// submission failures, expiry).
    ///
    /// Returns false if that attempt was already complete or superseded.
    pub(crate) fn mark_all(&self, generation: u64) -> bool {
        let _state = self.state.lock();
        if self.generation() != generation {
            return false;
        }
        self.flags.fetch_or(flags::BOTH, Ordering::AcqRel) != flags::BOTH
    }

    /// Response words stashed for the current attempt.
    pub(crate) fn take_response(&self) -> Vec<u32> {
        self.state.lock().response.take().unwrap_or_default()
    }

    /// Set the terminal state, wake waiters, and run the callback if any.
    pub(crate) fn finish(&self, outcome: Outcome) {
        {
            let mut state = self.state.lock();
            state.phase = Phase::Done;
            state.outcome = Some(outcome.clone());
            self.poll_complete.store(true, Ordering::Release);
            self.done.notify_all();
        }

        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(outcome.into_result());
        }
    }

    /// Flag observed by polled waiters.
    #[inline]
    pub fn is_poll_complete(&self) -> bool {
        self.poll_complete.load(Ordering::Acquire)
    }

    /// Take the terminal outcome if the attempt is done.
    pub(crate) fn take_outcome(&self) -> Option<Outcome> {
        let mut state = self.state.lock();
        if state.phase == Phase::Done {
            state.outcome.take()
        } else {
            None
        }
    }

    /// Block until the attempt is done or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.phase != Phase::Done {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.phase == Phase::Done {
            state.outcome.take()
        } else {
            None
        }
    }

    /// Block until a completion already underway has finished the attempt.
    pub(crate) fn wait_finished(&self) -> Option<Outcome> {
        let mut state = self.state.lock();
        while state.phase != Phase::Done {
            self.done.wait(&mut state);
        }
        state.outcome.take()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("route", &self.route)
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("generation", &self.generation())
            .finish()
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.get_mut().take() {
            self.transport.free_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Space;
    use crate::transport::PdfDispatch;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Pool {
        allocated: AtomicUsize,
        freed: AtomicUsize,
        exhausted: AtomicBool,
    }

    impl FrameTransport for Pool {
        fn allocate_frame(&self) -> std::result::Result<TxFrame, TransportError> {
            if self.exhausted.load(Ordering::SeqCst) {
                return Err(TransportError::Busy);
            }
            let index = self.allocated.fetch_add(1, Ordering::SeqCst);
            Ok(TxFrame::new(index as u32))
        }

        fn free_frame(&self, _frame: TxFrame) {
            self.freed.fetch_add(1, Ordering::SeqCst);
        }

        fn submit(&self, _frame: &TxFrame) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn register_pdf(
            &self,
            _tx: Vec<PdfDispatch>,
            _rx: Vec<PdfDispatch>,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn read_command(pool: &Arc<Pool>) -> Command {
        let addr = ConfigAddress::new(Space::Router, 0, 0, 2).unwrap();
        Command::new(
            CommandId(1),
            NodeId(0),
            Route::ROOT,
            CommandKind::Read,
            addr,
            Vec::new(),
            pool.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_frame_freed_on_drop() {
        let pool = Arc::new(Pool::default());
        let cmd = read_command(&pool);
        assert_eq!(pool.allocated.load(Ordering::SeqCst), 1);
        drop(cmd);
        assert_eq!(pool.freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = Arc::new(Pool::default());
        pool.exhausted.store(true, Ordering::SeqCst);
        let addr = ConfigAddress::new(Space::Router, 0, 0, 1).unwrap();
        let result = Command::new(
            CommandId(1),
            NodeId(0),
            Route::ROOT,
            CommandKind::Read,
            addr,
            Vec::new(),
            pool,
        );
        assert!(matches!(result, Err(TbError::ResourceExhausted)));
    }

    #[test]
    fn test_write_length_checked() {
        let pool = Arc::new(Pool::default());
        let addr = ConfigAddress::new(Space::Router, 0, 0, 2).unwrap();
        let result = Command::new(
            CommandId(1),
            NodeId(0),
            Route::ROOT,
            CommandKind::Write,
            addr,
            vec![1],
            pool,
        );
        assert!(matches!(result, Err(TbError::InvalidArgument(_))));
    }

    fn frame_generation(cmd: &Command) -> Option<u64> {
        cmd.with_frame(|frame| match frame.context {
            FrameContext::Command { generation, .. } => Ok(Some(generation)),
            FrameContext::HotplugAck => Ok(None),
        })
        .unwrap()
    }

    #[test]
    fn test_attempt_reencodes_with_seq() {
        let pool = Arc::new(Pool::default());
        let cmd = read_command(&pool);

        for expected in 1..=5u64 {
            let generation = cmd.begin_attempt(expected as u8);
            assert_eq!(generation, expected);
            let req = cmd
                .with_frame(|frame| Ok(ReadRequest::decode(&frame.data).unwrap()))
                .unwrap();
            assert_eq!(req.addr.seq, (expected & 0x3) as u8);
            assert_eq!(cmd.seq(), (expected & 0x3) as u8);
            assert_eq!(frame_generation(&cmd), Some(expected));
        }
    }

    #[test]
    fn test_exactly_one_side_completes() {
        let pool = Arc::new(Pool::default());
        let cmd = read_command(&pool);
        let first = cmd.begin_attempt(0);

        assert!(!cmd.mark(first, flags::RESP_COMPLETE, Some(vec![1, 2])));
        assert!(cmd.mark(first, flags::REQ_COMPLETE, None));
        assert!(!cmd.mark(first, flags::REQ_COMPLETE, None));
        assert!(!cmd.mark_all(first));
        assert_eq!(cmd.take_response(), vec![1, 2]);

        let second = cmd.begin_attempt(0);
        assert!(cmd.mark_all(second));
        assert!(!cmd.mark(second, flags::RESP_COMPLETE, None));
    }

    #[test]
    fn test_signal_for_superseded_attempt_is_ignored() {
        let pool = Arc::new(Pool::default());
        let cmd = read_command(&pool);
        let old = cmd.begin_attempt(1);
        let new = cmd.begin_attempt(2);

        // The old attempt's transmit completion must not count for the new one.
        assert!(!cmd.mark(old, flags::REQ_COMPLETE, None));
        assert!(!cmd.mark(old, flags::RESP_COMPLETE, Some(vec![9, 9])));
        assert!(!cmd.mark_all(old));
        assert!(!cmd.mark(new, flags::RESP_COMPLETE, Some(vec![3, 4])));
        assert!(cmd.mark(new, flags::REQ_COMPLETE, None));
        assert_eq!(cmd.take_response(), vec![3, 4]);
    }

    #[test]
    fn test_inflight_age_tracks_phase() {
        let pool = Arc::new(Pool::default());
        let cmd = read_command(&pool);
        cmd.begin_attempt(0);
        assert_eq!(cmd.inflight_for(), None);

        cmd.set_phase(Phase::Inflight);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cmd.inflight_for().unwrap() >= Duration::from_millis(5));

        cmd.set_phase(Phase::Queued);
        assert_eq!(cmd.inflight_for(), None);
    }

    #[test]
    fn test_finish_wakes_waiter_and_runs_callback() {
        let pool = Arc::new(Pool::default());
        let cmd = Arc::new(read_command(&pool));
        cmd.begin_attempt(0);

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        cmd.set_callback(Box::new(move |result| {
            *sink.lock() = Some(result.map_err(|e| e.to_string()));
        }));

        let finisher = cmd.clone();
        let handle = std::thread::spawn(move || {
            finisher.finish(Outcome::Completed(vec![7, 8]));
        });

        let outcome = cmd.wait(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(outcome, Some(Outcome::Completed(vec![7, 8])));
        assert!(cmd.is_poll_complete());
        assert_eq!(*seen.lock(), Some(Ok(vec![7, 8])));
    }

    #[test]
    fn test_wait_times_out() {
        let pool = Arc::new(Pool::default());
        let cmd = read_command(&pool);
        cmd.begin_attempt(0);

        let start = Instant::now();
        assert_eq!(cmd.wait(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_event_overrides_data() {
        let result = Outcome::Event(NotifyEvent::LockError).into_result();
        assert!(matches!(result, Err(TbError::AsyncEvent(NotifyEvent::LockError))));
        assert!(matches!(Outcome::TimedOut.into_result(), Err(TbError::Timeout)));
    }
}
