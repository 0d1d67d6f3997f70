//! Transport module - the frame ring the engine submits to.
//!
//! The ring itself (descriptor rings, DMA, interrupt demultiplexing) lives
//! outside this crate. The engine consumes it through [`FrameTransport`]:
//!
//! ```text
//! engine ──allocate_frame/submit──► FrameTransport ──► wire
//!   ▲                                     │
//!   └──── PdfDispatch handlers ◄──────────┘ (interrupt context)
//! ```
//!
//! Completion handlers are registered per packet type, separately for
//! transmit completions (a request frame left the ring) and receive
//! completions (a packet arrived).

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;
use crate::protocol::Pdf;

/// Arena handle of a router in a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "router#{}", self.0)
    }
}

/// Identity of a command object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub(crate) u64);

/// Correlation data the engine attaches to every frame it submits.
///
/// The transport hands it back untouched in the transmit completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameContext {
    /// A config read or write issued on behalf of a command.
    Command {
        node: NodeId,
        command: CommandId,
        /// Attempt number at the time of submission.
        generation: u64,
    },
    /// A hot-plug acknowledgment; nothing waits on it.
    HotplugAck,
}

/// A fixed-size transmit frame owned by the transport's pool.
#[derive(Debug)]
pub struct TxFrame {
    /// Slot index within the transport's frame pool.
    pub index: u32,
    /// Packet type to transmit with.
    pub pdf: Pdf,
    /// Sealed request bytes.
    pub data: Bytes,
    /// Expected response length in bytes.
    pub resp_len: usize,
    /// Correlation data returned on transmit completion.
    pub context: FrameContext,
}

impl TxFrame {
    /// Create an empty frame for pool slot `index`.
    pub fn new(index: u32) -> Self {
        Self {
            index,
            pdf: Pdf::Read,
            data: Bytes::new(),
            resp_len: 0,
            context: FrameContext::HotplugAck,
        }
    }
}

/// A frame reported back by the transport.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    /// Packet type the frame was sent or received with.
    pub pdf: Pdf,
    /// Context of the submitted frame (transmit completions only).
    pub context: Option<FrameContext>,
    /// Received packet bytes (receive completions only).
    pub payload: Bytes,
}

impl CompletedFrame {
    /// A transmit completion for a submitted frame.
    pub fn transmitted(frame: &TxFrame) -> Self {
        Self {
            pdf: frame.pdf,
            context: Some(frame.context),
            payload: Bytes::new(),
        }
    }

    /// A receive completion carrying `payload`.
    pub fn received(pdf: Pdf, payload: Bytes) -> Self {
        Self {
            pdf,
            context: None,
            payload,
        }
    }
}

/// Completion callback invoked from the transport's interrupt context.
pub type FrameHandler = Arc<dyn Fn(&CompletedFrame) + Send + Sync>;

/// Handler registration for one packet type.
#[derive(Clone)]
pub struct PdfDispatch {
    pub pdf: Pdf,
    pub handler: FrameHandler,
}

impl fmt::Debug for PdfDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfDispatch").field("pdf", &self.pdf).finish()
    }
}

/// Frame ring shared by every router of one topology.
///
/// Implementations must tolerate handlers being invoked from any thread and
/// may invoke them before `submit` returns.
pub trait FrameTransport: Send + Sync {
    /// Take a frame from the pool. Fails with `Busy` when the pool is empty.
    fn allocate_frame(&self) -> Result<TxFrame, TransportError>;

    /// Return a frame to the pool.
    fn free_frame(&self, frame: TxFrame);

    /// Queue a frame for transmission. The transport copies what it needs;
    /// the caller keeps ownership. `Busy` means the ring is full for now.
    fn submit(&self, frame: &TxFrame) -> Result<(), TransportError>;

    /// Install completion handlers for transmit and receive completions.
    fn register_pdf(
        &self,
        tx: Vec<PdfDispatch>,
        rx: Vec<PdfDispatch>,
    ) -> Result<(), TransportError>;
}
