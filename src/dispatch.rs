//! Completion handlers installed on the transport.
//!
//! The transport reports two kinds of completions:
//!
//! - **transmit**: a request frame left the ring. The frame's
//!   [`FrameContext`] names the router, command, and attempt directly.
//! - **receive**: a packet arrived. Packets carry no context, only a route,
//!   so the router is found by route resolution and the command is whatever
//!   holds that router's inflight slot.
//!
//! ```text
//!  Read/Write tx ──► on_transmitted ─┐
//!  Read/Write rx ──► on_response ────┼─► REQ|RESP flags ─► complete
//!  Notify rx ─────► on_notify ───────┘   (event: immediate)
//!  Hotplug rx ────► on_hotplug ──► acknowledgment frame + event stream
//! ```
//!
//! Handlers hold a weak reference to the topology; completions arriving
//! after it is dropped are ignored.

use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};

use crate::command::{flags, CommandKind, Outcome};
use crate::error::Result;
use crate::protocol::{
    HotplugPacket, NotifyPacket, Pdf, ReadResponse, Route, WriteResponse,
};
use crate::topology::TopologyInner;
use crate::transport::{CompletedFrame, FrameContext, FrameHandler, PdfDispatch};

/// A hot-plug event received from the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugEvent {
    /// Router that raised the event.
    pub route: Route,
    /// Adapter whose plug state changed.
    pub adapter: u8,
    /// True when the adapter was unplugged.
    pub unplug: bool,
}

fn handler(
    inner: &Arc<TopologyInner>,
    f: fn(&TopologyInner, &CompletedFrame),
) -> FrameHandler {
    let weak: Weak<TopologyInner> = Arc::downgrade(inner);
    Arc::new(move |frame: &CompletedFrame| {
        if let Some(inner) = weak.upgrade() {
            f(&inner, frame);
        }
    })
}

/// Register transmit and receive handlers for every packet type.
pub(crate) fn register(inner: &Arc<TopologyInner>) -> Result<()> {
    let tx = vec![
        PdfDispatch {
            pdf: Pdf::Read,
            handler: handler(inner, on_transmitted),
        },
        PdfDispatch {
            pdf: Pdf::Write,
            handler: handler(inner, on_transmitted),
        },
    ];
    let rx = vec![
        PdfDispatch {
            pdf: Pdf::Read,
            handler: handler(inner, on_response),
        },
        PdfDispatch {
            pdf: Pdf::Write,
            handler: handler(inner, on_response),
        },
        PdfDispatch {
            pdf: Pdf::Notify,
            handler: handler(inner, on_notify),
        },
        PdfDispatch {
            pdf: Pdf::Hotplug,
            handler: handler(inner, on_hotplug),
        },
    ];
    inner.transport.register_pdf(tx, rx)?;
    Ok(())
}

/// A request frame was transmitted.
fn on_transmitted(inner: &TopologyInner, frame: &CompletedFrame) {
    let Some(FrameContext::Command {
        node,
        command,
        generation,
    }) = frame.context
    else {
        return;
    };

    let Some(router) = inner.router(node) else {
        debug!(?node, "transmit completion for a detached router");
        return;
    };

    let inflight = router.queue().lock().inflight().cloned();
    let Some(cmd) = inflight.filter(|c| c.id() == command && c.generation() == generation)
    else {
        router.stats.record_stale();
        debug!(route = %router.route(), generation, "stale transmit completion");
        return;
    };

    if cmd.mark(generation, flags::REQ_COMPLETE, None) {
        let data = cmd.take_response();
        inner.complete(&router, &cmd, generation, Outcome::Completed(data));
    }
}

/// A read or write response arrived.
fn on_response(inner: &TopologyInner, frame: &CompletedFrame) {
    let parsed = match frame.pdf {
        Pdf::Read => ReadResponse::decode(&frame.payload).map(|r| (r.route, r.addr, r.data)),
        Pdf::Write => WriteResponse::decode(&frame.payload).map(|r| (r.route, r.addr, Vec::new())),
        _ => return,
    };
    let (route, addr, mut data) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(pdf = ?frame.pdf, error = %err, "dropping malformed response");
            return;
        }
    };

    let router = match inner.resolve(route) {
        Ok(router) => router,
        Err(err) => {
            warn!(route = %route, error = %err, "response for unknown route dropped");
            return;
        }
    };

    let inflight = router.queue().lock().inflight().cloned();
    let Some(cmd) = inflight else {
        router.stats.record_stale();
        warn!(route = %route, "response with no command inflight dropped");
        return;
    };
    // Read before the seq check; `mark` rejects it if a retry began since.
    let generation = cmd.generation();
    if cmd.kind().pdf() != frame.pdf || cmd.seq() != addr.seq {
        router.stats.record_stale();
        warn!(
            route = %route,
            seq = addr.seq,
            expected = cmd.seq(),
            "response does not match the inflight attempt, dropped"
        );
        return;
    }

    let response = if cmd.kind() == CommandKind::Read {
        data.truncate(cmd.addr().dwords as usize);
        Some(data)
    } else {
        None
    };
    if cmd.mark(generation, flags::RESP_COMPLETE, response) {
        let data = cmd.take_response();
        inner.complete(&router, &cmd, generation, Outcome::Completed(data));
    }
}

/// An error or event notification arrived.
fn on_notify(inner: &TopologyInner, frame: &CompletedFrame) {
    let packet = match NotifyPacket::decode(&frame.payload) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(error = %err, "dropping malformed notification");
            return;
        }
    };

    let Some(event) = packet.event() else {
        debug!(route = %packet.route, code = packet.code, "ignoring unrecognized notification");
        return;
    };

    let router = match inner.resolve(packet.route) {
        Ok(router) => router,
        Err(err) => {
            warn!(route = %packet.route, %event, error = %err, "notification for unknown route");
            return;
        }
    };

    let inflight = router.queue().lock().inflight().cloned();
    let Some(cmd) = inflight else {
        debug!(route = %packet.route, %event, adapter = packet.adapter, "notification with no command inflight");
        return;
    };

    warn!(route = %packet.route, %event, adapter = packet.adapter, "notification interrupts inflight command");
    let generation = cmd.generation();
    if cmd.mark_all(generation) {
        inner.complete(&router, &cmd, generation, Outcome::Event(event));
    }
}

/// A hot-plug event arrived. Always acknowledged.
fn on_hotplug(inner: &TopologyInner, frame: &CompletedFrame) {
    let packet = match HotplugPacket::decode(&frame.payload) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(error = %err, "dropping malformed hot-plug event");
            return;
        }
    };
    debug!(
        route = %packet.route,
        adapter = packet.adapter,
        unplug = packet.unplug,
        "hot-plug event"
    );

    acknowledge(inner, &packet);

    let event = HotplugEvent {
        route: packet.route,
        adapter: packet.adapter,
        unplug: packet.unplug,
    };
    let mut sender = inner.hotplug_tx.lock();
    if let Some(tx) = sender.as_ref() {
        if tx.send(event).is_err() {
            *sender = None;
        }
    }
}

/// Send the acknowledgment for a hot-plug event. Failures are logged only.
fn acknowledge(inner: &TopologyInner, packet: &HotplugPacket) {
    let mut frame = match inner.transport.allocate_frame() {
        Ok(frame) => frame,
        Err(err) => {
            error!(route = %packet.route, error = %err, "no frame for hot-plug acknowledgment");
            return;
        }
    };

    let ack = NotifyPacket::hotplug_ack(packet);
    frame.pdf = Pdf::Notify;
    frame.data = ack.encode();
    frame.resp_len = 0;
    frame.context = FrameContext::HotplugAck;

    if let Err(err) = inner.transport.submit(&frame) {
        error!(route = %packet.route, error = %err, "hot-plug acknowledgment not sent");
    }
    inner.transport.free_frame(frame);
}
