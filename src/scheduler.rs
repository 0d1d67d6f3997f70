//! Per-router admission control: a FIFO of pending commands in front of a
//! single inflight slot.
//!
//! ```text
//!   enqueue ─► [ pending FIFO ] ─drain─► ( inflight slot ) ─► FrameTransport
//!                   ▲                          │
//!                   └──── Busy: back to head ──┘
//! ```
//!
//! The slot state machine is `Idle -> Draining -> Inflight -> Idle`. The
//! queue lock is dropped around the transport submission so a transport
//! that completes frames inline cannot deadlock against it; the command is
//! installed in the slot before the lock is dropped, so the inline
//! completion finds it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::command::{Command, Outcome, Phase};
use crate::error::TransportError;
use crate::topology::Router;
use crate::transport::FrameTransport;

/// Occupancy of a router's inflight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No command holds the slot.
    Idle,
    /// A command holds the slot and is being handed to the transport.
    Draining,
    /// A command holds the slot and the transport accepted it.
    Inflight,
}

/// Why a drain pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// Nothing left to submit.
    Empty,
    /// The inflight slot is occupied.
    Occupied,
    /// The transport reported Busy; the head command waits for capacity.
    Deferred,
}

/// Pending FIFO plus single inflight slot of one router.
#[derive(Debug)]
pub struct CommandQueue {
    pending: VecDeque<Arc<Command>>,
    inflight: Option<Arc<Command>>,
    state: SlotState,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            inflight: None,
            state: SlotState::Idle,
        }
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Number of commands waiting behind the slot.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Check if neither the FIFO nor the slot holds a command.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.inflight.is_none()
    }

    /// The command holding the slot.
    #[inline]
    pub fn inflight(&self) -> Option<&Arc<Command>> {
        self.inflight.as_ref()
    }

    /// Append a command to the FIFO.
    pub fn enqueue(&mut self, command: Arc<Command>) {
        command.set_phase(Phase::Queued);
        self.pending.push_back(command);
    }

    /// Move the head of the FIFO into the slot if the slot is free.
    fn begin_drain(&mut self) -> Option<Arc<Command>> {
        if self.state != SlotState::Idle {
            return None;
        }
        let command = self.pending.pop_front()?;
        command.set_phase(Phase::Inflight);
        self.inflight = Some(command.clone());
        self.state = SlotState::Draining;
        Some(command)
    }

    fn holds(&self, command: &Arc<Command>) -> bool {
        self.inflight
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, command))
    }

    fn clear_slot(&mut self) {
        self.inflight = None;
        self.state = SlotState::Idle;
    }

    /// The transport accepted the slot's command.
    fn submitted(&mut self, command: &Arc<Command>) {
        if self.holds(command) && self.state == SlotState::Draining {
            self.state = SlotState::Inflight;
        }
    }

    /// The transport was full; put the command back at the head.
    ///
    /// A command abandoned while its submission was underway is dropped
    /// instead; its waiter requeues it if it retries. Returns whether the
    /// command was requeued.
    fn defer(&mut self, command: Arc<Command>) -> bool {
        if !self.holds(&command) {
            return false;
        }
        self.clear_slot();
        command.set_phase(Phase::Queued);
        self.pending.push_front(command);
        true
    }

    /// The transport refused the command outright.
    fn reject(&mut self, command: &Arc<Command>) -> bool {
        if self.holds(command) {
            self.clear_slot();
            true
        } else {
            false
        }
    }

    /// Release the slot for a completed attempt.
    ///
    /// Returns false if `command` no longer holds the slot or the slot holds
    /// a different attempt of it; the completion is stale.
    pub fn complete(&mut self, command: &Arc<Command>, generation: u64) -> bool {
        if self.holds(command) && command.generation() == generation {
            self.clear_slot();
            true
        } else {
            false
        }
    }

    /// Release the slot if its command has held it for at least `limit`.
    ///
    /// The command is claimed before release, so a completion racing the
    /// expiry loses. Returns the released command, which the caller must
    /// finish.
    pub fn expire_inflight(&mut self, limit: Duration) -> Option<Arc<Command>> {
        let expired = self.inflight.as_ref().is_some_and(|cmd| {
            cmd.inflight_for().is_some_and(|age| age >= limit) && cmd.mark_all(cmd.generation())
        });
        if !expired {
            return None;
        }
        let command = self.inflight.take();
        self.clear_slot();
        command
    }

    /// Withdraw a command whose waiter gave up on it.
    ///
    /// Returns false if the command is in neither the slot nor the FIFO,
    /// meaning a completion already claimed it.
    pub fn abandon(&mut self, command: &Arc<Command>) -> bool {
        if self.holds(command) {
            self.clear_slot();
            return true;
        }
        match self.pending.iter().position(|c| Arc::ptr_eq(c, command)) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Submit queued commands of `router` until its slot is occupied, the FIFO
/// is empty, or the transport pushes back.
pub(crate) fn drain(router: &Router, transport: &dyn FrameTransport) -> Drained {
    loop {
        let command = {
            let mut queue = router.queue().lock();
            match queue.begin_drain() {
                Some(command) => command,
                None if queue.inflight.is_some() => return Drained::Occupied,
                None => return Drained::Empty,
            }
        };

        let result = command.with_frame(|frame| transport.submit(frame));

        match result {
            Ok(()) => {
                router.stats.record_submitted();
                router.queue().lock().submitted(&command);
                debug!(
                    route = %router.route(),
                    seq = command.seq(),
                    kind = ?command.kind(),
                    "command submitted"
                );
            }
            Err(TransportError::Busy) => {
                router.stats.record_busy();
                if router.queue().lock().defer(command) {
                    debug!(route = %router.route(), "transport busy, command deferred");
                } else {
                    debug!(route = %router.route(), "transport busy, abandoned command dropped");
                }
                return Drained::Deferred;
            }
            Err(err) => {
                let rejected = router.queue().lock().reject(&command);
                warn!(route = %router.route(), error = %err, "command submission failed");
                if rejected && command.mark_all(command.generation()) {
                    command.finish(Outcome::Failed(err));
                }
            }
        }
    }
}
