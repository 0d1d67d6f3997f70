//! Config-space reads and writes in four calling conventions.
//!
//! | Mode | Waits by | Retries | Timeout |
//! |---|---|---|---|
//! | `read` / `write` | condition variable | `retries` | per attempt |
//! | `*_polled` | sleeping in `poll_interval` steps | `retries` | per attempt |
//! | `*_callback` | not at all; callback runs on completion | none | none |
//! | `*_async` | `await` on a oneshot channel | none | one attempt |
//!
//! Polled calls are for contexts where completions cannot wake the caller
//! through the normal mechanism, such as discovery before interrupts are
//! routed.
//!
//! In every mode an asynchronous notification seen while the command was
//! inflight turns the result into [`TbError::AsyncEvent`], even if response
//! data had already arrived.
//!
//! # Example
//!
//! ```ignore
//! let words = topology.read(&router, Space::Router, 0, 0, 2)?;
//! topology.adapter_write(&router, 3, 0x10, &[0x8000_0000])?;
//!
//! topology.read_callback(&router, Space::Router, 0, 7, 2, |result| {
//!     println!("uuid words: {:x?}", result);
//! })?;
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::command::{Command, CommandKind, Outcome};
use crate::error::{Result, TbError};
use crate::protocol::{ConfigAddress, Space, MAX_DWORDS};
use crate::topology::{Router, Topology, TopologyInner};

fn write_address(space: Space, adapter: u8, offset: u16, data: &[u32]) -> Result<ConfigAddress> {
    if data.len() > MAX_DWORDS as usize {
        return Err(TbError::InvalidArgument(format!(
            "write of {} dwords exceeds {}",
            data.len(),
            MAX_DWORDS
        )));
    }
    ConfigAddress::new(space, adapter, offset, data.len() as u8)
}

/// Submit, wait, and resubmit on timeout until the retry budget is spent.
fn run(
    inner: &TopologyInner,
    router: &Router,
    kind: CommandKind,
    addr: ConfigAddress,
    payload: Vec<u32>,
    wait: impl Fn(&Command) -> Option<Outcome>,
) -> Result<Vec<u32>> {
    let command = inner.command(router, kind, addr, payload)?;
    let attempts = inner.config.retries.saturating_add(1);

    for attempt in 1..=attempts {
        command.begin_attempt(router.next_seq());
        inner.submit(router, command.clone())?;

        let outcome = match wait(&command) {
            Some(outcome) => outcome,
            None if inner.abandon(router, &command) => {
                warn!(
                    route = %router.route(),
                    kind = ?kind,
                    offset = addr.offset,
                    attempt,
                    attempts,
                    "command timed out"
                );
                continue;
            }
            // A completion claimed the attempt as the wait expired.
            None => match command.wait_finished() {
                Some(outcome) => outcome,
                None => continue,
            },
        };
        if outcome == Outcome::TimedOut {
            debug!(route = %router.route(), attempt, attempts, "inflight attempt expired");
            continue;
        }
        return outcome.into_result();
    }
    Err(TbError::Timeout)
}

pub(crate) fn run_blocking(
    inner: &TopologyInner,
    router: &Router,
    kind: CommandKind,
    addr: ConfigAddress,
    payload: Vec<u32>,
) -> Result<Vec<u32>> {
    let timeout = inner.config.timeout();
    run(inner, router, kind, addr, payload, |cmd| cmd.wait(timeout))
}

pub(crate) fn run_polled(
    inner: &TopologyInner,
    router: &Router,
    kind: CommandKind,
    addr: ConfigAddress,
    payload: Vec<u32>,
) -> Result<Vec<u32>> {
    let timeout = inner.config.timeout();
    let interval = inner.config.poll_interval();
    run(inner, router, kind, addr, payload, |cmd| {
        poll(cmd, timeout, interval)
    })
}

/// Sleep in `interval` steps until the poll flag is set or `timeout` passes.
fn poll(command: &Command, timeout: Duration, interval: Duration) -> Option<Outcome> {
    let start = Instant::now();
    loop {
        if command.is_poll_complete() {
            return command.take_outcome();
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return None;
        }
        thread::sleep(interval.min(timeout - elapsed));
    }
}

impl Topology {
    /// Read `len` dwords, blocking until the response or the retry budget
    /// runs out.
    pub fn read(
        &self,
        router: &Router,
        space: Space,
        adapter: u8,
        offset: u16,
        len: u8,
    ) -> Result<Vec<u32>> {
        let addr = ConfigAddress::new(space, adapter, offset, len)?;
        run_blocking(&self.inner, router, CommandKind::Read, addr, Vec::new())
    }

    /// Like [`read`](Self::read), but waits by polling.
    pub fn read_polled(
        &self,
        router: &Router,
        space: Space,
        adapter: u8,
        offset: u16,
        len: u8,
    ) -> Result<Vec<u32>> {
        let addr = ConfigAddress::new(space, adapter, offset, len)?;
        run_polled(&self.inner, router, CommandKind::Read, addr, Vec::new())
    }

    /// Issue a read and return immediately; `callback` receives the result.
    ///
    /// Single attempt, no timeout.
    pub fn read_callback<F>(
        &self,
        router: &Router,
        space: Space,
        adapter: u8,
        offset: u16,
        len: u8,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Vec<u32>>) + Send + 'static,
    {
        let addr = ConfigAddress::new(space, adapter, offset, len)?;
        self.issue_callback(router, CommandKind::Read, addr, Vec::new(), Box::new(callback))
    }

    /// Read as a future. One attempt, bounded by the configured timeout.
    pub async fn read_async(
        &self,
        router: &Router,
        space: Space,
        adapter: u8,
        offset: u16,
        len: u8,
    ) -> Result<Vec<u32>> {
        let addr = ConfigAddress::new(space, adapter, offset, len)?;
        self.issue_async(router, CommandKind::Read, addr, Vec::new())
            .await
    }

    /// Write `data`, blocking until acknowledged or the retry budget runs out.
    pub fn write(
        &self,
        router: &Router,
        space: Space,
        adapter: u8,
        offset: u16,
        data: &[u32],
    ) -> Result<()> {
        let addr = write_address(space, adapter, offset, data)?;
        run_blocking(&self.inner, router, CommandKind::Write, addr, data.to_vec()).map(|_| ())
    }

    /// Like [`write`](Self::write), but waits by polling.
    pub fn write_polled(
        &self,
        router: &Router,
        space: Space,
        adapter: u8,
        offset: u16,
        data: &[u32],
    ) -> Result<()> {
        let addr = write_address(space, adapter, offset, data)?;
        run_polled(&self.inner, router, CommandKind::Write, addr, data.to_vec()).map(|_| ())
    }

    /// Issue a write and return immediately; `callback` receives the result.
    pub fn write_callback<F>(
        &self,
        router: &Router,
        space: Space,
        adapter: u8,
        offset: u16,
        data: &[u32],
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let addr = write_address(space, adapter, offset, data)?;
        self.issue_callback(
            router,
            CommandKind::Write,
            addr,
            data.to_vec(),
            Box::new(move |result| callback(result.map(|_| ()))),
        )
    }

    /// Write as a future. One attempt, bounded by the configured timeout.
    pub async fn write_async(
        &self,
        router: &Router,
        space: Space,
        adapter: u8,
        offset: u16,
        data: &[u32],
    ) -> Result<()> {
        let addr = write_address(space, adapter, offset, data)?;
        self.issue_async(router, CommandKind::Write, addr, data.to_vec())
            .await
            .map(|_| ())
    }

    /// Read router config space.
    pub fn router_read(&self, router: &Router, offset: u16, len: u8) -> Result<Vec<u32>> {
        self.read(router, Space::Router, 0, offset, len)
    }

    pub fn router_read_polled(&self, router: &Router, offset: u16, len: u8) -> Result<Vec<u32>> {
        self.read_polled(router, Space::Router, 0, offset, len)
    }

    /// Write router config space.
    pub fn router_write(&self, router: &Router, offset: u16, data: &[u32]) -> Result<()> {
        self.write(router, Space::Router, 0, offset, data)
    }

    /// Read the config space of one adapter.
    pub fn adapter_read(
        &self,
        router: &Router,
        adapter: u8,
        offset: u16,
        len: u8,
    ) -> Result<Vec<u32>> {
        self.read(router, Space::Adapter, adapter, offset, len)
    }

    /// Write the config space of one adapter.
    pub fn adapter_write(
        &self,
        router: &Router,
        adapter: u8,
        offset: u16,
        data: &[u32],
    ) -> Result<()> {
        self.write(router, Space::Adapter, adapter, offset, data)
    }

    fn issue_callback(
        &self,
        router: &Router,
        kind: CommandKind,
        addr: ConfigAddress,
        payload: Vec<u32>,
        callback: crate::command::CommandCallback,
    ) -> Result<()> {
        let command = self.inner.command(router, kind, addr, payload)?;
        command.set_callback(callback);
        command.begin_attempt(router.next_seq());
        self.inner.submit(router, command)
    }

    async fn issue_async(
        &self,
        router: &Router,
        kind: CommandKind,
        addr: ConfigAddress,
        payload: Vec<u32>,
    ) -> Result<Vec<u32>> {
        let inner = &self.inner;
        let command: Arc<Command> = inner.command(router, kind, addr, payload)?;

        let (tx, mut rx) = oneshot::channel();
        command.set_callback(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        command.begin_attempt(router.next_seq());
        inner.submit(router, command.clone())?;

        match tokio::time::timeout(inner.config.timeout(), &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TbError::Timeout),
            Err(_) => {
                if inner.abandon(router, &command) {
                    warn!(route = %router.route(), kind = ?kind, offset = addr.offset, "command timed out");
                    return Err(TbError::Timeout);
                }
                // A completion claimed the attempt as the timer fired.
                rx.await.unwrap_or(Err(TbError::Timeout))
            }
        }
    }
}
