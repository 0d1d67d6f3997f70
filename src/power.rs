//! Router sleep entry and exit.
//!
//! Suspending a router asks it to enter sleep through ROUTER_CS_5 with only
//! USB3 wake enabled, then waits for ROUTER_CS_6 to report sleep-ready.
//! Once the router is asleep its suspended flag short-circuits every new
//! read and write with `Suspended`.

use std::thread;

use tracing::{debug, info, warn};

use crate::error::{Result, TbError};
use crate::protocol::regs::{cs5, cs6, ROUTER_CS_5, ROUTER_CS_6};
use crate::topology::{Router, Topology};

impl Topology {
    /// Put `router` to sleep.
    ///
    /// Fails with `Timeout` if the router does not report sleep-ready
    /// within the configured number of checks; the router is then left
    /// marked awake.
    pub fn suspend(&self, router: &Router) -> Result<()> {
        if router.is_suspended() {
            return Ok(());
        }

        let cs5 = self
            .router_read(router, ROUTER_CS_5, 1)?
            .first()
            .copied()
            .ok_or_else(|| TbError::Protocol("empty ROUTER_CS_5 read".to_string()))?;
        let requested = (cs5 & !(cs5::WOP | cs5::WOU | cs5::WOD)) | cs5::SLP | cs5::WOU;
        self.router_write(router, ROUTER_CS_5, &[requested])?;
        debug!(route = %router.route(), cs5 = format_args!("{:#010x}", requested), "sleep requested");

        let config = self.config();
        thread::sleep(config.sleep_ready_wait());
        for attempt in 0..=config.sleep_ready_attempts {
            let cs6 = self.router_read(router, ROUTER_CS_6, 1)?;
            if cs6.first().is_some_and(|word| word & cs6::SLPR != 0) {
                router.set_suspended(true);
                info!(route = %router.route(), "router suspended");
                return Ok(());
            }
            if attempt < config.sleep_ready_attempts {
                thread::sleep(config.sleep_ready_wait());
            }
        }

        warn!(route = %router.route(), "router never reported sleep ready");
        Err(TbError::Timeout)
    }

    /// Mark `router` awake again. Idempotent.
    pub fn resume(&self, router: &Router) -> Result<()> {
        if router.is_detached() {
            return Err(TbError::NotFound);
        }
        if router.is_suspended() {
            router.set_suspended(false);
            info!(route = %router.route(), "router resumed");
        }
        Ok(())
    }
}
