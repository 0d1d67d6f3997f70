//! # tbcfg
//!
//! Configuration-space command engine for USB4/Thunderbolt router
//! topologies.
//!
//! The engine reads and writes small register blocks in the config space of
//! routers arranged in a tree, over a shared ring-based transport that
//! allows one outstanding request per router and delivers responses and
//! unsolicited events out of band.
//!
//! ## Architecture
//!
//! ```text
//!  caller ─► access (blocking / polled / callback / async)
//!              │
//!              ▼
//!           command ─► scheduler (per-router FIFO + inflight slot)
//!                          │
//!                          ▼
//!                   FrameTransport ◄── external ring
//!                          │
//!                          ▼
//!                      dispatch ─► topology (route resolution) ─► command
//! ```
//!
//! - **Protocol**: route strings, CRC-32C-sealed big-endian framing, register
//!   layouts
//! - **Topology**: arena of routers addressed by route, with discovery
//! - **Capability**: capability chain walker
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tbcfg::{Space, Topology};
//!
//! let topology = Topology::attach_root(Arc::new(ring))?;
//! let root = topology.root().expect("host router");
//!
//! let words = topology.read(&root, Space::Router, 0, 0, 2)?;
//! let tmu = topology.find_router_capability(&root, 0x03)?;
//! ```

pub mod capability;
pub mod command;
pub mod config;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod topology;
pub mod transport;

mod access;
mod dispatch;
mod power;

pub use capability::{find_capability, CapabilityCursor, CapabilityTarget, ConfigSpaceRead};
pub use command::CommandCallback;
pub use config::EngineConfig;
pub use dispatch::HotplugEvent;
pub use error::{Result, TbError, TransportError};
pub use protocol::{NotifyEvent, Route, Space};
pub use topology::{
    CapabilityFlavor, Router, RouterIdentity, RouterStats, Topology, TopologyBuilder,
};
pub use transport::{
    CompletedFrame, FrameContext, FrameHandler, FrameTransport, NodeId, PdfDispatch, TxFrame,
};
