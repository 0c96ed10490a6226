//! # obnet — System Management Node for distributed co-simulation
//!
//! The coordination core of an openBuildNet-style federation: autonomous
//! node processes each simulate one subsystem, and this crate's
//! [`Coordinator`] owns the global virtual clock, schedules every block
//! firing, and drives the two-phase output/state barrier that keeps the
//! federation causally ordered.
//!
//! ## Design Principles
//!
//! - **Deterministic scheduling**: the event queue orders firings by
//!   `(virtual time, registration rank)`, so identical configurations and
//!   node behaviors replay identically.
//! - **Dependency-aware barriers**: each tick's fired set is partitioned
//!   into topological waves over feedthrough and internal dependencies;
//!   blocks in the same wave compute in parallel across the federation.
//! - **Narrow transport boundary**: the coordinator drives any back-end
//!   implementing the [`Transport`] capability; frames cross it through a
//!   fixed-schema codec.
//! - **Single-threaded core**: the coordinator suspends only on
//!   `recv(deadline)`; all scheduler state is owned by one thread.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod queue;
pub mod registry;
pub mod report;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use codec::{AckStatus, Body, EventRequest, Message, MessageKind};
pub use config::{BlockDecl, Connection, Deadlines, NodeDecl, SystemConfig, SystemConfigBuilder};
pub use coordinator::{CancelToken, Coordinator};
pub use error::{Error, ProtocolError};
pub use graph::{BlockRef, TickPlan, UpdateGraph};
pub use queue::{EventQueue, FireReason, ScheduledFiring};
pub use registry::{Liveness, NodeRegistry};
pub use report::{MemorySink, NullSink, Phase, ReportEvent, ReportSink, StopReason, TracingSink};
pub use transport::{ChannelTransport, Endpoint, NodeLink, Transport, TransportEvent};
pub use types::{BlockId, NodeId, PortId, SimTime, UpdateMask};
