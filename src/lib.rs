//! # Honeycomb
//!
//! Hierarchical cell coordination - a tree of cells that route requests to
//! each other and keep their parents up to date.
//!
//! Every cell owns a slice of the fleet. A request made at any cell can be
//! targeted at one cell by path, broadcast down a subtree, or pushed up to the
//! ancestors; replies come back as per-cell envelopes and are merged by an
//! aggregation policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         CELLS MANAGER (api)                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │    Router    │  │ Reconciler   │  │ Propagation  │               │
//! │  └──────┬───────┘  └──────────────┘  └──────────────┘               │
//! └─────────┼───────────────────────────────────────────────────────────┘
//!           │ Transport (call / cast, targeted / broadcast)
//!          ┌┴──────────────────┬───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │  api.east   │     │  api.west   │     │  api.north  │
//!   └──────┬──────┘     └──────┬──────┘     └─────────────┘
//!          │                   │
//!     ┌────┴────┐         ┌────┴────┐
//!     ▼         ▼         ▼         ▼
//!   ┌─────┐  ┌─────┐    ┌─────┐  ┌─────┐
//!   │rack1│  │rack2│    │rack1│  │rack2│
//!   └─────┘  └─────┘    └─────┘  └─────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Cell path**: dotted route from the top cell (`api.east.rack1`)
//! - **Target address**: `cell!item` or `cell!item@host`
//! - **Envelope**: one cell's reply, success or captured failure
//! - **Reconciliation**: periodic re-publication of local records upward

pub mod address;
pub mod aggregate;
pub mod config;
pub mod cursor;
pub mod envelope;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod message;
pub mod models;
pub mod propagation;
pub mod reconcile;
pub mod records;
pub mod router;
pub mod topology;
pub mod transport;

pub use address::{CellPath, TargetAddress};
pub use aggregate::{AggregationPolicy, Aggregated, Tagged};
pub use config::{CellsConfig, DriverKind};
pub use envelope::{RemoteFailure, ResultEnvelope};
pub use error::{CellError, Result};
pub use loopback::{LoopbackDriver, LoopbackNetwork};
pub use manager::CellsManager;
pub use message::{CellMessage, Direction};
pub use models::{BandwidthUsage, CellScoped, ComputeNode, DeleteType, InstanceFault, Service, TaskLog};
pub use reconcile::{ReconciliationEngine, TickReport};
pub use records::{InMemoryRecordStore, RecordStore, ResourceId, ResourceRecord, SyncQuery};
pub use router::Router;
pub use topology::{CellTree, TopologyStore, TreeTopology};
pub use transport::{CellHandler, Transport};
