//! netloom-core: Shared types and error handling for the netloom discovery engine.
//!
//! This crate provides the foundational types used across all netloom components:
//! - Raw protocol observations and address targets
//! - Topology entities (Device, Interface, Link) and the graph that holds them
//! - Change sets produced by diffing two graph states
//! - Scan jobs, job reports, and completion acknowledgements
//! - Common error types

pub mod changes;
pub mod error;
pub mod events;
pub mod job;
pub mod types;

pub use changes::{ChangeSet, ChangeSummary, EntityChanges, FieldChange, JobMetadata, Modification};
pub use error::NetloomError;
pub use events::JobAck;
pub use job::{JobOrigin, JobReport, JobStatus, ScanJob};
pub use types::{
    AddressTarget, Device, DeviceId, DeviceKey, DeviceStatus, Interface, InterfaceRecord,
    InterfaceRef, Link, LinkKey, LinkKind, MacAddress, Protocol, RawObservation,
    ServiceMetadata, TargetSet, TenantId, TopologyGraph,
};
