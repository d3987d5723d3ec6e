//! Hierarchical worker leases bounding parallel work.

pub mod registry;

pub use registry::{LeaseCompletion, LeaseError, LeaseId, LeaseRegistry, with_current_lease};
