//! Reusable worker clients and the pool that hands them out.

pub mod client;
pub mod manager;

pub use client::{ClientId, ClientState, WorkerClient};
pub use manager::{ClientsError, ReservedClient, WorkerClientsManager};
