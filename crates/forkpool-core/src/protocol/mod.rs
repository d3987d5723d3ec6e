//! Line protocol spoken between the pool and its worker processes.
//!
//! One JSON object per line over the worker's stdin/stdout. The reader is
//! tolerant: unknown fields are ignored and unknown message types surface as
//! `Unknown` rather than errors.

mod parser;
mod types;

pub use parser::{encode, parse_host_line, parse_worker_line};
pub use types::*;
