//! Operation tracing for dispatched work.

pub mod tracer;

pub use tracer::{
    OperationContext, OperationDescriptor, OperationEvent, OperationId, OperationTracer,
};
