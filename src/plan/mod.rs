//! Collector plans. Only the concurrent-marking barrier strategies live here; the heap layout
//! and object tracing belong to the embedding runtime.

pub mod concurrent;
