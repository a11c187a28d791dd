//! Streaming pipeline: registry, generator factory, queue pool
//!
//! Worker notifications flow registry → per-stream sink → pump →
//! bounded chunk queue → consumer. Cancellation travels the other way.

pub mod generator;
pub mod registry;

pub use generator::{
    render_template, AsyncQueue, GenerateRequest, GenerationStats, GeneratorChunk,
    GeneratorFactory, GeneratorFactoryConfig, GeneratorOptions, Priority, QueuePool,
    TelemetryHooks, TokenStream,
};
pub use registry::{
    CancelToken, StreamEvent, StreamRegistry, StreamRegistryConfig, StreamRegistryStats,
};
