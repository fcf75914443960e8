//! filmstrip-engine: adaptive filmstrip extraction and caching.
//!
//! The engine decides which frames of a clip to extract, runs extraction on
//! a pool of background workers under a memory-aware concurrency cap, falls
//! back to slower decode paths when fast decoding fails, and keeps the
//! results in a subscribable in-memory cache backed by a blob store.
//!
//! Everything is driven through [`FilmstripService`].

pub mod admission;
pub mod cache;
pub mod fallback;
pub mod handles;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod sampling;
pub mod service;
pub mod session;
pub mod worker;

pub use cache::{FilmstripCallback, SubscriberId};
pub use fallback::DecodePath;
pub use memory::{
    probe_from_config, CacheFootprintProbe, MemoryPressure, MemoryPressureProbe,
    ProcessMemoryProbe,
};
pub use metrics::{ExtractionMetrics, ExtractionOutcome, MetricsSnapshot};
pub use sampling::Sampler;
pub use service::{FilmstripRequest, FilmstripService, ServiceStats, Subscription};
pub use worker::Decoders;
