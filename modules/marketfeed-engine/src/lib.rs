//! Incremental source-synchronization engine.
//!
//! One generic traversal/retry/persistence triad replaces the
//! near-duplicate per-source scrapers: each source supplies only a
//! [`SourceAdapter`] (fetch one page, parse it), and the engine owns
//! page iteration and stop conditions, category filtering, bounded
//! retries behind a resource guard, idempotent persistence, and
//! interval/staleness scheduling.

pub mod adapter;
pub mod filter;
pub mod group;
pub mod jobs;
pub mod resource;
pub mod retry;
pub mod sink;
pub mod stats;
pub mod traversal;

pub use adapter::{SourceAdapter, SourceSpec};
pub use filter::{RecordFilter, TaxonomyMap};
pub use group::GroupRunner;
pub use jobs::{JobScheduler, JobSpec, JobStatus};
pub use resource::{HeadroomGuard, ResourceGuard, ResourceSample, ResourceSampler, SysinfoSampler};
pub use retry::RetryController;
pub use sink::{FileSink, PgSink, Sink};
pub use stats::{GroupReport, SourceOutcome};
pub use traversal::{TraversalController, TraversalOutcome};
