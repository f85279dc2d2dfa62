//! JSON-over-HTTP client for the remote listing generation service.
//!
//! One [`Api`] instance drives every call the CLI makes: auth exchange,
//! rules resolution and archive download, job submission, status polling,
//! incremental trace reads, result fetch, and cancellation. All calls share
//! a single connection pool, a per-endpoint retry budget with exponential
//! backoff, and an optional request/response trace hook.

mod api;
pub mod cancel;
mod error;
pub mod types;

pub use api::{Api, TraceEvent, TraceFn, TraceStage};
pub use cancel::{Cancelled, OrCancelExt};
pub use error::ApiError;
