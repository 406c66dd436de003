//! `texforge-core`: domain building blocks for the compilation queue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the immutable job record, the job state machine and the clock
//! abstraction used to keep time-dependent logic deterministic under test.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{DocumentRef, JobId, OwnerRef};
pub use job::CompilationJob;
pub use state::{JobOutcome, JobState, JobStatus};
