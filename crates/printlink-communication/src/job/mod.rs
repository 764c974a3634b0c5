//! Print execution
//!
//! - `state`: job status machine and the observable job snapshot
//! - `streaming`: program splitting and the line cursor
//! - `runner`: the feed task that drives a job

pub mod runner;
pub mod state;
pub mod streaming;

pub use runner::JobSettings;
pub use state::{progress_percent, JobFailure, JobStatus, PrintJob};
pub use streaming::{program_lines, ProgressCallback, StreamOptions, StreamSummary, StreamingAdapter};
