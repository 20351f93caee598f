//! Camera connections and their supervision.
//!
//! Each enabled camera runs on its own thread: connect, read, shed frames
//! through the `FrameScheduler`, hand admitted frames to the pipeline pool,
//! and back off exponentially on failure. The `StreamSupervisor` owns those
//! threads and exposes the administrative operations.

mod backoff;
mod connection;
mod scheduler;
mod state;
mod supervisor;

pub use backoff::{backoff_delay, Backoff};
pub use connection::{StatusCell, StopSignal, StreamStatus};
pub use scheduler::FrameScheduler;
pub use state::{ConnectionEvent, ConnectionState};
pub use supervisor::{shared_thresholds, StreamSupervisor, SystemStatus};
