//! Source lifecycle: connection state machine, retry policy, capture worker.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Streaming <-> Reconnecting -> Failed
//!        ^_____________________ any state (stop/disconnect) ______________|
//! ```

mod machine;
mod manager;
mod policy;

pub use machine::ConnectionState;
pub use manager::{ConnectionManager, FrameProcessor, ManagerStatus};
pub use policy::RetryPolicy;
