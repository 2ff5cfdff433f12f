//! facewatch
//!
//! Resilient ingest of one live network camera feed with motion-gated face
//! matching. Detection events go to a message bus while the same feed is
//! relayed to any number of viewers.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager --(Frame)--> DetectionPipeline --> FrameDistributor --> viewers
//!        |                            |
//!        |                     MotionGate --trigger--> recognition worker
//!        |                                               |
//!        +------------ SharedState <---- DetectionEvent -+--> EventPublisher
//! ```
//!
//! - The capture worker owns the source. It never blocks on a consumer:
//!   the distributor drops the oldest frame when a viewer falls behind.
//! - Only one recognition runs at a time; motion triggers that arrive while
//!   it is busy are skipped.
//! - Connection state, the current frame and the detection history live behind
//!   one mutex per source ([`state::SharedState`]).
//!
//! # Module Structure
//!
//! - `frame`: frames and the bounded drop-oldest distributor
//! - `ingest`: source descriptors, reachability probe, frame sources
//! - `connection`: connection state machine, retry policy, capture loop
//! - `motion`: background model and the cooldown-gated motion trigger
//! - `recognize`: extractors, identity stores, cosine matching
//! - `pipeline`: detection cycle orchestration
//! - `transport`: event payloads and the MQTT publisher
//! - `stream`: viewer JPEG/multipart encoding
//! - `api`: HTTP control surface
//! - `config`: layered daemon configuration

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod hooks;
pub mod ingest;
pub mod motion;
pub mod pipeline;
pub mod recognize;
pub mod state;
pub mod stream;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState, FrameProcessor, ManagerStatus, RetryPolicy};
pub use error::ConnectError;
pub use frame::{Frame, FrameDistributor, FrameSubscription, RecvOutcome};
pub use hooks::{DispatchReport, HandlerSet};
pub use ingest::{FrameSource, NetworkConnector, SourceConnector, SourceDescriptor, SourceOptions};
pub use motion::{MotionConfig, MotionGate, MotionTrigger};
pub use pipeline::{DetectionEvent, DetectionPipeline, PipelineConfig};
pub use recognize::{
    cosine_similarity, Accelerator, DetectedFace, DirectoryIdentityStore, EmbeddingExtractor,
    IdentityStore, InMemoryIdentityStore, RecognitionMatcher, RecognitionResult,
};
pub use state::{CaptureStats, SharedState, StatusSnapshot};
pub use stream::{StreamConfig, StreamEncoder};
pub use transport::{EventPublisher, LogPublisher, MqttPublisher};
