//! # Castor Contracts
//!
//! Shared contracts between the castor coordinator and worker daemons:
//!
//! - the capability record a daemon reports once at registration,
//! - the job model (spec, states, stats, error taxonomy),
//! - elementary-stream samples and batches,
//! - the websocket frame envelopes and their JSON codec,
//! - the length-delimited es-pipe framing spoken to the encoder process.
//!
//! Everything here is plain data: no I/O, no runtime state. Both binaries
//! depend on this crate and nothing in it depends on them.

/// Capability record reported at registration.
pub mod capabilities;

/// Codec name normalization and encoder-name classification.
pub mod codec;

/// Length-delimited framing for the encoder's stdin/stdout pipes.
pub mod espipe;

/// Job spec, job states, runtime stats, and the transcode error taxonomy.
pub mod job;

/// Control-plane and transcode-stream message bodies.
pub mod message;

/// Elementary-stream samples and batches.
pub mod sample;

/// JSON wire codec helpers shared by both websocket endpoints.
pub mod wire;

pub use capabilities::{
    Capabilities, FilteredEncoder, GpuClass, GpuInfo, HwAccel, HwAccelKind,
};
pub use job::{
    GpuExhaustedPolicy, JobSpec, JobState, TranscodeError, TranscodeErrorCode, TranscodeStats,
};
pub use message::{
    Command, ConcurrencyUpdate, CoordinatorFrame, DaemonFrame, GpuUtilization, HeartbeatRequest,
    HeartbeatResponse, JobStatus, RegisterFailure, RegisterRequest, RegisterResponse, SystemStats,
    TranscodeMessage, UnregisterRequest, UnregisterResponse,
};
pub use sample::{EsSample, EsSampleBatch};

/// Protocol revision spoken over the daemon websocket. Registration is
/// rejected with `VersionIncompatible` when the two sides disagree.
pub const PROTOCOL_VERSION: u32 = 1;
