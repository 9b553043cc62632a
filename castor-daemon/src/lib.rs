//! # Castor Daemon
//!
//! Worker daemon of the castor transcoding fabric. One daemon per encode
//! host. Responsibilities:
//!
//! - **Capability probe**: enumerate encoders/decoders and hardware
//!   accelerators once at startup, reported verbatim at registration.
//! - **Local admission control**: per-worker caps on total/CPU/GPU/probe
//!   jobs and per-GPU encode sessions; deterministic encoder selection.
//! - **Process supervision**: one external encoder process per job, with
//!   sample pumps over es-pipe framing, progress parsing, and bounded
//!   teardown.
//! - **Runtime**: the single websocket to the coordinator: registration,
//!   heartbeats, command intake, transcode stream demultiplexing, and
//!   reconnection with bounded backoff.

/// Slot accounting and encoder selection.
pub mod admission;

/// Startup capability detection.
pub mod probe;

/// Coordinator connection lifecycle.
pub mod runtime;

/// Host statistics sampling for heartbeats.
pub mod stats;

/// Per-job encoder process supervision.
pub mod supervisor;
