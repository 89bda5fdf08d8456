//! Application layer for tvault.
//!
//! Exposes the engine's command surface: path checks, entropy collection,
//! and seal/unseal/reseal/info jobs that stream progress events.

pub mod args;
pub mod engine;
pub mod job;

pub use args::{ContainerInfoArgs, DecryptArgs, EncryptArgs, ResealArgs};
pub use engine::Engine;
pub use job::{
    bridge_events, BridgeEvent, InfoResult, JobEvent, JobHandle, JobKind, JobOutput, JobReport,
    Reporter,
};
