//! Stage reporting for long-running container operations.
//!
//! Operations announce each stage they enter to a [`StageObserver`]. The
//! job layer turns stages into percentages with [`Stage::percent`].

use std::fmt;

/// Operation a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Seal,
    Unseal,
    Reseal,
}

/// A step of seal, unseal or reseal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Compressing,
    KeyPreparing,
    Encrypting,
    TaggingIntegrity,
    Writing,
    OpeningHeader,
    TokenResolving,
    KeyReconstructing,
    IntegrityVerifying,
    Decrypting,
    Decompressing,
    Done,
}

impl Stage {
    /// Progress percentage reported when `op` enters this stage.
    ///
    /// Percentages follow stage order within each operation, so a correctly
    /// sequenced operation never reports a decrease.
    pub fn percent(self, op: Operation) -> u8 {
        use Stage::*;
        match (op, self) {
            (_, Done) => 100,

            (Operation::Seal, Validating) => 0,
            (Operation::Seal, Compressing) => 10,
            (Operation::Seal, KeyPreparing) => 40,
            (Operation::Seal, Encrypting) => 55,
            (Operation::Seal, TaggingIntegrity) => 80,
            (Operation::Seal, Writing) => 90,

            (Operation::Unseal, Validating) => 0,
            (Operation::Unseal, OpeningHeader) => 5,
            (Operation::Unseal, TokenResolving) => 10,
            (Operation::Unseal, KeyReconstructing) => 20,
            (Operation::Unseal, IntegrityVerifying) => 40,
            (Operation::Unseal, Decrypting) => 60,
            (Operation::Unseal, Decompressing) => 80,

            (Operation::Reseal, Validating) => 0,
            (Operation::Reseal, OpeningHeader) => 5,
            (Operation::Reseal, TokenResolving) => 10,
            (Operation::Reseal, KeyReconstructing) => 15,
            (Operation::Reseal, IntegrityVerifying) => 25,
            (Operation::Reseal, Decrypting) => 35,
            (Operation::Reseal, Compressing) => 50,
            (Operation::Reseal, KeyPreparing) => 60,
            (Operation::Reseal, Encrypting) => 70,
            (Operation::Reseal, TaggingIntegrity) => 80,
            (Operation::Reseal, Writing) => 90,

            // Stages that do not occur in `op`.
            _ => 0,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receives stage transitions from an operation.
pub trait StageObserver {
    fn on_stage(&mut self, stage: Stage);
}

impl<F: FnMut(Stage)> StageObserver for F {
    fn on_stage(&mut self, stage: Stage) {
        self(stage)
    }
}

/// Observer that ignores every stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl StageObserver for NoProgress {
    fn on_stage(&mut self, _stage: Stage) {}
}
