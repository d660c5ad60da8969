//! Shared domain types for Stepwise.
//!
//! This crate contains the values passed between the graph loader, checksum
//! engine, artifact store, and scheduler: step identifiers, fingerprints,
//! artifacts, run status, configuration, and the error types shared by the
//! core ports and their infrastructure implementations.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod artifact;
pub mod config;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod identifier;
pub mod run;

pub use artifact::{Artifact, ArtifactFile};
pub use fingerprint::Fingerprint;
pub use identifier::{Category, StepIdentifier, Version};
pub use run::{NodeStatus, SkipReason};
