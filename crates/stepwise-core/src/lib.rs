//! Build engine core for Stepwise.
//!
//! This crate holds the engine's logic and defines the "ports" (traits) that
//! the infrastructure layer implements: where fragments come from
//! ([`graph::FragmentSource`]), where step definitions come from
//! ([`checksum::DefinitionSource`]), where artifacts live
//! ([`store::ArtifactStore`]), and who executes a step
//! ([`adapter::StepAdapter`]). It performs no filesystem or network I/O of its
//! own.

pub mod adapter;
pub mod checksum;
pub mod event;
pub mod graph;
pub mod run_state;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
