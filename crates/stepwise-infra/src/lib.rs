//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the ports defined in `stepwise-core`:
//! filesystem fragment and definition sources, the local artifact store and
//! its remote mirrors, the snapshot and command step adapters, and the
//! configuration loader.

pub mod adapter;
pub mod config;
pub mod crypto;
pub mod definition;
pub mod fragment;
pub mod mirror;
pub mod store;
