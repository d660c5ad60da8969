//! Content hashing.
//!
//! - `hash`: SHA-256 of byte strings, files, and artifact payload trees

pub mod hash;
