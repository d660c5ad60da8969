//! Remote mirror implementations.
//!
//! - `directory` -- a second store tree on a mounted filesystem
//! - `http` -- a plain HTTP object store (GET/HEAD/PUT)

pub mod directory;
pub mod http;

use stepwise_core::store::BoxRemoteMirror;
use stepwise_types::config::{MirrorConfig, MirrorKind};

pub use directory::DirectoryMirror;
pub use http::HttpMirror;

/// Build the mirror described by `config`.
pub fn build_mirror(config: &MirrorConfig) -> BoxRemoteMirror {
    match config.kind {
        MirrorKind::Directory => BoxRemoteMirror::new(DirectoryMirror::new(&config.location)),
        MirrorKind::Http => BoxRemoteMirror::new(HttpMirror::new(&config.location)),
    }
}
