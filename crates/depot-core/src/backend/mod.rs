//! Storage backends
//!
//! The store talks to exactly one backend, chosen once during
//! initialization:
//! - [`RemoteBackend`]: a document store reached through a [`DocumentStore`] driver
//! - [`LocalBackend`]: a single JSON file on disk
//!
//! [`DocumentStore`]: document::DocumentStore

pub mod document;
pub mod http;
pub mod local;
pub mod memory;
pub mod remote;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Which kind of backend is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Remote => write!(f, "remote"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// The selected backend
#[derive(Debug, Clone)]
pub enum Backend {
    Remote(RemoteBackend),
    Local(LocalBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Remote(_) => BackendKind::Remote,
            Backend::Local(_) => BackendKind::Local,
        }
    }
}
