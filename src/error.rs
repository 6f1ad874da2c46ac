use std::io;

use thiserror::Error;

/// Persistent-file save failures. Messages stay short and stable; periodic
/// saves re-assert the dirty flag so the next cycle retries.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("could not open file")]
    Open(#[source] io::Error),
    #[error("error saving file")]
    Write(#[source] io::Error),
    #[error("could not rename temp file to real file")]
    Rename(#[source] io::Error),
}

/// Persistent-file load failures. Per-line problems go to the warn callback
/// instead; only file access and a bad header abort the load.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not open file")]
    Open(#[source] io::Error),
    #[error("error reading file")]
    Read(#[source] io::Error),
    #[error("header line mismatch, ignoring rest of file")]
    BadHeader,
}

/// Crate-level convenience error: a thin wrapper over the capability errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Save(#[from] SaveError),

    #[error(transparent)]
    Load(#[from] LoadError),
}
