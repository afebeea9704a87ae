use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CinderError>;

#[derive(Debug, Error)]
pub enum CinderError {
    #[error("no usable KMS device found")]
    NoDisplay,

    #[error("drm: {0}")]
    Drm(#[source] io::Error),

    #[error("surface: {0}")]
    Surface(String),

    #[error("terminal {vt}: {source}")]
    Terminal {
        vt: usize,
        #[source]
        source: io::Error,
    },

    #[error("vt {0} out of range")]
    BadVt(usize),

    #[error("input: {0}")]
    Input(#[source] io::Error),

    #[error("image {path}: {reason}")]
    Image { path: String, reason: String },

    #[error("ipc: {0}")]
    Ipc(String),

    #[error("event loop: {0}")]
    EventLoop(String),

    #[error("invalid argument: {0}")]
    BadArgument(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
