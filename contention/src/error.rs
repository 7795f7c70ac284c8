use cache_utils::mmap::MapError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentionError {
    #[error("invalid contention spec, {field}: {reason}")]
    InvalidSpec { field: &'static str, reason: String },

    #[error("allocation of {bytes} bytes failed: {source}")]
    AllocationFailed {
        bytes: usize,
        #[source]
        source: MapError,
    },

    #[error("cannot create datagram socket: {0}")]
    SocketUnavailable(#[source] io::Error),

    #[error("send to {destination} failed: {source}")]
    SendFailed {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn contention thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("contention unit panicked")]
    UnitPanicked,
}

impl ContentionError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ContentionError::InvalidSpec {
            field,
            reason: reason.into(),
        }
    }
}
