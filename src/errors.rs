use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Pool exhausted, chunk allocation failed, ring full. Callers are
    /// expected to defer or fall back, never to fail the whole batch.
    #[error("insufficient resources: {0}")]
    InsufficientResources(&'static str),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("DMA mapping failed: {0}")]
    DmaMappingFailed(DmaFailure),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("Can't spawn worker: {0}")]
    Spawn(String),
}

/// Why a scatter-gather mapping could not be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaFailure {
    TooManySegments,
    AddressOutOfRange,
    DirectMappingForbidden,
}

impl std::fmt::Display for DmaFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DmaFailure::TooManySegments => write!(f, "segment count exceeded"),
            DmaFailure::AddressOutOfRange => write!(f, "physical address out of range"),
            DmaFailure::DirectMappingForbidden => write!(f, "direct mapping forbidden"),
        }
    }
}

impl Error {
    /// Resource exhaustion is recoverable and handled locally.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Error::InsufficientResources(_) | Error::DmaMappingFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
