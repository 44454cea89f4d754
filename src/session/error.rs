use crate::device::DeviceError;

/// A status line that is impossible in the current session state.
///
/// The server and registry disagree about the world; the run is aborted
/// through cleanup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("socket {socket} connected twice")]
    DuplicateConnection { socket: u32 },

    #[error("socket {socket} is not connected")]
    UnknownSocket { socket: u32 },

    #[error("socket {socket} already has prefix {prefix}")]
    PrefixAlreadySet { socket: u32, prefix: String },

    #[error("socket {socket} has no prefix yet")]
    NotRunning { socket: u32 },

    #[error("socket {socket} closed with prefix {given}, but its prefix is {expected}")]
    PrefixMismatch {
        socket: u32,
        expected: String,
        given: String,
    },

    #[error("socket {socket} released {file}, which is outside its prefix {prefix}")]
    FileOutsidePrefix {
        socket: u32,
        file: String,
        prefix: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    #[error(transparent)]
    Device(#[from] DeviceError),
}
