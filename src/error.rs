// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error type for the receive-side core.
//!
//! Mirrors `hdds::dds::Error`: a plain enum with a hand-written `Display`
//! and `std::error::Error` impl. Per the propagation policy, packet-level
//! protocol violations and buffer-exhaustion drops never become an `Error`
//! value — they are absorbed locally and only bump a metrics counter.

/// Errors surfaced to callers of the receive-side API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The named RPC id does not exist (e.g. `RegisterInterest` with a
    /// stale or unknown client id).
    NoSuchRpc,
    /// Caller-supplied argument is invalid (e.g. a server id passed where
    /// a client id was required).
    InvalidArgument,
    /// The socket has been shut down; all waiters wake with this error.
    SocketShutdown,
    /// A signal interrupted a blocking wait.
    Interrupted,
    /// Nonblocking mode was requested and no RPC was ready.
    WouldBlock,
    /// The user-buffer pool has no space left to satisfy an allocation.
    BufferPoolExhausted,
    /// A peer sent a packet that violates wire-protocol invariants.
    PacketProtocolViolation,
    /// RPC creation failed during dispatch (e.g. the collaborator's
    /// `rpc_table.new_server` returned an error).
    InternalCreateFailure,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NoSuchRpc => write!(f, "no such RPC"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::SocketShutdown => write!(f, "socket shut down"),
            Error::Interrupted => write!(f, "interrupted"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::BufferPoolExhausted => write!(f, "buffer pool exhausted"),
            Error::PacketProtocolViolation => write!(f, "packet protocol violation"),
            Error::InternalCreateFailure => write!(f, "internal RPC creation failure"),
        }
    }
}

impl std::error::Error for Error {}

/// Convenience alias for results using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
