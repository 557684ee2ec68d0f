// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Receive-side core of a Homa-style transport protocol: message
//! reassembly, receiver-driven grant scheduling, and handoff of
//! completed (or failed) messages to waiting application threads.
//!
//! This crate models the packet-processing and scheduling logic only.
//! Packet transmission, the socket table, buffer-pool backing memory,
//! and address resolution are all collaborator interfaces consumed
//! through the traits in [`collab`]; production callers supply their own
//! implementations of those, and drive this crate by calling
//! [`dispatch::dispatch`] for each arriving packet and
//! [`wait::wait_for_message`] from each application thread that wants
//! the next completed message.

pub mod abort;
pub mod clock;
pub mod collab;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gap;
pub mod grant;
pub mod handlers;
pub mod metrics;
pub mod peer;
pub mod reassembly;
pub mod rpc;
pub mod socket;
pub mod transport;
pub mod wait;
pub mod wire;

pub use error::{Error, Result};
pub use transport::Transport;
