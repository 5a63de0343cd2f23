// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Message codec and channel handshake for the QDMA function-to-function
//! mailbox.
//!
//! The mailbox is the control plane between the PF driver and the VF drivers
//! of the multi-queue DMA engine. This crate provides the pieces shared by
//! both sides: the fixed 32-word [`message::MboxMessage`] buffer with its
//! compose/parse codec and response correlator, and the
//! [`channel::MboxChannel`] register handshake (send, receive, ack clearing,
//! interrupt enables) over a [`registers::MboxRegisterIo`] window. An
//! [`emulated`] loopback device backs the tests of both drivers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod emulated;
pub mod message;
pub mod registers;

use qdma_defs::MboxStatus;
use thiserror::Error;

/// Mailbox protocol or transport failure.
#[derive(Debug, Error)]
pub enum MboxError {
    /// A caller-supplied field cannot be represented on the wire.
    #[error("invalid {field} value {value:#x}")]
    InvalidArgument {
        /// Field name.
        field: &'static str,
        /// Rejected value.
        value: u64,
    },
    /// An inbound message failed validation.
    #[error("malformed mailbox message: {0}")]
    MalformedMessage(&'static str),
    /// The outbound slot still holds a message the peer has not consumed.
    #[error("mailbox channel busy")]
    ChannelBusy,
    /// No inbound message is pending.
    #[error("no mailbox message pending")]
    NoMessage,
    /// No correlated response arrived within the deadline.
    #[error("timed out waiting for mailbox response")]
    Timeout,
    /// The mailbox window is unusable.
    #[error("mailbox hardware fault: {0}")]
    HardwareFault(&'static str),
    /// The peer processed the request and rejected it.
    #[error("request failed with status {0:?}")]
    RequestFailed(MboxStatus),
}
