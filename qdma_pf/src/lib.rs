// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PF-side mailbox service for the QDMA multi-queue DMA engine.
//!
//! The PF owns all privileged engine state. VF drivers reach it only through
//! mailbox requests, which [`dispatch::PfDispatcher`] validates against the
//! per-function grants in [`resources::QueueTable`] before programming
//! hardware through a [`dispatch::ContextBackend`]. [`PfMailbox`] couples
//! that dispatcher to the PF's hardware channel: each [`PfMailbox::poll`]
//! consumes at most one inbound request and latches its response, so the
//! loop can run from an interrupt handler or a periodic poll without ever
//! blocking on a VF.

#![forbid(unsafe_code)]

pub mod dispatch;
pub mod resources;

use dispatch::ContextBackend;
use dispatch::PfDispatcher;
use qdma_mbox::channel::MboxChannel;
use qdma_mbox::channel::MboxRole;
use qdma_mbox::message::MboxMessage;
use qdma_mbox::registers::MboxRegisterIo;
use qdma_mbox::MboxError;
use resources::PfConfig;

/// One PF mailbox endpoint: the hardware channel plus the dispatcher that
/// answers requests arriving on it.
pub struct PfMailbox<T, B> {
    chan: MboxChannel<T>,
    dispatcher: PfDispatcher<B>,
    /// Response that could not be latched because the outbound slot still
    /// held an earlier, unconsumed response.
    pending: Option<(u16, MboxMessage)>,
    faulted: bool,
}

impl<T: MboxRegisterIo, B: ContextBackend> PfMailbox<T, B> {
    /// Initializes the PF mailbox window and its dispatcher.
    pub fn new(io: T, func_id: u16, config: PfConfig, backend: B) -> Result<Self, MboxError> {
        let chan = MboxChannel::new(io, MboxRole::Pf, func_id)?;
        Ok(Self {
            chan,
            dispatcher: PfDispatcher::new(func_id, config, backend),
            pending: None,
            faulted: false,
        })
    }

    /// Returns the dispatcher, for resource inspection.
    pub fn dispatcher(&self) -> &PfDispatcher<B> {
        &self.dispatcher
    }

    /// Whether the channel faulted and needs [`Self::recover`].
    pub fn faulted(&self) -> bool {
        self.faulted
    }

    /// Serves at most one pending request: receive, dispatch, respond.
    ///
    /// Returns whether a request was served. `Ok(false)` means nothing was
    /// pending, or the outbound slot is still held by a response some VF has
    /// not consumed yet.
    pub fn poll(&mut self) -> Result<bool, MboxError> {
        if self.faulted {
            return Err(MboxError::HardwareFault("mailbox channel faulted"));
        }
        self.flush_pending()?;
        if self.pending.is_some() {
            // No room for another response until this one lands.
            return Ok(false);
        }
        let (src_fn, msg) = match self.chan.receive() {
            Ok(recv) => recv,
            Err(MboxError::NoMessage) => return Ok(false),
            Err(err) => return Err(self.fault(err)),
        };
        let resp = self.dispatcher.handle_request(src_fn, &msg);
        match self.chan.send(src_fn, resp.clone()) {
            Ok(()) => Ok(true),
            Err(MboxError::ChannelBusy) => {
                self.pending = Some((src_fn, resp));
                Ok(true)
            }
            Err(err) => Err(self.fault(err)),
        }
    }

    /// Serves requests until none are pending, returning how many were
    /// handled.
    pub fn poll_all(&mut self) -> Result<usize, MboxError> {
        let mut served = 0;
        while self.poll()? {
            served += 1;
        }
        Ok(served)
    }

    /// Resets the acknowledgment state and clears the fault latch.
    pub fn recover(&mut self) -> Result<(), MboxError> {
        self.chan.clear_ack()?;
        self.pending = None;
        self.faulted = false;
        tracing::info!("mailbox channel recovered");
        Ok(())
    }

    /// Enables the new-message interrupt on the PF window.
    pub fn enable_interrupts(&mut self) {
        self.chan.enable_interrupts();
    }

    /// Disables the new-message interrupt; polling keeps working.
    pub fn disable_interrupts(&mut self) {
        self.chan.disable_interrupts();
    }

    /// Programs the PF's mailbox interrupt vector.
    pub fn set_interrupt_vector(&mut self, vec: u8) -> Result<(), MboxError> {
        self.chan.set_interrupt_vector(vec)
    }

    fn flush_pending(&mut self) -> Result<(), MboxError> {
        let Some((dst, msg)) = self.pending.take() else {
            return Ok(());
        };
        match self.chan.send(dst, msg.clone()) {
            Ok(()) => Ok(()),
            Err(MboxError::ChannelBusy) => {
                self.pending = Some((dst, msg));
                Ok(())
            }
            Err(err) => Err(self.fault(err)),
        }
    }

    fn fault(&mut self, err: MboxError) -> MboxError {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            "mailbox channel fault"
        );
        self.faulted = true;
        err
    }
}
