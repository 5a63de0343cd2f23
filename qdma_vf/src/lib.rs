// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VF-side mailbox client for the QDMA multi-queue DMA engine.
//!
//! A VF driver has no access to privileged engine state. Queue allocation,
//! context programming and interrupt ring setup all go to the parent PF over
//! the function's mailbox window. [`VfMailbox`] wraps that window with a
//! strict request/response discipline: one outstanding request, bounded
//! polling for the response, a handshake reset and bounded resends when the
//! PF goes quiet, and a failure latch once it stays quiet.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use qdma_defs::CsrBlock;
use qdma_defs::DescqConf;
use qdma_defs::MboxDevInfo;
use qdma_mbox::channel::MboxChannel;
use qdma_mbox::channel::MboxRole;
use qdma_mbox::message::is_response;
use qdma_mbox::message::vf_ack;
use qdma_mbox::message::vf_csr_info;
use qdma_mbox::message::vf_dev_info;
use qdma_mbox::message::vf_func_id;
use qdma_mbox::message::vf_intr_ctxt;
use qdma_mbox::message::vf_parent_func_id;
use qdma_mbox::message::vf_qctxt;
use qdma_mbox::message::vf_qinfo;
use qdma_mbox::message::IntrCtxt;
use qdma_mbox::message::IntrRings;
use qdma_mbox::message::MboxMessage;
use qdma_mbox::message::MboxRequest;
use qdma_mbox::message::QueueSel;
use qdma_mbox::registers::MboxRegisterIo;
use qdma_mbox::MboxError;
use std::time::Duration;
use std::time::Instant;

#[cfg(test)]
mod tests;

/// Tuning for the VF's response polling.
#[derive(Debug, Clone)]
pub struct VfMboxConfig {
    /// How long to poll for a response before resetting the handshake.
    pub response_timeout: Duration,
    /// Delay between response polls.
    pub poll_interval: Duration,
    /// How many times to reset and resend before latching failure.
    pub send_retries: u32,
}

impl Default for VfMboxConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(1),
            send_retries: 3,
        }
    }
}

/// Identity and queue grant reported by the PF when the function comes
/// online.
#[derive(Debug, Clone, Copy)]
pub struct VfIdentity {
    /// This function's id as the PF sees it.
    pub func_id: u16,
    /// The parent PF's function id.
    pub parent_pf: u16,
    /// First queue of the grant.
    pub qbase: u16,
    /// Queue count of the grant.
    pub qmax: u16,
    /// Device capabilities and total queue count.
    pub dev: MboxDevInfo,
}

/// Mailbox client owned by a VF driver, speaking to its parent PF.
pub struct VfMailbox<T: MboxRegisterIo> {
    chan: MboxChannel<T>,
    parent_pf: u16,
    config: VfMboxConfig,
    online: bool,
    failed: bool,
}

impl<T: MboxRegisterIo> VfMailbox<T> {
    /// Initializes the VF mailbox window.
    pub fn new(
        io: T,
        func_id: u16,
        parent_pf: u16,
        config: VfMboxConfig,
    ) -> Result<Self, MboxError> {
        let chan = MboxChannel::new(io, MboxRole::Vf, func_id)?;
        Ok(Self {
            chan,
            parent_pf,
            config,
            online: false,
            failed: false,
        })
    }

    /// This function's id.
    pub fn func_id(&self) -> u16 {
        self.chan.func_id()
    }

    /// The parent PF's function id.
    pub fn parent_pf(&self) -> u16 {
        self.parent_pf
    }

    /// Whether the client latched failure and stopped issuing requests.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Whether the function is currently online with the PF.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Brings the function online, allocating `qmax` queues (zero for the PF
    /// default) at `qbase` if given.
    pub fn online(&mut self, qmax: u16, qbase: Option<u16>) -> Result<VfIdentity, MboxError> {
        let resp = self.transact(&MboxRequest::VfOnline { qmax, qbase })?;
        let (qbase, qmax) = vf_qinfo(&resp)?;
        let dev = vf_dev_info(&resp)?;
        let func_id = vf_func_id(&resp)?;
        let parent_pf = vf_parent_func_id(&resp)?;
        if func_id != self.chan.func_id() {
            // The PF derives the source from the status register, so its
            // view wins over whatever this driver was constructed with.
            tracing::warn!(
                claimed = self.chan.func_id(),
                reported = func_id,
                "function id corrected by the PF"
            );
        }
        self.online = true;
        tracing::info!(func_id, qbase, qmax, "function online");
        Ok(VfIdentity {
            func_id,
            parent_pf,
            qbase,
            qmax,
            dev,
        })
    }

    /// Takes the function offline, releasing its queue grant.
    pub fn offline(&mut self) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::VfOffline)?;
        vf_ack(&resp)?;
        self.online = false;
        tracing::info!(func_id = self.chan.func_id(), "function offline");
        Ok(())
    }

    /// Re-negotiates the function's queue range. Any previously programmed
    /// queue map is dropped by the PF and must be programmed again.
    pub fn request_queues(
        &mut self,
        qmax: u16,
        qbase: Option<u16>,
    ) -> Result<(u16, u16), MboxError> {
        let resp = self.transact(&MboxRequest::Qreq { qmax, qbase })?;
        vf_qinfo(&resp)
    }

    /// Reports a queue as brought up, for the PF's accounting.
    pub fn notify_qadd(&mut self, qid_hw: u16) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::NotifyQadd { qid_hw })?;
        vf_ack(&resp)
    }

    /// Reports a queue as torn down.
    pub fn notify_qdel(&mut self, qid_hw: u16) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::NotifyQdel { qid_hw })?;
        vf_ack(&resp)
    }

    /// Programs the function's queue map window in hardware.
    pub fn fmap_program(&mut self, qbase: u16, qmax: u16) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::Fmap { qbase, qmax })?;
        vf_ack(&resp)
    }

    /// Programs a descriptor-queue context.
    pub fn qctxt_write(&mut self, sel: QueueSel, conf: DescqConf) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::QctxtWrite { sel, conf })?;
        vf_ack(&resp)
    }

    /// Reads back a descriptor-queue context.
    pub fn qctxt_read(&mut self, sel: QueueSel) -> Result<DescqConf, MboxError> {
        let resp = self.transact(&MboxRequest::QctxtRead { sel })?;
        let (_, conf) = vf_qctxt(&resp)?;
        Ok(conf)
    }

    /// Invalidates a descriptor-queue context.
    pub fn qctxt_invalidate(&mut self, sel: QueueSel) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::QctxtInvalidate { sel })?;
        vf_ack(&resp)
    }

    /// Clears a descriptor-queue context.
    pub fn qctxt_clear(&mut self, sel: QueueSel) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::QctxtClear { sel })?;
        vf_ack(&resp)
    }

    /// Reads the global CSR snapshot.
    pub fn csr_read(&mut self) -> Result<CsrBlock, MboxError> {
        let resp = self.transact(&MboxRequest::CsrRead)?;
        vf_csr_info(&resp)
    }

    /// Programs interrupt aggregation ring contexts.
    pub fn intr_ctxt_write(&mut self, ctxt: IntrCtxt) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::IntrCtxtWrite { ctxt })?;
        vf_ack(&resp)
    }

    /// Reads back interrupt aggregation ring contexts.
    pub fn intr_ctxt_read(&mut self, rings: IntrRings) -> Result<IntrCtxt, MboxError> {
        let resp = self.transact(&MboxRequest::IntrCtxtRead { rings })?;
        vf_intr_ctxt(&resp)
    }

    /// Invalidates interrupt aggregation ring contexts.
    pub fn intr_ctxt_invalidate(&mut self, rings: IntrRings) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::IntrCtxtInvalidate { rings })?;
        vf_ack(&resp)
    }

    /// Clears interrupt aggregation ring contexts.
    pub fn intr_ctxt_clear(&mut self, rings: IntrRings) -> Result<(), MboxError> {
        let resp = self.transact(&MboxRequest::IntrCtxtClear { rings })?;
        vf_ack(&resp)
    }

    /// Programs the function's mailbox interrupt vector.
    pub fn set_interrupt_vector(&mut self, vec: u8) -> Result<(), MboxError> {
        self.chan.set_interrupt_vector(vec)
    }

    /// Enables the response interrupt on the function's window.
    pub fn enable_interrupts(&mut self) {
        self.chan.enable_interrupts();
    }

    /// Disables the response interrupt; polling keeps working.
    pub fn disable_interrupts(&mut self) {
        self.chan.disable_interrupts();
    }

    /// Sends `req` to the parent PF and polls for the matching response.
    ///
    /// Returns [`MboxError::ChannelBusy`] without side effects while an
    /// earlier request is still in flight. On a response timeout the
    /// handshake is reset and the request resent up to
    /// [`VfMboxConfig::send_retries`] times; if the PF still does not
    /// answer, the client latches [`VfMailbox::failed`] and every later
    /// request fails fast.
    pub fn transact(&mut self, req: &MboxRequest) -> Result<MboxMessage, MboxError> {
        if self.failed {
            return Err(MboxError::HardwareFault("mailbox client failed"));
        }
        let msg = req.encode(self.chan.func_id(), self.parent_pf)?;
        match self.chan.send(self.parent_pf, msg.clone()) {
            Ok(()) => {}
            // A request is already in flight; the caller must collect it
            // before issuing another.
            Err(err @ MboxError::ChannelBusy) => return Err(err),
            Err(err) => return Err(self.fail(err)),
        }
        let mut attempts_left = self.config.send_retries;
        loop {
            if let Some(resp) = self.wait_response(&msg)? {
                return Ok(resp);
            }
            if attempts_left == 0 {
                return Err(self.fail(MboxError::Timeout));
            }
            attempts_left -= 1;
            tracing::warn!(
                op = ?req.op(),
                attempts_left,
                "mailbox response timed out; resetting handshake"
            );
            if let Err(err) = self.chan.clear_ack() {
                return Err(self.fail(err));
            }
            match self.chan.send(self.parent_pf, msg.clone()) {
                Ok(()) => {}
                // The original request is still latched; keep waiting on it.
                Err(MboxError::ChannelBusy) => {}
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Polls until `sent`'s response arrives or the per-attempt deadline
    /// passes. `Ok(None)` is a timeout; hardware errors latch failure.
    fn wait_response(&mut self, sent: &MboxMessage) -> Result<Option<MboxMessage>, MboxError> {
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            match self.chan.receive() {
                Ok((src_fn, resp)) => {
                    if is_response(sent, &resp) {
                        return Ok(Some(resp));
                    }
                    tracing::warn!(src_fn, "dropping uncorrelated mailbox message");
                }
                Err(MboxError::NoMessage) => {}
                Err(err) => return Err(self.fail(err)),
            }
            if Instant::now() > deadline {
                return Ok(None);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn fail(&mut self, err: MboxError) -> MboxError {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            "mailbox transaction failed"
        );
        self.failed = true;
        err
    }
}

impl<T: MboxRegisterIo> Drop for VfMailbox<T> {
    fn drop(&mut self) {
        if !self.online || self.failed {
            return;
        }
        // Release the queue grant so the function's resources can be reused.
        if let Err(err) = self.offline() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "offline on drop failed"
            );
        }
    }
}
