// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mailbox channel handshake.
//!
//! A [`MboxChannel`] drives one function's end of the mailbox: latching
//! outgoing messages, consuming incoming ones, and keeping the hardware
//! acknowledgment state coherent. It is strictly non-blocking; waiting for a
//! response is the caller's job.

use crate::message::MboxMessage;
use crate::registers::MboxRegisterIo;
use crate::registers::MboxRegs;
use crate::MboxError;
use qdma_defs::FnCmd;
use qdma_defs::FnStatus;
use qdma_defs::MBOX_FN_ID_BITS;
use qdma_defs::MBOX_ISR_VEC_BITS;
use qdma_defs::MBOX_MSG_WORDS;
use qdma_defs::MBOX_PF_ACK_WORDS;

/// Which side of the mailbox a channel drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MboxRole {
    /// Physical function.
    Pf,
    /// Virtual function.
    Vf,
}

/// One function's end of the mailbox.
pub struct MboxChannel<T> {
    regs: MboxRegs<T>,
    role: MboxRole,
    func_id: u16,
    outstanding: bool,
    ack_shadow: [u32; MBOX_PF_ACK_WORDS],
    intr_enabled: bool,
}

impl<T: MboxRegisterIo> MboxChannel<T> {
    /// Initializes the mailbox window for `func_id`.
    ///
    /// Clears acknowledgment state left by a previous driver instance; a VF
    /// also drops any stale inbound response. A request already parked at
    /// the PF stays pending so the service loop can answer it. Interrupts
    /// start disabled.
    pub fn new(io: T, role: MboxRole, func_id: u16) -> Result<Self, MboxError> {
        if u64::from(func_id) >> MBOX_FN_ID_BITS != 0 {
            return Err(MboxError::InvalidArgument {
                field: "func_id",
                value: func_id.into(),
            });
        }
        let regs = match role {
            MboxRole::Pf => MboxRegs::new_pf(io),
            MboxRole::Vf => MboxRegs::new_vf(io),
        };
        let mut chan = Self {
            regs,
            role,
            func_id,
            outstanding: false,
            ack_shadow: [0; MBOX_PF_ACK_WORDS],
            intr_enabled: false,
        };
        chan.hw_init()?;
        Ok(chan)
    }

    fn hw_init(&mut self) -> Result<(), MboxError> {
        let status = self.read_status()?;
        match self.role {
            MboxRole::Pf => {
                // A request parked before this service instance started
                // stays pending; every request still gets its response.
                for i in 0..MBOX_PF_ACK_WORDS {
                    self.regs.set_pf_ack_word(i, !0);
                }
            }
            MboxRole::Vf => {
                // A stale response from a previous driver instance has no
                // waiter.
                if status.in_msg() {
                    tracing::debug!(func_id = self.func_id, "draining stale mailbox message");
                    self.regs.set_fn_cmd(FnCmd::new().with_rcv(true));
                }
            }
        }
        self.regs.set_isr_en(0);
        self.outstanding = status.out_msg();
        Ok(())
    }

    fn read_status(&self) -> Result<FnStatus, MboxError> {
        let status = self.regs.fn_status();
        if u32::from(status) == !0 {
            return Err(MboxError::HardwareFault("mailbox status reads all ones"));
        }
        Ok(status)
    }

    /// Returns this channel's function id.
    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    /// Returns the channel role.
    pub fn role(&self) -> MboxRole {
        self.role
    }

    /// Returns whether the last sent message was still unconsumed by the
    /// peer as of the most recent register poll.
    pub fn outstanding(&self) -> bool {
        self.outstanding
    }

    /// Sends `msg` to `dst_fn`.
    ///
    /// Fails with [`MboxError::ChannelBusy`] while the previously sent
    /// message has not been consumed by the peer; the outbound slot holds
    /// exactly one message.
    pub fn send(&mut self, dst_fn: u16, msg: MboxMessage) -> Result<(), MboxError> {
        if u64::from(dst_fn) >> MBOX_FN_ID_BITS != 0 {
            return Err(MboxError::InvalidArgument {
                field: "dst_fn",
                value: dst_fn.into(),
            });
        }
        let status = self.read_status()?;
        if status.out_msg() {
            self.outstanding = true;
            return Err(MboxError::ChannelBusy);
        }
        for (i, &word) in msg.words().iter().enumerate() {
            self.regs.set_out_msg_word(i, word);
        }
        self.regs.set_fn_target(dst_fn.into());
        self.regs.set_fn_cmd(FnCmd::new().with_snd(true));
        if self.role == MboxRole::Pf {
            // Mark the outbound message complete so the target VF sees it.
            self.regs.set_fn_status(FnStatus::new().with_ack(true));
        }
        self.outstanding = true;
        tracing::trace!(
            src = self.func_id,
            dst = dst_fn,
            op = msg.hdr().op(),
            "mailbox send"
        );
        Ok(())
    }

    /// Consumes the pending inbound message, if any.
    ///
    /// Returns the transport-level source function id with the message. On
    /// the PF this comes from the status register, not the message header,
    /// so a VF cannot spoof it.
    pub fn receive(&mut self) -> Result<(u16, MboxMessage), MboxError> {
        let status = self.read_status()?;
        self.outstanding = status.out_msg();
        if !status.in_msg() {
            return Err(MboxError::NoMessage);
        }
        let mut words = [0; MBOX_MSG_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.regs.in_msg_word(i);
        }
        let msg = MboxMessage::from_words(words);
        self.regs.set_fn_cmd(FnCmd::new().with_rcv(true));
        let src = match self.role {
            MboxRole::Pf => {
                let src = status.src_fn();
                // Release the sender's slot for its next message.
                self.clear_ack_bit(src);
                src
            }
            MboxRole::Vf => msg.hdr().src_fn(),
        };
        tracing::trace!(
            src,
            dst = self.func_id,
            op = msg.hdr().op(),
            "mailbox receive"
        );
        Ok((src, msg))
    }

    fn clear_ack_bit(&mut self, func_id: u16) {
        let word = usize::from(func_id) / 32;
        let bit = 1u32 << (func_id % 32);
        if word < MBOX_PF_ACK_WORDS {
            self.regs.set_pf_ack_word(word, bit);
            self.ack_shadow[word] &= !bit;
        }
    }

    /// Resets the hardware acknowledgment state of this channel.
    ///
    /// On the PF this snapshots and clears every per-function ack bit; on a
    /// VF it drops a stale inbound message. Used when recovering a channel
    /// after a fault or a response timeout.
    pub fn clear_ack(&mut self) -> Result<(), MboxError> {
        match self.role {
            MboxRole::Pf => {
                for i in 0..MBOX_PF_ACK_WORDS {
                    self.ack_shadow[i] = self.regs.pf_ack_word(i);
                    self.regs.set_pf_ack_word(i, !0);
                }
            }
            MboxRole::Vf => {
                let status = self.read_status()?;
                if status.in_msg() {
                    tracing::debug!(func_id = self.func_id, "dropping stale inbound message");
                    self.regs.set_fn_cmd(FnCmd::new().with_rcv(true));
                }
            }
        }
        Ok(())
    }

    /// Returns whether `func_id` had acknowledged a message as of the last
    /// [`Self::clear_ack`].
    pub fn ack_pending(&self, func_id: u16) -> bool {
        let word = usize::from(func_id) / 32;
        word < MBOX_PF_ACK_WORDS && self.ack_shadow[word] & 1 << (func_id % 32) != 0
    }

    /// Programs the interrupt vector for this function's mailbox interrupt.
    pub fn set_interrupt_vector(&mut self, vec: u8) -> Result<(), MboxError> {
        if u64::from(vec) >> MBOX_ISR_VEC_BITS != 0 {
            return Err(MboxError::InvalidArgument {
                field: "vec",
                value: vec.into(),
            });
        }
        self.regs.set_isr_vec(vec.into());
        Ok(())
    }

    /// Enables the mailbox message interrupt.
    pub fn enable_interrupts(&mut self) {
        self.regs.set_isr_en(1);
        self.intr_enabled = true;
    }

    /// Disables the mailbox message interrupt. Polling keeps working.
    pub fn disable_interrupts(&mut self) {
        self.regs.set_isr_en(0);
        self.intr_enabled = false;
    }

    /// Returns whether the mailbox message interrupt is enabled.
    pub fn interrupts_enabled(&self) -> bool {
        self.intr_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedMbox;
    use crate::message::status_response;
    use crate::message::MboxRequest;
    use qdma_defs::MboxStatus;

    #[test]
    fn vf_to_pf_round_trip() {
        let dev = EmulatedMbox::new();
        let mut vf = MboxChannel::new(dev.vf_io(5), MboxRole::Vf, 5).unwrap();
        let mut pf = MboxChannel::new(dev.pf_io(), MboxRole::Pf, 0).unwrap();

        let req = MboxRequest::CsrRead.encode(5, 0).unwrap();
        vf.send(0, req.clone()).unwrap();
        assert!(vf.outstanding());

        let (src, rcvd) = pf.receive().unwrap();
        assert_eq!(src, 5);
        assert_eq!(rcvd.words(), req.words());

        // Consuming the request freed the VF's outbound slot.
        assert!(matches!(pf.receive(), Err(MboxError::NoMessage)));
        vf.send(0, req).unwrap();
        pf.receive().unwrap();
    }

    #[test]
    fn pf_response_reaches_vf() {
        let dev = EmulatedMbox::new();
        let mut vf = MboxChannel::new(dev.vf_io(3), MboxRole::Vf, 3).unwrap();
        let mut pf = MboxChannel::new(dev.pf_io(), MboxRole::Pf, 0).unwrap();

        let req = MboxRequest::VfOffline.encode(3, 0).unwrap();
        vf.send(0, req.clone()).unwrap();
        let (src, _) = pf.receive().unwrap();

        pf.send(src, status_response(req.hdr(), MboxStatus::OK)).unwrap();
        let (resp_src, resp) = vf.receive().unwrap();
        assert_eq!(resp_src, 0);
        assert!(resp.hdr().resp());
        assert_eq!(resp.status(), MboxStatus::OK);
    }

    #[test]
    fn second_send_while_outstanding_is_busy() {
        let dev = EmulatedMbox::new();
        let mut vf = MboxChannel::new(dev.vf_io(2), MboxRole::Vf, 2).unwrap();

        let req = MboxRequest::CsrRead.encode(2, 0).unwrap();
        vf.send(0, req.clone()).unwrap();
        assert!(matches!(vf.send(0, req), Err(MboxError::ChannelBusy)));
    }

    #[test]
    fn receive_without_message() {
        let dev = EmulatedMbox::new();
        let mut pf = MboxChannel::new(dev.pf_io(), MboxRole::Pf, 0).unwrap();
        assert!(matches!(pf.receive(), Err(MboxError::NoMessage)));
    }

    #[test]
    fn request_parked_before_pf_init_stays_pending() {
        let dev = EmulatedMbox::new();
        let mut vf = MboxChannel::new(dev.vf_io(6), MboxRole::Vf, 6).unwrap();
        let req = MboxRequest::CsrRead.encode(6, 0).unwrap();
        vf.send(0, req.clone()).unwrap();

        // The PF comes up after the request was sent; it must not discard
        // it, or the VF would wait forever.
        let mut pf = MboxChannel::new(dev.pf_io(), MboxRole::Pf, 0).unwrap();
        let (src, rcvd) = pf.receive().unwrap();
        assert_eq!(src, 6);
        assert_eq!(rcvd.words(), req.words());

        pf.send(src, status_response(req.hdr(), MboxStatus::OK)).unwrap();
        let (_, resp) = vf.receive().unwrap();
        assert_eq!(resp.status(), MboxStatus::OK);
    }

    #[test]
    fn clear_ack_drops_stale_vf_inbound() {
        let dev = EmulatedMbox::new();
        let mut vf = MboxChannel::new(dev.vf_io(4), MboxRole::Vf, 4).unwrap();
        let mut pf = MboxChannel::new(dev.pf_io(), MboxRole::Pf, 0).unwrap();

        let req = MboxRequest::CsrRead.encode(4, 0).unwrap();
        vf.send(0, req.clone()).unwrap();
        pf.receive().unwrap();
        pf.send(4, status_response(req.hdr(), MboxStatus::OK)).unwrap();

        vf.clear_ack().unwrap();
        assert!(matches!(vf.receive(), Err(MboxError::NoMessage)));
    }

    #[test]
    fn rejects_wide_function_ids() {
        let dev = EmulatedMbox::new();
        assert!(matches!(
            MboxChannel::new(dev.vf_io(1), MboxRole::Vf, 0x1000),
            Err(MboxError::InvalidArgument { .. })
        ));
        let mut vf = MboxChannel::new(dev.vf_io(1), MboxRole::Vf, 1).unwrap();
        let req = MboxRequest::CsrRead.encode(1, 0).unwrap();
        assert!(matches!(
            vf.send(0x1000, req),
            Err(MboxError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn interrupt_vector_bounds() {
        let dev = EmulatedMbox::new();
        let mut vf = MboxChannel::new(dev.vf_io(1), MboxRole::Vf, 1).unwrap();
        vf.set_interrupt_vector(31).unwrap();
        assert!(vf.set_interrupt_vector(32).is_err());
        vf.enable_interrupts();
        assert!(vf.interrupts_enabled());
        vf.disable_interrupts();
        assert!(!vf.interrupts_enabled());
    }
}
