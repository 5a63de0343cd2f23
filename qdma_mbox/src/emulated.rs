// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated mailbox device for testing.
//!
//! Models the hardware between the PF window and any number of VF windows:
//! the per-function outbound latch, the PF's pending-message queue, the
//! acknowledgment handshake, and interrupt delivery counters. All windows
//! share one interior-locked state, so a PF and several VF drivers can run
//! against it from different threads.

use crate::registers::MboxRegisterIo;
use parking_lot::Mutex;
use qdma_defs::FnCmd;
use qdma_defs::FnStatus;
use qdma_defs::MboxRegister;
use qdma_defs::MBOX_BASE_PF;
use qdma_defs::MBOX_BASE_VF;
use qdma_defs::MBOX_MSG_WORDS;
use qdma_defs::MBOX_PF_ACK_WORDS;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// An emulated mailbox: one PF window plus a VF window per function id.
#[derive(Clone)]
pub struct EmulatedMbox {
    state: Arc<Mutex<MboxState>>,
}

impl EmulatedMbox {
    /// Creates an emulated mailbox with no functions online.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MboxState::default())),
        }
    }

    /// Returns the register view of `func_id`'s VF mailbox window.
    pub fn vf_io(&self, func_id: u16) -> VfMboxIo {
        self.state.lock().vfs.entry(func_id).or_default();
        VfMboxIo {
            state: self.state.clone(),
            func_id,
        }
    }

    /// Returns the register view of the PF mailbox window.
    pub fn pf_io(&self) -> PfMboxIo {
        PfMboxIo {
            state: self.state.clone(),
        }
    }

    /// Makes every subsequent register read return all ones, as reads from a
    /// surprise-removed device do. Writes are dropped.
    pub fn fail_device(&self) {
        self.state.lock().failed = true;
    }

    /// Messages signaled to the PF while its interrupt was enabled.
    pub fn pf_interrupt_count(&self) -> u64 {
        self.state.lock().pf.irq_count
    }

    /// Messages signaled to `func_id` while its interrupt was enabled.
    pub fn vf_interrupt_count(&self, func_id: u16) -> u64 {
        self.state.lock().vfs.get(&func_id).map_or(0, |vf| vf.irq_count)
    }
}

impl Default for EmulatedMbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Register view of one VF's mailbox window.
#[derive(Clone)]
pub struct VfMboxIo {
    state: Arc<Mutex<MboxState>>,
    func_id: u16,
}

/// Register view of the PF's mailbox window.
#[derive(Clone)]
pub struct PfMboxIo {
    state: Arc<Mutex<MboxState>>,
}

impl MboxRegisterIo for VfMboxIo {
    fn read_u32(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        if state.failed {
            return !0;
        }
        state.vf_read(self.func_id, window_reg(MBOX_BASE_VF, offset))
    }

    fn write_u32(&self, offset: usize, data: u32) {
        let mut state = self.state.lock();
        if state.failed {
            return;
        }
        state.vf_write(self.func_id, window_reg(MBOX_BASE_VF, offset), data);
    }
}

impl MboxRegisterIo for PfMboxIo {
    fn read_u32(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        if state.failed {
            return !0;
        }
        state.pf_read(window_reg(MBOX_BASE_PF, offset))
    }

    fn write_u32(&self, offset: usize, data: u32) {
        let mut state = self.state.lock();
        if state.failed {
            return;
        }
        state.pf_write(window_reg(MBOX_BASE_PF, offset), data);
    }
}

fn window_reg(base: usize, offset: usize) -> u16 {
    assert!(
        (base..base + 0x1000).contains(&offset),
        "offset {offset:#x} outside the mailbox window at {base:#x}"
    );
    (offset - base) as u16
}

const PF_ACK_END: u16 = MboxRegister::PF_ACK_BASE.0 + MBOX_PF_ACK_WORDS as u16 * 4;
const IN_MSG_END: u16 = MboxRegister::IN_MSG_BASE.0 + MBOX_MSG_WORDS as u16 * 4;
const OUT_MSG_END: u16 = MboxRegister::OUT_MSG_BASE.0 + MBOX_MSG_WORDS as u16 * 4;

#[derive(Default)]
struct MboxState {
    vfs: BTreeMap<u16, VfSlot>,
    pf: PfSlot,
    failed: bool,
}

#[derive(Default)]
struct VfSlot {
    /// Message delivered by the PF, cleared by `FN_CMD.rcv`.
    inbox: Option<[u32; MBOX_MSG_WORDS]>,
    /// Staging buffer behind the `OUT_MSG` registers.
    outbox: [u32; MBOX_MSG_WORDS],
    /// Message latched by `FN_CMD.snd`, held until the PF consumes it.
    out_pending: Option<[u32; MBOX_MSG_WORDS]>,
    target: u16,
    isr_en: bool,
    isr_vec: u32,
    irq_count: u64,
}

#[derive(Default)]
struct PfSlot {
    /// Source function ids of latched VF messages, in arrival order.
    pending: VecDeque<u16>,
    outbox: [u32; MBOX_MSG_WORDS],
    /// Latched response words, delivered to `out_busy` on ack assert.
    staged: [u32; MBOX_MSG_WORDS],
    /// Target of the latched response, held until that VF consumes it.
    out_busy: Option<u16>,
    ack: [u32; MBOX_PF_ACK_WORDS],
    target: u16,
    isr_en: bool,
    isr_vec: u32,
    irq_count: u64,
}

impl MboxState {
    fn vf_read(&mut self, func_id: u16, reg: u16) -> u32 {
        let vf = self.vfs.entry(func_id).or_default();
        match reg {
            r if r == MboxRegister::FN_STATUS.0 => FnStatus::new()
                .with_in_msg(vf.inbox.is_some())
                .with_out_msg(vf.out_pending.is_some())
                .into(),
            r if r == MboxRegister::FN_CMD.0 => 0,
            r if r == MboxRegister::ISR_VEC.0 => vf.isr_vec,
            r if r == MboxRegister::FN_TARGET.0 => vf.target.into(),
            r if r == MboxRegister::ISR_EN.0 => vf.isr_en.into(),
            r if (MboxRegister::PF_ACK_BASE.0..PF_ACK_END).contains(&r) => 0,
            r if (MboxRegister::IN_MSG_BASE.0..IN_MSG_END).contains(&r) => {
                let i = usize::from(r - MboxRegister::IN_MSG_BASE.0) / 4;
                vf.inbox.map_or(0, |msg| msg[i])
            }
            r if (MboxRegister::OUT_MSG_BASE.0..OUT_MSG_END).contains(&r) => {
                let i = usize::from(r - MboxRegister::OUT_MSG_BASE.0) / 4;
                vf.outbox[i]
            }
            _ => panic!("unknown mailbox register {reg:#x}"),
        }
    }

    fn vf_write(&mut self, func_id: u16, reg: u16, data: u32) {
        match reg {
            // No writable status bits on a VF window.
            r if r == MboxRegister::FN_STATUS.0 => {}
            r if r == MboxRegister::FN_CMD.0 => {
                let cmd = FnCmd::from(data);
                if cmd.snd() {
                    self.vf_send(func_id);
                }
                if cmd.rcv() {
                    self.vf_consume(func_id);
                }
                if cmd.vf_reset() {
                    self.vf_reset(func_id);
                }
            }
            r if r == MboxRegister::ISR_VEC.0 => {
                self.vfs.entry(func_id).or_default().isr_vec = data & 0x1f;
            }
            r if r == MboxRegister::FN_TARGET.0 => {
                self.vfs.entry(func_id).or_default().target = data as u16;
            }
            r if r == MboxRegister::ISR_EN.0 => {
                self.vfs.entry(func_id).or_default().isr_en = data & 1 != 0;
            }
            r if (MboxRegister::PF_ACK_BASE.0..PF_ACK_END).contains(&r) => {}
            r if (MboxRegister::IN_MSG_BASE.0..IN_MSG_END).contains(&r) => {}
            r if (MboxRegister::OUT_MSG_BASE.0..OUT_MSG_END).contains(&r) => {
                let i = usize::from(r - MboxRegister::OUT_MSG_BASE.0) / 4;
                self.vfs.entry(func_id).or_default().outbox[i] = data;
            }
            _ => panic!("unknown mailbox register {reg:#x}"),
        }
    }

    fn vf_send(&mut self, func_id: u16) {
        let vf = self.vfs.entry(func_id).or_default();
        if vf.out_pending.is_some() {
            // Slot busy. Hardware drops the trigger.
            return;
        }
        vf.out_pending = Some(vf.outbox);
        self.pf.pending.push_back(func_id);
        if self.pf.isr_en {
            tracing::debug!(func_id, "signaling mailbox interrupt to pf");
            self.pf.irq_count += 1;
        }
    }

    fn vf_consume(&mut self, func_id: u16) {
        let vf = self.vfs.entry(func_id).or_default();
        if vf.inbox.take().is_some() {
            // Record the consumption for the PF and free its response slot.
            let word = usize::from(func_id) / 32;
            if word < MBOX_PF_ACK_WORDS {
                self.pf.ack[word] |= 1 << (func_id % 32);
            }
            if self.pf.out_busy == Some(func_id) {
                self.pf.out_busy = None;
            }
        }
    }

    fn vf_reset(&mut self, func_id: u16) {
        let vf = self.vfs.entry(func_id).or_default();
        vf.inbox = None;
        vf.out_pending = None;
        vf.outbox = [0; MBOX_MSG_WORDS];
        self.pf.pending.retain(|&f| f != func_id);
    }

    fn pf_read(&mut self, reg: u16) -> u32 {
        match reg {
            r if r == MboxRegister::FN_STATUS.0 => {
                let src = self.pf.pending.front().copied().unwrap_or(0);
                FnStatus::new()
                    .with_in_msg(!self.pf.pending.is_empty())
                    .with_out_msg(self.pf.out_busy.is_some())
                    .with_src_fn(src & 0xfff)
                    .into()
            }
            r if r == MboxRegister::FN_CMD.0 => 0,
            r if r == MboxRegister::ISR_VEC.0 => self.pf.isr_vec,
            r if r == MboxRegister::FN_TARGET.0 => self.pf.target.into(),
            r if r == MboxRegister::ISR_EN.0 => self.pf.isr_en.into(),
            r if (MboxRegister::PF_ACK_BASE.0..PF_ACK_END).contains(&r) => {
                let i = usize::from(r - MboxRegister::PF_ACK_BASE.0) / 4;
                self.pf.ack[i]
            }
            r if (MboxRegister::IN_MSG_BASE.0..IN_MSG_END).contains(&r) => {
                let i = usize::from(r - MboxRegister::IN_MSG_BASE.0) / 4;
                self.pf
                    .pending
                    .front()
                    .and_then(|src| self.vfs.get(src))
                    .and_then(|vf| vf.out_pending)
                    .map_or(0, |msg| msg[i])
            }
            r if (MboxRegister::OUT_MSG_BASE.0..OUT_MSG_END).contains(&r) => {
                let i = usize::from(r - MboxRegister::OUT_MSG_BASE.0) / 4;
                self.pf.outbox[i]
            }
            _ => panic!("unknown mailbox register {reg:#x}"),
        }
    }

    fn pf_write(&mut self, reg: u16, data: u32) {
        match reg {
            r if r == MboxRegister::FN_STATUS.0 => {
                if FnStatus::from(data).ack() {
                    self.pf_deliver();
                }
            }
            r if r == MboxRegister::FN_CMD.0 => {
                let cmd = FnCmd::from(data);
                if cmd.snd() {
                    self.pf_send();
                }
                if cmd.rcv() {
                    self.pf_consume();
                }
            }
            r if r == MboxRegister::ISR_VEC.0 => self.pf.isr_vec = data & 0x1f,
            r if r == MboxRegister::FN_TARGET.0 => self.pf.target = data as u16,
            r if r == MboxRegister::ISR_EN.0 => self.pf.isr_en = data & 1 != 0,
            r if (MboxRegister::PF_ACK_BASE.0..PF_ACK_END).contains(&r) => {
                // Write 1 to clear.
                let i = usize::from(r - MboxRegister::PF_ACK_BASE.0) / 4;
                self.pf.ack[i] &= !data;
            }
            r if (MboxRegister::IN_MSG_BASE.0..IN_MSG_END).contains(&r) => {}
            r if (MboxRegister::OUT_MSG_BASE.0..OUT_MSG_END).contains(&r) => {
                let i = usize::from(r - MboxRegister::OUT_MSG_BASE.0) / 4;
                self.pf.outbox[i] = data;
            }
            _ => panic!("unknown mailbox register {reg:#x}"),
        }
    }

    fn pf_send(&mut self) {
        if self.pf.out_busy.is_some() {
            return;
        }
        self.pf.out_busy = Some(self.pf.target);
        self.pf.staged = self.pf.outbox;
    }

    /// Ack assert: the latched response becomes visible to its target.
    fn pf_deliver(&mut self) {
        let Some(target) = self.pf.out_busy else {
            return;
        };
        let staged = self.pf.staged;
        let vf = self.vfs.entry(target).or_default();
        vf.inbox = Some(staged);
        if vf.isr_en {
            tracing::debug!(func_id = target, "signaling mailbox interrupt to vf");
            vf.irq_count += 1;
        }
    }

    fn pf_consume(&mut self) {
        if let Some(src) = self.pf.pending.pop_front() {
            if let Some(vf) = self.vfs.get_mut(&src) {
                vf.out_pending = None;
            }
        }
    }
}
