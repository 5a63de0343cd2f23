// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mailbox register window access.

use qdma_defs::FnCmd;
use qdma_defs::FnStatus;
use qdma_defs::MboxRegister;
use qdma_defs::MBOX_BASE_PF;
use qdma_defs::MBOX_BASE_VF;
use qdma_defs::MBOX_MSG_WORDS;
use qdma_defs::MBOX_PF_ACK_WORDS;

/// Access to a function's BAR for mailbox register I/O.
///
/// Implemented over a real BAR mapping in production and by the
/// [`emulated`](crate::emulated) device in tests. Offsets are byte offsets
/// from the start of the BAR; the mailbox window base is added by the
/// wrapper, not the implementation.
pub trait MboxRegisterIo: Send + Sync {
    /// Reads the 32-bit register at `offset`.
    fn read_u32(&self, offset: usize) -> u32;
    /// Writes the 32-bit register at `offset`.
    fn write_u32(&self, offset: usize, data: u32);
}

pub(crate) struct MboxRegs<T> {
    io: T,
    base: usize,
}

macro_rules! reg32 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.io.read_u32(self.base + MboxRegister::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.io
                .write_u32(self.base + MboxRegister::$reg.0 as usize, v.into())
        }
    };
}

impl<T: MboxRegisterIo> MboxRegs<T> {
    pub fn new_vf(io: T) -> Self {
        Self {
            io,
            base: MBOX_BASE_VF,
        }
    }

    pub fn new_pf(io: T) -> Self {
        Self {
            io,
            base: MBOX_BASE_PF,
        }
    }

    reg32!(fn_status, set_fn_status, FN_STATUS, FnStatus);
    reg32!(fn_cmd, set_fn_cmd, FN_CMD, FnCmd);
    reg32!(isr_vec, set_isr_vec, ISR_VEC, u32);
    reg32!(fn_target, set_fn_target, FN_TARGET, u32);
    reg32!(isr_en, set_isr_en, ISR_EN, u32);

    pub fn in_msg_word(&self, index: usize) -> u32 {
        debug_assert!(index < MBOX_MSG_WORDS);
        self.io
            .read_u32(self.base + MboxRegister::IN_MSG_BASE.0 as usize + index * 4)
    }

    pub fn set_out_msg_word(&self, index: usize, data: u32) {
        debug_assert!(index < MBOX_MSG_WORDS);
        self.io.write_u32(
            self.base + MboxRegister::OUT_MSG_BASE.0 as usize + index * 4,
            data,
        )
    }

    pub fn pf_ack_word(&self, index: usize) -> u32 {
        debug_assert!(index < MBOX_PF_ACK_WORDS);
        self.io
            .read_u32(self.base + MboxRegister::PF_ACK_BASE.0 as usize + index * 4)
    }

    pub fn set_pf_ack_word(&self, index: usize, data: u32) {
        debug_assert!(index < MBOX_PF_ACK_WORDS);
        self.io.write_u32(
            self.base + MboxRegister::PF_ACK_BASE.0 as usize + index * 4,
            data,
        )
    }
}
