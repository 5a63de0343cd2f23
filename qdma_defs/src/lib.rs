// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register and wire-format definitions for the QDMA function-to-function
//! mailbox.
//!
//! The mailbox carries the control plane between the physical function (PF)
//! driver and the virtual function (VF) drivers of the multi-queue DMA
//! engine: queue allocation, queue/interrupt context programming, function
//! map setup, and global CSR discovery. Every message is a fixed block of
//! [`MBOX_MSG_WORDS`] 32-bit words exchanged through a per-function register
//! window.

#![no_std]
#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Mailbox register window base for a VF, as a BAR byte offset.
pub const MBOX_BASE_VF: usize = 0x1000;
/// Mailbox register window base for the PF.
pub const MBOX_BASE_PF: usize = 0x2400;

/// Message size in 32-bit words.
pub const MBOX_MSG_WORDS: usize = 32;
/// Number of 32-bit PF acknowledgment registers, one bit per function id.
pub const MBOX_PF_ACK_WORDS: usize = 8;

/// Function id field width. Ids above `2^12 - 1` are not representable.
pub const MBOX_FN_ID_BITS: u32 = 12;
/// Hardware queue id field width.
pub const MBOX_QID_BITS: u32 = 12;
/// Queue count field width. Counts up to the full 4096-queue engine fit.
pub const MBOX_QMAX_BITS: u32 = 13;
/// Interrupt vector field width in `ISR_VEC`.
pub const MBOX_ISR_VEC_BITS: u32 = 5;

/// Total queues on the engine.
pub const QDMA_MAX_QUEUES: u32 = 4096;
/// Interrupt aggregation rings addressable per context message.
pub const MBOX_INTR_CTXT_RINGS: usize = 8;
/// Entries in each global CSR array (ring sizes, buffer sizes, timers,
/// counter thresholds).
pub const QDMA_GLOBAL_CSR_ARRAY_SZ: usize = 16;

open_enum! {
    /// Register byte offsets within a function's mailbox window.
    pub enum MboxRegister: u16 {
        FN_STATUS = 0x00,
        FN_CMD = 0x04,
        ISR_VEC = 0x08,
        FN_TARGET = 0x0c,
        ISR_EN = 0x10,
        PF_ACK_BASE = 0x20,
        IN_MSG_BASE = 0x800,
        OUT_MSG_BASE = 0xc00,
    }
}

/// Mailbox function status register.
///
/// `ack` and `src_fn` are implemented on the PF window only; a VF reads
/// zeroes there.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FnStatus {
    /// An inbound message is pending.
    pub in_msg: bool,
    /// The previous outbound message has not been consumed by the peer.
    pub out_msg: bool,
    /// Outbound message marked complete for the target (PF, write-1-to-set).
    pub ack: bool,
    reserved: bool,
    /// Source function id of the pending inbound message (PF).
    #[bits(12)]
    pub src_fn: u16,
    #[bits(16)]
    reserved2: u16,
}

/// Mailbox function command register. All bits are write-1-to-trigger.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FnCmd {
    /// Latch the outgoing message for the function in `FN_TARGET`.
    pub snd: bool,
    /// Consume the pending inbound message and release the sender's slot.
    pub rcv: bool,
    reserved: bool,
    /// Request a VF function-level reset.
    pub vf_reset: bool,
    #[bits(28)]
    reserved2: u32,
}

open_enum! {
    /// Mailbox message opcodes.
    ///
    /// `VF_ONLINE`/`VF_OFFLINE` values are fixed by the device; dispatch
    /// treats anything outside this set as malformed. A response reuses the
    /// request opcode with the direction flag set. `NOOP` marks a consumed
    /// buffer.
    pub enum MboxOp: u8 {
        NOOP = 0,
        VF_ONLINE = 19,
        VF_OFFLINE = 20,
        QREQ = 21,
        QNOTIFY_ADD = 22,
        QNOTIFY_DEL = 23,
        FMAP = 24,
        QCTXT_WRT = 25,
        QCTXT_RD = 26,
        QCTXT_INV = 27,
        QCTXT_CLR = 28,
        CSR_READ = 29,
        INTR_CTXT_WRT = 30,
        INTR_CTXT_RD = 31,
        INTR_CTXT_INV = 32,
        INTR_CTXT_CLR = 33,
    }
}

open_enum! {
    /// Response status codes, word 1 of every response.
    pub enum MboxStatus: i32 {
        OK = 0,
        INVALID_ARGUMENT = -1,
        QUEUE_NOT_FOUND = -2,
        NO_RESOURCE = -3,
        BUSY = -4,
        UNAUTHORIZED = -5,
        MALFORMED = -6,
    }
}

/// Message header, word 0 of every message.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MboxMsgHdr {
    /// Opcode ([`MboxOp`]).
    #[bits(7)]
    pub op: u8,
    /// Direction flag: clear for a request, set for a response.
    pub resp: bool,
    /// Sender function id.
    #[bits(12)]
    pub src_fn: u16,
    /// Destination function id.
    #[bits(12)]
    pub dst_fn: u16,
}

/// Word index of the first request payload word.
pub const MBOX_REQ_PAYLOAD_WORD: usize = 1;
/// Word index of the response status word.
pub const MBOX_RESP_STATUS_WORD: usize = 1;
/// Word index of the first response payload word.
pub const MBOX_RESP_PAYLOAD_WORD: usize = 2;

/// Queue count, bit-limited to [`MBOX_QMAX_BITS`].
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QmaxWord {
    #[bits(13)]
    pub qmax: u16,
    #[bits(19)]
    reserved: u32,
}

/// Queue range carried by `VF_ONLINE`/`QREQ`/`FMAP` requests and echoed by
/// queue-info responses. A request `qbase` of -1 means no base preference.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MboxQinfo {
    pub qbase: i32,
    pub qmax: QmaxWord,
}

/// Device capability flags reported in the `VF_ONLINE` response.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DevCapsWord {
    pub num_pfs: u8,
    pub mm_channel_max: u8,
    pub flr_present: bool,
    pub st_en: bool,
    pub mm_en: bool,
    pub mm_cmpt_en: bool,
    pub mig_en: bool,
    pub debug_mode: bool,
    #[bits(2)]
    pub desc_eng_mode: u8,
    reserved: u8,
}

/// Device identity block in the `VF_ONLINE` response.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MboxDevInfo {
    pub caps: DevCapsWord,
    /// Total queues on the device.
    pub num_qs: u32,
}

/// Full `VF_ONLINE` response payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MboxOnlineResp {
    pub qinfo: MboxQinfo,
    pub dev: MboxDevInfo,
}

/// Hardware queue id carried by `QNOTIFY_ADD`/`QNOTIFY_DEL`.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QidWord {
    #[bits(12)]
    pub qid_hw: u16,
    #[bits(20)]
    reserved: u32,
}

open_enum! {
    /// Completion context handling for a queue-context operation.
    pub enum CmptCtxtType: u8 {
        CMPT_CTXT_ONLY = 0,
        CMPT_WITH_MM = 1,
        CMPT_WITH_ST = 2,
        CMPT_NONE = 3,
    }
}

/// Queue selector, word 1 of every `QCTXT_*` request.
///
/// `cmpt_ctxt_type` governs which completion-related fields of the
/// descriptor-queue config the PF programs or returns ([`CmptCtxtType`]).
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QctxtSel {
    #[bits(12)]
    pub qid_hw: u16,
    /// Streaming-mode queue.
    pub st: bool,
    /// Card-to-host direction.
    pub c2h: bool,
    #[bits(2)]
    pub cmpt_ctxt_type: u8,
    #[bits(16)]
    reserved: u16,
}

/// Descriptor-queue enable and mode flags.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DescqFlags {
    pub forced_en: bool,
    pub en_bypass: bool,
    pub irq_arm: bool,
    pub wbi_intvl_en: bool,
    pub wbi_chk: bool,
    pub at: bool,
    pub wbk_en: bool,
    pub irq_en: bool,
    pub pfch_en: bool,
    pub pfch_bypass: bool,
    pub dis_overflow_check: bool,
    pub cmpt_int_en: bool,
    pub cmpt_at: bool,
    pub cmpt_color: bool,
    pub cmpt_full_upd: bool,
    pub cmpl_stat_en: bool,
    #[bits(2)]
    pub desc_sz: u8,
    #[bits(2)]
    pub cmpt_desc_sz: u8,
    #[bits(3)]
    pub triggermode: u8,
    #[bits(9)]
    reserved: u16,
}

/// Owning function and threshold indices for a descriptor queue.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DescqOwner {
    pub func_id: u16,
    pub cnt_thres_idx: u8,
    pub timer_thres_idx: u8,
}

/// Interrupt routing and ring-size index for a descriptor queue.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DescqIntr {
    #[bits(11)]
    pub intr_id: u16,
    pub intr_aggr: bool,
    #[bits(4)]
    reserved: u8,
    pub ringsz_idx: u16,
}

/// Buffer-size and completion-ring-size indices for a descriptor queue.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DescqSizes {
    pub bufsz_idx: u16,
    pub cmpt_ringsz_idx: u16,
}

/// Descriptor-queue configuration, words 2..10 of `QCTXT_WRT` and of the
/// `QCTXT_RD` response.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DescqConf {
    pub ring_bs_addr: u64,
    pub cmpt_ring_bs_addr: u64,
    pub flags: DescqFlags,
    pub owner: DescqOwner,
    pub intr: DescqIntr,
    pub sizes: DescqSizes,
}

/// Global CSR snapshot returned by `CSR_READ`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CsrBlock {
    pub ringsz: [u16; QDMA_GLOBAL_CSR_ARRAY_SZ],
    pub bufsz: [u16; QDMA_GLOBAL_CSR_ARRAY_SZ],
    pub timer_cnt: [u8; QDMA_GLOBAL_CSR_ARRAY_SZ],
    pub cnt_thres: [u8; QDMA_GLOBAL_CSR_ARRAY_SZ],
    pub wb_intvl: u32,
}

/// Low 64 bits of an interrupt aggregation ring context.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IntrRingLo {
    pub valid: bool,
    #[bits(11)]
    pub vec: u16,
    pub int_st: bool,
    pub color: bool,
    /// Ring base address in 4K pages.
    #[bits(50)]
    pub baddr_4k: u64,
}

/// High word of an interrupt aggregation ring context.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IntrRingHi {
    #[bits(7)]
    pub page_size: u8,
    #[bits(12)]
    pub pidx: u16,
    pub at: bool,
    #[bits(12)]
    reserved: u16,
}

/// Ring count for an interrupt-context message. 1..=8 rings are valid.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IntrBlockHdr {
    #[bits(4)]
    pub num_rings: u8,
    #[bits(28)]
    reserved: u32,
}

/// Interrupt aggregation ring context block, the full payload of every
/// `INTR_CTXT_*` message.
///
/// Entries past `hdr.num_rings` are zero. Read, invalidate and clear
/// requests carry only the ring list; the context words are meaningful in
/// write requests and read responses.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IntrCtxtBlock {
    pub ring_ctxt_lo: [IntrRingLo; MBOX_INTR_CTXT_RINGS],
    pub ring_ctxt_hi: [IntrRingHi; MBOX_INTR_CTXT_RINGS],
    pub ring_index: [u16; MBOX_INTR_CTXT_RINGS],
    pub hdr: IntrBlockHdr,
    pub reserved: u32,
}
