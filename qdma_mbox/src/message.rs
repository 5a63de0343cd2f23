// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mailbox message composition, parsing, and response correlation.

use crate::MboxError;
use qdma_defs::CmptCtxtType;
use qdma_defs::CsrBlock;
use qdma_defs::DescqConf;
use qdma_defs::IntrBlockHdr;
use qdma_defs::IntrCtxtBlock;
use qdma_defs::IntrRingHi;
use qdma_defs::IntrRingLo;
use qdma_defs::MboxDevInfo;
use qdma_defs::MboxMsgHdr;
use qdma_defs::MboxOnlineResp;
use qdma_defs::MboxOp;
use qdma_defs::MboxQinfo;
use qdma_defs::MboxStatus;
use qdma_defs::QctxtSel;
use qdma_defs::QidWord;
use qdma_defs::QmaxWord;
use qdma_defs::MBOX_FN_ID_BITS;
use qdma_defs::MBOX_INTR_CTXT_RINGS;
use qdma_defs::MBOX_MSG_WORDS;
use qdma_defs::MBOX_QID_BITS;
use qdma_defs::MBOX_QMAX_BITS;
use qdma_defs::MBOX_REQ_PAYLOAD_WORD;
use qdma_defs::MBOX_RESP_PAYLOAD_WORD;
use qdma_defs::MBOX_RESP_STATUS_WORD;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// A fixed 32-word mailbox message buffer.
///
/// Buffers move by value through send and receive so a consumed message
/// cannot be silently reused; [`MboxMessage::invalidate`] additionally stamps
/// the opcode to `NOOP` so a stale buffer fails to parse.
#[derive(Debug, Clone)]
pub struct MboxMessage([u32; MBOX_MSG_WORDS]);

impl MboxMessage {
    /// Returns an all-zero message.
    pub fn new_zeroed() -> Self {
        Self([0; MBOX_MSG_WORDS])
    }

    /// Wraps raw words read from a mailbox slot.
    pub fn from_words(words: [u32; MBOX_MSG_WORDS]) -> Self {
        Self(words)
    }

    /// Returns the raw message words.
    pub fn words(&self) -> &[u32; MBOX_MSG_WORDS] {
        &self.0
    }

    /// Returns the header word.
    pub fn hdr(&self) -> MboxMsgHdr {
        MboxMsgHdr::from(self.0[0])
    }

    fn set_hdr(&mut self, hdr: MboxMsgHdr) {
        self.0[0] = hdr.into();
    }

    /// Returns the response status word.
    pub fn status(&self) -> MboxStatus {
        MboxStatus(self.0[MBOX_RESP_STATUS_WORD] as i32)
    }

    fn set_status(&mut self, status: MboxStatus) {
        self.0[MBOX_RESP_STATUS_WORD] = status.0 as u32;
    }

    /// Marks the message consumed by rewriting its opcode to `NOOP`.
    pub fn invalidate(&mut self) {
        self.0[0] = MboxMsgHdr::new().with_op(MboxOp::NOOP.0).into();
    }

    fn write_at<P: IntoBytes + Immutable>(&mut self, word: usize, p: &P) {
        let bytes = p.as_bytes();
        self.0.as_mut_bytes()[word * 4..word * 4 + bytes.len()].copy_from_slice(bytes);
    }

    fn read_at<P: FromBytes>(&self, word: usize) -> P {
        P::read_from_prefix(&self.0.as_bytes()[word * 4..]).unwrap().0
    }
}

fn check_width(field: &'static str, value: u64, bits: u32) -> Result<(), MboxError> {
    if value >> bits != 0 {
        return Err(MboxError::InvalidArgument { field, value });
    }
    Ok(())
}

/// Typed queue-context selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSel {
    /// Absolute hardware queue id.
    pub qid_hw: u16,
    /// Streaming-mode queue.
    pub st: bool,
    /// Card-to-host direction.
    pub c2h: bool,
    /// Completion-context handling.
    pub cmpt: CmptCtxtType,
}

impl QueueSel {
    fn to_wire(self) -> Result<QctxtSel, MboxError> {
        check_width("qid_hw", self.qid_hw.into(), MBOX_QID_BITS)?;
        Ok(QctxtSel::new()
            .with_qid_hw(self.qid_hw)
            .with_st(self.st)
            .with_c2h(self.c2h)
            .with_cmpt_ctxt_type(self.cmpt.0))
    }
}

impl From<QctxtSel> for QueueSel {
    fn from(w: QctxtSel) -> Self {
        Self {
            qid_hw: w.qid_hw(),
            st: w.st(),
            c2h: w.c2h(),
            cmpt: CmptCtxtType(w.cmpt_ctxt_type()),
        }
    }
}

/// Ring list for an interrupt-context operation.
#[derive(Debug, Clone, Copy)]
pub struct IntrRings {
    /// Valid entries in `ring_index`, 1..=8.
    pub num_rings: u8,
    /// Interrupt aggregation ring indices.
    pub ring_index: [u16; MBOX_INTR_CTXT_RINGS],
}

impl IntrRings {
    fn to_block(&self) -> Result<IntrCtxtBlock, MboxError> {
        if self.num_rings == 0 || self.num_rings as usize > MBOX_INTR_CTXT_RINGS {
            return Err(MboxError::InvalidArgument {
                field: "num_rings",
                value: self.num_rings.into(),
            });
        }
        let mut block = IntrCtxtBlock::new_zeroed();
        block.hdr = IntrBlockHdr::new().with_num_rings(self.num_rings);
        for i in 0..self.num_rings as usize {
            block.ring_index[i] = self.ring_index[i];
        }
        Ok(block)
    }

    fn from_block(block: &IntrCtxtBlock) -> Result<Self, MboxError> {
        let n = block.hdr.num_rings() as usize;
        if n == 0 || n > MBOX_INTR_CTXT_RINGS {
            return Err(MboxError::MalformedMessage("interrupt ring count out of range"));
        }
        for i in n..MBOX_INTR_CTXT_RINGS {
            if block.ring_index[i] != 0
                || u64::from(block.ring_ctxt_lo[i]) != 0
                || u32::from(block.ring_ctxt_hi[i]) != 0
            {
                return Err(MboxError::MalformedMessage(
                    "interrupt ring entries past the ring count",
                ));
            }
        }
        Ok(Self {
            num_rings: block.hdr.num_rings(),
            ring_index: block.ring_index,
        })
    }
}

/// Interrupt aggregation ring contexts and the rings they apply to.
#[derive(Debug, Clone, Copy)]
pub struct IntrCtxt {
    /// Rings addressed by this block.
    pub rings: IntrRings,
    /// Low context words, parallel to `rings.ring_index`.
    pub ctxt_lo: [IntrRingLo; MBOX_INTR_CTXT_RINGS],
    /// High context words, parallel to `rings.ring_index`.
    pub ctxt_hi: [IntrRingHi; MBOX_INTR_CTXT_RINGS],
}

impl IntrCtxt {
    fn to_block(&self) -> Result<IntrCtxtBlock, MboxError> {
        let mut block = self.rings.to_block()?;
        for i in 0..self.rings.num_rings as usize {
            block.ring_ctxt_lo[i] = self.ctxt_lo[i];
            block.ring_ctxt_hi[i] = self.ctxt_hi[i];
        }
        Ok(block)
    }

    fn from_block(block: &IntrCtxtBlock) -> Result<Self, MboxError> {
        Ok(Self {
            rings: IntrRings::from_block(block)?,
            ctxt_lo: block.ring_ctxt_lo,
            ctxt_hi: block.ring_ctxt_hi,
        })
    }
}

fn qinfo_to_wire(qbase: Option<u16>, qmax: u16) -> Result<MboxQinfo, MboxError> {
    check_width("qmax", qmax.into(), MBOX_QMAX_BITS)?;
    let qbase = match qbase {
        Some(qbase) => {
            check_width("qbase", qbase.into(), MBOX_QID_BITS)?;
            qbase.into()
        }
        None => -1,
    };
    Ok(MboxQinfo {
        qbase,
        qmax: QmaxWord::new().with_qmax(qmax),
    })
}

fn qinfo_from_wire(qi: MboxQinfo) -> Result<(Option<u16>, u16), MboxError> {
    let qbase = match qi.qbase {
        -1 => None,
        q if q >= 0 && (q as u64) >> MBOX_QID_BITS == 0 => Some(q as u16),
        _ => return Err(MboxError::MalformedMessage("queue base out of range")),
    };
    Ok((qbase, qi.qmax.qmax()))
}

/// A request message, one variant per opcode.
#[derive(Debug, Clone)]
pub enum MboxRequest {
    /// Bring the sending function online and allocate its queue range.
    VfOnline {
        /// Requested queue count. Zero asks for the PF default.
        qmax: u16,
        /// Requested queue base, or `None` for no preference.
        qbase: Option<u16>,
    },
    /// Take the sending function offline and release its resources.
    VfOffline,
    /// Re-negotiate the sending function's queue range.
    Qreq {
        /// Requested queue count.
        qmax: u16,
        /// Requested queue base, or `None` for no preference.
        qbase: Option<u16>,
    },
    /// Account a queue as added by the sending function.
    NotifyQadd {
        /// Absolute hardware queue id.
        qid_hw: u16,
    },
    /// Account a queue as deleted by the sending function.
    NotifyQdel {
        /// Absolute hardware queue id.
        qid_hw: u16,
    },
    /// Program the sending function's queue map window.
    Fmap {
        /// First queue of the window.
        qbase: u16,
        /// Queue count of the window.
        qmax: u16,
    },
    /// Program a descriptor-queue context.
    QctxtWrite {
        /// Queue addressed by the operation.
        sel: QueueSel,
        /// Context to program.
        conf: DescqConf,
    },
    /// Read back a descriptor-queue context.
    QctxtRead {
        /// Queue addressed by the operation.
        sel: QueueSel,
    },
    /// Invalidate a descriptor-queue context.
    QctxtInvalidate {
        /// Queue addressed by the operation.
        sel: QueueSel,
    },
    /// Clear a descriptor-queue context.
    QctxtClear {
        /// Queue addressed by the operation.
        sel: QueueSel,
    },
    /// Read the global CSR snapshot.
    CsrRead,
    /// Program interrupt aggregation ring contexts.
    IntrCtxtWrite {
        /// Contexts and their ring list.
        ctxt: IntrCtxt,
    },
    /// Read back interrupt aggregation ring contexts.
    IntrCtxtRead {
        /// Rings addressed by the operation.
        rings: IntrRings,
    },
    /// Invalidate interrupt aggregation ring contexts.
    IntrCtxtInvalidate {
        /// Rings addressed by the operation.
        rings: IntrRings,
    },
    /// Clear interrupt aggregation ring contexts.
    IntrCtxtClear {
        /// Rings addressed by the operation.
        rings: IntrRings,
    },
}

impl MboxRequest {
    /// Returns the opcode for this request.
    pub fn op(&self) -> MboxOp {
        match self {
            MboxRequest::VfOnline { .. } => MboxOp::VF_ONLINE,
            MboxRequest::VfOffline => MboxOp::VF_OFFLINE,
            MboxRequest::Qreq { .. } => MboxOp::QREQ,
            MboxRequest::NotifyQadd { .. } => MboxOp::QNOTIFY_ADD,
            MboxRequest::NotifyQdel { .. } => MboxOp::QNOTIFY_DEL,
            MboxRequest::Fmap { .. } => MboxOp::FMAP,
            MboxRequest::QctxtWrite { .. } => MboxOp::QCTXT_WRT,
            MboxRequest::QctxtRead { .. } => MboxOp::QCTXT_RD,
            MboxRequest::QctxtInvalidate { .. } => MboxOp::QCTXT_INV,
            MboxRequest::QctxtClear { .. } => MboxOp::QCTXT_CLR,
            MboxRequest::CsrRead => MboxOp::CSR_READ,
            MboxRequest::IntrCtxtWrite { .. } => MboxOp::INTR_CTXT_WRT,
            MboxRequest::IntrCtxtRead { .. } => MboxOp::INTR_CTXT_RD,
            MboxRequest::IntrCtxtInvalidate { .. } => MboxOp::INTR_CTXT_INV,
            MboxRequest::IntrCtxtClear { .. } => MboxOp::INTR_CTXT_CLR,
        }
    }

    /// Composes the request into a message from `src_fn` to `dst_fn`.
    ///
    /// Every field is validated against its wire width; a value that does
    /// not fit fails with [`MboxError::InvalidArgument`] rather than being
    /// truncated.
    pub fn encode(&self, src_fn: u16, dst_fn: u16) -> Result<MboxMessage, MboxError> {
        check_width("src_fn", src_fn.into(), MBOX_FN_ID_BITS)?;
        check_width("dst_fn", dst_fn.into(), MBOX_FN_ID_BITS)?;
        let mut msg = MboxMessage::new_zeroed();
        msg.set_hdr(
            MboxMsgHdr::new()
                .with_op(self.op().0)
                .with_src_fn(src_fn)
                .with_dst_fn(dst_fn),
        );
        match *self {
            MboxRequest::VfOnline { qmax, qbase } | MboxRequest::Qreq { qmax, qbase } => {
                msg.write_at(MBOX_REQ_PAYLOAD_WORD, &qinfo_to_wire(qbase, qmax)?);
            }
            MboxRequest::VfOffline | MboxRequest::CsrRead => {}
            MboxRequest::NotifyQadd { qid_hw } | MboxRequest::NotifyQdel { qid_hw } => {
                check_width("qid_hw", qid_hw.into(), MBOX_QID_BITS)?;
                msg.write_at(MBOX_REQ_PAYLOAD_WORD, &QidWord::new().with_qid_hw(qid_hw));
            }
            MboxRequest::Fmap { qbase, qmax } => {
                msg.write_at(MBOX_REQ_PAYLOAD_WORD, &qinfo_to_wire(Some(qbase), qmax)?);
            }
            MboxRequest::QctxtWrite { sel, conf } => {
                msg.write_at(MBOX_REQ_PAYLOAD_WORD, &sel.to_wire()?);
                msg.write_at(MBOX_REQ_PAYLOAD_WORD + 1, &conf);
            }
            MboxRequest::QctxtRead { sel }
            | MboxRequest::QctxtInvalidate { sel }
            | MboxRequest::QctxtClear { sel } => {
                msg.write_at(MBOX_REQ_PAYLOAD_WORD, &sel.to_wire()?);
            }
            MboxRequest::IntrCtxtWrite { ctxt } => {
                msg.write_at(MBOX_REQ_PAYLOAD_WORD, &ctxt.to_block()?);
            }
            MboxRequest::IntrCtxtRead { rings }
            | MboxRequest::IntrCtxtInvalidate { rings }
            | MboxRequest::IntrCtxtClear { rings } => {
                msg.write_at(MBOX_REQ_PAYLOAD_WORD, &rings.to_block()?);
            }
        }
        Ok(msg)
    }

    /// Parses a request message.
    ///
    /// Fails with [`MboxError::MalformedMessage`] on a set direction flag,
    /// an opcode outside the dispatchable set, or a payload violating a
    /// protocol invariant.
    pub fn decode(msg: &MboxMessage) -> Result<Self, MboxError> {
        let hdr = msg.hdr();
        if hdr.resp() {
            return Err(MboxError::MalformedMessage("direction flag set on a request"));
        }
        let req = match MboxOp(hdr.op()) {
            MboxOp::VF_ONLINE => {
                let (qbase, qmax) = qinfo_from_wire(msg.read_at(MBOX_REQ_PAYLOAD_WORD))?;
                MboxRequest::VfOnline { qmax, qbase }
            }
            MboxOp::VF_OFFLINE => MboxRequest::VfOffline,
            MboxOp::QREQ => {
                let (qbase, qmax) = qinfo_from_wire(msg.read_at(MBOX_REQ_PAYLOAD_WORD))?;
                MboxRequest::Qreq { qmax, qbase }
            }
            MboxOp::QNOTIFY_ADD => {
                let w: QidWord = msg.read_at(MBOX_REQ_PAYLOAD_WORD);
                MboxRequest::NotifyQadd { qid_hw: w.qid_hw() }
            }
            MboxOp::QNOTIFY_DEL => {
                let w: QidWord = msg.read_at(MBOX_REQ_PAYLOAD_WORD);
                MboxRequest::NotifyQdel { qid_hw: w.qid_hw() }
            }
            MboxOp::FMAP => {
                let (qbase, qmax) = qinfo_from_wire(msg.read_at(MBOX_REQ_PAYLOAD_WORD))?;
                let qbase = qbase
                    .ok_or(MboxError::MalformedMessage("queue map without a queue base"))?;
                MboxRequest::Fmap { qbase, qmax }
            }
            MboxOp::QCTXT_WRT => MboxRequest::QctxtWrite {
                sel: QueueSel::from(msg.read_at::<QctxtSel>(MBOX_REQ_PAYLOAD_WORD)),
                conf: msg.read_at(MBOX_REQ_PAYLOAD_WORD + 1),
            },
            MboxOp::QCTXT_RD => MboxRequest::QctxtRead {
                sel: QueueSel::from(msg.read_at::<QctxtSel>(MBOX_REQ_PAYLOAD_WORD)),
            },
            MboxOp::QCTXT_INV => MboxRequest::QctxtInvalidate {
                sel: QueueSel::from(msg.read_at::<QctxtSel>(MBOX_REQ_PAYLOAD_WORD)),
            },
            MboxOp::QCTXT_CLR => MboxRequest::QctxtClear {
                sel: QueueSel::from(msg.read_at::<QctxtSel>(MBOX_REQ_PAYLOAD_WORD)),
            },
            MboxOp::CSR_READ => MboxRequest::CsrRead,
            MboxOp::INTR_CTXT_WRT => {
                let block: IntrCtxtBlock = msg.read_at(MBOX_REQ_PAYLOAD_WORD);
                MboxRequest::IntrCtxtWrite {
                    ctxt: IntrCtxt::from_block(&block)?,
                }
            }
            MboxOp::INTR_CTXT_RD => {
                let block: IntrCtxtBlock = msg.read_at(MBOX_REQ_PAYLOAD_WORD);
                MboxRequest::IntrCtxtRead {
                    rings: IntrRings::from_block(&block)?,
                }
            }
            MboxOp::INTR_CTXT_INV => {
                let block: IntrCtxtBlock = msg.read_at(MBOX_REQ_PAYLOAD_WORD);
                MboxRequest::IntrCtxtInvalidate {
                    rings: IntrRings::from_block(&block)?,
                }
            }
            MboxOp::INTR_CTXT_CLR => {
                let block: IntrCtxtBlock = msg.read_at(MBOX_REQ_PAYLOAD_WORD);
                MboxRequest::IntrCtxtClear {
                    rings: IntrRings::from_block(&block)?,
                }
            }
            _ => return Err(MboxError::MalformedMessage("unknown opcode")),
        };
        Ok(req)
    }
}

/// A response payload, composed by the PF dispatcher.
#[derive(Debug, Clone)]
pub enum MboxResponse {
    /// Status only.
    Ack,
    /// Allocated queue range.
    Qinfo {
        /// First queue of the range.
        qbase: u16,
        /// Queue count of the range.
        qmax: u16,
    },
    /// Queue range plus device identity, answering `VF_ONLINE`.
    Online {
        /// First queue of the range.
        qbase: u16,
        /// Queue count of the range.
        qmax: u16,
        /// Device identity block.
        dev: MboxDevInfo,
    },
    /// Global CSR snapshot.
    Csr(CsrBlock),
    /// Descriptor-queue context snapshot.
    Qctxt {
        /// Queue the snapshot belongs to.
        sel: QueueSel,
        /// Context as read from hardware.
        conf: DescqConf,
    },
    /// Interrupt aggregation ring context snapshot.
    IntrCtxt(IntrCtxt),
}

impl MboxResponse {
    /// Composes the response to the request carrying `req_hdr`.
    ///
    /// The opcode is echoed with the direction flag set and the function ids
    /// mirrored. The payload is encoded only for an `OK` status.
    pub fn encode(
        &self,
        req_hdr: MboxMsgHdr,
        status: MboxStatus,
    ) -> Result<MboxMessage, MboxError> {
        let mut msg = status_response(req_hdr, status);
        if status != MboxStatus::OK {
            return Ok(msg);
        }
        match *self {
            MboxResponse::Ack => {}
            MboxResponse::Qinfo { qbase, qmax } => {
                msg.write_at(MBOX_RESP_PAYLOAD_WORD, &qinfo_to_wire(Some(qbase), qmax)?);
            }
            MboxResponse::Online { qbase, qmax, dev } => {
                msg.write_at(
                    MBOX_RESP_PAYLOAD_WORD,
                    &MboxOnlineResp {
                        qinfo: qinfo_to_wire(Some(qbase), qmax)?,
                        dev,
                    },
                );
            }
            MboxResponse::Csr(csr) => {
                msg.write_at(MBOX_RESP_PAYLOAD_WORD, &csr);
            }
            MboxResponse::Qctxt { sel, conf } => {
                msg.write_at(MBOX_RESP_PAYLOAD_WORD, &sel.to_wire()?);
                msg.write_at(MBOX_RESP_PAYLOAD_WORD + 1, &conf);
            }
            MboxResponse::IntrCtxt(ctxt) => {
                msg.write_at(MBOX_RESP_PAYLOAD_WORD, &ctxt.to_block()?);
            }
        }
        Ok(msg)
    }
}

/// Builds a status-only response to the request carrying `req_hdr`.
///
/// Infallible, so error and busy replies can always be produced.
pub fn status_response(req_hdr: MboxMsgHdr, status: MboxStatus) -> MboxMessage {
    let mut msg = MboxMessage::new_zeroed();
    msg.set_hdr(
        MboxMsgHdr::new()
            .with_op(req_hdr.op())
            .with_resp(true)
            .with_src_fn(req_hdr.dst_fn())
            .with_dst_fn(req_hdr.src_fn()),
    );
    msg.set_status(status);
    msg
}

/// Returns whether `rcvd` is the response to `sent`.
///
/// True only when the direction flag is set, the opcode matches, and the
/// function ids mirror the request; a response carrying a different function
/// id never correlates.
pub fn is_response(sent: &MboxMessage, rcvd: &MboxMessage) -> bool {
    let s = sent.hdr();
    let r = rcvd.hdr();
    r.resp()
        && !s.resp()
        && r.op() == s.op()
        && r.src_fn() == s.dst_fn()
        && r.dst_fn() == s.src_fn()
}

/// Returns the status word of a response.
pub fn response_status(rcvd: &MboxMessage) -> MboxStatus {
    rcvd.status()
}

fn checked_resp(msg: &MboxMessage, ops: &[MboxOp]) -> Result<MboxMsgHdr, MboxError> {
    let hdr = msg.hdr();
    if !hdr.resp() || !ops.contains(&MboxOp(hdr.op())) {
        return Err(MboxError::MalformedMessage("not a response to this operation"));
    }
    let status = msg.status();
    if status != MboxStatus::OK {
        return Err(MboxError::RequestFailed(status));
    }
    Ok(hdr)
}

/// Extracts the granted queue range from a `VF_ONLINE` or `QREQ` response.
pub fn vf_qinfo(msg: &MboxMessage) -> Result<(u16, u16), MboxError> {
    checked_resp(msg, &[MboxOp::VF_ONLINE, MboxOp::QREQ])?;
    let (qbase, qmax) = qinfo_from_wire(msg.read_at(MBOX_RESP_PAYLOAD_WORD))?;
    let qbase = qbase.ok_or(MboxError::MalformedMessage("response without a queue base"))?;
    Ok((qbase, qmax))
}

/// Extracts the device identity block from a `VF_ONLINE` response.
pub fn vf_dev_info(msg: &MboxMessage) -> Result<MboxDevInfo, MboxError> {
    checked_resp(msg, &[MboxOp::VF_ONLINE])?;
    let resp: MboxOnlineResp = msg.read_at(MBOX_RESP_PAYLOAD_WORD);
    Ok(resp.dev)
}

/// Extracts the receiving function's own id from a `VF_ONLINE` response.
pub fn vf_func_id(msg: &MboxMessage) -> Result<u16, MboxError> {
    let hdr = checked_resp(msg, &[MboxOp::VF_ONLINE])?;
    Ok(hdr.dst_fn())
}

/// Extracts the parent PF's id from a `VF_ONLINE` response.
pub fn vf_parent_func_id(msg: &MboxMessage) -> Result<u16, MboxError> {
    let hdr = checked_resp(msg, &[MboxOp::VF_ONLINE])?;
    Ok(hdr.src_fn())
}

/// Extracts the global CSR snapshot from a `CSR_READ` response.
pub fn vf_csr_info(msg: &MboxMessage) -> Result<CsrBlock, MboxError> {
    checked_resp(msg, &[MboxOp::CSR_READ])?;
    Ok(msg.read_at(MBOX_RESP_PAYLOAD_WORD))
}

/// Extracts the queue-context snapshot from a `QCTXT_RD` response.
pub fn vf_qctxt(msg: &MboxMessage) -> Result<(QueueSel, DescqConf), MboxError> {
    checked_resp(msg, &[MboxOp::QCTXT_RD])?;
    let sel = QueueSel::from(msg.read_at::<QctxtSel>(MBOX_RESP_PAYLOAD_WORD));
    let conf = msg.read_at(MBOX_RESP_PAYLOAD_WORD + 1);
    Ok((sel, conf))
}

/// Extracts the interrupt-context snapshot from an `INTR_CTXT_RD` response.
pub fn vf_intr_ctxt(msg: &MboxMessage) -> Result<IntrCtxt, MboxError> {
    checked_resp(msg, &[MboxOp::INTR_CTXT_RD])?;
    let block: IntrCtxtBlock = msg.read_at(MBOX_RESP_PAYLOAD_WORD);
    IntrCtxt::from_block(&block)
}

/// Checks a plain acknowledgment response, surfacing a non-OK status as
/// [`MboxError::RequestFailed`].
pub fn vf_ack(msg: &MboxMessage) -> Result<(), MboxError> {
    if !msg.hdr().resp() {
        return Err(MboxError::MalformedMessage("not a response"));
    }
    let status = msg.status();
    if status != MboxStatus::OK {
        return Err(MboxError::RequestFailed(status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdma_defs::DescqFlags;
    use qdma_defs::DescqIntr;
    use qdma_defs::DescqOwner;
    use qdma_defs::DescqSizes;
    use qdma_defs::DevCapsWord;

    fn sample_conf() -> DescqConf {
        DescqConf {
            ring_bs_addr: 0x1234_5678_9000,
            cmpt_ring_bs_addr: 0xabcd_ef00_0000,
            flags: DescqFlags::new()
                .with_irq_en(true)
                .with_wbk_en(true)
                .with_desc_sz(2)
                .with_triggermode(1),
            owner: DescqOwner::new()
                .with_func_id(7)
                .with_cnt_thres_idx(3)
                .with_timer_thres_idx(5),
            intr: DescqIntr::new().with_intr_id(33).with_intr_aggr(true).with_ringsz_idx(9),
            sizes: DescqSizes::new().with_bufsz_idx(4).with_cmpt_ringsz_idx(2),
        }
    }

    fn sample_intr_ctxt(num_rings: u8) -> IntrCtxt {
        let mut rings = IntrRings {
            num_rings,
            ring_index: [0; MBOX_INTR_CTXT_RINGS],
        };
        let mut ctxt_lo = [IntrRingLo::new(); MBOX_INTR_CTXT_RINGS];
        let mut ctxt_hi = [IntrRingHi::new(); MBOX_INTR_CTXT_RINGS];
        for i in 0..num_rings as usize {
            rings.ring_index[i] = 10 + i as u16;
            ctxt_lo[i] = IntrRingLo::new()
                .with_valid(true)
                .with_vec(4 + i as u16)
                .with_baddr_4k(0x40_0000 + i as u64);
            ctxt_hi[i] = IntrRingHi::new().with_page_size(1).with_pidx(64);
        }
        IntrCtxt {
            rings,
            ctxt_lo,
            ctxt_hi,
        }
    }

    #[test]
    fn header_word_layout() {
        let msg = MboxRequest::VfOffline.encode(5, 0).unwrap();
        // op 20 in bits 0..7, src 5 in bits 8..20, dst 0 in bits 20..32.
        assert_eq!(msg.words()[0], 0x0514);
        let resp = status_response(msg.hdr(), MboxStatus::OK);
        assert_eq!(resp.words()[0], 0x14 | 0x80 | 5 << 20);
    }

    #[test]
    fn queue_request_words() {
        let msg = MboxRequest::Qreq {
            qmax: 4,
            qbase: None,
        }
        .encode(9, 0)
        .unwrap();
        assert_eq!(msg.words()[1], 0xffff_ffff);
        assert_eq!(msg.words()[2], 4);

        let msg = MboxRequest::Qreq {
            qmax: 4,
            qbase: Some(128),
        }
        .encode(9, 0)
        .unwrap();
        assert_eq!(msg.words()[1], 128);
    }

    #[test]
    fn rejects_fields_wider_than_the_wire() {
        assert!(matches!(
            MboxRequest::VfOffline.encode(0x1000, 0),
            Err(MboxError::InvalidArgument { field: "src_fn", .. })
        ));
        assert!(matches!(
            MboxRequest::Qreq {
                qmax: 1 << 13,
                qbase: None
            }
            .encode(1, 0),
            Err(MboxError::InvalidArgument { field: "qmax", .. })
        ));
        assert!(matches!(
            MboxRequest::Fmap {
                qbase: 4096,
                qmax: 4
            }
            .encode(1, 0),
            Err(MboxError::InvalidArgument { field: "qbase", .. })
        ));
        // Boundary values still fit.
        MboxRequest::Qreq {
            qmax: (1 << 13) - 1,
            qbase: Some(4095),
        }
        .encode(0xfff, 0)
        .unwrap();
    }

    #[test]
    fn request_round_trips() {
        let reqs = [
            MboxRequest::VfOnline {
                qmax: 4,
                qbase: None,
            },
            MboxRequest::VfOffline,
            MboxRequest::Qreq {
                qmax: 32,
                qbase: Some(256),
            },
            MboxRequest::NotifyQadd { qid_hw: 77 },
            MboxRequest::NotifyQdel { qid_hw: 78 },
            MboxRequest::Fmap {
                qbase: 64,
                qmax: 8,
            },
            MboxRequest::QctxtWrite {
                sel: QueueSel {
                    qid_hw: 65,
                    st: true,
                    c2h: false,
                    cmpt: CmptCtxtType::CMPT_WITH_ST,
                },
                conf: sample_conf(),
            },
            MboxRequest::QctxtRead {
                sel: QueueSel {
                    qid_hw: 65,
                    st: false,
                    c2h: true,
                    cmpt: CmptCtxtType::CMPT_NONE,
                },
            },
            MboxRequest::CsrRead,
            MboxRequest::IntrCtxtWrite {
                ctxt: sample_intr_ctxt(3),
            },
            MboxRequest::IntrCtxtRead {
                rings: sample_intr_ctxt(8).rings,
            },
        ];
        for req in reqs {
            let msg = req.encode(11, 0).unwrap();
            let hdr = msg.hdr();
            assert_eq!(hdr.src_fn(), 11);
            assert_eq!(hdr.dst_fn(), 0);
            assert!(!hdr.resp());
            let back = MboxRequest::decode(&msg).unwrap();
            assert_eq!(back.op(), req.op());
            let again = back.encode(11, 0).unwrap();
            assert_eq!(again.words(), msg.words());
        }
    }

    #[test]
    fn descq_flags_word_layout() {
        let flags = DescqFlags::new()
            .with_irq_en(true)
            .with_desc_sz(2)
            .with_triggermode(1);
        assert_eq!(u32::from(flags), 0x80 | 0x2_0000 | 0x10_0000);
    }

    #[test]
    fn intr_ring_lo_layout() {
        let lo = IntrRingLo::new()
            .with_valid(true)
            .with_vec(3)
            .with_baddr_4k(0x1234);
        assert_eq!(u64::from(lo), 0x7 | 0x1234 << 14);
    }

    #[test]
    fn intr_ring_count_bounds() {
        for n in [1, 8] {
            MboxRequest::IntrCtxtWrite {
                ctxt: sample_intr_ctxt(n),
            }
            .encode(1, 0)
            .unwrap();
        }
        for n in [0, 9] {
            let mut ctxt = sample_intr_ctxt(1);
            ctxt.rings.num_rings = n;
            assert!(matches!(
                MboxRequest::IntrCtxtWrite { ctxt }.encode(1, 0),
                Err(MboxError::InvalidArgument {
                    field: "num_rings",
                    ..
                })
            ));
        }
    }

    #[test]
    fn intr_ring_count_inconsistent_with_list() {
        let msg = MboxRequest::IntrCtxtWrite {
            ctxt: sample_intr_ctxt(3),
        }
        .encode(1, 0)
        .unwrap();
        // Drop the declared count below the populated entries.
        let hdr_word = MBOX_REQ_PAYLOAD_WORD + size_of::<IntrCtxtBlock>() / 4 - 2;
        let mut words = *msg.words();
        words[hdr_word] = u32::from(IntrBlockHdr::new().with_num_rings(2));
        let err = MboxRequest::decode(&MboxMessage::from_words(words)).unwrap_err();
        assert!(matches!(err, MboxError::MalformedMessage(_)));
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let mut words = [0; MBOX_MSG_WORDS];
        words[0] = u32::from(MboxMsgHdr::new().with_op(0x55).with_src_fn(3));
        assert!(matches!(
            MboxRequest::decode(&MboxMessage::from_words(words)),
            Err(MboxError::MalformedMessage("unknown opcode"))
        ));
    }

    #[test]
    fn invalidated_message_fails_decode() {
        let mut msg = MboxRequest::VfOffline.encode(5, 0).unwrap();
        msg.invalidate();
        assert!(MboxRequest::decode(&msg).is_err());
    }

    #[test]
    fn correlation_requires_mirrored_ids() {
        let req = MboxRequest::Qreq {
            qmax: 4,
            qbase: None,
        }
        .encode(5, 0)
        .unwrap();
        let resp = status_response(req.hdr(), MboxStatus::OK);
        assert!(is_response(&req, &resp));

        // Request is not a response to itself.
        assert!(!is_response(&req, &req));

        // Wrong opcode.
        let other = MboxRequest::CsrRead.encode(5, 0).unwrap();
        assert!(!is_response(&other, &resp));

        // Response addressed to a different function.
        let foreign = MboxRequest::Qreq {
            qmax: 4,
            qbase: None,
        }
        .encode(6, 0)
        .unwrap();
        let foreign_resp = status_response(foreign.hdr(), MboxStatus::OK);
        assert!(!is_response(&req, &foreign_resp));
    }

    #[test]
    fn online_response_payload() {
        let req = MboxRequest::VfOnline {
            qmax: 4,
            qbase: None,
        }
        .encode(9, 0)
        .unwrap();
        let dev = MboxDevInfo {
            caps: DevCapsWord::new()
                .with_num_pfs(4)
                .with_st_en(true)
                .with_mm_en(true),
            num_qs: 2048,
        };
        let resp = MboxResponse::Online {
            qbase: 128,
            qmax: 4,
            dev,
        }
        .encode(req.hdr(), MboxStatus::OK)
        .unwrap();

        assert!(is_response(&req, &resp));
        assert_eq!(vf_qinfo(&resp).unwrap(), (128, 4));
        assert_eq!(vf_func_id(&resp).unwrap(), 9);
        assert_eq!(vf_parent_func_id(&resp).unwrap(), 0);
        let dev = vf_dev_info(&resp).unwrap();
        assert_eq!(dev.num_qs, 2048);
        assert!(dev.caps.st_en());
        assert_eq!(dev.caps.num_pfs(), 4);
    }

    #[test]
    fn getters_check_opcode_and_status() {
        let req = MboxRequest::Qreq {
            qmax: 4,
            qbase: None,
        }
        .encode(9, 0)
        .unwrap();
        let resp = MboxResponse::Qinfo {
            qbase: 16,
            qmax: 4,
        }
        .encode(req.hdr(), MboxStatus::OK)
        .unwrap();
        assert_eq!(vf_qinfo(&resp).unwrap(), (16, 4));
        assert!(matches!(
            vf_csr_info(&resp),
            Err(MboxError::MalformedMessage(_))
        ));

        let failed = status_response(req.hdr(), MboxStatus::NO_RESOURCE);
        assert!(matches!(
            vf_qinfo(&failed),
            Err(MboxError::RequestFailed(MboxStatus::NO_RESOURCE))
        ));
    }

    #[test]
    fn qctxt_snapshot_round_trip() {
        let sel = QueueSel {
            qid_hw: 130,
            st: true,
            c2h: true,
            cmpt: CmptCtxtType::CMPT_WITH_MM,
        };
        let req = MboxRequest::QctxtRead { sel }.encode(3, 0).unwrap();
        let resp = MboxResponse::Qctxt {
            sel,
            conf: sample_conf(),
        }
        .encode(req.hdr(), MboxStatus::OK)
        .unwrap();
        let (rsel, rconf) = vf_qctxt(&resp).unwrap();
        assert_eq!(rsel, sel);
        assert_eq!(rconf.ring_bs_addr, sample_conf().ring_bs_addr);
        assert_eq!(u32::from(rconf.flags), u32::from(sample_conf().flags));
    }

    #[test]
    fn intr_ctxt_snapshot_round_trip() {
        let ctxt = sample_intr_ctxt(8);
        let req = MboxRequest::IntrCtxtRead { rings: ctxt.rings }.encode(3, 0).unwrap();
        let resp = MboxResponse::IntrCtxt(ctxt).encode(req.hdr(), MboxStatus::OK).unwrap();
        let back = vf_intr_ctxt(&resp).unwrap();
        assert_eq!(back.rings.num_rings, 8);
        assert_eq!(back.rings.ring_index, ctxt.rings.ring_index);
        for i in 0..8 {
            assert_eq!(u64::from(back.ctxt_lo[i]), u64::from(ctxt.ctxt_lo[i]));
            assert_eq!(u32::from(back.ctxt_hi[i]), u32::from(ctxt.ctxt_hi[i]));
        }
    }

    #[test]
    fn csr_block_round_trip() {
        let mut csr = CsrBlock::new_zeroed();
        csr.ringsz[0] = 2048;
        csr.ringsz[15] = 16384;
        csr.bufsz[0] = 4096;
        csr.timer_cnt[3] = 30;
        csr.cnt_thres[2] = 64;
        csr.wb_intvl = 5;
        let req = MboxRequest::CsrRead.encode(2, 0).unwrap();
        let resp = MboxResponse::Csr(csr).encode(req.hdr(), MboxStatus::OK).unwrap();
        let back = vf_csr_info(&resp).unwrap();
        assert_eq!(back.ringsz, csr.ringsz);
        assert_eq!(back.bufsz, csr.bufsz);
        assert_eq!(back.timer_cnt, csr.timer_cnt);
        assert_eq!(back.cnt_thres, csr.cnt_thres);
        assert_eq!(back.wb_intvl, 5);
    }
}
