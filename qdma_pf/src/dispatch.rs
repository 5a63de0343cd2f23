// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PF-side request dispatch.
//!
//! [`PfDispatcher::handle_request`] turns one raw VF request into exactly one
//! response message: decode failures and refused claims become negative
//! statuses rather than local faults, so a waiting VF always gets a reply.
//! Every identifier the request claims is validated against the
//! [`QueueTable`] before the privileged [`ContextBackend`] operation runs.

use crate::resources::PfConfig;
use crate::resources::QueueGrant;
use crate::resources::QueueTable;
use parking_lot::Mutex;
use qdma_defs::CsrBlock;
use qdma_defs::DescqConf;
use qdma_defs::IntrRingHi;
use qdma_defs::IntrRingLo;
use qdma_defs::MboxDevInfo;
use qdma_defs::MboxStatus;
use qdma_defs::MBOX_INTR_CTXT_RINGS;
use qdma_mbox::message::status_response;
use qdma_mbox::message::IntrCtxt;
use qdma_mbox::message::IntrRings;
use qdma_mbox::message::MboxMessage;
use qdma_mbox::message::MboxRequest;
use qdma_mbox::message::MboxResponse;
use qdma_mbox::message::QueueSel;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Range;
use thiserror::Error;

/// Why a decoded request was refused.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A request value is out of range for the operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The addressed queue or context does not exist.
    #[error("no such queue or context")]
    QueueNotFound,
    /// The allocation cannot be satisfied.
    #[error("queue resources exhausted")]
    NoResource,
    /// The function already has a request in flight.
    #[error("request already in flight for the function")]
    Busy,
    /// The request claims a resource outside the function's grant.
    #[error("unauthorized {0}")]
    Unauthorized(&'static str),
}

impl DispatchError {
    /// Wire status reported for this failure.
    pub fn status(&self) -> MboxStatus {
        match self {
            DispatchError::InvalidArgument(_) => MboxStatus::INVALID_ARGUMENT,
            DispatchError::QueueNotFound => MboxStatus::QUEUE_NOT_FOUND,
            DispatchError::NoResource => MboxStatus::NO_RESOURCE,
            DispatchError::Busy => MboxStatus::BUSY,
            DispatchError::Unauthorized(_) => MboxStatus::UNAUTHORIZED,
        }
    }
}

/// Privileged hardware programming, invoked only after a request's claims
/// have been validated against the resource table.
pub trait ContextBackend: Send {
    /// Drops every context the function programmed, as a function-level
    /// reset does. Called when the function goes offline or re-onlines.
    fn function_reset(
        &mut self,
        func_id: u16,
        queues: QueueGrant,
        vectors: Range<u16>,
    ) -> Result<(), DispatchError>;
    /// Programs the function map window for `func_id`.
    fn fmap_write(&mut self, func_id: u16, qbase: u16, qmax: u16) -> Result<(), DispatchError>;
    /// Programs a descriptor-queue context.
    fn qctxt_write(&mut self, sel: &QueueSel, conf: &DescqConf) -> Result<(), DispatchError>;
    /// Reads a descriptor-queue context back.
    fn qctxt_read(&mut self, sel: &QueueSel) -> Result<DescqConf, DispatchError>;
    /// Invalidates a descriptor-queue context.
    fn qctxt_invalidate(&mut self, sel: &QueueSel) -> Result<(), DispatchError>;
    /// Clears a descriptor-queue context.
    fn qctxt_clear(&mut self, sel: &QueueSel) -> Result<(), DispatchError>;
    /// Programs interrupt aggregation ring contexts.
    fn intr_ctxt_write(&mut self, ctxt: &IntrCtxt) -> Result<(), DispatchError>;
    /// Reads interrupt aggregation ring contexts back.
    fn intr_ctxt_read(&mut self, rings: &IntrRings) -> Result<IntrCtxt, DispatchError>;
    /// Invalidates interrupt aggregation ring contexts.
    fn intr_ctxt_invalidate(&mut self, rings: &IntrRings) -> Result<(), DispatchError>;
    /// Clears interrupt aggregation ring contexts.
    fn intr_ctxt_clear(&mut self, rings: &IntrRings) -> Result<(), DispatchError>;
}

/// Context store backed by host memory, standing in for the indirect
/// context-programming interface of real hardware.
pub struct MemoryBackend {
    qctxt: BTreeMap<(u16, bool, bool, u8), DescqConf>,
    intr: BTreeMap<u16, (IntrRingLo, IntrRingHi)>,
    fmap: BTreeMap<u16, (u16, u16)>,
}

impl MemoryBackend {
    /// Creates an empty context store.
    pub fn new() -> Self {
        Self {
            qctxt: BTreeMap::new(),
            intr: BTreeMap::new(),
            fmap: BTreeMap::new(),
        }
    }

    fn key(sel: &QueueSel) -> (u16, bool, bool, u8) {
        (sel.qid_hw, sel.st, sel.c2h, sel.cmpt.0)
    }

    /// Returns the stored context for `sel`, if programmed.
    pub fn qctxt(&self, sel: &QueueSel) -> Option<&DescqConf> {
        self.qctxt.get(&Self::key(sel))
    }

    /// Returns the programmed function map window for `func_id`.
    pub fn fmap(&self, func_id: u16) -> Option<(u16, u16)> {
        self.fmap.get(&func_id).copied()
    }

    /// Returns the stored interrupt ring context for `ring_index`.
    pub fn intr_ring(&self, ring_index: u16) -> Option<(IntrRingLo, IntrRingHi)> {
        self.intr.get(&ring_index).copied()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBackend for MemoryBackend {
    fn function_reset(
        &mut self,
        func_id: u16,
        queues: QueueGrant,
        vectors: Range<u16>,
    ) -> Result<(), DispatchError> {
        let qend = queues.qbase + queues.qmax;
        self.qctxt
            .retain(|&(qid, ..), _| qid < queues.qbase || qid >= qend);
        for ring in vectors {
            self.intr.remove(&ring);
        }
        self.fmap.remove(&func_id);
        Ok(())
    }

    fn fmap_write(&mut self, func_id: u16, qbase: u16, qmax: u16) -> Result<(), DispatchError> {
        self.fmap.insert(func_id, (qbase, qmax));
        Ok(())
    }

    fn qctxt_write(&mut self, sel: &QueueSel, conf: &DescqConf) -> Result<(), DispatchError> {
        self.qctxt.insert(Self::key(sel), *conf);
        Ok(())
    }

    fn qctxt_read(&mut self, sel: &QueueSel) -> Result<DescqConf, DispatchError> {
        self.qctxt
            .get(&Self::key(sel))
            .copied()
            .ok_or(DispatchError::QueueNotFound)
    }

    fn qctxt_invalidate(&mut self, sel: &QueueSel) -> Result<(), DispatchError> {
        self.qctxt.remove(&Self::key(sel));
        Ok(())
    }

    fn qctxt_clear(&mut self, sel: &QueueSel) -> Result<(), DispatchError> {
        self.qctxt.remove(&Self::key(sel));
        Ok(())
    }

    fn intr_ctxt_write(&mut self, ctxt: &IntrCtxt) -> Result<(), DispatchError> {
        for i in 0..ctxt.rings.num_rings as usize {
            self.intr.insert(
                ctxt.rings.ring_index[i],
                (ctxt.ctxt_lo[i], ctxt.ctxt_hi[i]),
            );
        }
        Ok(())
    }

    fn intr_ctxt_read(&mut self, rings: &IntrRings) -> Result<IntrCtxt, DispatchError> {
        let mut ctxt = IntrCtxt {
            rings: *rings,
            ctxt_lo: [IntrRingLo::new(); MBOX_INTR_CTXT_RINGS],
            ctxt_hi: [IntrRingHi::new(); MBOX_INTR_CTXT_RINGS],
        };
        for i in 0..rings.num_rings as usize {
            let (lo, hi) = self
                .intr
                .get(&rings.ring_index[i])
                .copied()
                .ok_or(DispatchError::QueueNotFound)?;
            ctxt.ctxt_lo[i] = lo;
            ctxt.ctxt_hi[i] = hi;
        }
        Ok(ctxt)
    }

    fn intr_ctxt_invalidate(&mut self, rings: &IntrRings) -> Result<(), DispatchError> {
        for i in 0..rings.num_rings as usize {
            self.intr.remove(&rings.ring_index[i]);
        }
        Ok(())
    }

    fn intr_ctxt_clear(&mut self, rings: &IntrRings) -> Result<(), DispatchError> {
        for i in 0..rings.num_rings as usize {
            self.intr.remove(&rings.ring_index[i]);
        }
        Ok(())
    }
}

struct PfState<B> {
    table: QueueTable,
    dev: MboxDevInfo,
    csr: CsrBlock,
    backend: B,
}

/// Serves decoded requests against the PF's resource records.
///
/// `handle_request` may be called concurrently for different source
/// functions; grants and hardware state share one mutual-exclusion domain,
/// while the per-function busy flags refuse a second in-flight request from
/// the same function without queuing it.
pub struct PfDispatcher<B> {
    func_id: u16,
    busy: Mutex<BTreeSet<u16>>,
    state: Mutex<PfState<B>>,
}

impl<B: ContextBackend> PfDispatcher<B> {
    /// Creates a dispatcher answering as PF `func_id` with `config` policy.
    pub fn new(func_id: u16, config: PfConfig, backend: B) -> Self {
        Self {
            func_id,
            busy: Mutex::new(BTreeSet::new()),
            state: Mutex::new(PfState {
                table: QueueTable::new(&config),
                dev: config.dev,
                csr: config.csr,
                backend,
            }),
        }
    }

    /// Function id responses are sent from.
    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    /// Runs `f` against the resource table.
    pub fn with_table<R>(&self, f: impl FnOnce(&QueueTable) -> R) -> R {
        f(&self.state.lock().table)
    }

    /// Runs `f` against the context backend.
    pub fn with_backend<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.state.lock().backend)
    }

    /// Handles one raw request from `src_fn`, always producing the response
    /// to transmit back.
    pub fn handle_request(&self, src_fn: u16, msg: &MboxMessage) -> MboxMessage {
        let hdr = msg.hdr();
        // Claim the function's busy flag. A second request while one is in
        // flight is refused immediately, never queued.
        if !self.busy.lock().insert(src_fn) {
            tracing::debug!(src_fn, "mailbox request while busy");
            return status_response(hdr, MboxStatus::BUSY);
        }
        let resp = self.dispatch(src_fn, msg);
        self.busy.lock().remove(&src_fn);
        resp
    }

    fn dispatch(&self, src_fn: u16, msg: &MboxMessage) -> MboxMessage {
        let hdr = msg.hdr();
        let req = match MboxRequest::decode(msg) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(
                    src_fn,
                    error = &err as &dyn std::error::Error,
                    "malformed mailbox request"
                );
                return status_response(hdr, MboxStatus::MALFORMED);
            }
        };
        tracing::debug!(src_fn, op = ?req.op(), "mailbox request");
        match self.execute(src_fn, &req) {
            Ok(resp) => resp.encode(hdr, MboxStatus::OK).unwrap_or_else(|err| {
                tracing::error!(
                    src_fn,
                    error = &err as &dyn std::error::Error,
                    "unencodable mailbox response"
                );
                status_response(hdr, MboxStatus::INVALID_ARGUMENT)
            }),
            Err(err) => {
                tracing::debug!(
                    src_fn,
                    op = ?req.op(),
                    error = &err as &dyn std::error::Error,
                    "mailbox request refused"
                );
                status_response(hdr, err.status())
            }
        }
    }

    fn execute(&self, src_fn: u16, req: &MboxRequest) -> Result<MboxResponse, DispatchError> {
        let state = &mut *self.state.lock();
        match *req {
            MboxRequest::VfOnline { qmax, qbase } => {
                if Self::release_function(state, src_fn)? {
                    tracing::info!(src_fn, "released previous grant on re-online");
                }
                let grant = state.table.online(src_fn, qmax, qbase)?;
                tracing::info!(src_fn, qbase = grant.qbase, qmax = grant.qmax, "function online");
                Ok(MboxResponse::Online {
                    qbase: grant.qbase,
                    qmax: grant.qmax,
                    dev: state.dev,
                })
            }
            MboxRequest::VfOffline => {
                if Self::release_function(state, src_fn)? {
                    tracing::info!(src_fn, "function offline");
                }
                Ok(MboxResponse::Ack)
            }
            MboxRequest::Qreq { qmax, qbase } => {
                let grant = state.table.resize(src_fn, qmax, qbase)?;
                Ok(MboxResponse::Qinfo {
                    qbase: grant.qbase,
                    qmax: grant.qmax,
                })
            }
            MboxRequest::NotifyQadd { qid_hw } => {
                state.table.note_queue_added(src_fn, qid_hw)?;
                Ok(MboxResponse::Ack)
            }
            MboxRequest::NotifyQdel { qid_hw } => {
                state.table.note_queue_deleted(src_fn, qid_hw)?;
                Ok(MboxResponse::Ack)
            }
            MboxRequest::Fmap { qbase, qmax } => {
                state.table.program_fmap(src_fn, qbase, qmax)?;
                state.backend.fmap_write(src_fn, qbase, qmax)?;
                Ok(MboxResponse::Ack)
            }
            MboxRequest::QctxtWrite { sel, conf } => {
                state.table.check_queue(src_fn, sel.qid_hw)?;
                if conf.owner.func_id() != src_fn {
                    return Err(DispatchError::Unauthorized("context owner"));
                }
                if conf.flags.irq_en() {
                    // Direct vector or aggregation ring index; both live in
                    // the function's vector window.
                    state.table.check_vector(src_fn, conf.intr.intr_id())?;
                }
                state.backend.qctxt_write(&sel, &conf)?;
                Ok(MboxResponse::Ack)
            }
            MboxRequest::QctxtRead { sel } => {
                state.table.check_queue(src_fn, sel.qid_hw)?;
                let conf = state.backend.qctxt_read(&sel)?;
                Ok(MboxResponse::Qctxt { sel, conf })
            }
            MboxRequest::QctxtInvalidate { sel } => {
                state.table.check_queue(src_fn, sel.qid_hw)?;
                state.backend.qctxt_invalidate(&sel)?;
                Ok(MboxResponse::Ack)
            }
            MboxRequest::QctxtClear { sel } => {
                state.table.check_queue(src_fn, sel.qid_hw)?;
                state.backend.qctxt_clear(&sel)?;
                Ok(MboxResponse::Ack)
            }
            MboxRequest::CsrRead => Ok(MboxResponse::Csr(state.csr)),
            MboxRequest::IntrCtxtWrite { ctxt } => {
                Self::check_rings(&state.table, src_fn, &ctxt.rings)?;
                for i in 0..ctxt.rings.num_rings as usize {
                    state.table.check_vector(src_fn, ctxt.ctxt_lo[i].vec())?;
                }
                state.backend.intr_ctxt_write(&ctxt)?;
                Ok(MboxResponse::Ack)
            }
            MboxRequest::IntrCtxtRead { rings } => {
                Self::check_rings(&state.table, src_fn, &rings)?;
                let ctxt = state.backend.intr_ctxt_read(&rings)?;
                Ok(MboxResponse::IntrCtxt(ctxt))
            }
            MboxRequest::IntrCtxtInvalidate { rings } => {
                Self::check_rings(&state.table, src_fn, &rings)?;
                state.backend.intr_ctxt_invalidate(&rings)?;
                Ok(MboxResponse::Ack)
            }
            MboxRequest::IntrCtxtClear { rings } => {
                Self::check_rings(&state.table, src_fn, &rings)?;
                state.backend.intr_ctxt_clear(&rings)?;
                Ok(MboxResponse::Ack)
            }
        }
    }

    /// Resets everything `src_fn` programmed, then releases its grant.
    ///
    /// Returns whether the function was online. The grant is released only
    /// after the reset succeeds, so a failed reset leaves the range held and
    /// the reset still owed.
    fn release_function(state: &mut PfState<B>, src_fn: u16) -> Result<bool, DispatchError> {
        let (Some(queues), Some(vectors)) =
            (state.table.grant(src_fn), state.table.vector_span(src_fn))
        else {
            return Ok(false);
        };
        state.backend.function_reset(src_fn, queues, vectors)?;
        state.table.offline(src_fn);
        Ok(true)
    }

    /// Every ring index named by an interrupt-context operation must lie in
    /// the function's vector window.
    fn check_rings(
        table: &QueueTable,
        src_fn: u16,
        rings: &IntrRings,
    ) -> Result<(), DispatchError> {
        for i in 0..rings.num_rings as usize {
            table.check_vector(src_fn, rings.ring_index[i])?;
        }
        Ok(())
    }
}
