// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PF-side resource accounting for mailbox-served functions.
//!
//! The [`QueueTable`] is the authoritative record of which queue range and
//! interrupt vector window each online function owns. The dispatcher
//! validates every identifier claimed by an inbound request against it
//! before any privileged operation runs; the request itself proves nothing.

use crate::dispatch::DispatchError;
use qdma_defs::CsrBlock;
use qdma_defs::DevCapsWord;
use qdma_defs::MboxDevInfo;
use qdma_defs::QDMA_MAX_QUEUES;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Range;

/// PF allocation policy plus the device identity served over the mailbox.
#[derive(Debug, Clone)]
pub struct PfConfig {
    /// Queues the engine exposes, shared by all functions.
    pub num_queues: u16,
    /// Queue count granted when an online request does not name one.
    pub default_qmax: u16,
    /// Interrupt vectors the engine exposes.
    pub num_vectors: u16,
    /// Vector window granted to each online function.
    pub vectors_per_fn: u16,
    /// Device identity block echoed to an online request.
    pub dev: MboxDevInfo,
    /// Global CSR snapshot echoed to a CSR read.
    pub csr: CsrBlock,
}

impl Default for PfConfig {
    fn default() -> Self {
        Self {
            num_queues: QDMA_MAX_QUEUES as u16,
            default_qmax: 8,
            num_vectors: 256,
            vectors_per_fn: 8,
            dev: MboxDevInfo {
                caps: DevCapsWord::new()
                    .with_num_pfs(4)
                    .with_mm_channel_max(1)
                    .with_flr_present(true)
                    .with_st_en(true)
                    .with_mm_en(true)
                    .with_mm_cmpt_en(true),
                num_qs: QDMA_MAX_QUEUES,
            },
            csr: default_csr(),
        }
    }
}

/// Engine reset values for the global CSR arrays.
fn default_csr() -> CsrBlock {
    CsrBlock {
        ringsz: [
            2049, 65, 129, 193, 257, 385, 513, 769, 1025, 1537, 3073, 4097, 6145, 8193, 12289,
            16385,
        ],
        bufsz: [
            4096, 256, 512, 1024, 2048, 3968, 4096, 4096, 4096, 4096, 4096, 4096, 4096, 8192,
            9018, 16384,
        ],
        timer_cnt: [1, 2, 4, 5, 8, 10, 15, 30, 50, 75, 100, 125, 150, 200, 250, 255],
        cnt_thres: [64, 2, 4, 8, 16, 24, 32, 48, 80, 96, 112, 128, 144, 160, 176, 192],
        wb_intvl: 4,
    }
}

/// A function's allocated queue range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueGrant {
    /// First queue of the range.
    pub qbase: u16,
    /// Queue count.
    pub qmax: u16,
}

struct FnEntry {
    qbase: u16,
    qmax: u16,
    vectors: Range<u16>,
    fmap: Option<(u16, u16)>,
    active: BTreeSet<u16>,
}

/// Per-function grant and queue accounting table.
pub struct QueueTable {
    num_queues: u16,
    default_qmax: u16,
    num_vectors: u16,
    vectors_per_fn: u16,
    fns: BTreeMap<u16, FnEntry>,
}

impl QueueTable {
    /// Creates an empty table with `config`'s allocation policy.
    pub fn new(config: &PfConfig) -> Self {
        Self {
            num_queues: config.num_queues.min(QDMA_MAX_QUEUES as u16),
            default_qmax: config.default_qmax,
            num_vectors: config.num_vectors,
            vectors_per_fn: config.vectors_per_fn,
            fns: BTreeMap::new(),
        }
    }

    /// Brings `func_id` online, allocating a queue range and a vector window.
    ///
    /// A `qmax` of zero asks for the configured default. A function that is
    /// already online is re-onlined; its previous grant is released first.
    pub fn online(
        &mut self,
        func_id: u16,
        qmax: u16,
        qbase: Option<u16>,
    ) -> Result<QueueGrant, DispatchError> {
        // Repeat online: release the previous grant first so placement does
        // not collide with it.
        self.fns.remove(&func_id);
        let qmax = if qmax == 0 { self.default_qmax } else { qmax };
        let qbase = self.place_queues(qmax, qbase)?;
        let vectors = self.place_vectors()?;
        self.fns.insert(
            func_id,
            FnEntry {
                qbase,
                qmax,
                vectors,
                fmap: None,
                active: BTreeSet::new(),
            },
        );
        Ok(QueueGrant { qbase, qmax })
    }

    /// Releases `func_id`'s grant, returning the queue range and vector
    /// window it held.
    pub fn offline(&mut self, func_id: u16) -> Option<(QueueGrant, Range<u16>)> {
        self.fns.remove(&func_id).map(|f| {
            (
                QueueGrant {
                    qbase: f.qbase,
                    qmax: f.qmax,
                },
                f.vectors,
            )
        })
    }

    /// Replaces `func_id`'s queue range.
    ///
    /// Refused while the function still has queues up, since their contexts
    /// reference the old range. The old grant is kept on failure.
    pub fn resize(
        &mut self,
        func_id: u16,
        qmax: u16,
        qbase: Option<u16>,
    ) -> Result<QueueGrant, DispatchError> {
        let Some(mut entry) = self.fns.remove(&func_id) else {
            return Err(DispatchError::Unauthorized("function"));
        };
        if !entry.active.is_empty() {
            self.fns.insert(func_id, entry);
            return Err(DispatchError::InvalidArgument("queues still active"));
        }
        let qmax = if qmax == 0 { self.default_qmax } else { qmax };
        match self.place_queues(qmax, qbase) {
            Ok(qbase) => {
                entry.qbase = qbase;
                entry.qmax = qmax;
                entry.fmap = None;
                self.fns.insert(func_id, entry);
                Ok(QueueGrant { qbase, qmax })
            }
            Err(err) => {
                self.fns.insert(func_id, entry);
                Err(err)
            }
        }
    }

    /// Returns `func_id`'s queue grant.
    pub fn grant(&self, func_id: u16) -> Option<QueueGrant> {
        self.fns.get(&func_id).map(|f| QueueGrant {
            qbase: f.qbase,
            qmax: f.qmax,
        })
    }

    /// Returns `func_id`'s interrupt vector window.
    pub fn vector_span(&self, func_id: u16) -> Option<Range<u16>> {
        self.fns.get(&func_id).map(|f| f.vectors.clone())
    }

    /// Returns the function map window programmed for `func_id`.
    pub fn fmap(&self, func_id: u16) -> Option<(u16, u16)> {
        self.fns.get(&func_id).and_then(|f| f.fmap)
    }

    /// Validates that `qid_hw` lies within `func_id`'s granted range.
    pub fn check_queue(&self, func_id: u16, qid_hw: u16) -> Result<(), DispatchError> {
        let f = self.entry(func_id)?;
        if qid_hw >= f.qbase && u32::from(qid_hw) < u32::from(f.qbase) + u32::from(f.qmax) {
            Ok(())
        } else {
            Err(DispatchError::Unauthorized("queue id"))
        }
    }

    /// Validates that `vec` lies within `func_id`'s vector window.
    pub fn check_vector(&self, func_id: u16, vec: u16) -> Result<(), DispatchError> {
        let f = self.entry(func_id)?;
        if f.vectors.contains(&vec) {
            Ok(())
        } else {
            Err(DispatchError::Unauthorized("interrupt vector"))
        }
    }

    /// Validates a function map window against the grant and records it.
    pub fn program_fmap(
        &mut self,
        func_id: u16,
        qbase: u16,
        qmax: u16,
    ) -> Result<(), DispatchError> {
        let Some(f) = self.fns.get_mut(&func_id) else {
            return Err(DispatchError::Unauthorized("function"));
        };
        let inside = qbase >= f.qbase
            && u32::from(qbase) + u32::from(qmax) <= u32::from(f.qbase) + u32::from(f.qmax);
        if !inside {
            return Err(DispatchError::Unauthorized("queue map window"));
        }
        f.fmap = Some((qbase, qmax));
        Ok(())
    }

    /// Records a queue as brought up by its owner.
    pub fn note_queue_added(&mut self, func_id: u16, qid_hw: u16) -> Result<(), DispatchError> {
        self.check_queue(func_id, qid_hw)?;
        if let Some(f) = self.fns.get_mut(&func_id) {
            if !f.active.insert(qid_hw) {
                return Err(DispatchError::InvalidArgument("queue already added"));
            }
        }
        Ok(())
    }

    /// Records a queue as torn down by its owner.
    pub fn note_queue_deleted(&mut self, func_id: u16, qid_hw: u16) -> Result<(), DispatchError> {
        self.check_queue(func_id, qid_hw)?;
        if let Some(f) = self.fns.get_mut(&func_id) {
            if !f.active.remove(&qid_hw) {
                return Err(DispatchError::QueueNotFound);
            }
        }
        Ok(())
    }

    /// Queues `func_id` currently has up.
    pub fn active_queues(&self, func_id: u16) -> usize {
        self.fns.get(&func_id).map_or(0, |f| f.active.len())
    }

    /// Number of online functions.
    pub fn online_functions(&self) -> usize {
        self.fns.len()
    }

    fn entry(&self, func_id: u16) -> Result<&FnEntry, DispatchError> {
        self.fns
            .get(&func_id)
            .ok_or(DispatchError::Unauthorized("function"))
    }

    fn place_queues(&self, qmax: u16, qbase: Option<u16>) -> Result<u16, DispatchError> {
        if qmax == 0 || qmax > self.num_queues {
            return Err(DispatchError::InvalidArgument("queue count"));
        }
        let mut spans: Vec<(u16, u16)> = self.fns.values().map(|f| (f.qbase, f.qmax)).collect();
        spans.sort_unstable();
        match qbase {
            Some(qbase) => {
                let end = u32::from(qbase) + u32::from(qmax);
                if end > u32::from(self.num_queues) {
                    return Err(DispatchError::InvalidArgument("queue base"));
                }
                let free = spans
                    .iter()
                    .all(|&(b, m)| end <= u32::from(b) || u32::from(qbase) >= u32::from(b) + u32::from(m));
                if free {
                    Ok(qbase)
                } else {
                    Err(DispatchError::NoResource)
                }
            }
            None => {
                // First fit over the gaps between existing grants.
                let mut cursor = 0u32;
                for (b, m) in spans {
                    if cursor + u32::from(qmax) <= u32::from(b) {
                        return Ok(cursor as u16);
                    }
                    cursor = u32::from(b) + u32::from(m);
                }
                if cursor + u32::from(qmax) <= u32::from(self.num_queues) {
                    Ok(cursor as u16)
                } else {
                    Err(DispatchError::NoResource)
                }
            }
        }
    }

    fn place_vectors(&self) -> Result<Range<u16>, DispatchError> {
        let count = self.vectors_per_fn;
        if count == 0 {
            return Ok(0..0);
        }
        let mut spans: Vec<Range<u16>> = self
            .fns
            .values()
            .map(|f| f.vectors.clone())
            .filter(|r| !r.is_empty())
            .collect();
        spans.sort_unstable_by_key(|r| r.start);
        let mut cursor = 0u32;
        for r in spans {
            if cursor + u32::from(count) <= u32::from(r.start) {
                return Ok(cursor as u16..cursor as u16 + count);
            }
            cursor = u32::from(r.end);
        }
        if cursor + u32::from(count) <= u32::from(self.num_vectors) {
            Ok(cursor as u16..cursor as u16 + count)
        } else {
            Err(DispatchError::NoResource)
        }
    }
}
