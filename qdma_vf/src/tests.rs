// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Drives the VF client and the PF service against the emulated mailbox to
//! test the end-to-end flow.

use crate::VfMailbox;
use crate::VfMboxConfig;
use qdma_defs::CmptCtxtType;
use qdma_defs::DescqConf;
use qdma_defs::DescqFlags;
use qdma_defs::DescqIntr;
use qdma_defs::DescqOwner;
use qdma_defs::DescqSizes;
use qdma_defs::IntrRingHi;
use qdma_defs::IntrRingLo;
use qdma_defs::MboxStatus;
use qdma_defs::MBOX_INTR_CTXT_RINGS;
use qdma_mbox::channel::MboxChannel;
use qdma_mbox::channel::MboxRole;
use qdma_mbox::emulated::EmulatedMbox;
use qdma_mbox::emulated::VfMboxIo;
use qdma_mbox::message::IntrCtxt;
use qdma_mbox::message::IntrRings;
use qdma_mbox::message::MboxRequest;
use qdma_mbox::message::QueueSel;
use qdma_mbox::MboxError;
use qdma_pf::dispatch::MemoryBackend;
use qdma_pf::resources::PfConfig;
use qdma_pf::PfMailbox;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

const PF: u16 = 0;

fn pf_config() -> PfConfig {
    PfConfig {
        num_queues: 64,
        default_qmax: 4,
        num_vectors: 32,
        vectors_per_fn: 8,
        ..PfConfig::default()
    }
}

fn vf_config() -> VfMboxConfig {
    VfMboxConfig {
        response_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_micros(100),
        send_retries: 1,
    }
}

fn vf(dev: &EmulatedMbox, func_id: u16) -> VfMailbox<VfMboxIo> {
    VfMailbox::new(dev.vf_io(func_id), func_id, PF, vf_config()).unwrap()
}

fn sel(qid_hw: u16) -> QueueSel {
    QueueSel {
        qid_hw,
        st: true,
        c2h: true,
        cmpt: CmptCtxtType::CMPT_WITH_ST,
    }
}

fn conf(func_id: u16) -> DescqConf {
    DescqConf {
        ring_bs_addr: 0x8000_0000,
        cmpt_ring_bs_addr: 0x8010_0000,
        flags: DescqFlags::new(),
        owner: DescqOwner::new().with_func_id(func_id),
        intr: DescqIntr::new().with_ringsz_idx(9),
        sizes: DescqSizes::new(),
    }
}

/// Runs a PF mailbox service on its own thread until dropped.
struct PfService {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PfService {
    fn spawn(dev: &EmulatedMbox) -> Self {
        let mut pf = PfMailbox::new(dev.pf_io(), PF, pf_config(), MemoryBackend::new()).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::spawn({
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::Relaxed) {
                    if pf.poll_all().is_err() {
                        break;
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for PfService {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
fn online_program_and_read_back() {
    let dev = EmulatedMbox::new();
    let _pf = PfService::spawn(&dev);
    let mut vf5 = vf(&dev, 5);

    let id = vf5.online(4, None).unwrap();
    assert_eq!((id.qbase, id.qmax), (0, 4));
    assert_eq!(id.func_id, 5);
    assert_eq!(id.parent_pf, PF);
    assert_eq!(id.dev.caps.num_pfs(), 4);
    assert!(id.dev.caps.st_en());
    assert!(vf5.is_online());

    vf5.fmap_program(id.qbase, id.qmax).unwrap();

    let want = conf(5);
    vf5.qctxt_write(sel(3), want).unwrap();
    vf5.notify_qadd(3).unwrap();

    let got = vf5.qctxt_read(sel(3)).unwrap();
    assert_eq!(got.ring_bs_addr, want.ring_bs_addr);
    assert_eq!(got.cmpt_ring_bs_addr, want.cmpt_ring_bs_addr);
    assert_eq!(u32::from(got.owner), u32::from(want.owner));
    assert_eq!(u32::from(got.intr), u32::from(want.intr));

    let csr = vf5.csr_read().unwrap();
    assert_eq!(csr.ringsz[0], 2049);
    assert_eq!(csr.wb_intvl, 4);

    vf5.notify_qdel(3).unwrap();
    vf5.qctxt_clear(sel(3)).unwrap();
    vf5.offline().unwrap();
    assert!(!vf5.is_online());
}

#[test]
fn queue_outside_grant_is_refused() {
    let dev = EmulatedMbox::new();
    let _pf = PfService::spawn(&dev);
    let mut vf5 = vf(&dev, 5);

    vf5.online(4, None).unwrap();
    let err = vf5.qctxt_write(sel(9), conf(5)).unwrap_err();
    assert!(matches!(
        err,
        MboxError::RequestFailed(MboxStatus::UNAUTHORIZED)
    ));
    // The refusal is not a transport failure; the client keeps working.
    assert!(!vf5.failed());
    vf5.qctxt_write(sel(3), conf(5)).unwrap();
}

#[test]
fn second_request_while_first_pending_is_busy() {
    let dev = EmulatedMbox::new();
    // Occupy VF 5's outbound slot before the client starts.
    let mut raw = MboxChannel::new(dev.vf_io(5), MboxRole::Vf, 5).unwrap();
    raw.send(PF, MboxRequest::NotifyQadd { qid_hw: 0 }.encode(5, PF).unwrap())
        .unwrap();

    let mut vf5 = vf(&dev, 5);
    let err = vf5.csr_read().unwrap_err();
    assert!(matches!(err, MboxError::ChannelBusy));
    assert!(!vf5.failed());

    // Once the PF drains the slot the same request goes through.
    let _pf = PfService::spawn(&dev);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match raw.receive() {
            Ok(_) => break,
            Err(MboxError::NoMessage) => {
                assert!(Instant::now() < deadline, "stale request never drained");
                thread::sleep(Duration::from_micros(100));
            }
            Err(err) => panic!("receive failed: {err}"),
        }
    }
    vf5.csr_read().unwrap();
}

#[test]
fn unanswered_request_times_out_and_latches() {
    let dev = EmulatedMbox::new();
    // No PF service behind the window.
    let mut vf5 = VfMailbox::new(
        dev.vf_io(5),
        5,
        PF,
        VfMboxConfig {
            response_timeout: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            send_retries: 1,
        },
    )
    .unwrap();

    let err = vf5.online(4, None).unwrap_err();
    assert!(matches!(err, MboxError::Timeout));
    assert!(vf5.failed());

    // Failure is latched; later requests fail fast.
    let err = vf5.csr_read().unwrap_err();
    assert!(matches!(err, MboxError::HardwareFault(_)));
}

#[test]
fn interrupt_context_round_trip() {
    let dev = EmulatedMbox::new();
    let _pf = PfService::spawn(&dev);
    let mut vf5 = vf(&dev, 5);
    // First function online, so the vector window is 0..8.
    vf5.online(4, None).unwrap();

    let mut ring_index = [0u16; MBOX_INTR_CTXT_RINGS];
    let mut ctxt_lo = [IntrRingLo::new(); MBOX_INTR_CTXT_RINGS];
    let mut ctxt_hi = [IntrRingHi::new(); MBOX_INTR_CTXT_RINGS];
    for i in 0..MBOX_INTR_CTXT_RINGS as u16 {
        let n = usize::from(i);
        ring_index[n] = i;
        ctxt_lo[n] = IntrRingLo::new()
            .with_valid(true)
            .with_vec(i)
            .with_baddr_4k(0x2_0000 + u64::from(i));
        ctxt_hi[n] = IntrRingHi::new().with_page_size(1).with_pidx(64);
    }
    let rings = IntrRings {
        num_rings: MBOX_INTR_CTXT_RINGS as u8,
        ring_index,
    };
    let want = IntrCtxt {
        rings,
        ctxt_lo,
        ctxt_hi,
    };
    vf5.intr_ctxt_write(want).unwrap();

    let got = vf5.intr_ctxt_read(rings).unwrap();
    assert_eq!(got.rings.num_rings, rings.num_rings);
    for i in 0..MBOX_INTR_CTXT_RINGS {
        assert_eq!(got.rings.ring_index[i], ring_index[i]);
        assert_eq!(u64::from(got.ctxt_lo[i]), u64::from(want.ctxt_lo[i]));
        assert_eq!(u32::from(got.ctxt_hi[i]), u32::from(want.ctxt_hi[i]));
    }

    // A ring outside the function's vector window is refused.
    let bad = IntrRings {
        num_rings: 1,
        ring_index: [8, 0, 0, 0, 0, 0, 0, 0],
    };
    let err = vf5.intr_ctxt_invalidate(bad).unwrap_err();
    assert!(matches!(
        err,
        MboxError::RequestFailed(MboxStatus::UNAUTHORIZED)
    ));

    vf5.intr_ctxt_invalidate(rings).unwrap();
    let err = vf5.intr_ctxt_read(rings).unwrap_err();
    assert!(matches!(
        err,
        MboxError::RequestFailed(MboxStatus::QUEUE_NOT_FOUND)
    ));
}

#[test]
fn offline_frees_the_grant_for_other_functions() {
    let dev = EmulatedMbox::new();
    let _pf = PfService::spawn(&dev);
    let mut vf1 = vf(&dev, 1);
    let mut vf2 = vf(&dev, 2);
    let mut vf3 = vf(&dev, 3);

    let id1 = vf1.online(32, None).unwrap();
    assert_eq!((id1.qbase, id1.qmax), (0, 32));
    let id2 = vf2.online(32, None).unwrap();
    assert_eq!((id2.qbase, id2.qmax), (32, 32));

    // All 64 queues are granted; a third function cannot come online.
    let err = vf3.online(8, None).unwrap_err();
    assert!(matches!(
        err,
        MboxError::RequestFailed(MboxStatus::NO_RESOURCE)
    ));
    assert!(!vf3.failed());

    vf1.offline().unwrap();
    let id3 = vf3.online(8, None).unwrap();
    assert_eq!((id3.qbase, id3.qmax), (0, 8));
}

#[test]
fn qreq_resizes_when_queues_are_idle() {
    let dev = EmulatedMbox::new();
    let _pf = PfService::spawn(&dev);
    let mut vf5 = vf(&dev, 5);

    let id = vf5.online(4, None).unwrap();
    vf5.fmap_program(id.qbase, id.qmax).unwrap();
    vf5.notify_qadd(0).unwrap();

    // Active queues pin the grant.
    let err = vf5.request_queues(16, None).unwrap_err();
    assert!(matches!(
        err,
        MboxError::RequestFailed(MboxStatus::INVALID_ARGUMENT)
    ));

    vf5.notify_qdel(0).unwrap();
    let (qbase, qmax) = vf5.request_queues(16, None).unwrap();
    assert_eq!((qbase, qmax), (0, 16));
    // The resize dropped the queue map; program it again.
    vf5.fmap_program(qbase, qmax).unwrap();
}
