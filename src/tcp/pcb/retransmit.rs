use std::time::{Duration, Instant};

use crate::tcp::seg::SegFlags;
use crate::tcp::wrapping_lt;

use super::{Pcb, PcbFlags};

/// What one cumulative ACK did to *unacked*, for the caller (`tcb.rs`) to fold into its own
/// RTT/window bookkeeping (§4.8, §4.9).
#[derive(Debug, Clone, Copy, Default)]
pub struct AckOutcome {
    pub acked_new_data: bool,
    pub rtt_sample: Option<Duration>,
    pub dup_ack: bool,
}

/// §4.8/§4.10: walk *unacked* from the head, removing every segment `ack` fully covers,
/// trimming a partially covered head, and taking an RTT sample when `ack` clears the segment
/// `rtseq` was armed on. The caller has already checked `ack` is new-or-duplicate relative to
/// `lastack` and not beyond `snd_nxt`.
pub fn on_cumulative_ack(pcb: &mut Pcb, ack: u32, now: Instant) -> AckOutcome {
    if ack == pcb.lastack {
        if !pcb.unacked.is_empty() {
            pcb.dupacks = pcb.dupacks.saturating_add(1);
            return AckOutcome {
                dup_ack: true,
                ..Default::default()
            };
        }
        return AckOutcome::default();
    }

    let mut rtt_sample = None;

    loop {
        let fully_acked = match pcb.unacked.front() {
            Some(seg) => !wrapping_lt(ack, seg.end_seqno()),
            None => false,
        };
        if !fully_acked {
            break;
        }

        let seg = pcb.unacked.pop_front().unwrap();
        pcb.snd_queuelen = pcb.snd_queuelen.saturating_sub(1);

        let sampled_this_seg = pcb.rtseq.map(|rtseq| !wrapping_lt(ack, rtseq.wrapping_add(1))).unwrap_or(false);
        if sampled_this_seg {
            if !seg.rexmit {
                if let Some(start) = pcb.rtt_start {
                    rtt_sample.get_or_insert(now.saturating_duration_since(start));
                }
            }
            pcb.rtseq = None;
            pcb.rtt_start = None;
        }
    }

    // A partial ack on the new head trims its already-sent prefix (§3.2: SYN/FIN segments
    // are all-or-nothing and never partially acked).
    if let Some(seg) = pcb.unacked.front_mut() {
        let partially_acked = wrapping_lt(seg.seqno, ack) && wrapping_lt(ack, seg.end_seqno());
        if partially_acked && !seg.flags.intersects(SegFlags::SYN | SegFlags::FIN) {
            let trim = ack.wrapping_sub(seg.seqno) as usize;
            seg.buf.data.drain(..trim);
            seg.seqno = ack;
            seg.checksum = crate::tcp::checksum::ChecksumAccum::new();
            seg.checksum.add(&seg.buf.data);
        }
    }

    pcb.lastack = ack;
    pcb.dupacks = 0;
    pcb.nrtx = 0;

    AckOutcome {
        acked_new_data: true,
        rtt_sample,
        dup_ack: false,
    }
}

/// §4.8 RTO retransmit: bulk-requeue every segment on both queues back onto *unsent*
/// (*unacked* first, since it holds the lower sequence numbers), mark each one retransmitted,
/// clear the in-flight RTT sample (it can no longer be trusted — Karn's algorithm), back off
/// the RTO, and reset `snd_nxt` to the new head so `output` resends from the loss point.
pub fn rexmit_rto(pcb: &mut Pcb) {
    let mut requeued = pcb.unacked.take();
    for seg in requeued.iter_mut() {
        seg.rexmit = true;
    }
    requeued.append(&mut pcb.unsent);
    pcb.unsent = requeued;

    if let Some(head) = pcb.unsent.front() {
        pcb.snd_nxt = head.seqno;
    }

    pcb.rtseq = None;
    pcb.rtt_start = None;
    pcb.nrtx = pcb.nrtx.saturating_add(1);
    pcb.rto = (pcb.rto * 2).min(60_000);
}

/// §4.8 fast retransmit: requeue only the single head-of-line segment (a sorted-insert back
/// onto *unsent*, since later unsent segments already have higher sequence numbers), mark it
/// retransmitted, clear the RTT sample if it was timing this segment, and bump `nrtx`. Unlike
/// `rexmit_rto`, this does not call `output` itself — the caller drives a fresh `output` pass
/// once congestion control has reacted (`rexmit_fast`).
pub fn rexmit(pcb: &mut Pcb) {
    let Some(mut seg) = pcb.unacked.pop_front() else {
        return;
    };

    if pcb.rtseq == Some(seg.seqno) {
        pcb.rtseq = None;
        pcb.rtt_start = None;
    }

    seg.rexmit = true;
    pcb.nrtx = pcb.nrtx.saturating_add(1);
    pcb.unsent.insert_sorted(seg);
}

/// §4.9: Reno-style congestion response to three duplicate ACKs (fast retransmit + fast
/// recovery entry). Idempotent per loss episode via `INFR`: only the first trio of dupacks in
/// an episode shrinks the window.
pub fn rexmit_fast(pcb: &mut Pcb) {
    if pcb.flags.contains(PcbFlags::INFR) {
        return;
    }

    let flight = pcb.cwnd.min(pcb.snd_wnd);
    pcb.ssthresh = (2 * pcb.mss as u32).max(flight / 2);
    pcb.cwnd = pcb.ssthresh + 3 * pcb.mss as u32;
    pcb.flags.insert(PcbFlags::INFR);

    rexmit(pcb);
}
