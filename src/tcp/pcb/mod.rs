//! The send-side engine: segmentation, queuing, transmission and retransmission for one
//! connection. Everything receive-side (state machine, `rcv_nxt`/`rcv_wnd` bookkeeping, ACK
//! acceptability) stays in `tcb.rs` and is threaded into these operations as plain arguments,
//! since it is the engine's *input*, not its own state.

mod control;
mod output;
mod retransmit;
mod write;

pub use control::{keepalive, rst, zero_window_probe};
pub use output::{output, send_empty_ack, RecvView};
pub use retransmit::{on_cumulative_ack, rexmit, rexmit_fast, rexmit_rto, AckOutcome};
pub use write::{enqueue_flags, send_fin, write, WriteFlags};

use std::time::Instant;

use bitflags::bitflags;

use super::queue::SegQueue;

bitflags! {
    /// Mirrors the source's `pcb->flags` bitset (§3.1), restricted to the bits the output
    /// engine itself reads or sets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcbFlags: u16 {
        const ACK_NOW     = 0b0000_0001;
        const NAGLEMEMERR = 0b0000_0010;
        const FIN         = 0b0000_0100;
        /// In fast recovery (`rexmit_fast` already triggered for this loss episode).
        const INFR        = 0b0000_1000;
        const NODELAY     = 0b0001_0000;
        const TIMESTAMP   = 0b0010_0000;
        const WND_SCALE   = 0b0100_0000;
    }
}

/// Hard cap on `snd_queuelen` (§6.4). The source's default is much larger for bulk transfer
/// PCBs; this is sized for the single-connection demo this engine is embedded in.
pub const TCP_SND_QUEUELEN: usize = 64;

/// `§6.4` default send MSS used before a peer's MSS option is negotiated.
pub const TCP_MSS: u16 = 1460;

/// `§6.4` window scale exponent this engine advertises; 0 keeps the raw 16-bit window and the
/// scale-factor arithmetic in `output`/`control` as identity operations.
pub const TCP_RCV_SCALE: u8 = 0;

/// The send-side half of a connection's protocol control block (§3.1). Everything here is
/// owned and mutated exclusively by `write`/`output`/the retransmit family; the surrounding
/// `TCB` only reads `lastack`/`snd_nxt` to fill in ACK fields on segments it builds itself
/// (keepalive, empty ACK from the input path) and writes `snd_wnd` from received window
/// updates.
#[derive(Debug, Clone)]
pub struct Pcb {
    pub mss: u16,
    pub snd_wnd: u32,
    pub snd_wnd_max: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub snd_buf: usize,
    pub snd_queuelen: usize,
    /// Sequence number of the next byte `write` will hand out ("last byte buffered + 1").
    pub snd_lbb: u32,
    pub snd_nxt: u32,
    pub lastack: u32,
    /// RTT sample in flight: sequence number being timed. `None` when no sample is running.
    pub rtseq: Option<u32>,
    /// Wall-clock start of the in-flight RTT sample; paired with `rtseq`.
    pub rtt_start: Option<Instant>,
    pub rto: u64,
    pub nrtx: u32,
    pub dupacks: u8,
    pub unsent: SegQueue,
    pub unacked: SegQueue,
    pub unsent_oversize: usize,
    pub flags: PcbFlags,
}

impl Pcb {
    /// A freshly opened connection's send engine. `mss` is the path MSS assumed until the
    /// peer's MSS option is seen; `iss` both seeds `snd_lbb`/`snd_nxt` and is *not* itself
    /// consumed here (the SYN segment that consumes it is enqueued by `enqueue_flags`).
    pub fn new(iss: u32, mss: u16) -> Self {
        Pcb {
            mss,
            snd_wnd: 0,
            snd_wnd_max: 0,
            // RFC 9293 S3.8.6.3 permits up to 4*SMSS for SMSS <= 1095; TCB::listen/syn_sent
            // use the same 4*mss starting point for the connection's initial cwnd.
            cwnd: 4 * mss as u32,
            ssthresh: u32::MAX,
            snd_buf: 64 * 1024,
            snd_queuelen: 0,
            snd_lbb: iss,
            snd_nxt: iss,
            lastack: iss,
            rtseq: None,
            rtt_start: None,
            rto: 1000,
            nrtx: 0,
            dupacks: 0,
            unsent: SegQueue::new(),
            unacked: SegQueue::new(),
            unsent_oversize: 0,
            flags: PcbFlags::empty(),
        }
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// §4.9 congestion-window growth on a fresh cumulative ACK (classic Reno). Fast recovery
    /// is left by the next non-duplicate ACK, mirrored here by clearing `INFR`.
    pub fn congestion_control_on_ack(&mut self) {
        if self.flags.contains(PcbFlags::INFR) {
            // Leaving fast recovery: deflate cwnd back down to ssthresh rather than letting
            // the inflated (ssthresh + 3*mss) window carry over into congestion avoidance.
            self.cwnd = self.ssthresh;
            self.flags.remove(PcbFlags::INFR);
        } else if self.is_slow_start() {
            self.cwnd += self.mss as u32;
        } else {
            self.cwnd += ((self.mss as u64 * self.mss as u64) / self.cwnd.max(1) as u64).max(1) as u32;
        }
        self.dupacks = 0;
    }

    /// `min(mss, snd_wnd_max/2)` as required by §3.1/§4.2, never zero. Before any window has
    /// been advertised (`snd_wnd_max == 0`, e.g. while still in SYN_SENT) the halved-max-window
    /// term is meaningless, so fall back to the plain MSS rather than degenerating to 0.
    pub(crate) fn mss_local(&self) -> usize {
        if self.snd_wnd_max == 0 {
            return self.mss.max(1) as usize;
        }
        let cap = self.snd_wnd_max / 2;
        (self.mss as u32).min(cap).max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pcb_starts_with_empty_queues_and_iw_cwnd() {
        let pcb = Pcb::new(1000, 536);
        assert!(pcb.unsent.is_empty());
        assert!(pcb.unacked.is_empty());
        assert_eq!(pcb.cwnd, 4 * 536);
        assert_eq!(pcb.snd_lbb, 1000);
        assert_eq!(pcb.snd_nxt, 1000);
    }

    #[test]
    fn congestion_control_slow_start_increments_by_mss() {
        let mut pcb = Pcb::new(0, 1460);
        pcb.ssthresh = 100_000;
        let before = pcb.cwnd;
        pcb.congestion_control_on_ack();
        assert_eq!(pcb.cwnd, before + 1460);
    }

    #[test]
    fn congestion_control_avoidance_increments_sublinearly() {
        let mut pcb = Pcb::new(0, 1460);
        pcb.cwnd = 100_000;
        pcb.ssthresh = 1_000;
        let before = pcb.cwnd;
        pcb.congestion_control_on_ack();
        assert!(pcb.cwnd > before);
        assert!(pcb.cwnd < before + 1460);
    }

    #[test]
    fn mss_local_falls_back_to_mss_before_any_window_is_known() {
        let pcb = Pcb::new(0, 1460);
        assert_eq!(pcb.mss_local(), 1460);
    }

    #[test]
    fn mss_local_honors_half_of_max_advertised_window() {
        let mut pcb = Pcb::new(0, 1460);
        pcb.snd_wnd_max = 1000;
        assert_eq!(pcb.mss_local(), 500);
    }
}
