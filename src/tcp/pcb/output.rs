use std::io::Write;
use std::time::Instant;

use crate::tcp::context::InputContext;
use crate::tcp::seg::{Seg, SegFlags};
use crate::tcp::wire::{self, ChecksumMode, OutSegment, SegOptions};
use crate::tcp::Quad;

use super::{Pcb, PcbFlags};

/// Receive-side facts the output path needs but does not own (§4.4 preamble). `tcb.rs` fills
/// this in fresh before every `output`/`send_empty_ack` call; nothing here survives past one
/// call.
#[derive(Debug, Clone, Copy)]
pub struct RecvView {
    pub rcv_nxt: u32,
    /// Unscaled advertised window, in bytes.
    pub rcv_ann_wnd: u16,
    pub rcv_scale: u8,
    /// Most recently received timestamp value, echoed back as TSecr.
    pub ts_recent: u32,
}

/// §4.4: drain *unsent* under the combined `min(snd_wnd, cwnd)` window, honoring Nagle and
/// piggybacking a forced ACK. Re-entrant calls for the connection currently being processed
/// by the input path are a no-op (§5, §9): the input handler calls `output` itself once it is
/// done mutating the PCB.
pub fn output<W: Write>(
    pcb: &mut Pcb,
    quad: &Quad,
    recv: &RecvView,
    tcp_ticks: u32,
    in_syn_sent: bool,
    ctx: &InputContext,
    tun: &mut W,
) {
    if ctx.is_current(*quad) {
        return;
    }

    // No window has been advertised yet (fresh SYN_SENT, before any segment from the peer):
    // `snd_wnd` is meaningless as a gate in that state, since it would otherwise block the
    // handshake SYN itself from ever going out (mirrors the `mss_local` sentinel).
    let wnd = if pcb.snd_wnd_max == 0 {
        u64::MAX
    } else {
        pcb.snd_wnd.min(pcb.cwnd) as u64
    };

    if pcb.flags.contains(PcbFlags::ACK_NOW) {
        let head_fits = pcb
            .unsent
            .front()
            .map(|seg| seg.seqno.wrapping_sub(pcb.lastack) as u64 + seg.tcp_len() as u64 <= wnd)
            .unwrap_or(false);
        if pcb.unsent.is_empty() || !head_fits {
            send_empty_ack(pcb, quad, recv, tcp_ticks, tun);
            return;
        }
    }

    loop {
        let send_now = match pcb.unsent.front() {
            None => break,
            Some(seg) => {
                let in_window =
                    seg.seqno.wrapping_sub(pcb.lastack) as u64 + seg.tcp_len() as u64 <= wnd;
                if !in_window {
                    false
                } else {
                    let small = seg.len() < pcb.mss as u32;
                    let nagle_holds = small
                        && !pcb.unacked.is_empty()
                        && !pcb.flags.contains(PcbFlags::NODELAY)
                        && !seg.flags.contains(SegFlags::PSH);
                    let override_nagle = pcb.flags.intersects(PcbFlags::NAGLEMEMERR | PcbFlags::FIN);
                    !nagle_holds || override_nagle
                }
            }
        };

        if !send_now {
            break;
        }

        let mut seg = pcb.unsent.pop_front().unwrap();
        pcb.flags.remove(PcbFlags::ACK_NOW);

        emit_segment(pcb, quad, &mut seg, recv, tcp_ticks, !in_syn_sent, tun);

        pcb.snd_nxt = if crate::tcp::wrapping_lt(pcb.snd_nxt, seg.end_seqno()) {
            seg.end_seqno()
        } else {
            pcb.snd_nxt
        };

        if seg.tcp_len() > 0 {
            pcb.unacked.push_back(seg);
        }
    }

    if pcb.unsent.is_empty() {
        pcb.unsent_oversize = 0;
    }
    pcb.flags.remove(PcbFlags::NAGLEMEMERR);
}

/// §4.5: an empty ACK built and sent directly, bypassing the queues entirely. Never
/// retransmitted, never touches `snd_nxt`/`unacked`.
pub fn send_empty_ack<W: Write>(pcb: &mut Pcb, quad: &Quad, recv: &RecvView, tcp_ticks: u32, tun: &mut W) {
    let window = recv.rcv_ann_wnd >> recv.rcv_scale;
    let options = if pcb.flags.contains(PcbFlags::TIMESTAMP) {
        wire::build_options(&SegOptions {
            timestamp: Some((tcp_ticks, recv.ts_recent)),
            ..Default::default()
        })
    } else {
        Vec::new()
    };

    let out = OutSegment {
        src_port: quad.dst.port,
        dst_port: quad.src.port,
        seqno: pcb.snd_nxt,
        ackno: recv.rcv_nxt,
        window,
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
        options,
    };

    let _ = wire::write_segment(
        tun,
        quad.dst.ipv4,
        quad.src.ipv4,
        &out,
        &[],
        ChecksumMode::Reference,
    );

    pcb.flags.remove(PcbFlags::ACK_NOW);
}

/// §4.6: build the wire header for `seg`, pick the window value, checksum the segment
/// (checksum-on-copy), hand it to the IP sink, and arm the RTT sample if none is running.
fn emit_segment<W: Write>(
    pcb: &mut Pcb,
    quad: &Quad,
    seg: &mut Seg,
    recv: &RecvView,
    tcp_ticks: u32,
    ack: bool,
    tun: &mut W,
) {
    let carries_wnd_scale = seg.flags.contains(SegFlags::SYN) && seg.flags.contains(SegFlags::OPTS_WND_SCALE);
    let window = if carries_wnd_scale {
        recv.rcv_ann_wnd
    } else {
        recv.rcv_ann_wnd >> recv.rcv_scale
    };

    let options = wire::build_options(&SegOptions {
        mss: seg.flags.contains(SegFlags::OPTS_MSS).then_some(pcb.mss),
        timestamp: seg
            .flags
            .contains(SegFlags::OPTS_TS)
            .then_some((tcp_ticks, recv.ts_recent)),
        window_scale: seg
            .flags
            .contains(SegFlags::OPTS_WND_SCALE)
            .then_some(recv.rcv_scale),
    });

    let out = OutSegment {
        src_port: quad.dst.port,
        dst_port: quad.src.port,
        seqno: seg.seqno,
        ackno: recv.rcv_nxt,
        window,
        syn: seg.flags.contains(SegFlags::SYN),
        ack,
        fin: seg.flags.contains(SegFlags::FIN),
        rst: seg.flags.contains(SegFlags::RST),
        psh: seg.flags.contains(SegFlags::PSH),
        options,
    };

    let checksum_mode = ChecksumMode::OnCopy(seg.checksum.partial_sum());
    let _ = wire::write_segment(tun, quad.dst.ipv4, quad.src.ipv4, &out, &seg.buf.data, checksum_mode);

    if !seg.rexmit && pcb.rtseq.is_none() {
        pcb.rtseq = Some(seg.seqno);
        pcb.rtt_start = Some(Instant::now());
    }

    seg.sent = Some(Instant::now());
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::tcp::pcb::write::write as pcb_write;
    use crate::tcp::pcb::write::WriteFlags;
    use crate::tcp::wire::IpSink;
    use crate::tcp::Dual;

    use super::*;

    fn quad() -> Quad {
        Quad {
            src: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 2),
                port: 54321,
            },
            dst: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 1),
                port: 9090,
            },
        }
    }

    fn recv() -> RecvView {
        RecvView {
            rcv_nxt: 1,
            rcv_ann_wnd: 8192,
            rcv_scale: 0,
            ts_recent: 0,
        }
    }

    #[test]
    fn output_drains_unsent_into_unacked_and_writes_a_segment() {
        let mut pcb = Pcb::new(0, 1460);
        pcb.snd_wnd = 8192;
        pcb_write(&mut pcb, b"hello", WriteFlags::empty()).unwrap();

        let ctx = InputContext::new();
        let mut sink = IpSink::new();
        output(&mut pcb, &quad(), &recv(), 0, false, &ctx, &mut sink);

        assert!(pcb.unsent.is_empty());
        assert_eq!(pcb.unacked.len(), 1);
        assert!(!sink.0.is_empty());
    }

    #[test]
    fn output_is_a_noop_while_the_connection_is_under_the_reentrance_guard() {
        let mut pcb = Pcb::new(0, 1460);
        pcb.snd_wnd = 8192;
        pcb_write(&mut pcb, b"hello", WriteFlags::empty()).unwrap();

        let ctx = InputContext::new();
        let q = quad();
        let _guard = ctx.enter(q);
        let mut sink = IpSink::new();
        output(&mut pcb, &q, &recv(), 0, false, &ctx, &mut sink);

        assert_eq!(pcb.unsent.len(), 1);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn send_empty_ack_writes_a_bare_ack_and_clears_ack_now() {
        let mut pcb = Pcb::new(0, 1460);
        pcb.flags.insert(PcbFlags::ACK_NOW);

        let mut sink = IpSink::new();
        send_empty_ack(&mut pcb, &quad(), &recv(), 0, &mut sink);

        assert!(!pcb.flags.contains(PcbFlags::ACK_NOW));
        assert!(!sink.0.is_empty());
    }
}
