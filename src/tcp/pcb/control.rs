use std::io::Write;

use crate::tcp::wire::{self, ChecksumMode, OutSegment};
use crate::tcp::{Dual, Quad};

use super::Pcb;
use super::output::RecvView;

/// §4.7: stateless RST, built straight from explicit addressing rather than from the PCB that
/// provoked it. Touches no PCB/TCB state; the caller (listen-state handling, or an unmatched
/// segment in `segment_loop`) is responsible for any connection teardown.
pub fn rst<W: Write>(local: Dual, remote: Dual, seqno: u32, ackno: u32, tun: &mut W) {
    wire::write_rst_explicit(local, remote, seqno, ackno, tun);
}

/// §4.7: header-only keepalive, `seqno = snd_nxt - 1` (a byte already acknowledged, so it
/// elicits an ACK without advancing any sequence space). Never queued.
pub fn keepalive<W: Write>(pcb: &Pcb, quad: &Quad, recv: &RecvView, tun: &mut W) {
    let window = recv.rcv_ann_wnd >> recv.rcv_scale;
    let out = OutSegment {
        src_port: quad.dst.port,
        dst_port: quad.src.port,
        seqno: pcb.snd_nxt.wrapping_sub(1),
        ackno: recv.rcv_nxt,
        window,
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
        options: Vec::new(),
    };

    let _ = wire::write_segment(
        tun,
        quad.dst.ipv4,
        quad.src.ipv4,
        &out,
        &[],
        ChecksumMode::Reference,
    );
}

/// §4.7: zero-window probe. Re-sends one byte of already-queued data (or a lone FIN) from the
/// head of *unacked*, falling back to *unsent*'s head if nothing is outstanding yet, so the
/// peer's ACK can report a reopened window. Does not advance `snd_nxt` or move the segment
/// between queues — this is a bare retransmission of data already accounted for.
pub fn zero_window_probe<W: Write>(pcb: &Pcb, quad: &Quad, recv: &RecvView, tun: &mut W) {
    let seg = pcb.unacked.front().or_else(|| pcb.unsent.front());
    let Some(seg) = seg else {
        return;
    };

    let window = recv.rcv_ann_wnd >> recv.rcv_scale;
    let one_byte = !seg.buf.is_empty();

    let out = OutSegment {
        src_port: quad.dst.port,
        dst_port: quad.src.port,
        seqno: seg.seqno,
        ackno: recv.rcv_nxt,
        window,
        syn: false,
        ack: true,
        fin: seg.is_pure_fin(),
        rst: false,
        psh: false,
        options: Vec::new(),
    };

    let payload = if one_byte { &seg.buf.data[..1] } else { &[] };
    let _ = wire::write_segment(tun, quad.dst.ipv4, quad.src.ipv4, &out, payload, ChecksumMode::Reference);
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::tcp::pcb::write::{write as pcb_write, WriteFlags};
    use crate::tcp::wire::IpSink;

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
    fn rst_writes_a_reset_segment() {
        let mut sink = IpSink::new();
        rst(quad().dst, quad().src, 10, 20, &mut sink);
        assert!(!sink.0.is_empty());
    }

    #[test]
    fn keepalive_probes_one_byte_before_the_current_snd_nxt() {
        let pcb = Pcb::new(100, 1460);
        let mut sink = IpSink::new();
        keepalive(&pcb, &quad(), &recv(), &mut sink);
        assert!(!sink.0.is_empty());
    }

    #[test]
    fn zero_window_probe_noops_with_nothing_queued() {
        let pcb = Pcb::new(0, 1460);
        let mut sink = IpSink::new();
        zero_window_probe(&pcb, &quad(), &recv(), &mut sink);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn zero_window_probe_resends_the_unacked_head_without_consuming_it() {
        let mut pcb = Pcb::new(0, 1460);
        pcb_write(&mut pcb, b"hello", WriteFlags::empty()).unwrap();
        pcb.unacked.append(&mut pcb.unsent.take());

        let mut sink = IpSink::new();
        zero_window_probe(&pcb, &quad(), &recv(), &mut sink);
        assert!(!sink.0.is_empty());
        assert_eq!(pcb.unacked.len(), 1);
    }
}
