use std::io::{self, Write};

use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice, TcpOptionElement};

use super::Quad;

/// TCP's default TTL and DSCP/ECN byte for segments this engine originates (§6.4 `TCP_TTL`).
pub const TCP_TTL: u8 = 64;

/// NOP/kind/len constants for the option encodings this engine emits (§6.3). Written out
/// explicitly rather than relying on a library default so the wire layout — and in
/// particular the exact NOP padding pattern — matches what the rest of this spec mandates.
pub const TS_OPTION_HEADER_WORD: u32 = 0x0101_080A;
pub const WSCALE_OPTION_HEADER_WORD_BASE: u32 = 0x0103_0300;

/// Negotiated/requested options for one outgoing segment, in the order they are encoded on
/// the wire: MSS, timestamp, window scale (§4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct SegOptions {
    pub mss: Option<u16>,
    pub timestamp: Option<(u32, u32)>,
    pub window_scale: Option<u8>,
}

fn element_len(el: &TcpOptionElement) -> usize {
    match el {
        TcpOptionElement::Noop => 1,
        TcpOptionElement::MaximumSegmentSize(_) => 4,
        TcpOptionElement::WindowScale(_) => 3,
        TcpOptionElement::Timestamp(_, _) => 10,
        TcpOptionElement::SelectiveAcknowledgementPermitted => 2,
        TcpOptionElement::SelectiveAcknowledgement(_, _) => 10,
    }
}

/// Builds the option element list in wire order, each option preceded by the minimal NOP
/// padding needed to keep it 4-byte aligned as a group, with trailing NOPs so the whole
/// option block is a multiple of 4 bytes (§4.6, §6.3).
pub fn build_options(opts: &SegOptions) -> Vec<TcpOptionElement> {
    let mut out = Vec::new();

    if let Some(mss) = opts.mss {
        out.push(TcpOptionElement::MaximumSegmentSize(mss));
    }
    if let Some((tsval, tsecr)) = opts.timestamp {
        out.push(TcpOptionElement::Noop);
        out.push(TcpOptionElement::Noop);
        out.push(TcpOptionElement::Timestamp(tsval, tsecr));
    }
    if let Some(shift) = opts.window_scale {
        out.push(TcpOptionElement::Noop);
        out.push(TcpOptionElement::WindowScale(shift));
    }

    let len: usize = out.iter().map(element_len).sum();
    let pad = (4 - len % 4) % 4;
    out.extend(std::iter::repeat(TcpOptionElement::Noop).take(pad));
    out
}

/// One fully-formed outgoing segment, header fields only (payload passed separately so
/// callers can hand in a borrowed slice without copying).
pub struct OutSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seqno: u32,
    pub ackno: u32,
    pub window: u16,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub options: Vec<TcpOptionElement>,
}

/// §4.6: "compute checksum: either use precomputed partial checksum folded with the
/// pseudo-header partial sum (checksum-on-copy), or compute the full pseudo-header + data
/// checksum synchronously". `OnCopy` carries the running payload sum accumulated while the
/// segment's bytes were copied in during `write` (§4.2); `Reference` recomputes over the
/// whole payload here, which §9 requires to agree bit-for-bit with `OnCopy`.
pub enum ChecksumMode {
    OnCopy(u32),
    Reference,
}

pub(crate) fn write_segment<W: Write>(
    tun: &mut W,
    src_ip: std::net::Ipv4Addr,
    dst_ip: std::net::Ipv4Addr,
    seg: &OutSegment,
    payload: &[u8],
    checksum_mode: ChecksumMode,
) -> io::Result<()> {
    let mut tcph = TcpHeader::new(seg.src_port, seg.dst_port, seg.seqno, seg.window);
    tcph.acknowledgment_number = seg.ackno;
    tcph.syn = seg.syn;
    tcph.ack = seg.ack;
    tcph.fin = seg.fin;
    tcph.rst = seg.rst;
    tcph.psh = seg.psh;
    tcph.set_options(&seg.options)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let ip4h = Ipv4Header::new(
        tcph.header_len() + payload.len() as u16,
        TCP_TTL,
        etherparse::ip_number::TCP,
        src_ip.octets(),
        dst_ip.octets(),
    );

    tcph.checksum = match checksum_mode {
        ChecksumMode::Reference => tcph
            .calc_checksum_ipv4(&ip4h, payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?,
        ChecksumMode::OnCopy(payload_partial) => {
            let mut header_bytes = [0u8; 60];
            let mut cursor = io::Cursor::new(&mut header_bytes[..]);
            tcph.write(&mut cursor)?;
            let header_len = cursor.position() as usize;
            let header_sum = super::checksum::sum16(&header_bytes[..header_len]);
            let partial = super::checksum::add_ones_complement(header_sum, payload_partial);
            super::checksum::fold_with_pseudo_header(
                partial,
                src_ip,
                dst_ip,
                tcph.header_len() + payload.len() as u16,
            )
        }
    };

    let mut buf = [0u8; 1500];
    let mut cursor = io::Cursor::new(&mut buf[..]);
    ip4h.write(&mut cursor)?;
    tcph.write(&mut cursor)?;
    cursor.write_all(payload)?;
    let n = cursor.position() as usize;

    tun.write_all(&buf[..n])
}

/// Stateless RST builder (§4.7): takes the offending segment's header and derives
/// seqno/ackno per RFC 9293's reset rules. Touches no PCB state.
pub fn write_reset<W: Write>(ip4h: &Ipv4HeaderSlice, tcph: &TcpHeaderSlice, data: &[u8], tun: &mut W) {
    let seqno = if tcph.ack() {
        tcph.acknowledgment_number()
    } else {
        0
    };
    let ackno = tcph
        .sequence_number()
        .wrapping_add(data.len() as u32)
        .wrapping_add(if tcph.syn() { 1 } else { 0 })
        .wrapping_add(if tcph.fin() { 1 } else { 0 });

    let seg = OutSegment {
        src_port: tcph.destination_port(),
        dst_port: tcph.source_port(),
        seqno,
        ackno,
        window: 0,
        syn: false,
        ack: true,
        fin: false,
        rst: true,
        psh: false,
        options: Vec::new(),
    };

    let _ = write_segment(tun, ip4h.destination_addr(), ip4h.source_addr(), &seg, &[], ChecksumMode::Reference);
}

/// Stateless RST builder taking explicit addressing rather than an offending segment,
/// matching `rst(seqno, ackno, l_ip, r_ip, l_port, r_port)` in §6.1.
pub fn write_rst_explicit<W: Write>(
    local: super::Dual,
    remote: super::Dual,
    seqno: u32,
    ackno: u32,
    tun: &mut W,
) {
    let seg = OutSegment {
        src_port: local.port,
        dst_port: remote.port,
        seqno,
        ackno,
        window: 0,
        syn: false,
        ack: true,
        fin: false,
        rst: true,
        psh: false,
        options: Vec::new(),
    };

    let _ = write_segment(tun, local.ipv4, remote.ipv4, &seg, &[], ChecksumMode::Reference);
}

/// Bare ACK, not queued or retransmitted (§4.5 empty ACK, and input-path acceptability ACKs).
pub fn write_ack<W: Write>(quad: &Quad, seqno: u32, ackno: u32, window: u16, tun: &mut W) {
    let seg = OutSegment {
        src_port: quad.dst.port,
        dst_port: quad.src.port,
        seqno,
        ackno,
        window,
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
        options: Vec::new(),
    };

    let _ = write_segment(tun, quad.dst.ipv4, quad.src.ipv4, &seg, &[], ChecksumMode::Reference);
}

/// SYN-ACK reply from LISTEN/SYN-RCVD. Carries the MSS option (§4.3).
pub fn write_synack<W: Write>(quad: &Quad, seqno: u32, ackno: u32, window: u16, mss: u16, tun: &mut W) {
    let seg = OutSegment {
        src_port: quad.dst.port,
        dst_port: quad.src.port,
        seqno,
        ackno,
        window,
        syn: true,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
        options: build_options(&SegOptions {
            mss: Some(mss),
            ..Default::default()
        }),
    };

    let _ = write_segment(tun, quad.dst.ipv4, quad.src.ipv4, &seg, &[], ChecksumMode::Reference);
}

/// In-memory stand-in for a `Tun` device (§7.3): every `write_*` helper above is generic over
/// `io::Write`, so tests can assert on the raw bytes a segment would have put on the wire
/// without opening a real TUN fd.
#[cfg(test)]
pub(crate) struct IpSink(pub Vec<u8>);

#[cfg(test)]
impl IpSink {
    pub fn new() -> Self {
        IpSink(Vec::new())
    }
}

#[cfg(test)]
impl Write for IpSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::super::Dual;
    use super::*;

    #[test]
    fn write_ack_produces_a_parseable_ipv4_tcp_ack() {
        let quad = Quad {
            src: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 2),
                port: 54321,
            },
            dst: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 1),
                port: 9090,
            },
        };

        let mut sink = IpSink::new();
        write_ack(&quad, 100, 200, 4096, &mut sink);

        let ip4h = Ipv4HeaderSlice::from_slice(&sink.0).unwrap();
        assert_eq!(ip4h.source_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ip4h.destination_addr(), Ipv4Addr::new(10, 0, 0, 2));

        let tcph = TcpHeaderSlice::from_slice(&sink.0[(ip4h.ihl() * 4) as usize..]).unwrap();
        assert_eq!(tcph.source_port(), 9090);
        assert_eq!(tcph.destination_port(), 54321);
        assert_eq!(tcph.sequence_number(), 100);
        assert_eq!(tcph.acknowledgment_number(), 200);
        assert!(tcph.ack());
        assert!(!tcph.syn());
        assert!(!tcph.rst());
    }

    #[test]
    fn write_synack_carries_the_mss_option() {
        let quad = Quad {
            src: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 2),
                port: 54321,
            },
            dst: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 1),
                port: 9090,
            },
        };

        let mut sink = IpSink::new();
        write_synack(&quad, 0, 1, 4096, 1460, &mut sink);

        let ip4h = Ipv4HeaderSlice::from_slice(&sink.0).unwrap();
        let tcph = TcpHeaderSlice::from_slice(&sink.0[(ip4h.ihl() * 4) as usize..]).unwrap();
        assert!(tcph.syn());
        assert!(tcph.ack());
        let options: Vec<_> = tcph.options_iterator().collect::<Result<_, _>>().unwrap();
        assert!(matches!(options[0], TcpOptionElement::MaximumSegmentSize(1460)));
    }

    #[test]
    fn build_options_mss_only_is_four_byte_aligned() {
        let opts = build_options(&SegOptions {
            mss: Some(1460),
            ..Default::default()
        });
        let len: usize = opts.iter().map(element_len).sum();
        assert_eq!(len % 4, 0);
        assert_eq!(len, 4);
    }

    #[test]
    fn build_options_timestamp_padded_with_two_nops() {
        let opts = build_options(&SegOptions {
            timestamp: Some((1, 2)),
            ..Default::default()
        });
        assert!(matches!(opts[0], TcpOptionElement::Noop));
        assert!(matches!(opts[1], TcpOptionElement::Noop));
        assert!(matches!(opts[2], TcpOptionElement::Timestamp(1, 2)));
        let len: usize = opts.iter().map(element_len).sum();
        assert_eq!(len % 4, 0);
    }

    #[test]
    fn build_options_all_three_in_spec_order() {
        let opts = build_options(&SegOptions {
            mss: Some(1460),
            timestamp: Some((10, 20)),
            window_scale: Some(7),
        });
        assert!(matches!(opts[0], TcpOptionElement::MaximumSegmentSize(1460)));
        // NOP, NOP, Timestamp
        assert!(matches!(opts[3], TcpOptionElement::Timestamp(10, 20)));
        // NOP, WindowScale
        assert!(matches!(opts[5], TcpOptionElement::WindowScale(7)));
        let len: usize = opts.iter().map(element_len).sum();
        assert_eq!(len % 4, 0);
    }
}
