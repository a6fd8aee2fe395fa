use std::time::Instant;

use bitflags::bitflags;

use super::checksum::ChecksumAccum;

bitflags! {
    /// Per-segment control/option bits. SYN/FIN consume one sequence number each and are
    /// folded into `tcp_len`; the OPTS_* bits drive option encoding at emit time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegFlags: u16 {
        const SYN            = 0b0000_0001;
        const FIN            = 0b0000_0010;
        const RST            = 0b0000_0100;
        const PSH            = 0b0000_1000;
        const OPTS_MSS       = 0b0001_0000;
        const OPTS_TS        = 0b0010_0000;
        const OPTS_WND_SCALE = 0b0100_0000;
    }
}

/// Oversize reserve, in bytes, added to a fresh segment buffer when it looks like more data
/// will be packed into it before it ships (see `should_oversize`).
pub const TCP_OVERSIZE: usize = 128;

fn align4(x: usize) -> usize {
    (x + 3) & !3
}

/// Whether a freshly allocated segment buffer of `length` bytes should carry extra, unused
/// tail capacity so that a following `write` can pack into it in place instead of allocating
/// a new segment. Mirrors `tcp_pbuf_prealloc`: oversize only when it looks like the segment
/// won't ship immediately (Nagle engaged, or caller asked for more).
pub fn should_oversize(
    length: usize,
    max_length: usize,
    more: bool,
    nodelay: bool,
    first_seg: bool,
    queues_nonempty: bool,
) -> bool {
    length < max_length && (more || (!nodelay && (queues_nonempty || !first_seg)))
}

/// Size of the oversize reserve for a buffer whose logical length is `length`, capped so the
/// total allocation never exceeds `max_length`.
pub fn oversize_reserve(length: usize, max_length: usize) -> usize {
    let wanted = align4(length + TCP_OVERSIZE).min(max_length);
    wanted.saturating_sub(length)
}

/// Owning byte storage for one segment's payload. The header is built fresh at emit time
/// (§4.6), so this only ever holds payload bytes.
#[derive(Debug, Clone, Default)]
pub struct SegBuf {
    pub data: Vec<u8>,
}

impl SegBuf {
    pub fn with_reserve(oversize: usize) -> Self {
        SegBuf {
            data: Vec::with_capacity(oversize),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One TCP segment sitting on either the *unsent* or *unacked* queue.
#[derive(Debug, Clone)]
pub struct Seg {
    pub seqno: u32,
    pub buf: SegBuf,
    pub flags: SegFlags,
    pub checksum: ChecksumAccum,
    /// Unused tail capacity in `buf` that a later `write` may still pack into.
    pub oversize_left: usize,
    /// Set once this segment has been retransmitted; excludes it from RTT sampling
    /// (Karn's algorithm).
    pub rexmit: bool,
    /// When this segment was last handed to the IP sink; `None` until its first emission.
    /// Used both to arm the retransmission timer and, on the non-`rexmit` path, as the RTT
    /// sample start.
    pub sent: Option<Instant>,
}

impl Seg {
    pub fn new(seqno: u32, flags: SegFlags) -> Self {
        Seg {
            seqno,
            buf: SegBuf::default(),
            flags,
            checksum: ChecksumAccum::new(),
            oversize_left: 0,
            rexmit: false,
            sent: None,
        }
    }

    pub fn len(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Payload length plus one sequence number each for SYN/FIN.
    pub fn tcp_len(&self) -> u32 {
        self.len()
            + self.flags.contains(SegFlags::SYN) as u32
            + self.flags.contains(SegFlags::FIN) as u32
    }

    /// One past the last sequence number this segment occupies.
    pub fn end_seqno(&self) -> u32 {
        self.seqno.wrapping_add(self.tcp_len())
    }

    pub fn is_pure_fin(&self) -> bool {
        self.flags.contains(SegFlags::FIN) && self.buf.is_empty()
    }

    pub fn is_control_only(&self) -> bool {
        self.buf.is_empty()
            && !self.flags.intersects(SegFlags::SYN | SegFlags::FIN | SegFlags::RST)
    }

    /// Appends `data` to the buffer's oversize tail, folding it into the running checksum.
    /// Caller must ensure `data.len() <= self.oversize_left`.
    pub fn append_oversize(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.oversize_left);
        self.buf.data.extend_from_slice(data);
        self.checksum.add(data);
        self.oversize_left -= data.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversize_reserve_capped_at_max_length() {
        assert_eq!(oversize_reserve(100, 1460), align4(100 + TCP_OVERSIZE) - 100);
        assert_eq!(oversize_reserve(1400, 1460), 60);
    }

    #[test]
    fn should_oversize_matches_nagle_heuristic() {
        // First segment, NODELAY off, queues empty, no MORE: ships immediately, no oversize.
        assert!(!should_oversize(100, 1460, false, false, true, false));
        // MORE requested: always oversize regardless of Nagle state.
        assert!(should_oversize(100, 1460, true, false, true, false));
        // Not first segment: Nagle already engaged even without MORE.
        assert!(should_oversize(100, 1460, false, false, false, false));
        // NODELAY on: never oversize unless MORE.
        assert!(!should_oversize(100, 1460, false, true, false, true));
    }

    #[test]
    fn tcp_len_counts_syn_and_fin() {
        let mut seg = Seg::new(100, SegFlags::SYN);
        assert_eq!(seg.tcp_len(), 1);
        seg.buf.data.extend_from_slice(b"hello");
        let data_seg = Seg {
            flags: SegFlags::PSH,
            ..seg.clone()
        };
        assert_eq!(data_seg.tcp_len(), 6);
    }
}
