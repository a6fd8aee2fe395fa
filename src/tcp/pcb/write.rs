use bitflags::bitflags;

use crate::err::OutputError;
use crate::tcp::seg::{oversize_reserve, should_oversize, Seg, SegBuf, SegFlags};

use super::{Pcb, PcbFlags, TCP_SND_QUEUELEN};

bitflags! {
    /// Caller-facing flags for `write` (§6.1). `COPY` is the only mode this engine
    /// implements (§9's zero-copy re-architecture note recommends omitting zero-copy
    /// entirely to remove the borrow-lifetime hazard, which this crate does).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u8 {
        const MORE = 0b0000_0001;
    }
}

/// §4.2: segment `data` into `Seg`s and append them to *unsent*, all-or-nothing.
///
/// The source's three-phase plan (append to oversize tail, chain a fresh buffer onto the
/// tail, then build new segments) is expressed here over a flat `Vec<u8>`-backed `SegBuf`
/// rather than a `pbuf` chain: phases 1 and 2 collapse into "grow the tail segment in place
/// up to `mss_local`", since there is no separate buffer-chaining allocation to account for.
/// The queue-length and buffer-credit checks, and the commit-only-on-full-success contract,
/// are unchanged from the source.
pub fn write(pcb: &mut Pcb, data: &[u8], flags: WriteFlags) -> Result<(), OutputError> {
    if data.is_empty() {
        return Ok(());
    }
    if data.len() > pcb.snd_buf {
        pcb.flags.insert(PcbFlags::NAGLEMEMERR);
        return Err(OutputError::Mem);
    }

    let mss_local = pcb.mss_local();
    let nodelay = pcb.flags.contains(PcbFlags::NODELAY);
    let more = flags.contains(WriteFlags::MORE);

    // How much of `data` phase 1/2 can pack into the existing tail without allocating a new
    // segment (bounded by mss_local, since a segment never exceeds the negotiated size).
    let tail_room = pcb
        .unsent
        .back()
        .filter(|tail| {
            !tail.buf.is_empty() && !tail.flags.intersects(SegFlags::SYN | SegFlags::FIN | SegFlags::RST)
        })
        .map(|tail| mss_local.saturating_sub(tail.len() as usize))
        .unwrap_or(0)
        .min(data.len());

    let remaining = data.len() - tail_room;
    let new_segs_needed = remaining.div_ceil(mss_local.max(1));

    if pcb.snd_queuelen + new_segs_needed > TCP_SND_QUEUELEN {
        return Err(OutputError::Mem);
    }

    // Phase 1 + 2: extend the tail in place, oversizing its reserve if it wasn't already
    // large enough to admit these bytes.
    if tail_room > 0 {
        let tail = pcb.unsent.back_mut().unwrap();
        if tail.oversize_left < tail_room {
            tail.oversize_left = tail_room;
        }
        tail.append_oversize(&data[..tail_room]);
    }

    // Phase 3: whatever didn't fit becomes new, MSS-sized segments.
    let mut seqno = pcb.snd_lbb.wrapping_add(tail_room as u32);
    let mut chain = Vec::with_capacity(new_segs_needed);
    let queues_nonempty = !pcb.unsent.is_empty() || !pcb.unacked.is_empty();
    let mut rest = &data[tail_room..];
    while !rest.is_empty() {
        let take = rest.len().min(mss_local);
        let (chunk, tail_rest) = rest.split_at(take);
        rest = tail_rest;

        let first_seg = tail_room == 0 && chain.is_empty() && !queues_nonempty;
        let oversize = if should_oversize(take, mss_local, more, nodelay, first_seg, queues_nonempty) {
            oversize_reserve(take, mss_local)
        } else {
            0
        };

        let mut seg = Seg::new(seqno, SegFlags::empty());
        seg.buf = SegBuf::with_reserve(take + oversize);
        seg.buf.data.extend_from_slice(chunk);
        seg.checksum.add(chunk);
        seg.oversize_left = oversize;

        seqno = seqno.wrapping_add(take as u32);
        chain.push(seg);
    }

    // Commit: PSH on the very last segment that will hold this write's tail, unless MORE.
    if !more {
        if let Some(last) = chain.last_mut() {
            last.flags.insert(SegFlags::PSH);
        } else if tail_room > 0 {
            pcb.unsent.back_mut().unwrap().flags.insert(SegFlags::PSH);
        }
    }

    let new_count = chain.len();
    for seg in chain {
        pcb.unsent.push_back(seg);
    }

    pcb.snd_lbb = seqno;
    pcb.snd_buf -= data.len();
    pcb.snd_queuelen += new_count;
    pcb.unsent_oversize = pcb.unsent.back().map(|s| s.oversize_left).unwrap_or(0);

    Ok(())
}

/// §4.3: enqueue a zero-payload SYN and/or FIN segment, consuming one sequence number
/// (and, by source bug-compatibility, one byte of `snd_buf`; see §9 open questions).
pub fn enqueue_flags(
    pcb: &mut Pcb,
    control: SegFlags,
    offer_wnd_scale: bool,
    timestamp: bool,
) -> Result<(), OutputError> {
    debug_assert!(control.intersects(SegFlags::SYN | SegFlags::FIN));
    if pcb.snd_buf < 1 {
        return Err(OutputError::Mem);
    }

    let mut seg_flags = control;
    if control.contains(SegFlags::SYN) {
        seg_flags.insert(SegFlags::OPTS_MSS);
        if offer_wnd_scale {
            seg_flags.insert(SegFlags::OPTS_WND_SCALE);
        }
    }
    if timestamp {
        seg_flags.insert(SegFlags::OPTS_TS);
    }

    pcb.unsent.push_back(Seg::new(pcb.snd_lbb, seg_flags));
    pcb.snd_lbb = pcb.snd_lbb.wrapping_add(1);
    pcb.snd_buf -= 1;
    // This segment is its own fragment on *unsent* (§8.1 queue-length coherence:
    // snd_queuelen == 0 iff both queues are empty).
    pcb.snd_queuelen += 1;

    if control.contains(SegFlags::FIN) {
        pcb.flags.insert(PcbFlags::FIN);
    }

    Ok(())
}

/// §4.3: prefer attaching FIN to the last *unsent* segment over allocating a fresh one, as
/// long as that segment carries no SYN/FIN/RST already.
pub fn send_fin(pcb: &mut Pcb, offer_wnd_scale: bool, timestamp: bool) -> Result<(), OutputError> {
    if pcb.snd_buf < 1 {
        return Err(OutputError::Mem);
    }
    if let Some(tail) = pcb.unsent.back_mut() {
        if !tail.flags.intersects(SegFlags::SYN | SegFlags::FIN | SegFlags::RST) {
            tail.flags.insert(SegFlags::FIN);
            pcb.snd_lbb = pcb.snd_lbb.wrapping_add(1);
            // No new fragment is created here (FIN piggybacks on an existing segment), so
            // snd_queuelen is untouched; but FIN still charges the same one byte of send
            // buffer the enqueue_flags(FIN) path below charges (§9 bug-compatibility note),
            // so the two paths agree on snd_buf no matter which one a given `send_fin` call
            // takes.
            pcb.snd_buf -= 1;
            pcb.flags.insert(PcbFlags::FIN);
            return Ok(());
        }
    }
    enqueue_flags(pcb, SegFlags::FIN, offer_wnd_scale, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_rejects_len_over_snd_buf_without_mutating_state() {
        let mut pcb = Pcb::new(0, 1460);
        pcb.snd_buf = 10;
        let before_lbb = pcb.snd_lbb;
        let result = write(&mut pcb, &[0u8; 20], WriteFlags::empty());
        assert!(matches!(result, Err(OutputError::Mem)));
        assert!(pcb.flags.contains(PcbFlags::NAGLEMEMERR));
        assert_eq!(pcb.snd_lbb, before_lbb);
        assert!(pcb.unsent.is_empty());
    }

    #[test]
    fn oversize_packing_merges_two_small_writes_into_one_segment() {
        let mut pcb = Pcb::new(0, 1460);
        write(&mut pcb, &[1u8; 100], WriteFlags::MORE).unwrap();
        write(&mut pcb, &[2u8; 50], WriteFlags::empty()).unwrap();
        assert_eq!(pcb.unsent.len(), 1);
        let seg = pcb.unsent.front().unwrap();
        assert_eq!(seg.len(), 150);
        assert!(seg.flags.contains(SegFlags::PSH));
    }

    #[test]
    fn mss_segmentation_splits_into_expected_sizes() {
        let mut pcb = Pcb::new(0, 1460);
        write(&mut pcb, &[0u8; 4000], WriteFlags::empty()).unwrap();
        let lens: Vec<u32> = pcb.unsent.iter().map(|s| s.len()).collect();
        assert_eq!(lens, vec![1460, 1460, 1080]);
        assert!(pcb.unsent.iter().last().unwrap().flags.contains(SegFlags::PSH));
    }

    #[test]
    fn enqueue_flags_consumes_one_sequence_number_and_one_buffer_byte() {
        let mut pcb = Pcb::new(1000, 536);
        let before_buf = pcb.snd_buf;
        enqueue_flags(&mut pcb, SegFlags::SYN, true, false).unwrap();
        assert_eq!(pcb.snd_lbb, 1001);
        assert_eq!(pcb.snd_buf, before_buf - 1);
        let seg = pcb.unsent.front().unwrap();
        assert!(seg.flags.contains(SegFlags::OPTS_MSS | SegFlags::OPTS_WND_SCALE));
    }

    #[test]
    fn enqueue_flags_keeps_snd_queuelen_coherent_with_queue_occupancy() {
        // §8.1 queue-length coherence: snd_queuelen == 0 iff both queues are empty. A bare
        // SYN/FIN segment is its own fragment on *unsent* and must be counted.
        let mut pcb = Pcb::new(0, 1460);
        assert_eq!(pcb.snd_queuelen, 0);
        enqueue_flags(&mut pcb, SegFlags::SYN, true, false).unwrap();
        assert_eq!(pcb.snd_queuelen, 1);
        assert!(!pcb.unsent.is_empty());
    }

    #[test]
    fn send_fin_attaches_to_bare_tail_segment_instead_of_allocating() {
        let mut pcb = Pcb::new(0, 1460);
        write(&mut pcb, b"hello", WriteFlags::empty()).unwrap();
        let before_len = pcb.unsent.len();
        let before_buf = pcb.snd_buf;
        send_fin(&mut pcb, false, false).unwrap();
        assert_eq!(pcb.unsent.len(), before_len);
        assert!(pcb.unsent.iter().last().unwrap().flags.contains(SegFlags::FIN));
        // Attaching FIN charges the same one byte of snd_buf as the enqueue_flags(FIN)
        // fallback path would, even though it creates no new queue fragment.
        assert_eq!(pcb.snd_buf, before_buf - 1);
    }

    #[test]
    fn send_fin_attach_and_enqueue_paths_charge_snd_buf_identically() {
        let mut attached = Pcb::new(0, 1460);
        write(&mut attached, b"hello", WriteFlags::empty()).unwrap();
        let before = attached.snd_buf;
        send_fin(&mut attached, false, false).unwrap();

        let mut enqueued = Pcb::new(0, 1460);
        let before2 = enqueued.snd_buf;
        send_fin(&mut enqueued, false, false).unwrap();

        assert_eq!(before - attached.snd_buf, before2 - enqueued.snd_buf);
    }
}
