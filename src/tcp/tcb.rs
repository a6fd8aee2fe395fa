use std::cmp;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::Ordering::{self, Acquire};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice, TcpOptionElement};
use tracing::{debug, trace, warn};

use super::context::InputContext;
use super::pcb::{self, Pcb, PcbFlags, RecvView, TCP_MSS, TCP_RCV_SCALE, TCP_SND_QUEUELEN};
use super::seg::SegFlags;
use super::wire::{write_ack, write_reset, write_synack};
use super::{is_between_wrapped, wrapping_lt, Quad};

/*
                    RFC 9293 - S3.3.2 - Fig 5

                            +---------+ ---------\      active OPEN
                            |  CLOSED |            \    -----------
                            +---------+<---------\   \   create TCB
                              |     ^              \   \  snd SYN
                 passive OPEN |     |   CLOSE        \   \
                 ------------ |     | ----------       \   \
                  create TCB  |     | delete TCB         \   \
                              V     |                      \   \
          rcv RST (note 1)  +---------+            CLOSE    |    \
       -------------------->|  LISTEN |          ---------- |     |
      /                     +---------+          delete TCB |     |
     /           rcv SYN      |     |     SEND              |     |
    /           -----------   |     |    -------            |     V
+--------+      snd SYN,ACK  /       \   snd SYN          +--------+
|        |<-----------------           ------------------>|        |
|  SYN   |                    rcv SYN                     |  SYN   |
|  RCVD  |<-----------------------------------------------|  SENT  |
|        |                  snd SYN,ACK                   |        |
|        |------------------           -------------------|        |
+--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
   |         --------------   |     |   -----------
   |                x         |     |     snd ACK
   |                          V     V
   |  CLOSE                 +---------+
   | -------                |  ESTAB  |
   | snd FIN                +---------+
   |                 CLOSE    |     |    rcv FIN
   V                -------   |     |    -------
+---------+         snd FIN  /       \   snd ACK         +---------+
|  FIN    |<----------------          ------------------>|  CLOSE  |
| WAIT-1  |------------------                            |   WAIT  |
+---------+          rcv FIN  \                          +---------+
  | rcv ACK of FIN   -------   |                          CLOSE  |
  | --------------   snd ACK   |                         ------- |
  V        x                   V                         snd FIN V
+---------+               +---------+                    +---------+
|FINWAIT-2|               | CLOSING |                    | LAST-ACK|
+---------+               +---------+                    +---------+
  |              rcv ACK of FIN |                 rcv ACK of FIN |
  |  rcv FIN     -------------- |    Timeout=2MSL -------------- |
  |  -------            x       V    ------------        x       V
   \ snd ACK              +---------+delete TCB          +---------+
     -------------------->|TIME-WAIT|------------------->| CLOSED  |
                          +---------+                    +---------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listen,
    SynRcvd,
    SynSent,
    Estab,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

/*
                RFC 9293 - S3.3.1 - Fig 3

           1         2          3          4
      ----------|----------|----------|----------
             SND.UNA    SND.NXT    SND.UNA
                                  +SND.WND

1 - old sequence numbers that have been acknowledged
2 - sequence numbers of unacknowledged data
3 - sequence numbers allowed for new data transmission
4 - future sequence numbers that are not yet allowed

`SND.UNA`/`SND.NXT`/`SND.WND` live on `Pcb` as `lastack`/`snd_nxt`/`snd_wnd` (the send engine
owns them, §3.1); `wl1`/`wl2` stay here since they are purely an input-path bookkeeping device
(which segment last moved the window) with no role in segmentation or output.
*/

/*
                RFC 9293 - S3.3.1 - Fig 4

                       1          2          3
                   ----------|----------|----------
                          RCV.NXT    RCV.NXT
                                    +RCV.WND

        1 - old sequence numbers that have been acknowledged
        2 - sequence numbers allowed for new reception
        3 - future sequence numbers that are not yet allowed
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvSpace {
    pub(crate) nxt: u32, // receive next
    pub(crate) wnd: u16, // receive window
    irs: u32,            // initial receive sequence number
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

#[derive(Debug, Clone)]
pub enum Action {
    Noop,
    AddToPending(TCB),
    RemoveFromPending,
    IsEstablished,
    Reset,
    DeleteTCB,
    Wakeup {
        wake_up_reader: bool,
        wake_up_writer: bool,
        wake_up_closer: bool,
    },
    ConnectionRefused,
}

#[derive(Debug, Clone)]
pub struct TCB {
    pub(crate) quad: Quad,
    pub(crate) kind: Kind,
    pub(crate) state: State,
    pub(crate) reset: Arc<AtomicBool>,
    pub(crate) write_closed: Arc<AtomicBool>,
    pub(crate) read_closed: Arc<AtomicBool>,
    pub(crate) time_wait: Option<Instant>,

    // Window-update bookkeeping (RFC 9293 S3.10.7.3); `iss` is only needed to decide whether
    // an incoming ACK acknowledges our own SYN.
    iss: u32,
    wl1: u32,
    wl2: u32,

    pub(crate) rcv: RecvSpace,

    /// The send-side engine: segmentation, queuing, output, retransmission (§4 entire).
    pub(crate) pcb: Pcb,

    srtt: u128,
    rttvar: u128,
    rtt_measured: bool,

    /// Wall-clock start of the current back-to-back RTO retransmission run for the
    /// connection, used only to evaluate the R1/R2 thresholds below. Cleared whenever a
    /// cumulative ACK acknowledges new data.
    rto_backoff_run_started: Option<Instant>,
    r1: u128,
    pub(crate) r2: Arc<AtomicU64>,
    r1_syn: u128,
    pub(crate) r2_syn: Arc<AtomicU64>,

    probe_timeout: Option<Instant>,
    /// Coarse tick counter handed to the output path as the outgoing TSval; this engine
    /// never negotiates the timestamp option (`PcbFlags::TIMESTAMP` is never set), so its
    /// value is presently inert, kept only so `RecvView` has something to pass.
    tcp_ticks: u32,

    pub(crate) incoming: VecDeque<u8>,
}

impl TCB {
    fn common(quad: Quad, kind: Kind, state: State, iss: u32) -> Self {
        TCB {
            quad,
            kind,
            state,
            reset: Arc::new(AtomicBool::new(false)),
            write_closed: Arc::new(AtomicBool::new(false)),
            read_closed: Arc::new(AtomicBool::new(false)),
            time_wait: None,
            iss,
            wl1: 0,
            wl2: 0,
            rcv: RecvSpace {
                nxt: 0,
                wnd: 64240,
                irs: 0,
            },
            pcb: Pcb::new(iss, TCP_MSS),
            srtt: 0,
            rttvar: 0,
            rtt_measured: false,
            rto_backoff_run_started: None,
            /*
            The value of R1 SHOULD correspond to at least 3 retransmissions, at the current
            RTO (SHLD-10). The value of R2 SHOULD correspond to at least 100 seconds
            (SHLD-11).
            */
            r1: 50 * 1000,
            r2: Arc::new(AtomicU64::new(100 * 1000)),
            /*
            R2 for a SYN segment MUST be set large enough to provide retransmission of the
            segment for at least 3 minutes (MUST-23).
            */
            r1_syn: 1 * 60 * 1000,
            r2_syn: Arc::new(AtomicU64::new(3 * 60 * 1000)),
            probe_timeout: None,
            tcp_ticks: 0,
            incoming: VecDeque::new(),
        }
    }

    pub fn listen(quad: Quad, iss: u32) -> Self {
        Self::common(quad, Kind::Passive, State::Listen, iss)
    }

    pub fn syn_sent(quad: Quad, iss: u32) -> Self {
        let mut tcb = Self::common(quad, Kind::Active, State::SynSent, iss);

        // SYN is always alone (§3.2 invariant); offer our window-scale and always the MSS
        // option (§4.3).
        pcb::enqueue_flags(&mut tcb.pcb, SegFlags::SYN, true, false)
            .expect("fresh Pcb always has snd_buf >= 1");

        tcb
    }

    fn recv_view(&self) -> RecvView {
        RecvView {
            rcv_nxt: self.rcv.nxt,
            rcv_ann_wnd: self.rcv.wnd,
            rcv_scale: TCP_RCV_SCALE,
            ts_recent: 0,
        }
    }

    /// §4.4: drain *unsent* under the current window, guarded against re-entrance from
    /// whatever `ctx` says is the connection currently being processed by the input path
    /// (§5, §9). `on_segment` calls this itself after mutating the PCB, but while the input
    /// path still holds the guard for this connection that call is a deliberate no-op — the
    /// caller of `on_segment` is responsible for calling `output` again once it drops the
    /// guard, which is exactly what `segment_loop` does.
    pub fn output<W: Write>(&mut self, ctx: &InputContext, tun: &mut W) {
        let in_syn_sent = self.state == State::SynSent;
        let recv = self.recv_view();
        pcb::output(
            &mut self.pcb,
            &self.quad,
            &recv,
            self.tcp_ticks,
            in_syn_sent,
            ctx,
            tun,
        );
    }

    /// Whether a `write` of this connection's outgoing data would currently be rejected for
    /// lack of buffer credit or queue room (§4.2 preconditions) — used by `TcpStream::write`
    /// to decide whether to block.
    pub fn write_would_block(&self) -> bool {
        self.pcb.snd_buf == 0 || self.pcb.snd_queuelen >= TCP_SND_QUEUELEN
    }

    /// Whether every byte handed to `write` so far has been transmitted *and* cumulatively
    /// acknowledged — used by `TcpStream::flush` to block until the send side has fully
    /// drained (§8.2 round-trip property).
    pub fn all_sent(&self) -> bool {
        self.pcb.unsent.is_empty() && self.pcb.unacked.is_empty()
    }

    pub fn write(&mut self, data: &[u8], more: bool) -> Result<(), crate::OutputError> {
        if !matches!(
            self.state,
            State::Estab | State::CloseWait | State::SynSent | State::SynRcvd
        ) {
            return Err(crate::OutputError::Conn);
        }

        let flags = if more {
            pcb::WriteFlags::MORE
        } else {
            pcb::WriteFlags::empty()
        };
        pcb::write(&mut self.pcb, data, flags)
    }

    fn is_fin_acked(&self) -> bool {
        let acked = self.pcb.unsent.is_empty()
            && self.pcb.unacked.is_empty()
            && self.pcb.lastack == self.pcb.snd_nxt
            && self.write_closed.load(Ordering::Acquire);

        trace!(?self.quad, acked, "is_fin_acked");
        acked
    }

    pub fn close(&mut self) {
        if self.state == State::Estab {
            debug!(?self.quad, "state -> FinWait1");
            self.state = State::FinWait1;
        } else {
            assert_eq!(self.state, State::CloseWait);
            debug!(?self.quad, "state -> LastAck");
            self.state = State::LastAck;
        }

        self.write_closed.store(true, Ordering::Release);

        /*
        When we close the write half of the TCP stream, we must send a FIN. `send_fin`
        prefers attaching it to the last *unsent* segment over allocating a bare one (§4.3).
        */
        let _ = pcb::send_fin(&mut self.pcb, false, false);
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let len = cmp::min(buf.len(), self.incoming.len());

        let data: Vec<u8> = self.incoming.drain(..len).collect();

        buf[..data.len()].copy_from_slice(&data[..]);

        /*
                RFC9293 S3.8.6.2.2. Receiver's Algorithm -- When to Send a Window Update

        The solution to receiver SWS is to avoid advancing the right window edge
        RCV.NXT+RCV.WND in small increments, even if data is received from the network in
        small segments. The suggested SWS avoidance algorithm for the receiver is to keep
        RCV.NXT+RCV.WND fixed until the reduction satisfies:

            RCV.BUFF - RCV.USER - RCV.WND  >=  min( Fr * RCV.BUFF, Eff.snd.MSS )

        where Fr is a fraction whose recommended value is 1/2.
        */
        let reopened = self.incoming.capacity() - self.incoming.len() - self.rcv.wnd as usize
            >= cmp::min(
                (0.5 * self.incoming.capacity() as f64) as usize,
                self.pcb.mss as usize,
            );
        if reopened {
            self.rcv.wnd = (self.incoming.capacity() - self.incoming.len()) as u16;
            // A newly reopened window is worth telling the peer about promptly; the actual
            // send happens on the next `output` pass driven by `on_tick` (this method has no
            // `Tun` handle — it runs under the reader's lock, off the segment-loop thread).
            self.pcb.flags.insert(PcbFlags::ACK_NOW);
        }

        len
    }

    /// Timer-driven work for one connection: RTO retransmission, zero-window probing, and
    /// TIME-WAIT expiry. Returns `true` when the TCB should be deleted.
    pub fn on_tick<W: Write>(&mut self, ctx: &InputContext, tun: &mut W) -> bool {
        if let Some(seg) = self.pcb.unacked.front() {
            if let Some(sent) = seg.sent {
                let deadline = sent + Duration::from_millis(self.pcb.rto);
                if Instant::now() >= deadline {
                    let is_syn = seg.flags.contains(SegFlags::SYN);

                    if self.rto_backoff_run_started.is_none() {
                        self.rto_backoff_run_started = Some(Instant::now());
                    }

                    debug!(?self.quad, rto = self.pcb.rto, "RTO fired, retransmitting");
                    pcb::rexmit_rto(&mut self.pcb);
                    self.output(ctx, tun);

                    /*
                            RFC 9293 S3.8.3. TCP Connection Failures

                    (a) There are two thresholds R1 and R2 measuring the amount of
                        retransmission that has occurred for the same segment.
                    (b) When the number of transmissions of the same segment reaches or
                        exceeds threshold R1, pass negative advice to the IP layer.
                    (c) When the number of transmissions of the same segment reaches a
                        threshold R2 greater than R1, close the connection.
                    */
                    let elapsed = self.rto_backoff_run_started.unwrap().elapsed().as_millis();
                    let (r1, r2) = if is_syn {
                        (self.r1_syn, self.r2_syn.load(Acquire) as u128)
                    } else {
                        (self.r1, self.r2.load(Acquire) as u128)
                    };

                    if elapsed > r2 {
                        warn!(?self.quad, "R2 threshold reached, terminating connection");
                        return true;
                    } else if elapsed > r1 {
                        debug!(?self.quad, "R1 threshold reached");
                    }
                }
            }
        } else {
            self.rto_backoff_run_started = None;
        }

        if let Some(probe_timeout) = self.probe_timeout {
            if Instant::now() >= probe_timeout {
                trace!(?self.quad, "sending zero-window probe");
                let recv = self.recv_view();
                pcb::zero_window_probe(&self.pcb, &self.quad, &recv, tun);
                self.probe_timeout = Some(Instant::now() + Duration::from_millis(self.pcb.rto));
            }
        }

        if let Some(time_wait) = self.time_wait {
            if Instant::now() >= time_wait {
                debug!(?self.quad, "TIME-WAIT expired, deleting TCB");
                return true;
            }
        }

        self.output(ctx, tun);

        false
    }

    /// §4.9 Jacobson/Karels RTO estimator, fed one RTT sample at a time.
    fn compute_rto(&mut self, r: u128) {
        if !self.rtt_measured {
            self.srtt = r;
            self.rttvar = r / 2;
            self.rtt_measured = true;
        } else {
            self.rttvar =
                ((1.0 - 0.25) * self.rttvar as f64 + 0.25 * self.srtt.abs_diff(r) as f64) as u128;
            self.srtt = ((1.0 - 0.125) * self.srtt as f64 + 0.125 * r as f64) as u128;
        }

        let rto = self.srtt + cmp::max(100, 4 * self.rttvar);
        // "Whenever RTO is computed, if it is less than 1 second, then the RTO SHOULD be
        // rounded up to 1 second."
        self.pcb.rto = cmp::max(rto as u64, 1000);
    }

    pub fn on_segment<W: Write>(
        &mut self,
        ip4h: Ipv4HeaderSlice,
        tcph: TcpHeaderSlice,
        data: &[u8],
        ctx: &InputContext,
        tun: &mut W,
    ) -> Action {
        trace!(?self.quad, state = ?self.state, "on_segment");
        if self.state == State::Listen {
            /*
            If the state is LISTEN, then

            First, check for a RST: an incoming RST segment could not be valid since it
            could not have been sent in response to anything sent by this incarnation of
            the connection. Ignore it.

            Second, check for an ACK: any acknowledgment is bad if it arrives on a
            connection still in the LISTEN state; form a reset and return.

            Third, check for a SYN: set RCV.NXT to SEG.SEQ+1, IRS is set to SEG.SEQ. ISS
            should be selected and a SYN,ACK segment sent. SND.NXT is set to ISS+1 and
            SND.UNA to ISS. The connection state should be changed to SYN-RECEIVED.
            */
            if tcph.rst() {
                return Action::Noop;
            }

            if tcph.ack() {
                write_reset(&ip4h, &tcph, data, tun);
                return Action::Noop;
            }

            if tcph.syn() {
                let mss = tcph
                    .options_iterator()
                    .find_map(|op| match op.clone().unwrap() {
                        TcpOptionElement::MaximumSegmentSize(mss) => Some(mss),
                        _ => None,
                    })
                    .unwrap_or(536);

                self.rcv.nxt = tcph.sequence_number().wrapping_add(1);
                self.rcv.irs = tcph.sequence_number();

                self.pcb.snd_wnd = tcph.window_size() as u32;
                self.pcb.snd_wnd_max = self.pcb.snd_wnd;

                self.state = State::SynRcvd;

                // Enqueue and emit the SYN,ACK before narrowing `pcb.mss` to the peer's
                // value, so the MSS option on our own segment still advertises what *we*
                // are willing to receive (§4.3) rather than echoing the peer's back at them.
                pcb::enqueue_flags(&mut self.pcb, SegFlags::SYN, false, false)
                    .expect("fresh Pcb always has snd_buf >= 1");
                self.output(ctx, tun);

                self.pcb.mss = mss.min(TCP_MSS);

                debug!(?self.quad, "state -> SynRcvd");

                return Action::AddToPending(self.clone());
            }

            return Action::Noop;
        } else if self.state == State::SynSent {
            /*
            If the state is SYN-SENT, then

            First, check the ACK bit: if SEG.ACK =< ISS or SEG.ACK > SND.NXT, send a reset
            (unless RST is set, then drop). If SND.UNA < SEG.ACK =< SND.NXT, the ACK is
            acceptable.

            Second, check the RST bit: if set and the ACK was acceptable, signal "connection
            reset" and delete the TCB.

            Fourth, check the SYN bit: RCV.NXT is set to SEG.SEQ+1, IRS is set to SEG.SEQ.
            If SND.UNA > ISS (our SYN has been ACKed), enter ESTABLISHED and send a final ACK.
            Otherwise enter SYN-RECEIVED and resend SYN,ACK.
            */
            if tcph.ack() {
                if is_between_wrapped(
                    self.pcb.lastack,
                    tcph.acknowledgment_number(),
                    self.pcb.snd_nxt.wrapping_add(1),
                ) {
                    if tcph.rst() {
                        return Action::Reset;
                    }
                } else {
                    write_reset(&ip4h, &tcph, &[], tun);
                    return Action::Noop;
                }
            }

            if tcph.syn() {
                self.rcv.nxt = tcph.sequence_number().wrapping_add(1);
                self.rcv.irs = tcph.sequence_number();

                if wrapping_lt(self.iss, tcph.acknowledgment_number()) {
                    self.pcb.snd_wnd = tcph.window_size() as u32;
                    self.pcb.snd_wnd_max = self.pcb.snd_wnd;
                    self.wl1 = tcph.sequence_number();
                    self.wl2 = tcph.acknowledgment_number();

                    self.incoming.reserve_exact(64240);

                    // Pops the SYN segment from *unacked* via the ordinary cumulative-ack
                    // path, same as any other data-carrying segment.
                    pcb::on_cumulative_ack(
                        &mut self.pcb,
                        tcph.acknowledgment_number(),
                        Instant::now(),
                    );

                    debug!(?self.quad, "state -> Estab");
                    self.state = State::Estab;

                    let recv = self.recv_view();
                    pcb::send_empty_ack(&mut self.pcb, &self.quad, &recv, self.tcp_ticks, tun);

                    return Action::IsEstablished;
                } else {
                    debug!(?self.quad, "state -> SynRcvd (simultaneous open)");
                    self.state = State::SynRcvd;

                    write_synack(
                        &self.quad,
                        self.iss,
                        self.rcv.nxt,
                        tcph.window_size(),
                        self.pcb.mss,
                        tun,
                    );

                    return Action::Noop;
                }
            }

            return Action::Noop;
        } else {
            /*
            Otherwise: SYN-RECEIVED, ESTABLISHED, FIN-WAIT-1, FIN-WAIT-2, CLOSE-WAIT,
            CLOSING, LAST-ACK, or TIME-WAIT state.

            First, check sequence number.
            */
            let seg_len =
                data.len() + if tcph.ack() { 1 } else { 0 } + if tcph.fin() { 1 } else { 0 };

            if !self.is_segment_valid(&tcph, seg_len as u32) {
                if tcph.rst() {
                    return Action::Noop;
                }

                trace!(?self.quad, "segment outside receive window");
                write_ack(&self.quad, self.pcb.snd_nxt, self.rcv.nxt, self.rcv.wnd, tun);
                return Action::Noop;
            }

            // Second, check the RST bit.
            if tcph.rst() {
                if self.state == State::SynRcvd {
                    if self.kind == Kind::Passive {
                        return Action::RemoveFromPending;
                    } else {
                        return Action::ConnectionRefused;
                    }
                } else if matches!(
                    self.state,
                    State::Estab | State::FinWait1 | State::FinWait2 | State::CloseWait
                ) {
                    self.reset.store(true, Ordering::Release);
                    return Action::Reset;
                }
            }

            // Fourth, check the SYN bit.
            if tcph.syn() {
                if self.state == State::SynRcvd {
                    if self.kind == Kind::Passive {
                        return Action::RemoveFromPending;
                    }
                } else if matches!(
                    self.state,
                    State::Estab
                        | State::FinWait1
                        | State::FinWait2
                        | State::CloseWait
                        | State::Closing
                        | State::LastAck
                        | State::TimeWait
                ) {
                    // RFC 5961 challenge-ACK handling is not implemented; send a reset as
                    // RFC 793 originally prescribed (documented Non-goal, §1).
                    write_reset(&ip4h, &tcph, data, tun);
                    return Action::Reset;
                }
            }

            // Fifth, check the ACK field: if off, drop the segment and return.
            if !tcph.ack() {
                return Action::Noop;
            }

            let mut wake_up_reader = false;
            let mut wake_up_writer = false;
            let mut wake_up_closer = false;

            if self.state == State::SynRcvd {
                if is_between_wrapped(
                    self.pcb.lastack,
                    tcph.acknowledgment_number(),
                    self.pcb.snd_nxt.wrapping_add(1),
                ) {
                    debug!(?self.quad, "state -> Estab");
                    self.state = State::Estab;

                    self.pcb.snd_wnd = tcph.window_size() as u32;
                    self.wl1 = tcph.sequence_number();
                    self.wl2 = tcph.acknowledgment_number();
                    if self.pcb.snd_wnd > self.pcb.snd_wnd_max {
                        self.pcb.snd_wnd_max = self.pcb.snd_wnd;
                    }

                    self.incoming.reserve_exact(64240);

                    pcb::on_cumulative_ack(
                        &mut self.pcb,
                        tcph.acknowledgment_number(),
                        Instant::now(),
                    );

                    return Action::IsEstablished;
                } else {
                    write_reset(&ip4h, &tcph, data, tun);
                    return Action::Noop;
                }
            } else if matches!(
                self.state,
                State::Estab | State::FinWait1 | State::FinWait2 | State::CloseWait | State::Closing
            ) {
                /*
                If SND.UNA < SEG.ACK =< SND.NXT, then set SND.UNA <- SEG.ACK. Any segments
                on the retransmission queue that are thereby entirely acknowledged are
                removed. If the ACK is a duplicate (SEG.ACK =< SND.UNA), it can be ignored.
                If the ACK acks something not yet sent, send an ACK, drop, and return.
                */
                if is_between_wrapped(
                    self.pcb.lastack,
                    tcph.acknowledgment_number(),
                    self.pcb.snd_nxt.wrapping_add(1),
                ) {
                    let outcome = pcb::on_cumulative_ack(
                        &mut self.pcb,
                        tcph.acknowledgment_number(),
                        Instant::now(),
                    );

                    if outcome.acked_new_data {
                        self.pcb.congestion_control_on_ack();
                        self.rto_backoff_run_started = None;
                        wake_up_writer = true;
                    }
                    if let Some(rtt) = outcome.rtt_sample {
                        self.compute_rto(rtt.as_millis());
                    }
                    if outcome.dup_ack && self.pcb.dupacks == 3 {
                        debug!(?self.quad, "3 duplicate ACKs, fast retransmit");
                        pcb::rexmit_fast(&mut self.pcb);
                    }
                } else if tcph.acknowledgment_number() == self.pcb.lastack {
                    // `is_between_wrapped` is strict at its low end, so an exact repeat of
                    // `lastack` (the duplicate-ACK case fast retransmit depends on, §4.10)
                    // falls through here rather than into the branch above.
                    let outcome = pcb::on_cumulative_ack(
                        &mut self.pcb,
                        tcph.acknowledgment_number(),
                        Instant::now(),
                    );

                    if outcome.dup_ack && self.pcb.dupacks == 3 {
                        debug!(?self.quad, "3 duplicate ACKs, fast retransmit");
                        pcb::rexmit_fast(&mut self.pcb);
                    }
                } else if wrapping_lt(self.pcb.snd_nxt, tcph.acknowledgment_number()) {
                    trace!(?self.quad, "ACK for unsent data");
                    write_ack(&self.quad, self.pcb.snd_nxt, self.rcv.nxt, self.rcv.wnd, tun);
                    return Action::Noop;
                }

                /*
                If SND.UNA =< SEG.ACK =< SND.NXT, the send window should be updated. If
                (SND.WL1 < SEG.SEQ or (SND.WL1 = SEG.SEQ and SND.WL2 =< SEG.ACK)), set
                SND.WND <- SEG.WND, SND.WL1 <- SEG.SEQ, and set SND.WL2 <- SEG.ACK.
                */
                if is_between_wrapped(
                    self.pcb.lastack.wrapping_sub(1),
                    tcph.acknowledgment_number(),
                    self.pcb.snd_nxt.wrapping_add(1),
                ) && (wrapping_lt(self.wl1, tcph.sequence_number())
                    || (self.wl1 == tcph.sequence_number()
                        && wrapping_lt(
                            self.wl2,
                            tcph.sequence_number().wrapping_add(1),
                        )))
                {
                    self.pcb.snd_wnd = tcph.window_size() as u32;
                    self.wl1 = tcph.sequence_number();
                    self.wl2 = tcph.acknowledgment_number();

                    if self.pcb.snd_wnd > self.pcb.snd_wnd_max {
                        self.pcb.snd_wnd_max = self.pcb.snd_wnd;
                    }

                    if self.pcb.snd_wnd == 0 {
                        self.probe_timeout =
                            Some(Instant::now() + Duration::from_millis(self.pcb.rto));
                    } else {
                        self.probe_timeout.take();
                    }
                }
            } else if self.state == State::LastAck {
                /*
                The only thing that can arrive here is an acknowledgment of our FIN. If now
                acknowledged, delete the TCB, enter CLOSED, and return.
                */
                pcb::on_cumulative_ack(&mut self.pcb, tcph.acknowledgment_number(), Instant::now());

                if self.is_fin_acked() {
                    return Action::DeleteTCB;
                }
            } else if self.state == State::TimeWait {
                /*
                The only thing that can arrive here is a retransmission of the remote FIN.
                Acknowledge it, and restart the 2 MSL timeout.
                */
                self.time_wait = Some(Instant::now() + Duration::from_secs(2 * 2 * 60));
                write_ack(&self.quad, self.pcb.snd_nxt, self.rcv.nxt, self.rcv.wnd, tun);
            }

            // In addition to ESTABLISHED-state processing, if the FIN segment is now
            // acknowledged, enter FIN-WAIT-2.
            if self.state == State::FinWait1 && self.is_fin_acked() {
                debug!(?self.quad, "state -> FinWait2");
                self.state = State::FinWait2;
            }

            if self.state == State::FinWait2 {
                wake_up_closer = true;
            }

            let mut process_fin = tcph.fin();

            // Seventh, process the segment text.
            if matches!(self.state, State::Estab | State::FinWait1 | State::FinWait2) {
                let new = (self.rcv.nxt.wrapping_sub(tcph.sequence_number())) as usize;
                let new_len = data.len() - new;
                let acc_len = cmp::min(new_len, self.rcv.wnd as usize);

                let accepted = &data[new..new + acc_len];

                process_fin &= new_len == acc_len;

                self.incoming.extend(accepted.iter());

                let pre_nxt = self.rcv.nxt;
                self.rcv.nxt = self
                    .rcv
                    .nxt
                    .wrapping_add(acc_len as u32)
                    .wrapping_add(if process_fin { 1 } else { 0 });

                let pre_wnd = self.rcv.wnd;
                self.rcv.wnd -= acc_len as u16;

                // Only ACK if we accepted new data, or the window was zero and this is a
                // probe segment (§4.4 ACK_NOW: piggyback where possible, empty ACK
                // otherwise).
                if wrapping_lt(pre_nxt, self.rcv.nxt) || pre_wnd == 0 {
                    self.pcb.flags.insert(PcbFlags::ACK_NOW);
                }

                wake_up_reader = !accepted.is_empty();
            }
            // CLOSE-WAIT/CLOSING/LAST-ACK/TIME-WAIT: a FIN has already been received from
            // the remote side; segment text here should not occur. Ignore it.

            // Eighth, check the FIN bit.
            if process_fin {
                if matches!(self.state, State::Listen | State::SynSent) {
                    return Action::Noop;
                } else if matches!(self.state, State::SynRcvd | State::Estab) {
                    debug!(?self.quad, "state -> CloseWait");
                    self.state = State::CloseWait;
                    self.read_closed.store(true, Ordering::Release);
                    wake_up_reader = true;
                } else if self.state == State::FinWait1 {
                    if self.is_fin_acked() {
                        debug!(?self.quad, "state -> TimeWait");
                        self.state = State::TimeWait;
                        self.time_wait = Some(Instant::now() + Duration::from_secs(2 * 2 * 60));
                    } else {
                        debug!(?self.quad, "state -> Closing");
                        self.state = State::Closing;
                    }
                } else if self.state == State::FinWait2 {
                    debug!(?self.quad, "state -> TimeWait");
                    self.state = State::TimeWait;
                    self.time_wait = Some(Instant::now() + Duration::from_secs(2 * 2 * 60));
                } else if matches!(
                    self.state,
                    State::CloseWait | State::Closing | State::LastAck
                ) {
                    return Action::Noop;
                } else if self.state == State::TimeWait {
                    self.time_wait = Some(Instant::now() + Duration::from_secs(2 * 2 * 60));
                }
            }

            // Flush whatever this segment unblocked. While still inside `on_segment`, `ctx`
            // marks this connection as the one currently under input processing, so this
            // call is a guarded no-op (§5); the trailing `output` call the caller makes
            // after dropping the guard is what actually transmits.
            self.output(ctx, tun);

            Action::Wakeup {
                wake_up_reader,
                wake_up_writer,
                wake_up_closer,
            }
        }
    }

    /*
    There are four cases for the acceptability test for an incoming segment:

    Segment Length 	Receive Window 	Test
    0 	            0 	            SEG.SEQ = RCV.NXT
    0 	            >0 	            RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
    >0 	            0 	            not acceptable
    >0              >0              RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
                                     or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
    */
    fn is_segment_valid(&self, tcph: &TcpHeaderSlice, seg_len: u32) -> bool {
        let seg_seq = tcph.sequence_number();
        let rcv_wnd = self.rcv.wnd as u32;
        let rcv_nxt = self.rcv.nxt;

        if seg_len == 0 && rcv_wnd == 0 {
            seg_seq == rcv_nxt
        } else if seg_len == 0 && rcv_wnd > 0 {
            is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq,
                rcv_nxt.wrapping_add(rcv_wnd),
            )
        } else if seg_len > 0 && rcv_wnd == 0 {
            false
        } else if seg_len > 0 && rcv_wnd > 0 {
            is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq,
                rcv_nxt.wrapping_add(rcv_wnd),
            ) || is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq.wrapping_add(seg_len).wrapping_sub(1),
                rcv_nxt.wrapping_add(rcv_wnd),
            )
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use etherparse::{Ipv4Header, TcpHeader};

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

    /// Builds a raw IPv4/TCP packet from `remote` (`quad.src`) to `local` (`quad.dst`), the
    /// shape `on_segment` expects (mirrors what `segment_loop` hands it off the real TUN fd).
    #[allow(clippy::too_many_arguments)]
    fn build_packet(
        q: &Quad,
        seq: u32,
        ack: u32,
        window: u16,
        syn: bool,
        ack_flag: bool,
        fin: bool,
        rst: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut tcph = TcpHeader::new(q.src.port, q.dst.port, seq, window);
        tcph.acknowledgment_number = ack;
        tcph.syn = syn;
        tcph.ack = ack_flag;
        tcph.fin = fin;
        tcph.rst = rst;

        let ip4h = Ipv4Header::new(
            tcph.header_len() + payload.len() as u16,
            64,
            etherparse::ip_number::TCP,
            q.src.ipv4.octets(),
            q.dst.ipv4.octets(),
        );
        tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, payload).unwrap();

        let mut buf = Vec::new();
        ip4h.write(&mut buf).unwrap();
        tcph.write(&mut buf).unwrap();
        buf.extend_from_slice(payload);
        buf
    }

    fn parse(buf: &[u8]) -> (Ipv4HeaderSlice<'_>, TcpHeaderSlice<'_>, &[u8]) {
        let ip4h = Ipv4HeaderSlice::from_slice(buf).unwrap();
        let tcph = TcpHeaderSlice::from_slice(&buf[(ip4h.ihl() * 4) as usize..]).unwrap();
        let data = &buf[(ip4h.ihl() * 4 + tcph.data_offset() * 4) as usize..];
        (ip4h, tcph, data)
    }

    #[test]
    fn listen_on_syn_moves_to_syn_rcvd_and_emits_synack() {
        let q = quad();
        let mut tcb = TCB::listen(q, 500);
        let ctx = InputContext::new();
        let mut sink = IpSink::new();

        let pkt = build_packet(&q, 1000, 0, 4096, true, false, false, false, &[]);
        let (ip4h, tcph, data) = parse(&pkt);

        let action = tcb.on_segment(ip4h, tcph, data, &ctx, &mut sink);

        assert!(matches!(action, Action::AddToPending(_)));
        assert_eq!(tcb.state, State::SynRcvd);
        assert_eq!(tcb.rcv.nxt, 1001);
        assert!(!sink.0.is_empty());
    }

    #[test]
    fn listen_ignores_a_bare_rst() {
        let q = quad();
        let mut tcb = TCB::listen(q, 500);
        let ctx = InputContext::new();
        let mut sink = IpSink::new();

        let pkt = build_packet(&q, 1000, 0, 4096, false, false, false, true, &[]);
        let (ip4h, tcph, data) = parse(&pkt);

        let action = tcb.on_segment(ip4h, tcph, data, &ctx, &mut sink);

        assert!(matches!(action, Action::Noop));
        assert_eq!(tcb.state, State::Listen);
    }

    #[test]
    fn syn_sent_on_synack_establishes_the_connection() {
        let q = quad();
        let mut tcb = TCB::syn_sent(q, 500);
        let ctx = InputContext::new();
        let mut out_sink = IpSink::new();
        // Actually send the SYN so `snd_nxt` advances past `iss`, matching a real handshake.
        tcb.output(&ctx, &mut out_sink);

        let pkt = build_packet(&q, 2000, 501, 4096, true, true, false, false, &[]);
        let (ip4h, tcph, data) = parse(&pkt);

        let mut sink = IpSink::new();
        let action = tcb.on_segment(ip4h, tcph, data, &ctx, &mut sink);

        assert!(matches!(action, Action::IsEstablished));
        assert_eq!(tcb.state, State::Estab);
        assert!(!sink.0.is_empty());
    }

    #[test]
    fn write_fails_outside_the_eligible_states() {
        let mut tcb = TCB::listen(quad(), 0);
        assert!(matches!(tcb.write(b"hi", false), Err(crate::OutputError::Conn)));
    }

    #[test]
    fn all_sent_is_true_once_queues_drain() {
        let mut tcb = TCB::syn_sent(quad(), 0);
        assert!(!tcb.all_sent());
        tcb.pcb.unsent.take();
        tcb.pcb.unacked.take();
        assert!(tcb.all_sent());
    }

    #[test]
    fn three_duplicate_acks_trigger_fast_retransmit() {
        let q = quad();
        let mut tcb = TCB::syn_sent(q, 500);
        let ctx = InputContext::new();
        let mut sink = IpSink::new();
        tcb.output(&ctx, &mut sink);

        let pkt = build_packet(&q, 2000, 501, 4096, true, true, false, false, &[]);
        let (ip4h, tcph, data) = parse(&pkt);
        tcb.on_segment(ip4h, tcph, data, &ctx, &mut sink);
        assert_eq!(tcb.state, State::Estab);

        tcb.write(b"hello", false).unwrap();
        tcb.output(&ctx, &mut sink);
        assert_eq!(tcb.pcb.unacked.len(), 1);

        // Three segments the peer ACKs with the same (stale) cumulative ack number: a
        // duplicate ACK each time, since `lastack` never advances (§4.10).
        let dup = build_packet(&q, 2001, 501, 4096, false, true, false, false, &[]);
        for i in 1..=3u8 {
            let (ip4h, tcph, data) = parse(&dup);
            tcb.on_segment(ip4h, tcph, data, &ctx, &mut sink);
            assert_eq!(tcb.pcb.dupacks, i);
        }

        assert!(tcb.pcb.flags.contains(PcbFlags::INFR));
    }
}
