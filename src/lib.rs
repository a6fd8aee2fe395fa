use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;
use tracing::{debug, trace};

mod err;
pub use err::*;

mod tcp;
use tcp::context::InputContext;
use tcp::{write_reset, Action, Dual, Kind, Quad, TcpListener, TCB};

/// Lowest ephemeral port this stack hands out for active opens (`NetStack::connect`), matching
/// the IANA-recommended dynamic/private port range.
const EPHEMERAL_PORT_LO: u16 = 49152;

#[derive(Debug)]
pub struct EstabElement {
    quad: Quad,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    svar: Arc<Condvar>,
    r2_syn: Arc<AtomicU64>,
    r2: Arc<AtomicU64>,
    reset: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct EstabEntry {
    cvar: Arc<Condvar>,
    elts: Vec<EstabElement>,
}

#[derive(Debug)]
pub struct StreamEntry {
    tcb: TCB,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    svar: Arc<Condvar>,
    reset: Arc<AtomicBool>,
}

/// Outcome of one `NetStack::connect` call, handed from `segment_loop` to the blocked caller
/// through `Manager::connects` (the active-open counterpart of `EstabEntry`'s accept queue).
#[derive(Debug)]
enum ConnectOutcome {
    Established {
        rvar: Arc<Condvar>,
        wvar: Arc<Condvar>,
        svar: Arc<Condvar>,
        r2: Arc<AtomicU64>,
        r2_syn: Arc<AtomicU64>,
        reset: Arc<AtomicBool>,
    },
    Refused,
}

#[derive(Debug)]
struct ConnectWaiter {
    cvar: Arc<Condvar>,
    result: Option<ConnectOutcome>,
}

#[derive(Debug, Default)]
pub struct Manager {
    iss: Arc<AtomicU32>,
    bounded: HashSet<u16>,
    pending: HashMap<Quad, TCB>,
    established: HashMap<u16, EstabEntry>,
    streams: HashMap<Quad, StreamEntry>,
    /// Local ports currently in use by an in-flight or established active open (`connect`);
    /// disjoint from `bounded`, which tracks ports a listener has claimed.
    used_local_ports: HashSet<u16>,
    connects: HashMap<Quad, ConnectWaiter>,
}

impl Manager {
    /// Picks an unused port in the dynamic/private range for an active open. `None` once the
    /// whole range is exhausted (§6.4-style hard cap, scaled to this demo stack's scope).
    fn alloc_ephemeral_port(&mut self) -> Option<u16> {
        let port = (EPHEMERAL_PORT_LO..=u16::MAX)
            .find(|port| !self.bounded.contains(port) && !self.used_local_ports.contains(port))?;
        self.used_local_ports.insert(port);
        Some(port)
    }
}

#[derive(Debug)]
pub struct NetStack {
    manager: Arc<Mutex<Manager>>,
    local_ip: Ipv4Addr,
    jh: thread::JoinHandle<()>,
    ih: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, Error> {
        let _ = tracing_subscriber::fmt::try_init();

        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;

        let iss = Arc::new(AtomicU32::new(0));

        let ih = {
            let iss = iss.clone();

            thread::spawn(move || loop {
                thread::sleep(Duration::from_millis(4));

                iss.fetch_add(1, Ordering::Release);
            })
        };

        let manager = Arc::new(Mutex::new(Manager {
            iss,
            bounded: HashSet::new(),
            pending: HashMap::new(),
            established: HashMap::new(),
            streams: HashMap::new(),
            used_local_ports: HashSet::new(),
            connects: HashMap::new(),
        }));

        let jh = {
            let manager = manager.clone();

            thread::spawn(move || segment_loop(tun, manager.clone()))
        };

        Ok(NetStack {
            manager,
            local_ip: addr,
            jh,
            ih,
        })
    }

    pub fn bind(&mut self, port: u16) -> Result<TcpListener, Error> {
        let mut manager = self.manager.lock().unwrap();

        match manager.established.entry(port) {
            Entry::Occupied(_) => {
                return Err(Error::PortInUse(port));
            }
            Entry::Vacant(v) => {
                let cvar = Arc::new(Condvar::new());

                v.insert(EstabEntry {
                    cvar: cvar.clone(),
                    elts: Vec::new(),
                });

                assert!(manager.bounded.insert(port));

                return Ok(TcpListener {
                    port,
                    manager: self.manager.clone(),
                    cvar,
                });
            }
        }
    }

    /// Active open (§6.1's `TCB::syn_sent` path): picks an ephemeral local port, enqueues a
    /// SYN, and blocks the calling thread until `segment_loop` reports the handshake's outcome.
    pub fn connect(&mut self, dst_ip: Ipv4Addr, dst_port: u16) -> Result<tcp::TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        let local_port = manager
            .alloc_ephemeral_port()
            .ok_or(Error::NoEphemeralPort)?;

        let quad = Quad {
            src: Dual {
                ipv4: dst_ip,
                port: dst_port,
            },
            dst: Dual {
                ipv4: self.local_ip,
                port: local_port,
            },
        };

        let iss = manager.iss.load(Ordering::Acquire);
        manager.pending.insert(quad, TCB::syn_sent(quad, iss));

        let cvar = Arc::new(Condvar::new());
        manager.connects.insert(
            quad,
            ConnectWaiter {
                cvar: cvar.clone(),
                result: None,
            },
        );

        debug!(?quad, "connect: SYN queued, awaiting handshake");

        let mut manager = cvar
            .wait_while(manager, |manager| {
                manager
                    .connects
                    .get(&quad)
                    .map(|w| w.result.is_none())
                    .unwrap_or(false)
            })
            .unwrap();

        manager.used_local_ports.remove(&local_port);
        let outcome = manager.connects.remove(&quad).and_then(|w| w.result);

        match outcome {
            Some(ConnectOutcome::Established {
                rvar,
                wvar,
                svar,
                r2,
                r2_syn,
                reset,
            }) => Ok(tcp::TcpStream {
                manager: self.manager.clone(),
                quad,
                rvar,
                wvar,
                svar,
                r2,
                r2_syn,
                closed: false,
                reset,
            }),
            Some(ConnectOutcome::Refused) | None => Err(Error::ConnectionRefused(dst_port)),
        }
    }

    pub fn join(self) {
        self.jh.join().unwrap();
        self.ih.join().unwrap();
    }
}

fn wake_connect_waiter(manager: &mut Manager, quad: Quad, outcome: ConnectOutcome) {
    if let Some(waiter) = manager.connects.get_mut(&quad) {
        waiter.result = Some(outcome);
        waiter.cvar.notify_one();
    }
}

/// Drives one connection's trailing `output` call (§5, §9): after any mutation to its PCB, the
/// caller that held the re-entrance guard for this tick is responsible for giving the engine a
/// chance to actually transmit what the guarded call deferred. Called with the guard already
/// dropped, so this is a real send, not the no-op `output` performs during `ctx.enter`.
fn flush(manager: &mut Manager, quad: Quad, ctx: &InputContext, tun: &mut Tun) {
    if let Some(entry) = manager.streams.get_mut(&quad) {
        entry.tcb.output(ctx, tun);
    } else if let Some(tcb) = manager.pending.get_mut(&quad) {
        tcb.output(ctx, tun);
    }
}

fn segment_loop(mut tun: Tun, manager: Arc<Mutex<Manager>>) -> ! {
    let ctx = InputContext::new();

    loop {
        let mut buf = [0u8; 1500];

        let mut manager = manager.lock().unwrap();

        let mut to_be_deleted = vec![];
        for (quad, entry) in manager.streams.iter_mut() {
            if entry.tcb.on_tick(&ctx, &mut tun) {
                to_be_deleted.push(*quad);
            }
        }
        for quad in to_be_deleted {
            manager.streams.remove(&quad).unwrap();
        }

        let mut to_be_deleted = vec![];
        for (quad, tcb) in manager.pending.iter_mut() {
            if tcb.on_tick(&ctx, &mut tun) {
                to_be_deleted.push(*quad);
            }
        }
        for quad in to_be_deleted {
            manager.pending.remove(&quad).unwrap();
        }

        let mut pfd = [PollFd::new(tun.as_raw_fd(), PollFlags::POLLIN)];
        if poll(&mut pfd[..], 1).unwrap() == 0 {
            continue;
        }

        let n = tun.read(&mut buf).unwrap();

        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(&buf[..n]) else { continue };
        let Ok(tcph) = TcpHeaderSlice::from_slice(&buf[(ip4h.ihl() * 4) as usize..n]) else { continue };
        let data = &buf[(ip4h.ihl() * 4 + tcph.data_offset() * 4) as usize..n];

        let src = Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        };
        let dst = Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        };

        let quad = Quad { src, dst };

        // The guard marks `quad` as under input processing for the duration of the on_segment
        // call; any `output` that call triggers on this same connection is a deliberate no-op
        // (§5, §9). It is dropped at the end of this block, before `action` is matched, so the
        // explicit `flush` below performs the real transmission.
        let action = {
            let _guard = ctx.enter(quad);

            if let Some(StreamEntry { tcb, .. }) = manager.streams.get_mut(&quad) {
                tcb.on_segment(ip4h, tcph, data, &ctx, &mut tun)
            } else if let Some(tcb) = manager.pending.get_mut(&quad) {
                tcb.on_segment(ip4h, tcph, data, &ctx, &mut tun)
            } else if manager.bounded.contains(&dst.port) {
                let mut tcb = TCB::listen(quad, manager.iss.load(Ordering::Acquire));

                tcb.on_segment(ip4h, tcph, data, &ctx, &mut tun)
            } else {
                /*
                If the connection does not exist (CLOSED), then a reset is sent
                in response to any incoming segment except another reset. A SYN
                segment that does not match an existing connection is rejected
                by this means.

                If the incoming segment has the ACK bit set, the reset takes its
                sequence number from the ACK field of the segment; otherwise,
                the reset has sequence number zero and the ACK field is set to
                the sum of the sequence number and segment length of the
                incoming segment. The connection remains in the CLOSED state.
                */

                if tcph.rst() {
                    Action::Noop
                } else {
                    write_reset(&ip4h, &tcph, data, &mut tun);
                    Action::Noop
                }
            }
        };

        match action {
            Action::Noop => {}
            Action::AddToPending(tcb) => {
                manager.pending.insert(quad, tcb);
            }
            Action::RemoveFromPending => {
                manager.pending.remove(&quad);
            }
            Action::IsEstablished => {
                let tcb = manager.pending.remove(&quad).unwrap();
                let kind = tcb.kind;
                let rvar = Arc::new(Condvar::new());
                let wvar = Arc::new(Condvar::new());
                let svar = Arc::new(Condvar::new());
                let r2 = tcb.r2.clone();
                let r2_syn = tcb.r2_syn.clone();
                let reset = Arc::new(AtomicBool::new(false));

                manager.streams.insert(
                    quad,
                    StreamEntry {
                        tcb,
                        rvar: rvar.clone(),
                        wvar: wvar.clone(),
                        svar: svar.clone(),
                        reset: reset.clone(),
                    },
                );

                match kind {
                    // Passive (server-side) establishment: the TCB came from a listener's
                    // pending set, so hand the new stream to that listener's accept queue.
                    Kind::Passive => {
                        let EstabEntry { cvar, elts } =
                            manager.established.get_mut(&dst.port).unwrap();
                        elts.push(EstabElement {
                            quad,
                            rvar,
                            wvar,
                            svar,
                            r2,
                            r2_syn,
                            reset,
                        });
                        cvar.notify_one();
                    }
                    // Active (client-side) establishment: no listener is involved, so wake the
                    // thread blocked in `NetStack::connect` directly.
                    Kind::Active => {
                        wake_connect_waiter(
                            &mut manager,
                            quad,
                            ConnectOutcome::Established {
                                rvar,
                                wvar,
                                svar,
                                r2,
                                r2_syn,
                                reset,
                            },
                        );
                    }
                }
            }
            Action::Reset => {
                // An established connection's Reset always lives in `streams`; a SYN-SENT
                // connection that sees an acceptable RST before ever being established is
                // still sitting in `pending`, with a `connect` waiter (if any) to notify.
                if let Some(stream) = manager.streams.remove(&quad) {
                    stream.reset.store(true, Ordering::Release);
                    stream.rvar.notify_one();
                    stream.wvar.notify_one();
                    stream.svar.notify_one();
                } else {
                    manager.pending.remove(&quad);
                    wake_connect_waiter(&mut manager, quad, ConnectOutcome::Refused);
                }
            }
            Action::Wakeup {
                wake_up_reader,
                wake_up_writer,
                wake_up_closer,
            } => {
                let StreamEntry {
                    rvar, wvar, svar, ..
                } = &manager.streams[&quad];

                if wake_up_reader {
                    rvar.notify_one();
                }
                if wake_up_writer {
                    wvar.notify_one();
                }
                if wake_up_closer {
                    svar.notify_one();
                }
            }
            Action::DeleteTCB => {
                trace!(?quad, "deleting TCB after TIME-WAIT/LAST-ACK completion");
                if let Some(stream) = manager.streams.remove(&quad) {
                    stream.rvar.notify_one();
                    stream.wvar.notify_one();
                    stream.svar.notify_one();
                }
            }
            Action::ConnectionRefused => {
                debug!(?quad, "active open refused before establishment");
                manager.pending.remove(&quad);
                wake_connect_waiter(&mut manager, quad, ConnectOutcome::Refused);
            }
        }

        flush(&mut manager, quad, &ctx, &mut tun);
    }
}
