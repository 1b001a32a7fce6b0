//! The server: TCP socket owner, routing fabric, registration.
//!
//! One `Server` talks to one TNC. All protocol state (the port table, the
//! per-connection records, every throttle and timer) lives in a single
//! task, so nothing here needs a lock; application handles talk to that
//! task over channels. Two helper tasks move bytes: a reader that feeds
//! socket chunks into the command mailbox and a writer that drains a
//! bounded queue of encoded frames. The bounded queue doubles as the
//! egress backpressure signal for the throttles.
//!
//! Inbound routing is by layers: the server handles 'G', 'X' and 'K'
//! itself; everything else goes to a per-port client (created on demand),
//! which handles 'g' and 'y' and forwards the rest to the connection
//! keyed by (port, local call, remote call).

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::assembler::{Assembler, DEFAULT_FRAME_LENGTH};
use crate::call::Addr;
use crate::connection::{ConnEvent, ConnKey, Connection, RawSocket};
use crate::error::{Error, Result};
use crate::frame::{DataKind, Frame, Receiver};
use crate::packet::Packet;
use crate::throttle::{Item, Sink, Throttle, MAX_IN_FLIGHT};

/// Encoded frames queued for the socket writer.
const SEND_QUEUE: usize = 16;

/// Data chunks buffered per connection before the reader overflows.
const RECV_QUEUE: usize = 64;

/// A port throttle holding this many queued items pushes back on the
/// connection throttles above it.
const PORT_HIGH_WATER: usize = 16;

/// How to reach the TNC and how to behave once there.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Payload bytes per 'D' frame. Some TNCs drop the TCP connection
    /// when this is too big; 128 is safe everywhere.
    pub frame_length: usize,
    /// Station identification text, broadcast as an UNPROTO frame to "ID"
    /// when each connection closes.
    pub id: Option<String>,
    /// Direwolf compatibility: accept port numbers up to twice the
    /// advertised count, for TNCs that under-report their port list.
    pub double_port_count: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            frame_length: DEFAULT_FRAME_LENGTH,
            id: None,
            double_port_count: false,
        }
    }
}

/// Parameters for an outbound connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u8,
    pub local: Addr,
    pub remote: Addr,
    pub via: Vec<Addr>,
}

/// What `listen` resolved to: the validated calls and the TNC ports they
/// are registered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listening {
    pub calls: Vec<Addr>,
    pub ports: Vec<u8>,
}

/// Outcome of one 'X' call-sign registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Ok { port: u8, call: Addr },
    Refused { port: u8, call: Addr },
}

/// Asynchronous happenings on the server.
#[derive(Debug)]
pub enum ServerEvent {
    /// An inbound AX.25 connection arrived.
    Connection(Connection),
    Registration(Registration),
    Error(Error),
    Closed,
}

/// Requests into the server task.
pub(crate) enum Cmd {
    SockData(Vec<u8>),
    SockClosed(Option<std::io::Error>),
    Listen {
        calls: Vec<Addr>,
        ports: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<Listening>>,
    },
    Connect {
        opts: ConnectOptions,
        reply: oneshot::Sender<Result<Connection>>,
    },
    Write {
        key: ConnKey,
        data: Vec<u8>,
    },
    End {
        key: ConnKey,
    },
    Destroy {
        key: ConnKey,
    },
    Unproto {
        port: u8,
        from: Addr,
        to: Addr,
        via: Vec<Addr>,
        data: Vec<u8>,
    },
    RawSubscribe {
        tx: mpsc::UnboundedSender<Packet>,
    },
    RawUnsubscribe,
    SendRaw {
        packet: Packet,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one TNC. Cheap operations go through directly; everything
/// stateful round-trips through the server task.
pub struct Server {
    cmd: mpsc::UnboundedSender<Cmd>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    /// Dial the TNC and start the server task.
    pub async fn open(settings: Settings) -> Result<Server> {
        info!("connecting to TNC at {}:{}", settings.host, settings.port);
        let sock = TcpStream::connect((settings.host.as_str(), settings.port)).await?;
        sock.set_nodelay(true)?;
        let (rd, wr) = sock.into_split();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE);
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(rd, cmd_tx.clone()));
        tokio::spawn(write_loop(wr, out_rx, cmd_tx.clone()));
        let sender = FrameSender {
            tx: out_tx.clone(),
        };
        let actor = Actor::new(settings, cmd_tx.clone(), evt_tx, sender);
        tokio::spawn(actor.run(cmd_rx, out_tx));

        Ok(Server {
            cmd: cmd_tx,
            events: evt_rx,
        })
    }

    /// Register local call signs so remote stations can connect in.
    ///
    /// `ports` limits listening to a subset of the TNC's ports; `None`
    /// listens on all of them. Resolves once the TNC's port list is known
    /// and every 'X' registration has been sent; individual registration
    /// outcomes arrive as [`ServerEvent::Registration`].
    pub async fn listen(&self, calls: &[Addr], ports: Option<&[u8]>) -> Result<Listening> {
        if calls.is_empty() {
            return Err(Error::BadCallSign {
                call: String::new(),
                reason: "nothing to listen on",
            });
        }
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Cmd::Listen {
                calls: calls.to_vec(),
                ports: ports.map(<[u8]>::to_vec),
                reply: tx,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Open an AX.25 session to a remote station. Resolves once the TNC
    /// reports the link connected.
    pub async fn connect(&self, opts: ConnectOptions) -> Result<Connection> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Cmd::Connect { opts, reply: tx })
            .map_err(|_| Error::Closed)?;
        let mut conn = rx.await.map_err(|_| Error::Closed)??;
        conn.wait_connected().await?;
        Ok(conn)
    }

    /// Wait for the next inbound connection, skimming past registration
    /// notices.
    pub async fn accept(&mut self) -> Result<Connection> {
        loop {
            match self.events.recv().await {
                Some(ServerEvent::Connection(c)) => return Ok(c),
                Some(ServerEvent::Registration(r)) => debug!("registration: {r:?}"),
                Some(ServerEvent::Error(e)) => return Err(e),
                Some(ServerEvent::Closed) | None => return Err(Error::Closed),
            }
        }
    }

    /// The next server event, undigested. `None` once closed.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// A raw AX.25 tap across all TNC ports.
    pub fn create_socket(&self) -> Result<RawSocket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cmd
            .send(Cmd::RawSubscribe { tx })
            .map_err(|_| Error::Closed)?;
        Ok(RawSocket::new(self.cmd.clone(), rx))
    }

    /// Send a one-shot UNPROTO datagram, optionally through digipeaters.
    pub fn unproto(
        &self,
        port: u8,
        from: &Addr,
        to: &Addr,
        via: &[Addr],
        data: &[u8],
    ) -> Result<()> {
        if via.len() > 8 {
            return Err(Error::ViaTooLong(via.len()));
        }
        self.cmd
            .send(Cmd::Unproto {
                port,
                from: from.clone(),
                to: to.clone(),
                via: via.to_vec(),
                data: data.to_vec(),
            })
            .map_err(|_| Error::Closed)
    }

    /// Tear down the TCP connection. Every open connection sees a clean
    /// close.
    pub async fn close(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd.send(Cmd::Close { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The encoder end of the writer queue. `try_send` failing is the
/// backpressure signal the throttles honour.
struct FrameSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl FrameSender {
    fn push_now(&mut self, frame: Frame) {
        trace!("tnc <- {} port {}", frame.kind, frame.port);
        if self.tx.try_send(frame.encode()).is_err() {
            // Callers check is_full() first, so this means the writer died;
            // the SockClosed command is already on its way.
            debug!("writer gone, dropped {} frame", frame.kind);
        }
    }
}

impl Sink for FrameSender {
    fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }
    fn push(&mut self, frame: Frame) {
        self.push_now(frame);
    }
}

/// The connection tier drains into the port throttle, which pushes back
/// once its own queue is deep enough.
struct PortSink<'a> {
    throttle: &'a mut Throttle,
    out: &'a mut FrameSender,
}

impl Sink for PortSink<'_> {
    fn is_full(&self) -> bool {
        self.throttle.queue_len() >= PORT_HIGH_WATER
    }
    fn push(&mut self, frame: Frame) {
        let _ = self.throttle.write(Item::Frame(frame), &mut *self.out);
    }
}

/// Per-port client: the port throttle plus the connections behind it.
struct PortClient {
    throttle: Throttle,
    conns: HashMap<ConnKey, Conn>,
}

/// Server-side record of one AX.25 session.
struct Conn {
    throttle: Throttle,
    asm: Assembler,
    tx: mpsc::Sender<ConnEvent>,
    fault: Arc<Mutex<Option<Error>>>,
    /// Local side called end().
    ended: bool,
    /// The TNC reported the link down.
    disconnected: bool,
    /// The ID tail frame is queued or sent; never send it twice.
    sent_id: bool,
}

enum RegOrigin {
    Listen,
    Conn(ConnKey),
}

struct PendingListen {
    calls: Vec<Addr>,
    ports: Option<Vec<u8>>,
    reply: oneshot::Sender<Result<Listening>>,
}

enum DataOutcome {
    Delivered,
    IgnoredPostDisconnect,
    AfterClose,
    Overflow,
    HandleGone,
}

struct Actor {
    settings: Settings,
    recv: Receiver,
    out: FrameSender,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    events: mpsc::UnboundedSender<ServerEvent>,
    ports: HashMap<u8, PortClient>,
    port_list: Option<Vec<u8>>,
    sent_ports_query: bool,
    pending_listens: Vec<PendingListen>,
    registered: HashSet<(u8, Addr)>,
    pending_reg: HashMap<(u8, Addr), RegOrigin>,
    raw_subs: Vec<mpsc::UnboundedSender<Packet>>,
    raw_enabled: bool,
}

impl Actor {
    fn new(
        settings: Settings,
        cmd_tx: mpsc::UnboundedSender<Cmd>,
        events: mpsc::UnboundedSender<ServerEvent>,
        out: FrameSender,
    ) -> Self {
        Self {
            settings,
            recv: Receiver::new(),
            out,
            cmd_tx,
            events,
            ports: HashMap::new(),
            port_list: None,
            sent_ports_query: false,
            pending_listens: Vec::new(),
            registered: HashSet::new(),
            pending_reg: HashMap::new(),
            raw_subs: Vec::new(),
            raw_enabled: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>, out_tx: mpsc::Sender<Vec<u8>>) {
        debug!("server task running");
        loop {
            self.pump();
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.on_cmd(cmd) {
                            break;
                        }
                    }
                    None => {
                        self.shutdown(None);
                        break;
                    }
                },
                permit = out_tx.reserve(), if self.sender_waiting() => {
                    // The freed slot itself is the wake-up; pump() at the
                    // top of the loop re-drains the waiting throttles.
                    drop(permit);
                },
                () = sleep_or_forever(deadline) => self.on_tick(),
            }
        }
        debug!("server task finished");
    }

    /// Returns true when the task should exit.
    fn on_cmd(&mut self, cmd: Cmd) -> bool {
        match cmd {
            Cmd::SockData(bytes) => match self.recv.feed(&bytes) {
                Ok(frames) => {
                    for f in frames {
                        self.on_frame(f);
                    }
                }
                Err(e) => {
                    // Framing on the shared stream is positional: one bad
                    // header and nothing after it can be trusted.
                    error!("tearing down TNC stream: {e}");
                    self.shutdown(Some(e));
                    return true;
                }
            },
            Cmd::SockClosed(err) => {
                self.shutdown(err.map(Error::from));
                return true;
            }
            Cmd::Listen {
                calls,
                ports,
                reply,
            } => self.on_listen(PendingListen {
                calls,
                ports,
                reply,
            }),
            Cmd::Connect { opts, reply } => self.on_connect(opts, reply),
            Cmd::Write { key, data } => self.on_write(&key, data),
            Cmd::End { key } => self.on_end(&key),
            Cmd::Destroy { key } => self.remove_conn(&key),
            Cmd::Unproto {
                port,
                from,
                to,
                via,
                data,
            } => self.on_unproto(port, &from, &to, &via, data),
            Cmd::RawSubscribe { tx } => self.on_raw_subscribe(tx),
            Cmd::RawUnsubscribe => self.on_raw_unsubscribe(),
            Cmd::SendRaw { packet } => self.on_send_raw(packet),
            Cmd::Close { reply } => {
                self.shutdown(None);
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ---- inbound frame routing ----

    fn on_frame(&mut self, f: Frame) {
        trace!(
            "tnc -> {} port {} from {:?} to {:?}, {} payload bytes",
            f.kind,
            f.port,
            f.call_from,
            f.call_to,
            f.payload.len()
        );
        match f.kind {
            DataKind::Ports => self.on_ports_reply(&f),
            DataKind::Register => self.on_register_reply(&f),
            DataKind::Raw => self.on_raw_frame(&f),
            _ => self.on_port_frame(f),
        }
    }

    /// 'G' reply: `N;desc1;desc2;…`.
    fn on_ports_reply(&mut self, f: &Frame) {
        let text = String::from_utf8_lossy(&f.payload);
        let count: usize = text
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .parse()
            .unwrap_or(0);
        info!("TNC advertises {count} ports");
        let ports: Vec<u8> = (0..count.min(256)).map(|p| p as u8).collect();
        for &p in &ports {
            self.out.push_now(Frame::new(DataKind::PortCaps, p));
        }
        self.port_list = Some(ports);
        for l in mem::take(&mut self.pending_listens) {
            self.finish_listen(l);
        }
    }

    fn finish_listen(&mut self, l: PendingListen) {
        let known = self.port_list.clone().unwrap_or_default();
        if known.is_empty() {
            let _ = l.reply.send(Err(Error::NoPorts));
            return;
        }
        let ports = match &l.ports {
            None => known,
            Some(req) => {
                let limit = known.len() * if self.settings.double_port_count { 2 } else { 1 };
                for &p in req {
                    if (p as usize) >= limit {
                        let _ = l.reply.send(Err(Error::NoSuchPort(p)));
                        return;
                    }
                }
                req.clone()
            }
        };
        for &p in &ports {
            for call in &l.calls {
                self.register(p, call.clone(), RegOrigin::Listen);
            }
        }
        let _ = l.reply.send(Ok(Listening {
            calls: l.calls,
            ports,
        }));
    }

    fn register(&mut self, port: u8, call: Addr, origin: RegOrigin) {
        let k = (port, call.clone());
        if self.registered.contains(&k) {
            if matches!(origin, RegOrigin::Listen) {
                let _ = self
                    .events
                    .send(ServerEvent::Registration(Registration::Ok { port, call }));
            }
            return;
        }
        if self.pending_reg.contains_key(&k) {
            return;
        }
        debug!("registering {call} on port {port}");
        let mut f = Frame::new(DataKind::Register, port);
        f.call_from = call.call();
        self.out.push_now(f);
        self.pending_reg.insert(k, origin);
    }

    /// 'X' reply: payload byte 1 on success, 0 on refusal.
    fn on_register_reply(&mut self, f: &Frame) {
        let call = match Addr::new(&f.call_from) {
            Ok(a) => a,
            Err(e) => {
                warn!("registration reply with bad call sign: {e}");
                return;
            }
        };
        let ok = f.payload.first() == Some(&1);
        let origin = self.pending_reg.remove(&(f.port, call.clone()));
        if ok {
            self.registered.insert((f.port, call.clone()));
        }
        match origin {
            Some(RegOrigin::Conn(key)) => {
                if !ok {
                    self.fail_conn(
                        &key,
                        Error::RegistrationRefused {
                            port: f.port,
                            call,
                        },
                    );
                }
            }
            Some(RegOrigin::Listen) | None => {
                let reg = if ok {
                    Registration::Ok { port: f.port, call }
                } else {
                    Registration::Refused { port: f.port, call }
                };
                let _ = self.events.send(ServerEvent::Registration(reg));
            }
        }
    }

    /// 'K': raw AX.25, first payload byte is the port in the high nibble.
    fn on_raw_frame(&mut self, f: &Frame) {
        if self.raw_subs.is_empty() {
            debug!("raw frame with no listener, dropped");
            return;
        }
        let Some(bytes) = f.payload.get(1..) else {
            warn!("empty raw frame");
            return;
        };
        match Packet::decode(f.port, bytes) {
            Ok(p) => self.raw_subs.retain(|tx| tx.send(p.clone()).is_ok()),
            Err(e) => {
                warn!("undecodable raw packet: {e}");
                let _ = self.events.send(ServerEvent::Error(e));
            }
        }
    }

    fn ensure_port(&mut self, p: u8) {
        if !self.ports.contains_key(&p) {
            debug!("creating client for TNC port {p}");
            // Learn the real queue depth straight away.
            self.out.push_now(Frame::new(DataKind::PortInFlight, p));
            self.ports.insert(
                p,
                PortClient {
                    throttle: Throttle::for_port(p),
                    conns: HashMap::new(),
                },
            );
        }
    }

    fn on_port_frame(&mut self, f: Frame) {
        self.ensure_port(f.port);
        match f.kind {
            DataKind::PortCaps => trace!("port {} capabilities ignored", f.port),
            DataKind::PortInFlight => {
                let n = f.payload_u32().unwrap_or(0);
                if let Some(port) = self.ports.get_mut(&f.port) {
                    let _ = port.throttle.update_in_flight(n, &mut self.out);
                }
            }
            _ => self.on_conn_frame(f),
        }
    }

    fn on_conn_frame(&mut self, f: Frame) {
        // 'Y' replies echo our own query, so the local call sits in
        // call_from; everything else arrives from the remote station.
        let (local, remote) = if f.kind == DataKind::ConnInFlight {
            (&f.call_from, &f.call_to)
        } else {
            (&f.call_to, &f.call_from)
        };
        let (local, remote) = match (Addr::new(local), Addr::new(remote)) {
            (Ok(l), Ok(r)) => (l, r),
            _ => {
                warn!(
                    "bad call signs in {} frame: {:?} {:?}",
                    f.kind, f.call_from, f.call_to
                );
                let _ = self.events.send(ServerEvent::Error(Error::Protocol(format!(
                    "bad call sign in {} frame",
                    f.kind
                ))));
                return;
            }
        };
        let key = ConnKey {
            port: f.port,
            local,
            remote,
        };
        let exists = self
            .ports
            .get(&f.port)
            .is_some_and(|p| p.conns.contains_key(&key));
        if !exists {
            match f.kind {
                DataKind::Connect => {
                    info!("inbound connection {key}");
                    let handle = self.create_conn(key.clone());
                    let banner = latin1(&f.payload);
                    let _ = self.with_conn(&key, |c, _| {
                        let _ = c.tx.try_send(ConnEvent::Connected(banner));
                    });
                    let _ = self.events.send(ServerEvent::Connection(handle));
                }
                DataKind::Data => {
                    let _ = self.events.send(ServerEvent::Error(Error::Protocol(format!(
                        "data frame for unknown connection {key}"
                    ))));
                }
                _ => debug!("{} frame for unknown connection {key}", f.kind),
            }
            return;
        }
        match f.kind {
            DataKind::ConnInFlight => {
                let n = f.payload_u32().unwrap_or(0);
                let destroy = self
                    .with_conn(&key, |c, sink| c.throttle.update_in_flight(n, sink).destroy)
                    .unwrap_or(false);
                if destroy {
                    self.remove_conn(&key);
                }
            }
            DataKind::Connect => {
                debug!("connected event for {key}");
                let banner = latin1(&f.payload);
                let _ = self.with_conn(&key, |c, _| {
                    let _ = c.tx.try_send(ConnEvent::Connected(banner));
                });
            }
            DataKind::Data => self.on_conn_data(&key, f.payload),
            DataKind::Disconnect => self.on_conn_disconnect(&key),
            other => debug!("unhandled {other} frame for {key}"),
        }
    }

    fn on_conn_data(&mut self, key: &ConnKey, payload: Vec<u8>) {
        let outcome = self.with_conn(key, |c, _| {
            if c.disconnected {
                return DataOutcome::IgnoredPostDisconnect;
            }
            if c.ended {
                return DataOutcome::AfterClose;
            }
            match c.tx.try_send(ConnEvent::Data(payload)) {
                Ok(()) => DataOutcome::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => DataOutcome::Overflow,
                Err(mpsc::error::TrySendError::Closed(_)) => DataOutcome::HandleGone,
            }
        });
        match outcome {
            None | Some(DataOutcome::Delivered) => {}
            Some(DataOutcome::IgnoredPostDisconnect) => {
                debug!("data after disconnect on {key}, dropped");
            }
            Some(DataOutcome::AfterClose) => self.fail_conn(key, Error::RecvAfterClose),
            Some(DataOutcome::Overflow) => self.fail_conn(key, Error::RecvOverflow),
            Some(DataOutcome::HandleGone) => {
                debug!("handle for {key} dropped, ending the session");
                self.on_end(key);
            }
        }
    }

    /// 'd': the link is down. Tell the application, drop queued data that
    /// can no longer be sent, append the ID tail if configured, and
    /// schedule the record for destruction once the tail drains.
    fn on_conn_disconnect(&mut self, key: &ConnKey) {
        info!("disconnected {key}");
        let id = self.settings.id.clone();
        let destroy = self
            .with_conn(key, |c, sink| {
                c.disconnected = true;
                let _ = c.tx.try_send(ConnEvent::Disconnected);
                c.throttle.purge_data();
                // The TNC forgot this session's queue along with the link.
                let mut destroy = c.throttle.update_in_flight(0, sink).destroy;
                if let Some(id) = &id {
                    if !c.sent_id {
                        c.sent_id = true;
                        destroy |= c.throttle.write(Item::Frame(id_frame(key, id)), sink).destroy;
                    }
                }
                destroy |= c.throttle.write(Item::Destroy, sink).destroy;
                destroy
            })
            .unwrap_or(false);
        if destroy {
            self.remove_conn(key);
        }
    }

    // ---- application commands ----

    fn on_listen(&mut self, l: PendingListen) {
        if self.port_list.is_some() {
            self.finish_listen(l);
            return;
        }
        if !self.sent_ports_query {
            self.sent_ports_query = true;
            self.out.push_now(Frame::new(DataKind::Ports, 0));
        }
        self.pending_listens.push(l);
    }

    fn on_connect(&mut self, opts: ConnectOptions, reply: oneshot::Sender<Result<Connection>>) {
        if opts.via.len() > 8 {
            let _ = reply.send(Err(Error::ViaTooLong(opts.via.len())));
            return;
        }
        if let Some(known) = &self.port_list {
            let limit = known.len() * if self.settings.double_port_count { 2 } else { 1 };
            if (opts.port as usize) >= limit {
                let _ = reply.send(Err(Error::NoSuchPort(opts.port)));
                return;
            }
        }
        let key = ConnKey {
            port: opts.port,
            local: opts.local.clone(),
            remote: opts.remote.clone(),
        };
        let exists = self
            .ports
            .get(&key.port)
            .is_some_and(|p| p.conns.contains_key(&key));
        if exists {
            let _ = reply.send(Err(Error::AddrInUse(key.to_string())));
            return;
        }
        info!("connecting {key}");
        let handle = self.create_conn(key.clone());
        self.register(opts.port, opts.local.clone(), RegOrigin::Conn(key.clone()));

        let mut f = Frame::new(DataKind::Connect, opts.port);
        f.call_from = key.local.call();
        f.call_to = key.remote.call();
        if !opts.via.is_empty() {
            f.kind = DataKind::ConnectVia;
            f.payload = via_payload(&opts.via);
        }
        let destroy = self
            .with_conn(&key, |c, sink| c.throttle.write(Item::Frame(f), sink).destroy)
            .unwrap_or(false);
        if destroy {
            self.remove_conn(&key);
        }
        let _ = reply.send(Ok(handle));
    }

    fn on_write(&mut self, key: &ConnKey, data: Vec<u8>) {
        let destroy = self
            .with_conn(key, |c, sink| {
                if c.ended || c.disconnected {
                    debug!("write on closed {key}, dropped");
                    return false;
                }
                let mut destroy = false;
                for f in c.asm.write(&data) {
                    destroy |= c.throttle.write(Item::Frame(f), sink).destroy;
                }
                destroy
            })
            .unwrap_or(false);
        if destroy {
            self.remove_conn(key);
        }
    }

    /// Graceful close: flush buffered bytes, wait for the TNC to nearly
    /// drain, send the disconnect, then the ID tail.
    fn on_end(&mut self, key: &ConnKey) {
        debug!("ending {key}");
        let id = self.settings.id.clone();
        let destroy = self
            .with_conn(key, |c, sink| {
                if c.ended {
                    return false;
                }
                c.ended = true;
                let mut destroy = false;
                if let Some(f) = c.asm.flush() {
                    destroy |= c.throttle.write(Item::Frame(f), sink).destroy;
                }
                destroy |= c.throttle.write(Item::ClampToMin, sink).destroy;
                let mut d = Frame::new(DataKind::Disconnect, key.port);
                d.call_from = key.local.call();
                d.call_to = key.remote.call();
                destroy |= c.throttle.write(Item::Frame(d), sink).destroy;
                destroy |= c
                    .throttle
                    .write(Item::SetMax(MAX_IN_FLIGHT), sink)
                    .destroy;
                if let Some(id) = &id {
                    if !c.sent_id {
                        c.sent_id = true;
                        destroy |= c.throttle.write(Item::Frame(id_frame(key, id)), sink).destroy;
                    }
                }
                destroy |= c.throttle.write(Item::StopPoll, sink).destroy;
                destroy
            })
            .unwrap_or(false);
        if destroy {
            self.remove_conn(key);
        }
    }

    fn on_unproto(&mut self, port: u8, from: &Addr, to: &Addr, via: &[Addr], data: Vec<u8>) {
        self.ensure_port(port);
        let mut f = Frame::new(
            if via.is_empty() {
                DataKind::Unproto
            } else {
                DataKind::UnprotoVia
            },
            port,
        );
        f.call_from = from.call();
        f.call_to = to.call();
        f.payload = if via.is_empty() {
            data
        } else {
            let mut p = via_payload(via);
            p.extend(data);
            p
        };
        if let Some(pc) = self.ports.get_mut(&port) {
            let _ = pc.throttle.write(Item::Frame(f), &mut self.out);
        }
    }

    fn on_raw_subscribe(&mut self, tx: mpsc::UnboundedSender<Packet>) {
        self.raw_subs.retain(|t| !t.is_closed());
        self.raw_subs.push(tx);
        if !self.raw_enabled {
            debug!("enabling raw reception");
            self.raw_enabled = true;
            self.out.push_now(Frame::new(DataKind::RawToggle, 0));
        }
    }

    fn on_raw_unsubscribe(&mut self) {
        self.raw_subs.retain(|t| !t.is_closed());
        if self.raw_subs.is_empty() && self.raw_enabled {
            debug!("disabling raw reception");
            self.raw_enabled = false;
            self.out.push_now(Frame::new(DataKind::RawToggle, 0));
        }
    }

    fn on_send_raw(&mut self, packet: Packet) {
        let port = packet.port;
        self.ensure_port(port);
        let bytes = match packet.encode() {
            Ok(b) => b,
            Err(e) => {
                let _ = self.events.send(ServerEvent::Error(e));
                return;
            }
        };
        let mut f = Frame::new(DataKind::Raw, port);
        f.call_from = packet.src.call();
        f.call_to = packet.dst.call();
        f.payload = Vec::with_capacity(1 + bytes.len());
        f.payload.push(port << 4);
        f.payload.extend(bytes);
        if let Some(pc) = self.ports.get_mut(&port) {
            let _ = pc.throttle.write(Item::Frame(f), &mut self.out);
        }
    }

    // ---- plumbing ----

    fn create_conn(&mut self, key: ConnKey) -> Connection {
        self.ensure_port(key.port);
        let (tx, rx) = mpsc::channel(RECV_QUEUE);
        let fault = Arc::new(Mutex::new(None));
        let conn = Conn {
            throttle: Throttle::for_connection(key.port, &key.local, &key.remote),
            asm: Assembler::new(
                key.port,
                &key.local,
                &key.remote,
                self.settings.frame_length,
            ),
            tx,
            fault: fault.clone(),
            ended: false,
            disconnected: false,
            sent_id: false,
        };
        if let Some(port) = self.ports.get_mut(&key.port) {
            port.conns.insert(key.clone(), conn);
        }
        Connection::new(key, self.cmd_tx.clone(), rx, fault)
    }

    fn with_conn<R>(
        &mut self,
        key: &ConnKey,
        f: impl FnOnce(&mut Conn, &mut dyn Sink) -> R,
    ) -> Option<R> {
        let port = self.ports.get_mut(&key.port)?;
        let conn = port.conns.get_mut(key)?;
        let mut sink = PortSink {
            throttle: &mut port.throttle,
            out: &mut self.out,
        };
        Some(f(conn, &mut sink))
    }

    fn fail_conn(&mut self, key: &ConnKey, e: Error) {
        warn!("connection {key} failed: {e}");
        if let Some(port) = self.ports.get_mut(&key.port) {
            if let Some(conn) = port.conns.get_mut(key) {
                set_fault(conn, e);
            }
        }
        self.remove_conn(key);
    }

    fn remove_conn(&mut self, key: &ConnKey) {
        if let Some(port) = self.ports.get_mut(&key.port) {
            if port.conns.remove(key).is_some() {
                debug!("destroyed connection {key}");
            }
        }
    }

    fn sender_waiting(&self) -> bool {
        self.ports.values().any(|p| p.throttle.waiting_not_full())
    }

    /// Propagate drain progress across the two throttle tiers until it
    /// settles.
    fn pump(&mut self) {
        loop {
            let mut progress = false;
            let mut destroys = Vec::new();
            for port in self.ports.values_mut() {
                if port.throttle.waiting_not_full() && !self.out.is_full() {
                    let _ = port.throttle.notify_not_full(&mut self.out);
                    if !port.throttle.waiting_not_full() {
                        progress = true;
                    }
                }
                let PortClient { throttle, conns } = port;
                for (key, c) in conns.iter_mut() {
                    if c.throttle.waiting_not_full() && throttle.queue_len() < PORT_HIGH_WATER {
                        let mut sink = PortSink {
                            throttle: &mut *throttle,
                            out: &mut self.out,
                        };
                        if c.throttle.notify_not_full(&mut sink).destroy {
                            destroys.push(key.clone());
                        }
                        if !c.throttle.waiting_not_full() {
                            progress = true;
                        }
                    }
                }
            }
            for k in &destroys {
                self.remove_conn(k);
            }
            if !progress {
                break;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut best: Option<Instant> = None;
        for p in self.ports.values() {
            best = min_opt(best, p.throttle.deadline());
            for c in p.conns.values() {
                best = min_opt(best, c.throttle.deadline());
                best = min_opt(best, c.asm.deadline());
            }
        }
        best
    }

    fn on_tick(&mut self) {
        let mut destroys = Vec::new();
        for port in self.ports.values_mut() {
            port.throttle.tick(&mut self.out);
            let PortClient { throttle, conns } = port;
            for (key, c) in conns.iter_mut() {
                let mut sink = PortSink {
                    throttle: &mut *throttle,
                    out: &mut self.out,
                };
                c.throttle.tick(&mut sink);
                if let Some(f) = c.asm.tick() {
                    if c.throttle.write(Item::Frame(f), &mut sink).destroy {
                        destroys.push(key.clone());
                    }
                }
            }
        }
        for k in &destroys {
            self.remove_conn(k);
        }
    }

    fn shutdown(&mut self, err: Option<Error>) {
        match &err {
            Some(e) => info!("server shutting down: {e}"),
            None => info!("server shutting down"),
        }
        if let Some(e) = &err {
            for port in self.ports.values() {
                for conn in port.conns.values() {
                    set_fault(conn, e.clone());
                }
            }
        }
        // Dropping the records drops every event channel; each handle
        // observes its close.
        self.ports.clear();
        self.raw_subs.clear();
        for l in self.pending_listens.drain(..) {
            let _ = l.reply.send(Err(err.clone().unwrap_or(Error::Closed)));
        }
        if let Some(e) = err {
            let _ = self.events.send(ServerEvent::Error(e));
        }
        let _ = self.events.send(ServerEvent::Closed);
    }
}

fn set_fault(conn: &Conn, e: Error) {
    if let Ok(mut g) = conn.fault.lock() {
        g.get_or_insert(e);
    }
}

fn id_frame(key: &ConnKey, id: &str) -> Frame {
    let mut f = Frame::new(DataKind::Unproto, key.port);
    f.call_from = key.local.call();
    f.call_to = "ID".into();
    f.payload = latin1_bytes(id);
    f
}

/// Digipeater list as the TNC wants it: a count byte, then ten bytes per
/// hop (nine of ASCII call sign, one trailing NUL).
fn via_payload(via: &[Addr]) -> Vec<u8> {
    let mut out = vec![via.len() as u8];
    for v in via {
        let mut field = [0u8; 10];
        for (dst, b) in field.iter_mut().zip(v.call().bytes().take(9)) {
            *dst = b;
        }
        out.extend_from_slice(&field);
    }
    out
}

/// ISO-8859-1 decode: every byte is its own code point.
fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn latin1_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
        .collect()
}

fn min_opt(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

async fn sleep_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending::<()>().await,
    }
}

async fn read_loop(mut rd: OwnedReadHalf, cmd: mpsc::UnboundedSender<Cmd>) {
    let mut buf = [0u8; 4096];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                let _ = cmd.send(Cmd::SockClosed(None));
                break;
            }
            Ok(n) => {
                if cmd.send(Cmd::SockData(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = cmd.send(Cmd::SockClosed(Some(e)));
                break;
            }
        }
    }
}

async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cmd: mpsc::UnboundedSender<Cmd>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = wr.write_all(&chunk).await {
            let _ = cmd.send(Cmd::SockClosed(Some(e)));
            return;
        }
    }
    let _ = wr.shutdown().await;
}
