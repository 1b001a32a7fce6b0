//! Application-facing handles: the connected-mode byte stream and the raw
//! packet socket.
//!
//! Handles are thin: they hold channels to the server task that owns all
//! protocol state. Dropping a `Connection` without calling `end()` closes
//! the session politely; dropping a `RawSocket` turns raw reception back
//! off.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;

use crate::call::Addr;
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::server::Cmd;

/// Identity of one AX.25 conversation: TNC port plus both call signs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub port: u8,
    pub local: Addr,
    pub remote: Addr,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}<->{}", self.port, self.local, self.remote)
    }
}

/// What the server task tells a connection handle.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// The TNC confirmed the session; the payload is its banner text.
    Connected(String),
    Data(Vec<u8>),
    Disconnected,
}

/// One AX.25 connected-mode session, used like a socket.
///
/// Reads come from `recv()`; `Ok(None)` is the clean end-of-session.
/// Writes are fire-and-forget into the server task, which coalesces them
/// into data frames and paces them to the TNC.
pub struct Connection {
    key: ConnKey,
    cmd: mpsc::UnboundedSender<Cmd>,
    rx: mpsc::Receiver<ConnEvent>,
    fault: Arc<Mutex<Option<Error>>>,
    banner: Option<String>,
    pending: VecDeque<Vec<u8>>,
    ended: bool,
    eof: bool,
}

impl Connection {
    pub(crate) fn new(
        key: ConnKey,
        cmd: mpsc::UnboundedSender<Cmd>,
        rx: mpsc::Receiver<ConnEvent>,
        fault: Arc<Mutex<Option<Error>>>,
    ) -> Self {
        Self {
            key,
            cmd,
            rx,
            fault,
            banner: None,
            pending: VecDeque::new(),
            ended: false,
            eof: false,
        }
    }

    #[must_use]
    pub fn local_addr(&self) -> &Addr {
        &self.key.local
    }

    #[must_use]
    pub fn remote_addr(&self) -> &Addr {
        &self.key.remote
    }

    #[must_use]
    pub fn tnc_port(&self) -> u8 {
        self.key.port
    }

    /// The TNC's connect banner, once seen.
    #[must_use]
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Block until the TNC confirms the session. Returns the banner.
    pub async fn wait_connected(&mut self) -> Result<String> {
        loop {
            if let Some(b) = &self.banner {
                return Ok(b.clone());
            }
            match self.rx.recv().await {
                Some(ConnEvent::Connected(b)) => self.banner = Some(b),
                // Data can outrun the banner on a busy channel; keep it
                // for recv().
                Some(ConnEvent::Data(d)) => self.pending.push_back(d),
                Some(ConnEvent::Disconnected) => {
                    self.eof = true;
                    return Err(self.take_fault().unwrap_or(Error::Disconnected));
                }
                None => return Err(self.take_fault().unwrap_or(Error::Disconnected)),
            }
        }
    }

    /// Receive the next chunk of session data.
    ///
    /// `Ok(None)` means the remote station disconnected (or the server
    /// closed); an error carries whatever fault ended the session.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(d) = self.pending.pop_front() {
                return Ok(Some(d));
            }
            if self.eof {
                return Ok(None);
            }
            match self.rx.recv().await {
                Some(ConnEvent::Connected(b)) => self.banner = Some(b),
                Some(ConnEvent::Data(d)) => return Ok(Some(d)),
                Some(ConnEvent::Disconnected) => {
                    self.eof = true;
                    return Ok(None);
                }
                None => {
                    self.eof = true;
                    return match self.take_fault() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
            }
        }
    }

    /// Queue bytes for transmission. Order is preserved; delivery is
    /// whatever AX.25 and the TNC provide.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if self.ended {
            return Err(Error::Closed);
        }
        self.cmd
            .send(Cmd::Write {
                key: self.key.clone(),
                data: data.to_vec(),
            })
            .map_err(|_| Error::Closed)
    }

    /// Flush pending data, then disconnect the link. The optional station
    /// ID frame follows the disconnect on the air.
    pub fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        self.cmd
            .send(Cmd::End {
                key: self.key.clone(),
            })
            .map_err(|_| Error::Closed)
    }

    /// Drop the session unconditionally: pending writes are discarded.
    pub fn destroy(&mut self) {
        self.ended = true;
        let _ = self.cmd.send(Cmd::Destroy {
            key: self.key.clone(),
        });
    }

    fn take_fault(&self) -> Option<Error> {
        self.fault.lock().ok().and_then(|mut g| g.take())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.ended && !self.eof {
            debug!("connection {} dropped without end()", self.key);
            let _ = self.cmd.send(Cmd::End {
                key: self.key.clone(),
            });
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("ended", &self.ended)
            .field("eof", &self.eof)
            .finish()
    }
}

/// A raw AX.25 packet tap on the whole TNC.
///
/// Creating the first raw socket asks the TNC to start copying every heard
/// packet ('k'); dropping the last one turns that off again.
pub struct RawSocket {
    cmd: mpsc::UnboundedSender<Cmd>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl RawSocket {
    pub(crate) fn new(
        cmd: mpsc::UnboundedSender<Cmd>,
        rx: mpsc::UnboundedReceiver<Packet>,
    ) -> Self {
        Self { cmd, rx }
    }

    /// The next packet heard on any port. `None` once the server closes.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Transmit a packet exactly as given.
    pub fn send(&self, packet: Packet) -> Result<()> {
        self.cmd
            .send(Cmd::SendRaw { packet })
            .map_err(|_| Error::Closed)
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        let _ = self.cmd.send(Cmd::RawUnsubscribe);
    }
}
