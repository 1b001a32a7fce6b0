//! Client library for AGWPE-compatible TNCs (Direwolf, AGWPE, QtSoundModem,
//! ldsped, …) over TCP.
//!
//! One [`Server`] talks to one TNC and multiplexes any number of AX.25
//! connected-mode sessions, UNPROTO datagrams and raw-packet taps over the
//! single TCP socket, with flow control against the TNC's transmit queue.
//!
//! # Examples
//!
//! ## Calling another station
//!
//! ```no_run
//! use ragwpe::{Addr, ConnectOptions, Server, Settings};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ragwpe::Result<()> {
//! let server = Server::open(Settings::default()).await?;
//! let mut conn = server
//!     .connect(ConnectOptions {
//!         port: 0,
//!         local: Addr::new("M0THC-1")?,
//!         remote: Addr::new("M0THC-2")?,
//!         via: vec![],
//!     })
//!     .await?;
//! conn.send(b"Hello\r")?;
//! while let Some(data) = conn.recv().await? {
//!     print!("{}", String::from_utf8_lossy(&data));
//! }
//! # Ok(()) }
//! ```
//!
//! ## Accepting connections
//!
//! ```no_run
//! use ragwpe::{Addr, Server, Settings};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ragwpe::Result<()> {
//! let mut server = Server::open(Settings::default()).await?;
//! server.listen(&[Addr::new("M0THC-1")?], None).await?;
//! loop {
//!     let conn = server.accept().await?;
//!     conn.send(b"You are connected!\r")?;
//! }
//! # }
//! ```

pub mod assembler;
pub mod call;
pub mod connection;
pub mod error;
pub mod frame;
pub mod packet;
pub mod pcap;
pub mod server;
pub mod throttle;
mod timer;

pub use call::Addr;
pub use connection::{Connection, RawSocket};
pub use error::{Error, Result};
pub use frame::{DataKind, Frame, Receiver};
pub use packet::{Packet, PacketType, Via};
pub use server::{ConnectOptions, Listening, Registration, Server, ServerEvent, Settings};
