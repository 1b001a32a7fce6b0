//! Interactive connected-mode terminal: call a remote station and wire it
//! to stdin/stdout. `exit` on a line of its own (or ctrl-c) disconnects.
use std::io::Write;

use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncReadExt;

use ragwpe::{Addr, ConnectOptions, Server, Settings};

#[derive(Parser, Debug)]
struct Opt {
    /// TNC host
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    /// TNC TCP port
    #[clap(long, default_value = "8000")]
    port: u16,

    /// TNC radio port
    #[clap(short = 'p', default_value = "0")]
    tnc_port: u8,

    /// Local call sign
    #[clap(short = 's')]
    src: String,

    /// Digipeater path, comma separated
    #[clap(long)]
    via: Option<String>,

    /// Station ID to broadcast on disconnect
    #[clap(long)]
    id: Option<String>,

    #[clap(short = 'v', default_value = "0")]
    v: usize,

    /// Remote call sign
    #[clap()]
    dst: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("ragwpe")
        .verbosity(opt.v)
        .init()
        .unwrap();
    let server = Server::open(Settings {
        host: opt.host,
        port: opt.port,
        id: opt.id,
        ..Settings::default()
    })
    .await?;
    let via = match &opt.via {
        None => vec![],
        Some(s) => s
            .split(',')
            .map(Addr::new)
            .collect::<ragwpe::Result<Vec<_>>>()?,
    };
    let mut conn = server
        .connect(ConnectOptions {
            port: opt.tnc_port,
            local: Addr::new(&opt.src)?,
            remote: Addr::new(&opt.dst)?,
            via,
        })
        .await?;
    eprintln!("==== {}", conn.banner().unwrap_or_default());

    let mut stdin = tokio::io::stdin();
    loop {
        let mut buf = [0; 1024];
        tokio::select! {
            res = stdin.read(&mut buf) => {
                let buf = &buf[..res?];
                if buf.is_empty() || buf == b"exit\n" {
                    break;
                }
                conn.send(buf)?;
            },
            data = conn.recv() => {
                match data? {
                    None => {
                        eprintln!("==== Disconnected");
                        return Ok(());
                    }
                    Some(data) => {
                        // Some BBSes still set the top bit; strip it.
                        let s = match String::from_utf8(data.clone()) {
                            Ok(s) => s,
                            Err(_) => data.iter().map(|&b| (b & 0x7F) as char).collect(),
                        };
                        print!("{s}");
                        std::io::stdout().flush()?;
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    conn.end()?;
    // Drain until the TNC confirms the disconnect.
    while conn.recv().await?.is_some() {}
    Ok(())
}
