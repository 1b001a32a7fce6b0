//! Example server: listen on a call sign and echo whatever connecting
//! stations send.
use anyhow::Result;
use clap::Parser;
use log::debug;

use ragwpe::{Addr, Connection, Server, Settings};

#[derive(Parser, Debug)]
struct Opt {
    /// TNC host
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    /// TNC TCP port
    #[clap(long, default_value = "8000")]
    port: u16,

    /// Local call sign
    #[clap(short = 's')]
    src: String,

    /// Station ID to broadcast on disconnect
    #[clap(long)]
    id: Option<String>,

    #[clap(short = 'v', default_value = "0")]
    v: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("ragwpe")
        .verbosity(opt.v)
        .init()
        .unwrap();
    let mut server = Server::open(Settings {
        host: opt.host,
        port: opt.port,
        id: opt.id,
        ..Settings::default()
    })
    .await?;
    let listening = server.listen(&[Addr::new(&opt.src)?], None).await?;
    eprintln!(
        "==== Listening as {} on TNC ports {:?}",
        opt.src, listening.ports
    );

    loop {
        tokio::select! {
            conn = server.accept() => {
                let conn = conn?;
                eprintln!("==== Connected: {}", conn.remote_addr());
                tokio::spawn(async move {
                    if let Err(e) = serve(conn).await {
                        debug!("session error: {e}");
                    }
                });
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    server.close().await;
    Ok(())
}

async fn serve(mut conn: Connection) -> ragwpe::Result<()> {
    conn.send(b"You are connected!\r")?;
    while let Some(data) = conn.recv().await? {
        let s: String = data.iter().map(|&b| (b & 0x7F) as char).collect();
        let s = s.trim_end();
        println!("{} says: {s}", conn.remote_addr());
        conn.send(format!("Got <{s}>\r").as_bytes())?;
    }
    eprintln!("==== {} disconnected", conn.remote_addr());
    Ok(())
}
