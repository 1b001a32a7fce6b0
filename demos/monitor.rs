//! Raw channel monitor: print every packet the TNC hears, optionally
//! capturing to a pcap file for Wireshark.
use anyhow::Result;
use clap::Parser;

use ragwpe::pcap::PcapWriter;
use ragwpe::{Server, Settings};

#[derive(Parser, Debug)]
struct Opt {
    /// TNC host
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    /// TNC TCP port
    #[clap(long, default_value = "8000")]
    port: u16,

    /// Also capture to this pcap file
    #[clap(long)]
    pcap: Option<std::path::PathBuf>,

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
    let server = Server::open(Settings {
        host: opt.host,
        port: opt.port,
        ..Settings::default()
    })
    .await?;
    let mut pcap = opt.pcap.map(PcapWriter::create).transpose()?;
    let mut raw = server.create_socket()?;

    loop {
        tokio::select! {
            packet = raw.recv() => {
                let Some(packet) = packet else { break };
                println!("[{}] {}", packet.port, packet);
                if let Some(w) = &mut pcap {
                    w.write(&packet.encode()?)?;
                    w.flush()?;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
