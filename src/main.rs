use anyhow::Result;
use clap::Parser;
use pcap::Device;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mapletap::capture::PacketSource;
use mapletap::output::Formatter;
use mapletap::session::Analyzer;

#[derive(Parser)]
#[command(
    name = "mapletap",
    version,
    about = "Passive decryption tap for MapleStory sessions"
)]
struct Cli {
    /// Network interface to capture on
    #[arg(short = 'd', long)]
    interface: Option<String>,

    /// Read from pcap/pcapng file instead of live capture
    #[arg(short = 'I', long)]
    input: Option<PathBuf>,

    /// BPF filter expression (same syntax as tcpdump)
    #[arg(short = 'F', long)]
    bpf: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Show hex dump of decoded payloads
    #[arg(short = 'x', long)]
    hex: bool,

    /// Quiet mode (suppress per-packet header lines)
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Decode N packets then exit
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(1..))]
    count: Option<u64>,

    /// Don't use promiscuous mode
    #[arg(short = 'p', long)]
    no_promisc: bool,

    /// List available interfaces and exit
    #[arg(short = 'L', long)]
    list_interfaces: bool,

    /// Snap length (bytes to capture per frame)
    #[arg(short = 's', long, default_value_t = 65535, value_parser = clap::value_parser!(i32).range(1..=65535))]
    snaplen: i32,

    /// 3DES key for opcode-encryption packets (16 characters)
    #[arg(long, env = "MAPLETAP_OPCODE_KEY")]
    opcode_key: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_interfaces {
        list_interfaces()?;
        return Ok(());
    }

    let mut source = if let Some(ref path) = cli.input {
        PacketSource::from_file(path, cli.bpf.as_deref())?
    } else {
        PacketSource::live(
            cli.interface.as_deref(),
            cli.snaplen,
            !cli.no_promisc,
            cli.bpf.as_deref(),
        )?
    };

    let mut analyzer = match &cli.opcode_key {
        Some(key) => {
            if key.len() != 16 {
                eprintln!(
                    "Warning: --opcode-key must be 16 characters; falling back to the default"
                );
            }
            Analyzer::with_opcode_key(key.clone())
        }
        None => Analyzer::new(),
    };

    // Install Ctrl+C handler for graceful shutdown
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_clone = stop_flag.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if stop_clone.load(Ordering::Relaxed) {
            // Second Ctrl+C forces exit
            std::process::exit(1);
        }
        stop_clone.store(true, Ordering::Relaxed);
    }) {
        eprintln!("Warning: failed to install Ctrl+C handler: {}", e);
    }

    let formatter = Formatter::new(cli.json, cli.hex, cli.quiet);
    let mut decoded_count: u64 = 0;

    while !stop_flag.load(Ordering::Relaxed) {
        let packets = match source.next_frame()? {
            Some(frame) => analyzer.process_frame(frame.data, frame.timestamp),
            None => break,
        };
        for packet in &packets {
            formatter.print_packet(packet);
        }
        decoded_count += packets.len() as u64;

        if cli.count.is_some_and(|n| decoded_count >= n) {
            break;
        }
    }

    Ok(())
}

fn list_interfaces() -> Result<()> {
    for device in Device::list()? {
        let desc = device.desc.as_deref().unwrap_or("(no description)");
        println!("{}\t{}", device.name, desc);
    }
    Ok(())
}
