use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use etherparse::{NetHeaders, PacketBuilder, PacketHeaders};
use parking_lot::Mutex;

use nicxlat::offload::TxChecksumInfo;
use nicxlat::{
    Adapter, CompletionStatus, DatapathConfig, ExecutionLevel, LoopbackDevice, NblChain, NetBuffer,
    NetBufferList, OsNetStack,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Transmit and receive queues of the loopback device.
    #[clap(short, long, default_value_t = 1)]
    queues: u32,

    /// Lists per send call.
    #[clap(short, long, default_value_t = 32)]
    burst: usize,

    /// UDP payload bytes per frame.
    #[clap(short = 'l', long, default_value_t = 64)]
    payload: usize,

    /// Split each frame into pieces of this many bytes.
    #[clap(short, long)]
    pieces: Option<usize>,

    /// Fragments the device takes per packet; smaller forces bounce buffers.
    #[clap(long, default_value_t = 8)]
    max_fragments: u16,

    /// Lists allowed in flight before the sender backs off.
    #[clap(long, default_value_t = 1024)]
    window: u64,

    /// Print addresses of received frames.
    #[clap(short, long)]
    debug: bool,
}

/// Counts completions and keeps received lists until the main loop hands
/// them back.
#[derive(Default)]
struct DemoStack {
    completed: AtomicU64,
    failed: AtomicU64,
    received: AtomicU64,
    pending_returns: Mutex<NblChain>,
}

impl OsNetStack for DemoStack {
    fn complete_send(&self, chain: NblChain, _level: ExecutionLevel) {
        let failed = chain
            .iter()
            .filter(|list| list.status != CompletionStatus::Success)
            .count() as u64;
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.completed.fetch_add(chain.len() as u64, Ordering::Relaxed);
    }

    fn indicate_receive(&self, mut chain: NblChain, _level: ExecutionLevel) {
        self.received.fetch_add(chain.len() as u64, Ordering::Relaxed);
        self.pending_returns.lock().append(&mut chain);
    }
}

fn print_addrs(frame: &[u8]) -> Result<String> {
    let headers = PacketHeaders::from_ethernet_slice(frame)?;
    match headers.net {
        Some(NetHeaders::Ipv4(header, _)) => Ok(format!(
            "IP: {} > {}",
            std::net::Ipv4Addr::from(header.source),
            std::net::Ipv4Addr::from(header.destination)
        )),
        _ => bail!("no IPv4 header"),
    }
}

fn frame(payload: usize, sequence: u64) -> Result<Vec<u8>> {
    let mut frame = Vec::new();
    let mut data = vec![0u8; payload];
    for (byte, seq) in data.iter_mut().zip(sequence.to_be_bytes()) {
        *byte = seq;
    }
    PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(4000, 5000)
        .write(&mut frame, &data)?;
    Ok(frame)
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.queues == 0 {
        bail!("at least one queue is needed");
    }

    println!("Loopback test started with parameters:");
    println!("* queues: {}", args.queues);
    println!("* burst: {}", args.burst);
    println!("* payload: {}", args.payload);
    println!("* pieces: {:?}", args.pieces);
    println!("* max fragments: {}", args.max_fragments);
    println!("* debug: {}", if args.debug { "ON" } else { "OFF" });

    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })?;
    }

    let mut capabilities = LoopbackDevice::offload_capabilities(args.queues);
    capabilities.tx.max_fragments_per_packet = args.max_fragments;
    let device = Arc::new(LoopbackDevice::new(capabilities));
    let stack = Arc::new(DemoStack::default());
    let adapter = Arc::new(Adapter::new(
        DatapathConfig::default(),
        device.clone(),
        stack.clone(),
    ));
    adapter.start_datapath()?;

    let meter = {
        let stack = stack.clone();
        let term = term.clone();
        thread::spawn(move || {
            let mut old_total = 0;
            while !term.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                let total = stack.received.load(Ordering::Relaxed);
                println!("Received pkt/sec: {}", total.saturating_sub(old_total));
                old_total = total;
            }
        })
    };

    let mut sequence = 0u64;
    let mut printed = false;
    while !term.load(Ordering::SeqCst) {
        let in_flight = sequence.saturating_sub(stack.completed.load(Ordering::Relaxed));
        if in_flight < args.window {
            let mut chain = NblChain::new();
            for _ in 0..args.burst {
                let bytes = frame(args.payload, sequence)?;
                let buffer = match args.pieces {
                    Some(piece) => NetBuffer::from_pieces(&bytes, piece.max(1)),
                    None => NetBuffer::from_bytes(&bytes),
                };
                let mut list = NetBufferList::single(buffer);
                list.info.tx_checksum = TxChecksumInfo {
                    is_ipv4: true,
                    ip_header_checksum: true,
                    udp_checksum: true,
                    ..Default::default()
                };
                chain.push_back(list);
                sequence += 1;
            }
            adapter.send_net_buffer_lists(chain);
        } else {
            thread::yield_now();
        }

        let received = std::mem::take(&mut *stack.pending_returns.lock());
        if !received.is_empty() {
            if args.debug && !printed {
                if let Some(list) = received.iter().next() {
                    if let Ok(info) = print_addrs(&list.buffers[0].to_vec()) {
                        println!("first frame: {info}");
                    }
                }
                printed = true;
            }
            adapter.return_net_buffer_lists(received);
        }
    }

    // Stop blocks until every indicated list is back, so keep returning.
    let stopping = Arc::new(AtomicBool::new(false));
    let returner = {
        let adapter = adapter.clone();
        let stack = stack.clone();
        let stopping = stopping.clone();
        thread::spawn(move || {
            while !stopping.load(Ordering::SeqCst) {
                let received = std::mem::take(&mut *stack.pending_returns.lock());
                if received.is_empty() {
                    thread::sleep(Duration::from_millis(1));
                } else {
                    adapter.return_net_buffer_lists(received);
                }
            }
        })
    };
    adapter.stop_datapath();
    stopping.store(true, Ordering::SeqCst);
    returner.join().ok();
    meter.join().ok();

    let stats = adapter.statistics();
    println!(
        "sent {} completed {} failed {} received {}",
        sequence,
        stack.completed.load(Ordering::Relaxed),
        stack.failed.load(Ordering::Relaxed),
        stack.received.load(Ordering::Relaxed)
    );
    println!("adapter: {stats:?}");
    println!("device: {:?}", device.stats());
    Ok(())
}
