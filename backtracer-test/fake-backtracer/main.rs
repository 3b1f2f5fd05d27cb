//! Stands in for a real backtracer, it reads everything a backtracer would
//! need out of the crashed process and prints it, instead of unwinding

use backtracer_test::MARKER_VAR;
use crash_info::{CrashInfo, ThreadRecord};
use memserver::Client;

use anyhow::Context as _;
use clap::Parser;
use std::os::unix::io::FromRawFd;

/// Guards against walking a corrupted list forever
const MAX_THREADS: usize = 4096;

/// Every flag the crash handler passes, in the order it passes them
#[derive(Parser, Debug)]
struct Command {
    #[clap(long)]
    unwind: String,
    #[clap(long)]
    demangle: String,
    #[clap(long)]
    interactive: String,
    #[clap(long)]
    color: String,
    #[clap(long)]
    timeout: u64,
    #[clap(long)]
    preset: String,
    /// The address of the crash info, in hex
    #[clap(long)]
    crashinfo: String,
    #[clap(long)]
    threads: String,
    #[clap(long)]
    registers: String,
    #[clap(long)]
    images: String,
    #[clap(long)]
    limit: String,
    #[clap(long)]
    top: u32,
    #[clap(long)]
    sanitize: String,
    #[clap(long)]
    cache: String,
    #[clap(long)]
    output_to: String,
}

#[allow(unsafe_code)]
fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    println!("unwind: {}", cmd.unwind);
    println!("preset: {}", cmd.preset);
    println!("interactive: {}", cmd.interactive);
    println!("output-to: {}", cmd.output_to);
    println!("limit: {}", cmd.limit);
    println!("top: {}", cmd.top);
    println!("timeout: {}", cmd.timeout);

    let settings = std::env::var(crash_handler::ENV_VAR).unwrap_or_default();
    println!("settings: {settings}");

    // SAFETY: the crash handler hands us the memory server socket on this fd
    let mut client = unsafe { Client::from_raw_fd(crash_handler::MEMSERVER_FD) };

    let addr = u64::from_str_radix(&cmd.crashinfo, 16).context("invalid --crashinfo")?;
    let bytes = client
        .read_vec(addr, CrashInfo::SIZE)
        .context("failed to read the crash info")?;
    let info = CrashInfo::from_bytes(&bytes).context("invalid crash info")?;

    println!("crashed: {}", info.crashing_thread);
    println!("signal: {}", info.signal);
    println!("fault address: {:#x}", info.fault_address);

    let mut threads = Vec::new();
    let mut next = info.thread_list.head();
    while next != 0 && threads.len() < MAX_THREADS {
        let bytes = client
            .read_vec(next, ThreadRecord::SIZE)
            .with_context(|| format!("failed to read the thread record at {next:#x}"))?;
        let record = ThreadRecord::from_bytes(&bytes).context("invalid thread record")?;
        next = record.next;
        threads.push(record);
    }

    println!("threads: {}", threads.len());
    for thread in &threads {
        println!("thread {}: context {:#x}", thread.tid, thread.context);
    }

    // The crashing thread is the first to be registered, so it is last
    anyhow::ensure!(
        threads.last().map(|t| t.tid as u64) == Some(info.crashing_thread),
        "the crashing thread is not the last in the list"
    );

    let mut word = [0u8; 8];
    let unreadable = threads
        .iter()
        .filter(|t| client.read(t.context, &mut word).is_err())
        .count();
    if unreadable == 0 {
        println!("contexts: readable");
    } else {
        println!("contexts: {unreadable} unreadable");
    }

    if let Ok(marker) = std::env::var(MARKER_VAR) {
        let (addr, len) = marker.split_once(' ').context("invalid marker")?;
        let addr = u64::from_str_radix(addr, 16)?;
        let len = len.parse()?;

        let text = client.read_vec(addr, len).context("failed to read the marker")?;
        println!("marker: {}", String::from_utf8_lossy(&text));
    }

    // A read that the server can't satisfy must not bring it down
    match client.read_vec(0, 8) {
        Ok(_) => anyhow::bail!("read the null page"),
        Err(e) => println!("null read: {e}"),
    }
    client
        .read_vec(addr, CrashInfo::SIZE)
        .context("the memory server did not survive a bad read")?;

    Ok(())
}

fn main() {
    if let Err(e) = real_main() {
        println!("backtracer error: {e:#}");

        #[allow(clippy::exit)]
        std::process::exit(1);
    }
}
