//! shmpipe CLI
//!
//! Small operator tool around the library: serve an echo peer, connect to
//! one interactively, or measure round-trip latency.

use clap::{Parser, Subcommand};
use console::style;
use shmpipe::{Session, ShmPipeError, UnlinkPolicy};
use std::io::{self, BufRead, Write};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "shmpipe")]
#[command(about = "Byte streams over shared memory", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session and echo everything the peer sends
    Serve {
        /// Session name
        name: String,

        /// Per-direction ring capacity in bytes (power of two)
        #[arg(short, long, default_value_t = 64 * 1024)]
        capacity: u32,
    },

    /// Attach to a session and exchange lines with the peer
    Connect {
        /// Session name
        name: String,
    },

    /// Measure round-trip latency against a running `serve`
    Bench {
        /// Session name
        name: String,

        /// Round trips to time
        #[arg(long, default_value_t = 10_000)]
        iterations: u64,

        /// Bytes per round trip
        #[arg(long, default_value_t = 64)]
        payload: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { name, capacity } => serve(&name, capacity),
        Commands::Connect { name } => connect(&name),
        Commands::Bench {
            name,
            iterations,
            payload,
        } => bench(&name, iterations, payload),
    };

    if let Err(e) = result {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

fn serve(name: &str, capacity: u32) -> shmpipe::Result<()> {
    let mut session = Session::create(name, capacity)?;
    println!(
        "{} session '{}' ({} byte rings); waiting for a peer",
        style("serving").green().bold(),
        name,
        capacity
    );

    let mut buf = vec![0u8; 4096];
    let mut echoed: u64 = 0;
    loop {
        match session.read(&mut buf) {
            Ok(n) => {
                session.write(&buf[..n])?;
                echoed += n as u64;
            }
            Err(ShmPipeError::BrokenPipe | ShmPipeError::Interrupted) => break,
            Err(e) => return Err(e),
        }
    }

    println!("peer left, {} bytes echoed", echoed);
    session.close(UnlinkPolicy::Unlink)?;
    Ok(())
}

fn connect(name: &str) -> shmpipe::Result<()> {
    let mut session = Session::attach(name)?;
    println!(
        "{} to '{}' ({} byte rings); type lines, 'exit' quits",
        style("connected").green().bold(),
        name,
        session.capacity()
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buf = vec![0u8; 4096];

    loop {
        print!(">>> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim_end_matches('\n');
        if line == "exit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        let start = Instant::now();
        session.write(line.as_bytes())?;

        let mut received = 0;
        while received < line.len() {
            let n = session.read(&mut buf[received..line.len()])?;
            received += n;
        }
        let elapsed = start.elapsed();

        println!(
            "{} {} ({:.1}µs)",
            style("<<<").dim(),
            String::from_utf8_lossy(&buf[..received]),
            elapsed.as_secs_f64() * 1_000_000.0
        );
    }

    Ok(())
}

fn bench(name: &str, iterations: u64, payload: usize) -> shmpipe::Result<()> {
    let mut session = Session::attach(name)?;
    println!(
        "{} {} round trips of {} bytes against '{}'",
        style("benchmarking").cyan().bold(),
        iterations,
        payload,
        name
    );

    let data = vec![0xA5u8; payload];
    let mut buf = vec![0u8; payload];

    let mut round_trip = |session: &mut Session| -> shmpipe::Result<()> {
        session.write(&data)?;
        let mut received = 0;
        while received < payload {
            received += session.read(&mut buf[received..])?;
        }
        Ok(())
    };

    // Warmup
    for _ in 0..100 {
        round_trip(&mut session)?;
    }

    let start = Instant::now();
    for _ in 0..iterations {
        round_trip(&mut session)?;
    }
    let elapsed = start.elapsed();

    let avg_us = elapsed.as_secs_f64() * 1_000_000.0 / iterations as f64;
    let per_sec = iterations as f64 / elapsed.as_secs_f64();
    let mib_s = (iterations as f64 * payload as f64 * 2.0)
        / (1024.0 * 1024.0)
        / elapsed.as_secs_f64();

    println!();
    println!("  iterations   {}", style(iterations).bold());
    println!("  total time   {:.2} ms", elapsed.as_secs_f64() * 1000.0);
    println!("  round trip   {:.2} µs avg", avg_us);
    println!("  rate         {:.0} rt/s", per_sec);
    println!("  throughput   {:.1} MiB/s", mib_s);

    Ok(())
}
