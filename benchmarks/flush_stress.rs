use std::hint::black_box;
use std::process::ExitCode;
use std::sync::atomic::{compiler_fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::{error, info};
use rand::Rng;
use strata_os::{platform, WriteBufferFlusher};

#[derive(Parser, Debug)]
#[command(author, version, about = "Concurrent write buffer flush stress", long_about = None)]
struct Args {
    #[arg(short, long, value_delimiter = ',', default_value = "2,8,64")]
    threads: Vec<usize>,

    #[arg(short, long, default_value_t = 2000)]
    rounds: u64,

    /// Use the helper page even when membarrier is available
    #[arg(long)]
    helper_page: bool,
}

struct Outcome {
    misses: usize,
    flushes: usize,
    elapsed_ns: u128,
}

/// One writer stores `data`, flushes, then stores `flag`. The other threads
/// spin on relaxed loads with only a compiler fence on their side and count
/// every time they see `flag` ahead of `data`. Readers flush whenever the
/// flag moves, so flushes also race each other.
fn run(flusher: &Arc<WriteBufferFlusher>, threads: usize, rounds: u64) -> Outcome {
    let data = Arc::new(AtomicU64::new(0));
    let flag = Arc::new(AtomicU64::new(0));
    let misses = Arc::new(AtomicUsize::new(0));
    let flushes = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let readers: Vec<_> = (1..threads)
        .map(|_| {
            let flusher = Arc::clone(flusher);
            let data = Arc::clone(&data);
            let flag = Arc::clone(&flag);
            let misses = Arc::clone(&misses);
            let flushes = Arc::clone(&flushes);
            std::thread::spawn(move || {
                let mut last = 0;
                while last < rounds {
                    let seen_flag = flag.load(Ordering::Relaxed);
                    compiler_fence(Ordering::SeqCst);
                    let seen_data = data.load(Ordering::Relaxed);
                    if seen_data < seen_flag {
                        misses.fetch_add(1, Ordering::Relaxed);
                    }
                    if seen_flag != last {
                        last = seen_flag;
                        flusher.flush();
                        flushes.fetch_add(1, Ordering::Relaxed);
                    }
                    std::hint::spin_loop();
                }
            })
        })
        .collect();

    let mut rng = rand::thread_rng();
    for round in 1..=rounds {
        // Jitter so the readers are caught at varying points of their loop.
        for _ in 0..rng.gen_range(0..256) {
            black_box(round);
        }
        data.store(round, Ordering::Relaxed);
        flusher.flush();
        flushes.fetch_add(1, Ordering::Relaxed);
        flag.store(round, Ordering::Relaxed);
    }

    for handle in readers {
        if handle.join().is_err() {
            misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    Outcome {
        misses: misses.load(Ordering::Relaxed),
        flushes: flushes.load(Ordering::Relaxed),
        elapsed_ns: start.elapsed().as_nanos(),
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let page_size = platform::page_size();
    let flusher = if args.helper_page {
        WriteBufferFlusher::helper_page(page_size)
    } else {
        WriteBufferFlusher::initialize(page_size)
    };
    let flusher = match flusher {
        Ok(flusher) => Arc::new(flusher),
        Err(err) => {
            error!("Failed to set up write buffer flushing: {}", err);
            return ExitCode::FAILURE;
        }
    };

    println!("--- STRATA FLUSH STRESS ---");
    println!("Strategy:  {}", flusher.strategy());
    println!("Rounds:    {}", args.rounds);
    println!("---------------------------");

    let mut failed = false;
    for &threads in &args.threads {
        if threads == 0 {
            continue;
        }
        let outcome = run(&flusher, threads, args.rounds);
        let flushes = outcome.flushes.max(1);
        println!(
            "{:>4} threads: {:>8} flushes, {:>6} ns/flush, {} missed observations",
            threads,
            flushes,
            outcome.elapsed_ns / flushes as u128,
            outcome.misses
        );
        info!("{} threads finished in {} ms", threads, outcome.elapsed_ns / 1_000_000);
        failed |= outcome.misses != 0;
    }

    if failed {
        error!("Flush stress observed stale values");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
