mod config;

use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::info;
use rand::Rng;
use serde::Serialize;
use strata_os::{memory, thread, OsContext};

use crate::config::Args;

const MIB: usize = 1024 * 1024;

#[derive(Serialize)]
struct Placement {
    heap: u16,
    processor: u16,
    node: Option<u16>,
}

#[derive(Serialize)]
struct SmokeReport {
    reserved_bytes: usize,
    alignment: usize,
    base: String,
    probes_verified: usize,
}

#[derive(Serialize)]
struct Report {
    page_size: usize,
    processors: u32,
    usable_processors: Vec<usize>,
    numa_available: bool,
    highest_numa_node: u16,
    heap_placements: Vec<Placement>,
    pinned: Option<bool>,
    current_processor: Option<u32>,
    flush_strategy: String,
    flush_ns_per_call: Option<u64>,
    physical_memory_limit: u64,
    restricted: bool,
    memory_load_percent: u32,
    available_physical: u64,
    available_page_file: u64,
    virtual_memory_limit: u64,
    cache_size_true: u64,
    cache_size_scaled: u64,
    smoke_test: Option<SmokeReport>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = args.os_config().context("Invalid STRATA_GC_* environment")?;
    let mut context = OsContext::initialize(config).context("Failed to initialize the platform layer")?;
    context.apply_configured_affinity().context("Invalid heap affinity ranges")?;

    let pinned = args.pin.map(|cpu| context.bind_current_thread(cpu));
    let flush_ns_per_call = time_flushes(&context, args.flush_rounds);
    let smoke_test = match args.reserve_mib {
        0 => None,
        mib => Some(smoke_test(&context, mib * MIB).context("Virtual memory smoke test failed")?),
    };

    let report = build_report(&context, pinned, flush_ns_per_call, smoke_test);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    context.shutdown();
    Ok(())
}

fn time_flushes(context: &OsContext, rounds: u32) -> Option<u64> {
    if rounds == 0 {
        return None;
    }
    let start = Instant::now();
    for _ in 0..rounds {
        context.flush_process_write_buffers();
    }
    let per_call = start.elapsed().as_nanos() / u128::from(rounds);
    info!("{} flushes via {}: {} ns each", rounds, context.flush_strategy(), per_call);
    Some(per_call as u64)
}

/// Reserve -> commit -> scribble -> decommit -> commit -> expect zeros.
fn smoke_test(context: &OsContext, size: usize) -> anyhow::Result<SmokeReport> {
    let vm = context.virtual_memory();
    let alignment = 2 * MIB;
    let addr = vm.reserve(size, alignment, None, false)?;
    anyhow::ensure!(addr.as_ptr() as usize % alignment == 0, "reservation at {:p} is not aligned", addr);

    let mut rng = rand::thread_rng();
    let offsets: Vec<usize> = (0..64).map(|_| rng.gen_range(0..size)).collect();

    // SAFETY: every access stays inside the reservation, which is committed
    // around each access and released at the end.
    let result = unsafe {
        (|| -> anyhow::Result<()> {
            let node = context.processor_for_heap(0).and_then(|placement| placement.node);
            vm.commit(addr, size, node)?;
            for &offset in &offsets {
                *addr.as_ptr().add(offset) = 0xA5;
            }
            vm.decommit(addr, size)?;
            vm.commit(addr, size, None)?;
            for &offset in &offsets {
                anyhow::ensure!(*addr.as_ptr().add(offset) == 0, "offset {offset} survived decommit");
            }
            Ok(())
        })()
    };
    // SAFETY: the whole reservation is ours and no longer referenced.
    unsafe { vm.release(addr, size)? };
    result?;

    Ok(SmokeReport { reserved_bytes: size, alignment, base: format!("{:p}", addr), probes_verified: offsets.len() })
}

fn build_report(
    context: &OsContext,
    pinned: Option<bool>,
    flush_ns_per_call: Option<u64>,
    smoke_test: Option<SmokeReport>,
) -> Report {
    let heap_placements = (0..context.affinity().count().min(8) as u16)
        .filter_map(|heap| {
            let placement = context.processor_for_heap(heap)?;
            Some(Placement { heap, processor: placement.processor, node: placement.node })
        })
        .collect();
    let (physical_memory_limit, restricted) = context.physical_memory_limit();
    let status = context.memory_status();

    Report {
        page_size: context.page_size(),
        processors: context.total_processor_count(),
        usable_processors: context.affinity().iter().collect(),
        numa_available: context.can_enable_numa_aware(),
        highest_numa_node: context.topology().numa().highest_node(),
        heap_placements,
        pinned,
        current_processor: thread::current_processor_number(),
        flush_strategy: context.flush_strategy().to_string(),
        flush_ns_per_call,
        physical_memory_limit,
        restricted,
        memory_load_percent: status.load_percent,
        available_physical: status.available_physical,
        available_page_file: status.available_page_file,
        virtual_memory_limit: memory::virtual_memory_limit(),
        cache_size_true: context.cache_size_per_logical_cpu(true),
        cache_size_scaled: context.cache_size_per_logical_cpu(false),
        smoke_test,
    }
}

fn print_report(report: &Report) {
    let mib = |bytes: u64| bytes / MIB as u64;

    println!("--- STRATA PLATFORM PROBE ---");
    println!("Page size:        {} B", report.page_size);
    println!("Processors:       {} ({} usable)", report.processors, report.usable_processors.len());
    println!(
        "NUMA:             {}",
        if report.numa_available { format!("highest node {}", report.highest_numa_node) } else { "unavailable".into() }
    );
    for placement in &report.heap_placements {
        let node = placement.node.map_or_else(|| "-".to_string(), |node| node.to_string());
        println!("  heap {:>3} -> cpu {:>4} node {}", placement.heap, placement.processor, node);
    }
    if let Some(pinned) = report.pinned {
        println!("Pinned:           {}", pinned);
    }
    if let Some(cpu) = report.current_processor {
        println!("Running on:       cpu {}", cpu);
    }
    print!("Flush:            {}", report.flush_strategy);
    match report.flush_ns_per_call {
        Some(ns) => println!(" ({} ns/call)", ns),
        None => println!(),
    }
    println!(
        "Memory limit:     {} MiB{}",
        mib(report.physical_memory_limit),
        if report.restricted { " (restricted)" } else { "" }
    );
    println!("Memory load:      {}%", report.memory_load_percent);
    println!("Available:        {} MiB physical, {} MiB swap", mib(report.available_physical), mib(report.available_page_file));
    println!("VA limit:         {} GiB", report.virtual_memory_limit >> 30);
    println!("Cache per CPU:    {} KiB (scaled {} KiB)", report.cache_size_true / 1024, report.cache_size_scaled / 1024);
    if let Some(smoke) = &report.smoke_test {
        println!(
            "Smoke test:       {} MiB at {} (align {} KiB), {} probes zeroed after decommit",
            smoke.reserved_bytes / MIB,
            smoke.base,
            smoke.alignment / 1024,
            smoke.probes_verified
        );
    }
    println!("-----------------------------");
}
