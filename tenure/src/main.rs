use clap::Parser as ClapParser;
use std::process;

use heap::{Heap, HeapSettings, HeapStats, Space};
use tenure::{Report, Workload, run};

const MB: usize = 1024 * 1024;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Heap reservation in MB
    #[arg(long, default_value_t = 64)]
    heap_size: usize,

    /// Upper bound of the nursery in MB
    #[arg(long, default_value_t = 4)]
    nursery_size: usize,

    /// Mutator threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Collector threads used by parallel phases
    #[arg(long)]
    collectors: Option<usize>,

    /// Live nodes kept by each thread
    #[arg(long, default_value_t = 50_000)]
    objects: usize,

    /// Garbage nodes allocated after each live one
    #[arg(long, default_value_t = 4)]
    garbage: usize,

    /// Explicit collections requested during the run
    #[arg(long, default_value_t = 8)]
    cycles: usize,

    /// Force every n-th explicit collection to be major (0 never)
    #[arg(long, default_value_t = 3)]
    major_every: usize,

    /// Verify the reachable heap around every collection
    #[arg(long, help = "Verify the heap before and after every cycle")]
    verify: bool,

    /// Keep the nursery at its initial size instead of adapting it
    #[arg(long)]
    fixed_nursery: bool,

    /// Disable the write barrier and trace mature space on minor cycles
    #[arg(long)]
    non_generational: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let defaults = HeapSettings::default();
    let settings = HeapSettings {
        min_heap_size: defaults.min_heap_size.min(cli.heap_size * MB),
        max_heap_size: cli.heap_size * MB,
        max_nursery_size: cli.nursery_size * MB,
        min_nursery_size: defaults.min_nursery_size.min(cli.nursery_size * MB),
        num_collectors: cli.collectors.unwrap_or(defaults.num_collectors),
        adaptive_nursery: !cli.fixed_nursery,
        generational: !cli.non_generational,
        verify_heap: cli.verify,
        ..defaults
    };

    let heap = match Heap::new(settings) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Error creating heap: {}", err);
            process::exit(1);
        }
    };

    let workload = Workload {
        threads: cli.threads,
        objects: cli.objects,
        garbage: cli.garbage,
        collections: cli.cycles,
        major_every: cli.major_every,
        large_len: 2 * heap.settings.large_object_threshold,
        ..Workload::default()
    };

    match run(&heap, &workload) {
        Ok(report) => print_report(&heap, &report),
        Err(err) => {
            eprintln!("Workload failed: {}", err);
            process::exit(1);
        }
    }

    if heap.stats().verification_failures > 0 {
        process::exit(2);
    }
}

fn print_report(heap: &Heap, report: &Report) {
    println!(
        "{} threads allocated {} MB in {:?}",
        report.threads.len(),
        report.allocated() / MB,
        report.elapsed
    );
    for t in &report.threads {
        println!(
            "  thread {}: {} live nodes, {} large arrays, {} KB allocated",
            t.thread,
            t.live_nodes,
            t.large_objects,
            t.allocated / 1024
        );
    }
    print_stats(&heap.stats());
    println!(
        "{} KB committed, {} KB free, nursery at {} KB",
        heap.total_memory_size() / 1024,
        heap.free_memory_size() / 1024,
        heap.nursery_size() / 1024
    );
}

fn print_stats(stats: &HeapStats) {
    println!(
        "{} collections ({} minor, {} major), {} verification failures",
        stats.collections, stats.minor, stats.major, stats.verification_failures
    );
    for space in [Space::Nursery, Space::Mature, Space::LargeObject] {
        let s = stats.space(space);
        println!(
            "  {:<12} {:>4} collections, last survival {:.1}%",
            format!("{space:?}"),
            s.num_collections,
            s.survival_ratio * 100.0
        );
    }
    if let Some(last) = &stats.last {
        println!(
            "  last cycle {}: {:?} ({:?}) in {:?}, {} bytes live",
            last.cycle, last.kind, last.cause, last.pause, last.live_bytes_after
        );
        println!(
            "  {} references cleared, {} objects queued for finalization",
            last.cleared_references, last.finalizers_queued
        );
    }
}
