//!
//! Runs one of the demo programs on the Blue Book virtual machine.
//!
#![warn(missing_docs)]

use std::time::Instant;

use anyhow::{anyhow, Context};
use bluebook_gc::HeapConfig;
use clap::Parser;
#[cfg(feature = "jemalloc")]
use jemallocator::Jemalloc;
use log::info;

use bluebook_interpreter::debug::disassembler::disassemble;
use bluebook_interpreter::demos::{self, DEMOS};
use bluebook_interpreter::universe::{Universe, UniverseConfig};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Debug, Clone, PartialEq, Parser)]
#[clap(about, author)]
struct Options {
    /// Demo program to run. `list` shows them all.
    program: String,

    /// Integer the program is sent to.
    #[clap(default_value_t = 25, allow_hyphen_values = true)]
    argument: i64,

    /// Bytes committed to the heap up front.
    #[clap(long)]
    heap_size: Option<usize>,

    /// Bytes the heap may grow to.
    #[clap(long)]
    max_heap_size: Option<usize>,

    /// Bytes allocated between two collections.
    #[clap(long)]
    gc_threshold: Option<usize>,

    /// Collect before every allocation.
    #[clap(long)]
    gc_stress: bool,

    /// Disassemble the program instead of running it.
    #[clap(long, short)]
    disassemble: bool,

    /// Enable verbose output (with timing and collector statistics).
    #[clap(long, short)]
    verbose: bool,
}

impl Options {
    fn universe_config(&self) -> UniverseConfig {
        let defaults = HeapConfig::default();
        UniverseConfig {
            heap: HeapConfig {
                initial_bytes: self.heap_size.unwrap_or(defaults.initial_bytes),
                max_bytes: self.max_heap_size.unwrap_or(defaults.max_bytes),
                collection_threshold: self.gc_threshold.unwrap_or(defaults.collection_threshold),
                stress: self.gc_stress,
                ..defaults
            },
            ..UniverseConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if opts.verbose { "info" } else { "warn" })).init();

    if opts.program == "list" {
        for demo in DEMOS {
            println!("{:<10} {}", demo.name, demo.summary);
        }
        return Ok(());
    }

    let demo = demos::find(&opts.program).ok_or_else(|| anyhow!("no demo program named `{}` (try `list`)", opts.program))?;
    let (mut universe, mut interpreter) = Universe::bootstrap(opts.universe_config()).context("could not bootstrap the virtual machine")?;

    if opts.disassemble {
        demos::install_all(&mut universe, &mut interpreter)?;
        let integer = universe.core.integer_class;
        let selector = universe.symbol(demo.selector).context("demo selector was not interned")?;
        let method = universe.lookup_method(integer, selector).context("demo method was not installed")?;
        println!("Integer>>#{}", demo.selector);
        print!("{}", disassemble(&universe, method));
        return Ok(());
    }

    let start = Instant::now();
    let result = demos::run(&mut universe, &mut interpreter, demo.name, opts.argument)?;
    let elapsed = start.elapsed();
    println!("{}", universe.describe(result));

    if opts.verbose {
        let stats = universe.gc_stats();
        info!("ran `{} {}` in {:?}", demo.name, opts.argument, elapsed);
        info!(
            "{} collections, {} objects ({} bytes) allocated, {} bytes reclaimed, {} bytes in use",
            stats.collections,
            stats.allocations,
            stats.allocated_bytes,
            stats.reclaimed_bytes,
            universe.heap.used_bytes()
        );
        let cache = interpreter.method_cache();
        info!(
            "method cache: {} hits, {} misses; {} contexts reused",
            cache.hits(),
            cache.misses(),
            interpreter.context_pool().reused()
        );
    }
    Ok(())
}
