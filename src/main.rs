use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use srm::builtin::{self, Counts, WordIndex};
use srm::config::OPTION_PREFIX;
use srm::{Arg, Config, JobRegistry, Scheduler, VecInput};

/// Count numbers, copy the counts, and optionally index the words of a text
/// file. Engine options are passed as `-SRM:Key=value`.
#[derive(Parser)]
struct DemoArgs {
    /// Distinct numbers to count
    #[arg(short, long, default_value = "1000")]
    count: u64,

    /// How often every number occurs in the input
    #[arg(short, long, default_value = "4")]
    repeat: u64,

    /// Numbers per split
    #[arg(long, default_value = "100")]
    chunk: usize,

    /// Threads per process
    #[arg(short, long)]
    threads: Option<usize>,

    /// Directory for intermediate files
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Worker addresses, `host[:port]`, comma separated
    #[arg(short, long, value_delimiter = ',')]
    workers: Vec<String>,

    /// Text file whose words are indexed by line
    #[arg(long)]
    text: Option<PathBuf>,

    /// Shortest word kept by the index
    #[arg(long, default_value = "3")]
    min_len: usize,
}

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let (options, rest): (Vec<String>, Vec<String>) = std::env::args().partition(|a| a.starts_with(OPTION_PREFIX));
    let args = DemoArgs::parse_from(rest);

    let mut config = Config::from_args(&options)?;
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }
    if let Some(dir) = &args.dir {
        config = config.with_local_dir(dir);
    }
    if !args.workers.is_empty() {
        config = config.with_workers(args.workers.iter().cloned());
    }
    let config = Arc::new(config);

    let mut registry = JobRegistry::new();
    builtin::register_builtins(&mut registry)?;
    let registry = Arc::new(registry);

    let scheduler = Scheduler::connect(Arc::clone(&config), Arc::clone(&registry))?;
    info!(
        "Running as rank {} of {} with {} threads, {} partitions",
        scheduler.rank(),
        scheduler.num_workers(),
        config.threads,
        config.partitions()
    );

    let counts = count_numbers(&scheduler, &args)?;
    let doubled = copy_twice(&config, &registry, counts)?;
    report_counts(&doubled, &args)?;

    if let Some(path) = &args.text {
        index_text(&scheduler, path, args.min_len)?;
    }
    Ok(())
}

// Every number of 0..count, `repeat` times, counted on all ranks and gathered here
fn count_numbers(scheduler: &Scheduler, args: &DemoArgs) -> anyhow::Result<Counts> {
    let numbers: Vec<u64> = (0..args.repeat).flat_map(|_| 0..args.count).collect();
    let mut job = vec![
        Arg::shipped_input(builtin::NUMBERS, VecInput::new(numbers, args.chunk))?,
        Arg::constructed_mergeable(builtin::COUNTS, builtin::counts(scheduler.config())),
    ];
    let stats = scheduler.run(builtin::ADD_ONE, &mut job)?;
    info!(
        "{}: {} splits in {} iterations, {} failed, {}ms",
        builtin::ADD_ONE,
        stats.splits,
        stats.iterations,
        stats.failures,
        stats.elapsed_ms
    );
    if stats.failures > 0 {
        bail!("{} threads failed", stats.failures);
    }
    Ok(job.swap_remove(1).into_inner::<Counts>()?)
}

// Second stage over the gathered counts; copying twice doubles every value
fn copy_twice(config: &Arc<Config>, registry: &Arc<JobRegistry>, counts: Counts) -> anyhow::Result<Counts> {
    let local = Scheduler::new(Arc::clone(config), Arc::clone(registry))?;
    let mut job = vec![Arg::input(counts), Arg::mergeable(builtin::counts(config))];
    for _ in 0..2 {
        local.run(builtin::COPY, &mut job)?;
    }
    Ok(job.swap_remove(1).into_inner::<Counts>()?)
}

fn report_counts(counts: &Counts, args: &DemoArgs) -> anyhow::Result<()> {
    let expected = 2 * args.repeat;
    let mut keys = 0u64;
    for entry in counts.iter()? {
        let (key, value) = entry?;
        if value != expected {
            bail!("count of {} is {}, expected {}", key, value, expected);
        }
        keys += 1;
    }
    if keys != args.count {
        bail!("found {} keys, expected {}", keys, args.count);
    }
    println!("{} keys counted, each {} times", keys, expected);
    Ok(())
}

fn index_text(scheduler: &Scheduler, path: &Path, min_len: usize) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let lines: Vec<(u64, String)> = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i as u64 + 1, line.to_string()))
        .collect();

    let mut job = vec![
        Arg::shipped_input(builtin::LINES, VecInput::new(lines, 64))?,
        Arg::constructed_mergeable(builtin::WORD_INDEX, builtin::word_index(scheduler.config())),
        Arg::shipped_value(builtin::MIN_LEN, min_len)?,
    ];
    scheduler.run(builtin::INDEX_WORDS, &mut job)?;
    let index = job.swap_remove(1).into_inner::<WordIndex>()?;

    let mut busiest: Vec<(usize, String)> = Vec::new();
    for entry in index.iter()? {
        let (word, lines) = entry?;
        busiest.push((lines.len(), word));
    }
    busiest.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    println!("{} distinct words; most widespread:", busiest.len());
    for (i, (lines, word)) in busiest.iter().take(10).enumerate() {
        println!("{:2}: {} ({} lines)", i + 1, word, lines);
    }
    Ok(())
}
