//! Parallel conversion: a worker pool assembles episodes and a single
//! consumer hands them to the sink in bounded batches.

use std::mem;
use std::thread;

use anyhow::{Context, Result, bail};
use crossbeam::channel::{Receiver, bounded};
use indicatif::ProgressBar;
use log::debug;
use rayon::prelude::*;

use crate::default_progress_bar;
use crate::discovery::EpisodePath;
use crate::episode::{AssemblyError, EpisodeAssembler, EpisodeSample};
use crate::sink::DatasetSink;
use crate::trajectory::TrajectoryLoader;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverOptions {
    /// Number of assembly threads.
    pub workers: usize,
    /// Paths (written or skipped) accumulated before the sink is flushed.
    pub max_paths_in_memory: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub written: usize,
    pub skipped: usize,
    pub steps: usize,
}

type Converted = Result<EpisodeSample, AssemblyError>;

/// Convert every path and feed the results to `sink`.
///
/// At most `workers` finished episodes wait in the channel and at most
/// `max_paths_in_memory` wait in the current batch; workers block once both
/// are full. Failed episodes are counted and dropped. A sink error stops the
/// run and is returned.
pub fn run_conversion<L, S>(
    paths: &[EpisodePath],
    assembler: &EpisodeAssembler<'_, L>,
    sink: &mut S,
    opts: &DriverOptions,
) -> Result<DriverStats>
where
    L: TrajectoryLoader + ?Sized,
    S: DatasetSink,
{
    if opts.workers == 0 || opts.max_paths_in_memory == 0 {
        bail!("workers and max_paths_in_memory must be > 0");
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.workers)
        .build()
        .context("failed to build rayon thread pool")?;
    let pb = default_progress_bar(paths.len() as u64);
    let (tx, rx) = bounded::<Converted>(opts.workers);

    let (consumed, produced) = thread::scope(|scope| {
        let producer = scope.spawn(move || {
            pool.install(|| {
                paths
                    .par_iter()
                    .try_for_each_with(tx, |tx, path| tx.send(assembler.convert(path)))
            })
        });
        let consumed = consume(rx, sink, opts.max_paths_in_memory, &pb);
        (consumed, producer.join())
    });

    let stats = consumed?;
    match produced {
        Ok(Ok(())) => {}
        Ok(Err(_)) => bail!("conversion stopped before all episodes were delivered"),
        Err(_) => bail!("a conversion worker panicked"),
    }
    pb.finish_with_message("episodes converted");
    Ok(stats)
}

fn consume<S: DatasetSink>(
    rx: Receiver<Converted>,
    sink: &mut S,
    batch_size: usize,
    pb: &ProgressBar,
) -> Result<DriverStats> {
    let mut stats = DriverStats::default();
    let mut batch = Vec::with_capacity(batch_size);
    let mut pending = 0usize;
    for result in rx.iter() {
        pb.inc(1);
        pending += 1;
        match result {
            Ok(sample) => batch.push(sample),
            Err(_) => stats.skipped += 1,
        }
        if pending >= batch_size {
            flush(sink, &mut batch, &mut stats)?;
            pending = 0;
        }
    }
    flush(sink, &mut batch, &mut stats)?;
    Ok(stats)
}

fn flush<S: DatasetSink>(
    sink: &mut S,
    batch: &mut Vec<EpisodeSample>,
    stats: &mut DriverStats,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let episodes = batch.len();
    stats.steps += sink.write_batch(mem::take(batch))?;
    stats.written += episodes;
    debug!("flushed {episodes} episodes ({} written so far)", stats.written);
    Ok(())
}
