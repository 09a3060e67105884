use log::info;
use rayon::ThreadPoolBuilder;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::error::{GseaError, Result};

////////////////
// Structures //
////////////////

/// One unit of work handed to a worker thread
///
/// ### Fields
///
/// * `samples` - The contiguous sample range of this worker.
/// * `out` - The worker's disjoint slice of the sample-major result buffer.
/// * `reporter` - Only the last dispatched worker is flagged; it is the one
///   that emits progress.
#[derive(Debug)]
pub struct WorkerTask<'a> {
    pub samples: Range<usize>,
    pub out: &'a mut [f64],
    pub reporter: bool,
}

/// Best effort progress logging for the designated reporter
///
/// ### Fields
///
/// * `label` - What is being counted, used in the log line.
/// * `total` - Number of items the reporter will process.
/// * `interval` - Log every `interval` items; `0` disables logging.
/// * `started` - Start of the reporter's work.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    label: &'static str,
    total: usize,
    interval: usize,
    started: Instant,
}

impl ProgressLog {
    pub fn new(label: &'static str, total: usize, interval: usize) -> Self {
        Self {
            label,
            total,
            interval,
            started: Instant::now(),
        }
    }

    /// Log progress after `done` items if this is an interval boundary
    pub fn tick(&self, done: usize) {
        if self.interval == 0 || done == 0 || done % self.interval != 0 {
            return;
        }
        let eta = linear_eta(done, self.total, self.started.elapsed());
        info!(
            "{} {}/{} ETA: {:.1} min",
            self.label,
            done,
            self.total,
            eta.as_secs_f64() / 60.0
        );
    }
}

/////////////
// Helpers //
/////////////

/// Resolve the number of worker threads
///
/// ### Params
///
/// * `n_threads` - Requested threads, `0` for all available hardware
///   parallelism.
///
/// ### Returns
///
/// The number of threads to use, at least 1.
pub fn resolve_threads(n_threads: usize) -> usize {
    if n_threads == 0 {
        rayon::current_num_threads().max(1)
    } else {
        n_threads
    }
}

/// Split the samples into contiguous ranges, one per thread
///
/// Every range holds `n_samples / n_threads` samples and the last range
/// additionally absorbs the remainder `n_samples % n_threads`.
///
/// ### Params
///
/// * `n_samples` - Number of samples to split.
/// * `n_threads` - Number of threads, `0` for all hardware threads.
///
/// ### Returns
///
/// Vector of `n_threads` ranges covering `0..n_samples`.
pub fn partition_samples(n_samples: usize, n_threads: usize) -> Vec<Range<usize>> {
    let n_threads = resolve_threads(n_threads);
    let per_thread = n_samples / n_threads;
    let remainder = n_samples % n_threads;

    (0..n_threads)
        .map(|t| {
            let start = t * per_thread;
            let mut end = start + per_thread;
            if t == n_threads - 1 {
                end += remainder;
            }
            start..end
        })
        .collect()
}

/// Linear extrapolation of the remaining time
///
/// ### Params
///
/// * `done` - Items processed so far.
/// * `total` - Items to process overall.
/// * `elapsed` - Time spent for the processed items.
///
/// ### Returns
///
/// `(total - done) * elapsed / done`, zero if nothing was processed yet.
pub fn linear_eta(done: usize, total: usize, elapsed: Duration) -> Duration {
    if done == 0 || done >= total {
        return Duration::ZERO;
    }
    elapsed.mul_f64((total - done) as f64 / done as f64)
}

//////////////
// Dispatch //
//////////////

/// Run a job over all samples on a dedicated pool and wait for completion
///
/// A fresh pool with `n_threads` threads is built for this invocation and
/// dropped before returning. The result buffer is split into disjoint
/// slices, one per range from `partition_samples()`, so workers never share
/// a slot. The call returns only after every worker finished.
///
/// ### Params
///
/// * `n_threads` - Number of threads, `0` for all hardware threads.
/// * `row_width` - Number of values per sample in `out`.
/// * `out` - Sample-major result buffer of `n_samples * row_width` values.
/// * `job` - The work to run per task.
///
/// ### Returns
///
/// The first error returned by any worker, if any.
pub fn dispatch<F>(n_threads: usize, row_width: usize, out: &mut [f64], job: F) -> Result<()>
where
    F: Fn(WorkerTask<'_>) -> Result<()> + Sync,
{
    let n_threads = resolve_threads(n_threads);
    if row_width == 0 || out.len() % row_width != 0 {
        return Err(GseaError::PreconditionViolation(format!(
            "result buffer of length {} cannot hold rows of width {}",
            out.len(),
            row_width
        )));
    }
    let n_samples = out.len() / row_width;
    let ranges = partition_samples(n_samples, n_threads);
    let last = ranges.len() - 1;

    let pool = ThreadPoolBuilder::new().num_threads(n_threads).build()?;
    let mut statuses: Vec<Result<()>> = (0..ranges.len()).map(|_| Ok(())).collect();

    pool.scope(|s| {
        let job = &job;
        let mut rest: &mut [f64] = out;
        for ((idx, samples), status) in ranges.into_iter().enumerate().zip(statuses.iter_mut()) {
            let (slice, tail) = std::mem::take(&mut rest).split_at_mut(samples.len() * row_width);
            rest = tail;
            s.spawn(move |_| {
                *status = job(WorkerTask {
                    samples,
                    out: slice,
                    reporter: idx == last,
                });
            });
        }
    });

    statuses.into_iter().collect::<Result<Vec<()>>>()?;

    Ok(())
}
