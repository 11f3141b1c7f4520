//! Benchmark timing
//!
//! A benchmark runs `samples` batches of `iterations` calls back to back and
//! reports the best (lowest) mean time per call over all batches.

use std::time::{Duration, Instant};

use crate::error::Result;

/// Default number of timed batches.
pub const DEFAULT_SAMPLES: u32 = 3;

/// Default number of calls per batch.
pub const DEFAULT_ITERATIONS: u32 = 10;

/// Outcome of a benchmark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkResult {
    /// Best mean time per call, in seconds.
    pub best_seconds: f64,
    pub samples: u32,
    pub iterations: u32,
}

impl BenchmarkResult {
    /// Output megapixels produced per second at the best time.
    pub fn throughput(&self, megapixels: f64) -> f64 {
        if self.best_seconds > 0.0 {
            megapixels / self.best_seconds
        } else {
            f64::INFINITY
        }
    }
}

/// Lowest per-batch mean, in seconds. Returns `None` if there are no
/// batches or `iterations` is zero.
pub fn min_of_means(batch_totals: &[Duration], iterations: u32) -> Option<f64> {
    if iterations == 0 {
        return None;
    }
    batch_totals
        .iter()
        .map(|total| total.as_secs_f64() / f64::from(iterations))
        .min_by(|a, b| a.total_cmp(b))
}

/// Time `op`, which is called `samples * iterations` times.
///
/// The first error from `op` aborts the benchmark.
///
/// # Errors
///
/// Returns whatever `op` returns.
pub fn benchmark<F>(samples: u32, iterations: u32, mut op: F) -> Result<BenchmarkResult>
where
    F: FnMut() -> Result<()>,
{
    let samples = samples.max(1);
    let iterations = iterations.max(1);

    let mut totals = Vec::with_capacity(samples as usize);
    for sample in 0..samples {
        let start = Instant::now();
        for _ in 0..iterations {
            op()?;
        }
        let elapsed = start.elapsed();
        log::debug!(
            "Benchmark sample {}: {:.6} sec/iter",
            sample,
            elapsed.as_secs_f64() / f64::from(iterations)
        );
        totals.push(elapsed);
    }

    Ok(BenchmarkResult {
        best_seconds: min_of_means(&totals, iterations).unwrap_or(0.0),
        samples,
        iterations,
    })
}
