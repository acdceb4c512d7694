//! Parallel per-object execution.
//!
//! Heavy computers fan per-object work out to a fixed worker pool.
//! Workers pull ids from one shared iterator behind a mutex — work
//! stealing, not static partitioning, so uneven per-object costs balance
//! out. Cancellation is polled under the iterator lock before each
//! dispatch; signaled workers drain without scheduling new objects.
//!
//! Also home to the numeric kit the intensity computers share: the
//! single-pass weighted mean/variance accumulator and separable Gaussian
//! sampling kernels.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::image::Affine3;

use super::{CancellationToken, ProgressSink};

// ============================================================================
// Work-stealing driver
// ============================================================================

/// Run `work` over every item, fanning out to `n_threads` scoped workers.
///
/// `init` runs once per worker and builds its scratch state (voxel
/// readers, kernel buffers) so the per-item path stays lock-free apart
/// from the shared iterator. Progress is reported as
/// `done_offset + items_processed` out of `total`.
pub fn for_each_parallel<T, S, I, F>(
    items: Vec<T>,
    n_threads: usize,
    cancel: &CancellationToken,
    progress: &dyn ProgressSink,
    done_offset: u64,
    total: u64,
    init: I,
    work: F,
) where
    T: Send,
    I: Fn() -> S + Sync,
    F: Fn(&mut S, T) + Sync,
{
    let shared = Mutex::new(items.into_iter());
    let done = AtomicU64::new(0);
    let n_threads = n_threads.max(1);

    std::thread::scope(|scope| {
        for _ in 0..n_threads {
            scope.spawn(|| {
                let mut scratch = init();
                loop {
                    // Pull-next-object is the only shared critical
                    // section; cancellation is checked under it so no new
                    // object is dispatched after the signal.
                    let item = {
                        let mut iter = shared.lock();
                        if cancel.is_canceled() {
                            return;
                        }
                        iter.next()
                    };
                    let Some(item) = item else { return };
                    work(&mut scratch, item);
                    let d = done.fetch_add(1, Ordering::Relaxed) + 1;
                    progress.progress(done_offset + d, total);
                }
            });
        }
    });
}

// ============================================================================
// Online weighted statistics
// ============================================================================

/// Single-pass weighted mean/variance accumulator (West 1979).
///
/// Numerically stable and requires no buffering of sampled voxels:
/// for weight `w` and value `x`,
/// `weighted_sum += w; mean += (w/weighted_sum)*(x - mean_old);
/// s += w*(x - mean_old)*(x - mean_new)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnlineStats {
    weighted_sum: f64,
    mean: f64,
    s: f64,
}

impl OnlineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, w: f64, x: f64) {
        if w <= 0.0 {
            return;
        }
        self.weighted_sum += w;
        let delta = x - self.mean;
        self.mean += (w / self.weighted_sum) * delta;
        self.s += w * delta * (x - self.mean);
    }

    /// Total weight accumulated so far. Zero means nothing was sampled —
    /// the caller must leave the result unset, not write 0.
    pub fn weight(&self) -> f64 {
        self.weighted_sum
    }

    pub fn is_empty(&self) -> bool {
        self.weighted_sum <= 0.0
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.weighted_sum > 0.0 {
            // Guard against tiny negative values from rounding.
            (self.s / self.weighted_sum).max(0.0)
        } else {
            0.0
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }
}

// ============================================================================
// Separable Gaussian kernels
// ============================================================================

/// Gaussian weights along one axis, centered at a sub-voxel position and
/// normalized to sum to 1. `start` is the first voxel coordinate covered.
#[derive(Debug, Clone, Default)]
pub struct AxisKernel {
    pub start: i64,
    pub weights: SmallVec<[f64; 16]>,
}

impl AxisKernel {
    /// Build the half-kernel support `[center - cutoff*sigma, center +
    /// cutoff*sigma]`, clamped to `[0, dim)`. Empty when the support
    /// falls entirely outside the volume.
    pub fn gaussian(center: f64, sigma: f64, cutoff_sigmas: f64, dim: i64) -> Self {
        let half = (cutoff_sigmas * sigma).max(1.0);
        let start = ((center - half).floor() as i64).max(0);
        let end = ((center + half).ceil() as i64 + 1).min(dim);
        if start >= end {
            return Self::default();
        }

        let inv_two_sigma2 = 1.0 / (2.0 * sigma * sigma);
        let mut weights: SmallVec<[f64; 16]> = SmallVec::with_capacity((end - start) as usize);
        let mut sum = 0.0;
        for v in start..end {
            let d = v as f64 - center;
            let w = (-d * d * inv_two_sigma2).exp();
            weights.push(w);
            sum += w;
        }
        if sum > 0.0 {
            for w in &mut weights {
                *w /= sum;
            }
        }
        Self { start, weights }
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Per-axis voxel scale of a voxel-to-physical transform: the norms of
/// the linear part's columns.
pub fn axis_scales(transform: &Affine3) -> [f64; 3] {
    let r = &transform.rows;
    let mut scales = [0.0; 3];
    for (axis, scale) in scales.iter_mut().enumerate() {
        *scale = (r[0][axis] * r[0][axis] + r[1][axis] * r[1][axis] + r[2][axis] * r[2][axis]).sqrt();
    }
    scales
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::NoopProgress;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_online_stats_constant_values() {
        let mut stats = OnlineStats::new();
        for _ in 0..100 {
            stats.add(0.37, 100.0);
        }
        assert!((stats.mean() - 100.0).abs() < 1e-12);
        assert!(stats.variance() < 1e-12);
    }

    #[test]
    fn test_online_stats_matches_two_pass() {
        let samples = [(1.0, 2.0), (2.0, 4.0), (0.5, -1.0), (3.0, 7.5), (1.5, 0.0)];
        let mut stats = OnlineStats::new();
        for (w, x) in samples {
            stats.add(w, x);
        }

        let wsum: f64 = samples.iter().map(|(w, _)| w).sum();
        let mean: f64 = samples.iter().map(|(w, x)| w * x).sum::<f64>() / wsum;
        let var: f64 = samples.iter().map(|(w, x)| w * (x - mean).powi(2)).sum::<f64>() / wsum;

        assert!((stats.mean() - mean).abs() < 1e-12);
        assert!((stats.variance() - var).abs() < 1e-12);
    }

    #[test]
    fn test_online_stats_zero_weight_ignored() {
        let mut stats = OnlineStats::new();
        stats.add(0.0, 1000.0);
        assert!(stats.is_empty());
    }

    #[test]
    fn test_axis_kernel_normalized_and_centered() {
        let k = AxisKernel::gaussian(10.3, 2.0, 3.0, 64);
        assert!(!k.is_empty());
        let sum: f64 = k.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        // Peak weight sits at the voxel nearest the center.
        let peak = k
            .weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0 as i64
            + k.start;
        assert_eq!(peak, 10);
    }

    #[test]
    fn test_axis_kernel_clamped_at_edges() {
        let k = AxisKernel::gaussian(0.5, 2.0, 3.0, 4);
        assert_eq!(k.start, 0);
        assert!(k.weights.len() <= 4);
        let sum: f64 = k.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_axis_kernel_outside_volume() {
        let k = AxisKernel::gaussian(100.0, 1.0, 3.0, 4);
        assert!(k.is_empty());
    }

    #[test]
    fn test_axis_scales() {
        let t = Affine3::scaling(0.5, 0.5, 2.0);
        assert_eq!(axis_scales(&t), [0.5, 0.5, 2.0]);
    }

    #[test]
    fn test_for_each_parallel_visits_all() {
        let visited = AtomicUsize::new(0);
        let items: Vec<u32> = (0..1000).collect();
        for_each_parallel(
            items,
            4,
            &CancellationToken::new(),
            &NoopProgress,
            0,
            1000,
            || (),
            |_, _| {
                visited.fetch_add(1, Ordering::Relaxed);
            },
        );
        assert_eq!(visited.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_for_each_parallel_cancel_drains() {
        let cancel = CancellationToken::new();
        let visited = AtomicUsize::new(0);
        let items: Vec<u32> = (0..10_000).collect();
        let cancel2 = cancel.clone();
        for_each_parallel(
            items,
            4,
            &cancel,
            &NoopProgress,
            0,
            10_000,
            || (),
            |_, i| {
                if i == 50 {
                    cancel2.cancel("test stop");
                }
                visited.fetch_add(1, Ordering::Relaxed);
            },
        );
        // Far from all items were dispatched after the signal.
        assert!(visited.load(Ordering::Relaxed) < 10_000);
        assert_eq!(cancel.reason(), Some("test stop".into()));
    }
}
