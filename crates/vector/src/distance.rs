//! Distance kernels.
//!
//! All kernels expose an internal *similarity*: higher is always better, so
//! the graph search keeps one heap discipline per metric.
//!
//! - Cosine: dot product over unit-norm inputs (vectors are normalised at
//!   write time when the metric is cosine).
//! - InnerProduct: dot product as-is.
//! - L2: negated squared distance. Squared distance orders identically to
//!   distance and skips the sqrt; the public score converts back to true
//!   distance at the API edge and never mixes the two.
//!
//! A backend is chosen once at startup by CPU feature detection. The trait
//! is the plug-in seam: an external accelerated implementation replaces the
//! kernel behind the same contract.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Supported metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Cosine similarity over unit-norm vectors.
    Cosine,
    /// Euclidean distance.
    L2,
    /// Raw inner product.
    InnerProduct,
}

impl DistanceMetric {
    /// Whether the public score sorts ascending (distance) or descending
    /// (similarity).
    pub fn lower_is_better(self) -> bool {
        matches!(self, DistanceMetric::L2)
    }
}

/// A distance kernel implementation.
pub trait DistanceBackend: Send + Sync {
    /// Implementation name, for logs.
    fn name(&self) -> &'static str;

    /// Dot product.
    fn dot(&self, a: &[f32], b: &[f32]) -> f32;

    /// Squared L2 distance.
    fn squared_l2(&self, a: &[f32], b: &[f32]) -> f32;

    /// Internal similarity: higher is better for every metric.
    fn similarity(&self, a: &[f32], b: &[f32], metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine | DistanceMetric::InnerProduct => self.dot(a, b),
            DistanceMetric::L2 => -self.squared_l2(a, b),
        }
    }
}

/// Convert an internal similarity to the public score for a metric:
/// similarity (higher-better) for cosine/IP, distance (lower-better) for L2.
pub fn public_score(internal: f32, metric: DistanceMetric) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::InnerProduct => internal,
        DistanceMetric::L2 => (-internal).max(0.0).sqrt(),
    }
}

/// Portable reference kernels.
pub struct ScalarBackend;

impl DistanceBackend for ScalarBackend {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    fn squared_l2(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum()
    }
}

/// AVX2 kernels, used when the CPU supports them.
#[cfg(target_arch = "x86_64")]
pub struct Avx2Backend;

#[cfg(target_arch = "x86_64")]
impl Avx2Backend {
    #[target_feature(enable = "avx2", enable = "fma")]
    unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
        use std::arch::x86_64::*;
        let chunks = a.len() / 8;
        let mut acc = _mm256_setzero_ps();
        for i in 0..chunks {
            let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
            acc = _mm256_fmadd_ps(va, vb, acc);
        }
        let mut lanes = [0.0f32; 8];
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        let mut sum: f32 = lanes.iter().sum();
        for i in chunks * 8..a.len() {
            sum += a[i] * b[i];
        }
        sum
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    unsafe fn squared_l2_avx2(a: &[f32], b: &[f32]) -> f32 {
        use std::arch::x86_64::*;
        let chunks = a.len() / 8;
        let mut acc = _mm256_setzero_ps();
        for i in 0..chunks {
            let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
            let d = _mm256_sub_ps(va, vb);
            acc = _mm256_fmadd_ps(d, d, acc);
        }
        let mut lanes = [0.0f32; 8];
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        let mut sum: f32 = lanes.iter().sum();
        for i in chunks * 8..a.len() {
            let d = a[i] - b[i];
            sum += d * d;
        }
        sum
    }
}

#[cfg(target_arch = "x86_64")]
impl DistanceBackend for Avx2Backend {
    fn name(&self) -> &'static str {
        "avx2"
    }

    fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        // Feature presence was verified by select_backend.
        unsafe { Self::dot_avx2(a, b) }
    }

    fn squared_l2(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        unsafe { Self::squared_l2_avx2(a, b) }
    }
}

static BACKEND: Lazy<&'static dyn DistanceBackend> = Lazy::new(|| {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            tracing::debug!(backend = "avx2", "distance backend selected");
            return &Avx2Backend;
        }
    }
    tracing::debug!(backend = "scalar", "distance backend selected");
    &ScalarBackend
});

/// The process-wide kernel, selected once by CPU feature detection.
pub fn select_backend() -> &'static dyn DistanceBackend {
    *BACKEND
}

/// L2-normalise in place. No-op on zero vectors.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
