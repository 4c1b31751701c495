use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::SmoothError;
use crate::particle::ParticleStore;

#[inline]
pub(crate) fn timing_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("SMOOTH_TIMING")
            .map(|v| {
                let v = v.trim();
                !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
            })
            .unwrap_or(false)
    })
}

#[inline]
pub(crate) fn log_timing(label: &str, dt: Duration) {
    eprintln!("[smooth-timing] {label}: {:.3} ms", dt.as_secs_f64() * 1e3);
}

/// Per-axis wrap lengths; `f64::INFINITY` disables wrapping on an axis.
pub type Period = [f64; 3];

/// All axes unwrapped.
pub const NO_WRAP: Period = [f64::INFINITY; 3];

/// Convert the optional per-axis form used at the public seam.
#[inline]
pub fn period_from_options(period: [Option<f64>; 3]) -> Period {
    [
        period[0].unwrap_or(f64::INFINITY),
        period[1].unwrap_or(f64::INFINITY),
        period[2].unwrap_or(f64::INFINITY),
    ]
}

/// Minimum-image difference along one axis.
#[inline]
pub(crate) fn wrap_delta(d: f64, period: f64) -> f64 {
    if period.is_finite() {
        d - period * (d / period).round()
    } else {
        d
    }
}

/// Squared distance between two points under per-axis minimum image.
#[inline]
pub fn wrapped_dist2(a: &[f64; 3], b: &[f64; 3], period: &Period) -> f64 {
    let dx = wrap_delta(a[0] - b[0], period[0]);
    let dy = wrap_delta(a[1] - b[1], period[1]);
    let dz = wrap_delta(a[2] - b[2], period[2]);
    dx.mul_add(dx, dy.mul_add(dy, dz * dz))
}

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug)]
pub struct Bounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Bounds {
    fn of_positions<'a>(positions: impl Iterator<Item = &'a [f64; 3]>) -> Bounds {
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for p in positions {
            for k in 0..3 {
                if p[k] < min[k] {
                    min[k] = p[k];
                }
                if p[k] > max[k] {
                    max[k] = p[k];
                }
            }
        }
        Bounds { min, max }
    }

    #[inline]
    pub fn contains(&self, other: &Bounds) -> bool {
        (0..3).all(|k| self.min[k] <= other.min[k] && other.max[k] <= self.max[k])
    }

    /// Minimum squared distance from a point to the box under per-axis
    /// minimum image. Assumes the box extent does not exceed the wrap
    /// length on any wrapped axis.
    #[inline]
    fn min_dist2(&self, p: &[f64; 3], period: &Period) -> f64 {
        let mut s = 0.0;
        for k in 0..3 {
            let mid = 0.5 * (self.min[k] + self.max[k]);
            let half = 0.5 * (self.max[k] - self.min[k]);
            let d = wrap_delta(p[k] - mid, period[k]);
            let gap = (d.abs() - half).max(0.0);
            s += gap * gap;
        }
        s
    }
}

/// One node of the arena. `first..last` is the node's contiguous particle
/// run in the tree-owned store; leaves have no children and at most
/// `bucket` particles.
#[derive(Clone, Copy, Debug)]
pub struct KdNode {
    pub bounds: Bounds,
    pub split_dim: usize,
    pub split_val: f64,
    pub children: Option<(usize, usize)>, // indices into the node arena
    pub first: usize,
    pub last: usize,
}

impl KdNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.last - self.first
    }
}

// Max-heap entry for the bounded k-nearest search.
#[derive(Clone, Copy)]
struct Candidate {
    d2: f64,
    idx: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.d2.total_cmp(&other.d2) == Ordering::Equal
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.d2.total_cmp(&other.d2)
    }
}

/// Balanced KD-tree over a particle store.
///
/// Built once, then read-only: concurrent queries from independent
/// sessions are safe. The tree owns the store and physically reorders it
/// into per-leaf contiguous runs; `Particle::order` is the reverse
/// permutation back to caller-visible identifiers.
#[derive(Debug)]
pub struct KdTree {
    store: ParticleStore,
    nodes: Vec<KdNode>,
    bucket: usize,
}

impl KdTree {
    /// One-time O(P log P) build. Split axis is the widest bounding-box
    /// extent; the split is the median of the run along that axis, so the
    /// two halves differ by at most one particle.
    pub fn build(store: ParticleStore, bucket: usize) -> Result<KdTree, SmoothError> {
        if store.is_empty() {
            return Err(SmoothError::EmptyParticleSet);
        }
        let t0 = if timing_enabled() {
            Some(Instant::now())
        } else {
            None
        };

        let n = store.len();
        let bounds = Bounds::of_positions(store.particles().iter().map(|p| &p.r));
        let mut tree = KdTree {
            store,
            nodes: Vec::new(),
            bucket: bucket.max(1),
        };
        tree.nodes.push(KdNode {
            bounds,
            split_dim: 0,
            split_val: 0.0,
            children: None,
            first: 0,
            last: n,
        });
        tree.split_node(0);

        if let Some(t0) = t0 {
            log_timing("kdtree.build", t0.elapsed());
        }
        Ok(tree)
    }

    fn split_node(&mut self, node_idx: usize) {
        let (first, last, bounds) = {
            let nd = &self.nodes[node_idx];
            (nd.first, nd.last, nd.bounds)
        };
        if last - first <= self.bucket {
            return;
        }

        let mut dim = 0;
        let mut spread = bounds.max[0] - bounds.min[0];
        for k in 1..3 {
            let s = bounds.max[k] - bounds.min[k];
            if s > spread {
                spread = s;
                dim = k;
            }
        }

        let mid = first + (last - first) / 2;
        let run = &mut self.store.particles_mut()[first..last];
        run.select_nth_unstable_by(mid - first, |a, b| a.r[dim].total_cmp(&b.r[dim]));
        let split_val = self.store.particles()[mid].r[dim];

        let lower_bounds =
            Bounds::of_positions(self.store.particles()[first..mid].iter().map(|p| &p.r));
        let upper_bounds =
            Bounds::of_positions(self.store.particles()[mid..last].iter().map(|p| &p.r));

        let lower = self.nodes.len();
        self.nodes.push(KdNode {
            bounds: lower_bounds,
            split_dim: 0,
            split_val: 0.0,
            children: None,
            first,
            last: mid,
        });
        let upper = self.nodes.len();
        self.nodes.push(KdNode {
            bounds: upper_bounds,
            split_dim: 0,
            split_val: 0.0,
            children: None,
            first: mid,
            last,
        });

        {
            let nd = &mut self.nodes[node_idx];
            nd.split_dim = dim;
            nd.split_val = split_val;
            nd.children = Some((lower, upper));
        }

        self.split_node(lower);
        self.split_node(upper);
    }

    #[inline]
    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    #[inline]
    pub fn nodes(&self) -> &[KdNode] {
        &self.nodes
    }

    #[inline]
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    #[inline]
    pub fn root_bounds(&self) -> &Bounds {
        &self.nodes[0].bounds
    }

    /// Bounded k-nearest query. Fills the scratch buffers with up to `k`
    /// internal indices and squared distances, in unspecified order. The
    /// particle at the query point itself is a legitimate member of the
    /// pool; ask for k+1 to exclude it.
    pub fn nearest_neighbors(
        &self,
        center: &[f64; 3],
        k: usize,
        period: &Period,
        out_idx: &mut Vec<usize>,
        out_d2: &mut Vec<f64>,
    ) {
        out_idx.clear();
        out_d2.clear();
        if k == 0 {
            return;
        }
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        self.knn_node(0, center, k, period, &mut heap);
        for c in heap {
            out_idx.push(c.idx);
            out_d2.push(c.d2);
        }
    }

    fn knn_node(
        &self,
        node_idx: usize,
        center: &[f64; 3],
        k: usize,
        period: &Period,
        heap: &mut BinaryHeap<Candidate>,
    ) {
        let nd = &self.nodes[node_idx];
        let bound = if heap.len() == k {
            heap.peek().map(|c| c.d2).unwrap_or(f64::INFINITY)
        } else {
            f64::INFINITY
        };
        if nd.bounds.min_dist2(center, period) > bound {
            return;
        }

        match nd.children {
            None => {
                let parts = self.store.particles();
                for i in nd.first..nd.last {
                    let d2 = wrapped_dist2(center, &parts[i].r, period);
                    if heap.len() < k {
                        heap.push(Candidate { d2, idx: i });
                    } else if d2 < heap.peek().map(|c| c.d2).unwrap_or(f64::INFINITY) {
                        heap.pop();
                        heap.push(Candidate { d2, idx: i });
                    }
                }
            }
            Some((lower, upper)) => {
                // Nearer child first so the heap bound tightens early.
                let d_lo = self.nodes[lower].bounds.min_dist2(center, period);
                let d_hi = self.nodes[upper].bounds.min_dist2(center, period);
                let (a, b) = if d_lo <= d_hi {
                    (lower, upper)
                } else {
                    (upper, lower)
                };
                self.knn_node(a, center, k, period, heap);
                self.knn_node(b, center, k, period, heap);
            }
        }
    }

    /// Fixed-radius gather: every particle with squared distance <= `r2`.
    /// Returns the number of particles emitted into the scratch buffers.
    pub fn ball_gather(
        &self,
        center: &[f64; 3],
        r2: f64,
        period: &Period,
        out_idx: &mut Vec<usize>,
        out_d2: &mut Vec<f64>,
    ) -> usize {
        out_idx.clear();
        out_d2.clear();
        self.gather_node(0, center, r2, period, out_idx, out_d2);
        out_idx.len()
    }

    fn gather_node(
        &self,
        node_idx: usize,
        center: &[f64; 3],
        r2: f64,
        period: &Period,
        out_idx: &mut Vec<usize>,
        out_d2: &mut Vec<f64>,
    ) {
        let nd = &self.nodes[node_idx];
        if nd.bounds.min_dist2(center, period) > r2 {
            return;
        }
        match nd.children {
            None => {
                let parts = self.store.particles();
                for i in nd.first..nd.last {
                    let d2 = wrapped_dist2(center, &parts[i].r, period);
                    if d2 <= r2 {
                        out_idx.push(i);
                        out_d2.push(d2);
                    }
                }
            }
            Some((lower, upper)) => {
                self.gather_node(lower, center, r2, period, out_idx, out_d2);
                self.gather_node(upper, center, r2, period, out_idx, out_d2);
            }
        }
    }
}
