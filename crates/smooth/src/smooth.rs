use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::error::SmoothError;
use crate::kernel;
use crate::tree::{log_timing, period_from_options, timing_enabled, KdTree, Period};

/// Retry ceiling for the adaptive radius search. `open` already rejects
/// target counts larger than the particle set, so in practice this only
/// trips on pathological radius arithmetic.
pub const MAX_DOUBLINGS: usize = 64;

// Below this the per-particle radius convergence stays serial.
const PARALLEL_MIN_PARTICLES: usize = 1024;

/// Property selectors for `SmoothingSession::compute`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Property {
    SmoothingLength,
    Density,
    MeanVelocity,
    VelocityDivergence,
    VelocityDispersion,
}

impl Property {
    pub fn name(self) -> &'static str {
        match self {
            Property::SmoothingLength => "smoothing-length",
            Property::Density => "density",
            Property::MeanVelocity => "mean-velocity",
            Property::VelocityDivergence => "velocity-divergence",
            Property::VelocityDispersion => "velocity-dispersion",
        }
    }
}

/// Output buffer for `compute`, indexed by external identifier.
/// Mean velocity is the only vector-valued property.
pub enum PropertyOutput<'a> {
    Scalar(&'a mut [f64]),
    Vector(&'a mut [[f64; 3]]),
}

/// One record of the step protocol: the particle just visited, its
/// converged squared search radius, and its neighbour set translated to
/// external identifiers. Neighbour order is unspecified.
pub struct SmoothStep<'a> {
    pub order: usize,
    pub ball2: f64,
    pub neighbours: &'a [usize],
    pub dist2: &'a [f64],
}

/// A transient smoothing session over one immutable tree.
///
/// The session owns every piece of mutable state: the per-particle
/// squared search radii, the derived-quantity accumulators, and the
/// neighbour scratch buffers. Many sessions may query the same tree
/// concurrently; a single session must not be advanced from two threads.
#[derive(Debug)]
pub struct SmoothingSession {
    tree: Arc<KdTree>,
    n_smooth: usize,
    period: Period,
    ball2: Vec<f64>,
    density: Vec<f64>,
    v_mean: Vec<[f64; 3]>,
    div_v: Vec<f64>,
    vel2: Vec<f64>,
    cursor: usize,
    nn_idx: Vec<usize>,
    nn_d2: Vec<f64>,
    nn_orders: Vec<usize>,
    doublings: usize,
    has_density: bool,
}

impl SmoothingSession {
    /// Open a session. Radii start unknown (zero) unless seeded; target
    /// counts of zero or beyond the particle count are rejected up front
    /// since no radius could ever satisfy them.
    pub fn open(
        tree: Arc<KdTree>,
        n_smooth: usize,
        period: [Option<f64>; 3],
    ) -> Result<SmoothingSession, SmoothError> {
        if n_smooth == 0 {
            return Err(SmoothError::ZeroNeighbourCount);
        }
        let n = tree.store().len();
        if n_smooth > n {
            return Err(SmoothError::NeighbourCountExceedsParticles {
                n_smooth,
                n_particles: n,
            });
        }
        Ok(SmoothingSession {
            tree,
            n_smooth,
            period: period_from_options(period),
            ball2: vec![0.0; n],
            density: vec![0.0; n],
            v_mean: vec![[0.0; 3]; n],
            div_v: vec![0.0; n],
            vel2: vec![0.0; n],
            cursor: 0,
            nn_idx: Vec::new(),
            nn_d2: Vec::new(),
            nn_orders: Vec::new(),
            doublings: 0,
            has_density: false,
        })
    }

    #[inline]
    pub fn n_particles(&self) -> usize {
        self.ball2.len()
    }

    #[inline]
    pub fn n_smooth(&self) -> usize {
        self.n_smooth
    }

    #[inline]
    pub fn tree(&self) -> &Arc<KdTree> {
        &self.tree
    }

    /// Total doubling retries spent since open or the last rewind.
    #[inline]
    pub fn doubling_count(&self) -> usize {
        self.doublings
    }

    /// Seed per-particle smoothing lengths, indexed by external
    /// identifier. Stored as ball2 = (2h)^2. Values must be finite and
    /// strictly positive.
    pub fn seed_smoothing_lengths(&mut self, smooth: &[f64]) -> Result<(), SmoothError> {
        let n = self.ball2.len();
        if smooth.len() != n {
            return Err(SmoothError::SeedLengthMismatch {
                got: smooth.len(),
                expected: n,
            });
        }
        let tree = Arc::clone(&self.tree);
        for (i, p) in tree.store().particles().iter().enumerate() {
            let h = smooth[p.order];
            if !(h.is_finite() && h > 0.0) {
                return Err(SmoothError::InvalidSeedValue { order: p.order });
            }
            self.ball2[i] = 4.0 * h * h;
        }
        Ok(())
    }

    /// Seed per-particle densities, indexed by external identifier.
    /// Marks the density phase complete so dependent passes may run
    /// without a density pass of their own.
    pub fn seed_densities(&mut self, rho: &[f64]) -> Result<(), SmoothError> {
        let n = self.density.len();
        if rho.len() != n {
            return Err(SmoothError::SeedLengthMismatch {
                got: rho.len(),
                expected: n,
            });
        }
        let tree = Arc::clone(&self.tree);
        for (i, p) in tree.store().particles().iter().enumerate() {
            let r = rho[p.order];
            if !(r.is_finite() && r > 0.0) {
                return Err(SmoothError::InvalidSeedValue { order: p.order });
            }
            self.density[i] = r;
        }
        self.has_density = true;
        Ok(())
    }

    /// Advance the cursor by one particle: adaptive neighbour search,
    /// radius stored back, neighbour set reported. `None` once the pass
    /// is exhausted; `rewind` starts a new pass with the converged radii
    /// as seeds.
    pub fn step(&mut self) -> Result<Option<SmoothStep<'_>>, SmoothError> {
        let n = self.ball2.len();
        if self.cursor >= n {
            return Ok(None);
        }
        let pi = self.cursor;
        self.cursor += 1;

        let tree = Arc::clone(&self.tree);
        let (ball2, doublings) = adapt_radius(
            &tree,
            pi,
            self.n_smooth,
            &self.period,
            self.ball2[pi],
            &mut self.nn_idx,
            &mut self.nn_d2,
        )?;
        self.ball2[pi] = ball2;
        self.doublings += doublings;

        let parts = tree.store().particles();
        self.nn_orders.clear();
        for &j in &self.nn_idx {
            self.nn_orders.push(parts[j].order);
        }

        Ok(Some(SmoothStep {
            order: parts[pi].order,
            ball2,
            neighbours: &self.nn_orders,
            dist2: &self.nn_d2,
        }))
    }

    /// Reset the cursor to the first particle. Converged radii are kept,
    /// so subsequent passes converge without doubling retries; the retry
    /// counter restarts for the new pass.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.doublings = 0;
    }

    /// Converge the search radius of every particle, the bulk equivalent
    /// of stepping through a full pass. Per-particle searches are
    /// independent, so large sets run on the rayon pool with thread-local
    /// scratch.
    pub fn converge_radii(&mut self) -> Result<(), SmoothError> {
        let t0 = if timing_enabled() {
            Some(Instant::now())
        } else {
            None
        };

        let tree = Arc::clone(&self.tree);
        let n = self.ball2.len();
        let n_smooth = self.n_smooth;
        let period = self.period;

        if n < PARALLEL_MIN_PARTICLES {
            for pi in 0..n {
                let (b2, d) = adapt_radius(
                    &tree,
                    pi,
                    n_smooth,
                    &period,
                    self.ball2[pi],
                    &mut self.nn_idx,
                    &mut self.nn_d2,
                )?;
                self.ball2[pi] = b2;
                self.doublings += d;
            }
        } else {
            let tree_ref: &KdTree = &tree;
            let total: usize = self
                .ball2
                .par_iter_mut()
                .enumerate()
                .map_init(
                    || (Vec::new(), Vec::new()),
                    |(idx, d2), (pi, b2)| -> Result<usize, SmoothError> {
                        let (nb, d) =
                            adapt_radius(tree_ref, pi, n_smooth, &period, *b2, idx, d2)?;
                        *b2 = nb;
                        Ok(d)
                    },
                )
                .try_reduce(|| 0, |a, b| Ok(a + b))?;
            self.doublings += total;
        }

        if let Some(t0) = t0 {
            log_timing("smooth.converge_radii", t0.elapsed());
        }
        Ok(())
    }

    /// Compute one property into an output array indexed by external
    /// identifier. Dependency passes run to completion over the whole
    /// particle set before anything is written; a missing precondition is
    /// an error, never silent zeros.
    pub fn compute(
        &mut self,
        property: Property,
        out: PropertyOutput<'_>,
    ) -> Result<(), SmoothError> {
        let n = self.ball2.len();
        match out {
            PropertyOutput::Scalar(ref s) => {
                if s.len() != n {
                    return Err(SmoothError::OutputLengthMismatch {
                        got: s.len(),
                        expected: n,
                    });
                }
            }
            PropertyOutput::Vector(ref v) => {
                if v.len() != n {
                    return Err(SmoothError::OutputLengthMismatch {
                        got: v.len(),
                        expected: n,
                    });
                }
            }
        }

        match (property, out) {
            (Property::SmoothingLength, PropertyOutput::Scalar(out)) => {
                self.converge_radii()?;
                let tree = Arc::clone(&self.tree);
                for (i, p) in tree.store().particles().iter().enumerate() {
                    out[p.order] = 0.5 * self.ball2[i].sqrt();
                }
                Ok(())
            }
            (Property::Density, PropertyOutput::Scalar(out)) => {
                self.density_pass()?;
                let tree = Arc::clone(&self.tree);
                for (i, p) in tree.store().particles().iter().enumerate() {
                    out[p.order] = self.density[i];
                }
                Ok(())
            }
            (Property::MeanVelocity, PropertyOutput::Vector(out)) => {
                self.mean_vel_pass()?;
                let tree = Arc::clone(&self.tree);
                for (i, p) in tree.store().particles().iter().enumerate() {
                    out[p.order] = self.v_mean[i];
                }
                Ok(())
            }
            (Property::VelocityDivergence, PropertyOutput::Scalar(out)) => {
                self.mean_vel_pass()?;
                self.div_v_pass()?;
                let tree = Arc::clone(&self.tree);
                for (i, p) in tree.store().particles().iter().enumerate() {
                    out[p.order] = self.div_v[i];
                }
                Ok(())
            }
            (Property::VelocityDispersion, PropertyOutput::Scalar(out)) => {
                self.mean_vel_pass()?;
                self.div_v_pass()?;
                self.vel_disp_pass()?;
                let tree = Arc::clone(&self.tree);
                for (i, p) in tree.store().particles().iter().enumerate() {
                    out[p.order] = self.vel2[i].sqrt();
                }
                Ok(())
            }
            (property, _) => Err(SmoothError::OutputShapeMismatch {
                property: property.name(),
            }),
        }
    }

    // Every accumulation pass gathers within the stored ball radius, so
    // radii must have converged (or been seeded) for all particles.
    fn require_radii(&self, property: &'static str) -> Result<(), SmoothError> {
        if self.ball2.iter().all(|&b2| b2 > 0.0) {
            Ok(())
        } else {
            Err(SmoothError::MissingDependencyPass {
                property,
                missing: "smoothing-length",
            })
        }
    }

    fn require_density(&self, property: &'static str) -> Result<(), SmoothError> {
        if self.has_density {
            Ok(())
        } else {
            Err(SmoothError::MissingDependencyPass {
                property,
                missing: "density",
            })
        }
    }

    fn density_pass(&mut self) -> Result<(), SmoothError> {
        self.require_radii("density")?;
        let t0 = if timing_enabled() {
            Some(Instant::now())
        } else {
            None
        };

        self.density.iter_mut().for_each(|d| *d = 0.0);
        let tree = Arc::clone(&self.tree);
        let parts = tree.store().particles();
        for pi in 0..parts.len() {
            tree.ball_gather(
                &parts[pi].r,
                self.ball2[pi],
                &self.period,
                &mut self.nn_idx,
                &mut self.nn_d2,
            );
            kernel::density_sym(
                parts,
                self.ball2[pi],
                pi,
                &self.nn_idx,
                &self.nn_d2,
                &mut self.density,
            );
        }
        self.has_density = true;

        if let Some(t0) = t0 {
            log_timing("smooth.density_pass", t0.elapsed());
        }
        Ok(())
    }

    fn mean_vel_pass(&mut self) -> Result<(), SmoothError> {
        self.require_radii("mean-velocity")?;
        self.require_density("mean-velocity")?;
        let t0 = if timing_enabled() {
            Some(Instant::now())
        } else {
            None
        };

        self.v_mean.iter_mut().for_each(|v| *v = [0.0; 3]);
        let tree = Arc::clone(&self.tree);
        let parts = tree.store().particles();
        for pi in 0..parts.len() {
            tree.ball_gather(
                &parts[pi].r,
                self.ball2[pi],
                &self.period,
                &mut self.nn_idx,
                &mut self.nn_d2,
            );
            kernel::mean_vel_sym(
                parts,
                self.ball2[pi],
                pi,
                &self.nn_idx,
                &self.nn_d2,
                &self.density,
                &mut self.v_mean,
            );
        }

        if let Some(t0) = t0 {
            log_timing("smooth.mean_vel_pass", t0.elapsed());
        }
        Ok(())
    }

    fn div_v_pass(&mut self) -> Result<(), SmoothError> {
        self.require_radii("velocity-divergence")?;
        self.require_density("velocity-divergence")?;
        let t0 = if timing_enabled() {
            Some(Instant::now())
        } else {
            None
        };

        self.div_v.iter_mut().for_each(|d| *d = 0.0);
        let tree = Arc::clone(&self.tree);
        let parts = tree.store().particles();
        for pi in 0..parts.len() {
            tree.ball_gather(
                &parts[pi].r,
                self.ball2[pi],
                &self.period,
                &mut self.nn_idx,
                &mut self.nn_d2,
            );
            kernel::div_v_sym(
                parts,
                self.ball2[pi],
                pi,
                &self.nn_idx,
                &self.nn_d2,
                &self.period,
                &self.density,
                &mut self.div_v,
            );
        }

        if let Some(t0) = t0 {
            log_timing("smooth.div_v_pass", t0.elapsed());
        }
        Ok(())
    }

    fn vel_disp_pass(&mut self) -> Result<(), SmoothError> {
        self.require_radii("velocity-dispersion")?;
        self.require_density("velocity-dispersion")?;
        let t0 = if timing_enabled() {
            Some(Instant::now())
        } else {
            None
        };

        self.vel2.iter_mut().for_each(|d| *d = 0.0);
        let tree = Arc::clone(&self.tree);
        let parts = tree.store().particles();
        for pi in 0..parts.len() {
            tree.ball_gather(
                &parts[pi].r,
                self.ball2[pi],
                &self.period,
                &mut self.nn_idx,
                &mut self.nn_d2,
            );
            kernel::vel_disp_sym(
                parts,
                self.ball2[pi],
                pi,
                &self.nn_idx,
                &self.nn_d2,
                &self.period,
                &self.density,
                &self.v_mean,
                &self.div_v,
                &mut self.vel2,
            );
        }

        if let Some(t0) = t0 {
            log_timing("smooth.vel_disp_pass", t0.elapsed());
        }
        Ok(())
    }
}

// Starting guess when a particle's radius is still unknown: scale the
// widest root extent by the expected neighbour fraction. Floored so that
// doubling makes progress even for fully coincident clouds.
fn initial_ball2(tree: &KdTree, n_smooth: usize) -> f64 {
    let b = tree.root_bounds();
    let mut ext: f64 = 0.0;
    for k in 0..3 {
        ext = ext.max(b.max[k] - b.min[k]);
    }
    let n = tree.store().len();
    let g = ext * (n_smooth as f64 / n as f64).cbrt();
    (g * g).max(f64::MIN_POSITIVE)
}

// Adaptive search for one particle: gather within the seeded radius,
// doubling it until the target count is enclosed, then keep the n_smooth
// nearest. Returns the squared distance to the k-th neighbour and the
// number of doublings spent.
fn adapt_radius(
    tree: &KdTree,
    pi: usize,
    n_smooth: usize,
    period: &Period,
    seed: f64,
    idx: &mut Vec<usize>,
    d2: &mut Vec<f64>,
) -> Result<(f64, usize), SmoothError> {
    let center = tree.store().particles()[pi].r;
    let mut r2 = if seed > 0.0 {
        seed
    } else {
        initial_ball2(tree, n_smooth)
    };

    let mut doublings = 0;
    loop {
        let count = tree.ball_gather(&center, r2, period, idx, d2);
        if count >= n_smooth {
            break;
        }
        if doublings >= MAX_DOUBLINGS {
            return Err(SmoothError::RadiusDiverged {
                order: tree.store().particles()[pi].order,
                n_smooth,
                doublings,
            });
        }
        // radius doubles, so the squared radius quadruples
        r2 *= 4.0;
        doublings += 1;
    }

    if idx.len() > n_smooth {
        let mut pairs: Vec<(f64, usize)> =
            d2.iter().copied().zip(idx.iter().copied()).collect();
        pairs.select_nth_unstable_by(n_smooth - 1, |a, b| a.0.total_cmp(&b.0));
        pairs.truncate(n_smooth);
        idx.clear();
        d2.clear();
        for (dist2, j) in pairs {
            idx.push(j);
            d2.push(dist2);
        }
    }
    // Fully coincident neighbour sets would report a zero radius, which
    // reads as "unknown"; keep it representable as converged.
    let kth = d2.iter().fold(0.0f64, |a, &b| a.max(b));
    Ok((kth.max(f64::MIN_POSITIVE), doublings))
}
