//! Brute-force O(N^2) reference implementations, mainly for testing the
//! tree queries and the symmetric accumulation passes against.

use crate::kernel;
use crate::particle::Particle;
use crate::tree::{wrapped_dist2, Period};

/// The k nearest particles to a point by full scan, squared distances
/// ascending.
pub fn direct_nearest_neighbors(
    positions: &[[f64; 3]],
    center: &[f64; 3],
    k: usize,
    period: &Period,
) -> (Vec<usize>, Vec<f64>) {
    let mut pairs: Vec<(f64, usize)> = positions
        .iter()
        .enumerate()
        .map(|(i, p)| (wrapped_dist2(center, p, period), i))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    pairs.truncate(k);
    let idx = pairs.iter().map(|&(_, i)| i).collect();
    let d2 = pairs.iter().map(|&(d, _)| d).collect();
    (idx, d2)
}

/// Every particle within squared radius `r2` of a point, by full scan.
pub fn direct_ball_gather(
    positions: &[[f64; 3]],
    center: &[f64; 3],
    r2: f64,
    period: &Period,
) -> (Vec<usize>, Vec<f64>) {
    let mut idx = Vec::new();
    let mut d2 = Vec::new();
    for (i, p) in positions.iter().enumerate() {
        let dist2 = wrapped_dist2(center, p, period);
        if dist2 <= r2 {
            idx.push(i);
            d2.push(dist2);
        }
    }
    (idx, d2)
}

/// Symmetric kernel densities with brute-force ball gathers. `parts` and
/// `ball2` share the same (internal) order, as does the result.
pub fn direct_densities(parts: &[Particle], ball2: &[f64], period: &Period) -> Vec<f64> {
    let n = parts.len();
    let mut density = vec![0.0; n];
    let mut idx = Vec::new();
    let mut d2 = Vec::new();
    for pi in 0..n {
        idx.clear();
        d2.clear();
        for (j, pj) in parts.iter().enumerate() {
            let dist2 = wrapped_dist2(&parts[pi].r, &pj.r, period);
            if dist2 <= ball2[pi] {
                idx.push(j);
                d2.push(dist2);
            }
        }
        kernel::density_sym(parts, ball2[pi], pi, &idx, &d2, &mut density);
    }
    density
}
