//! M4 cubic-spline kernel and the symmetric pairwise accumulators.
//!
//! All evaluators consume one particle's gathered ball (neighbour indices
//! plus squared distances, internal order) and update both endpoints of
//! every pair in the same traversal. The kernel carries a factor 0.5 in
//! its normalisation because each unordered pair is visited once from
//! each side over a full pass, once with each particle's smoothing scale:
//! the summed weight is the symmetrised 0.5 * (W(h_i) + W(h_j)).

use std::f64::consts::FRAC_1_PI;

use crate::particle::Particle;
use crate::tree::{wrap_delta, Period};

/// Unnormalised spline weight as a function of u^2 = r^2 * ih2,
/// where ih2 = 4 / ball2 = 1 / h^2. Compact support ends at u = 2,
/// which the gather radius guarantees (r^2 <= ball2 implies u^2 <= 4).
#[inline]
pub fn spline_weight(u2: f64) -> f64 {
    let u = u2.sqrt();
    if u2 < 1.0 {
        1.0 - 0.75 * (2.0 - u) * u2
    } else {
        let t = 2.0 - u;
        0.25 * t * t * t
    }
}

/// Radial gradient factor (dW/du)/u on the same domain, so that the
/// vector gradient of the kernel is this factor times the separation.
#[inline]
pub fn spline_weight_gradient(u2: f64) -> f64 {
    let u = u2.sqrt();
    if u2 < 1.0 {
        -3.0 + 2.25 * u
    } else {
        let t = 2.0 - u;
        -0.75 * t * t / u
    }
}

// Normalisations: W carries 1/h^3, its gradient 1/h^4. The 0.5 is the
// symmetric-pass pair-sharing factor described in the module docs.
#[inline]
fn norm_w(ih2: f64) -> f64 {
    0.5 * FRAC_1_PI * ih2.sqrt() * ih2
}

#[inline]
fn norm_dw(ih2: f64) -> f64 {
    0.5 * FRAC_1_PI * ih2 * ih2
}

/// rho_i += W m_j and rho_j += W m_i for every neighbour j in i's ball.
pub fn density_sym(
    parts: &[Particle],
    ball2_i: f64,
    pi: usize,
    nn: &[usize],
    d2: &[f64],
    density: &mut [f64],
) {
    let ih2 = 4.0 / ball2_i;
    let f = norm_w(ih2);
    let mi = parts[pi].mass;
    for (&pj, &r2) in nn.iter().zip(d2) {
        let w = f * spline_weight(r2 * ih2);
        density[pi] += w * parts[pj].mass;
        density[pj] += w * mi;
    }
}

/// Kernel-weighted volume average of neighbour velocities, both endpoints.
/// Requires completed densities for every particle in range.
pub fn mean_vel_sym(
    parts: &[Particle],
    ball2_i: f64,
    pi: usize,
    nn: &[usize],
    d2: &[f64],
    density: &[f64],
    v_mean: &mut [[f64; 3]],
) {
    let ih2 = 4.0 / ball2_i;
    let f = norm_w(ih2);
    let mi = parts[pi].mass;
    let vi = parts[pi].v;
    let rho_i = density[pi];
    for (&pj, &r2) in nn.iter().zip(d2) {
        let w = f * spline_weight(r2 * ih2);
        let wj = w * parts[pj].mass / density[pj];
        let wi = w * mi / rho_i;
        for k in 0..3 {
            v_mean[pi][k] += wj * parts[pj].v[k];
            v_mean[pj][k] += wi * vi[k];
        }
    }
}

/// SPH velocity divergence: div_i -= (dW/du)/u (dv . dr) m_j / rho_j,
/// both endpoints. Negative for converging flow. The self pair has
/// dv . dr = 0 and contributes nothing.
#[allow(clippy::too_many_arguments)]
pub fn div_v_sym(
    parts: &[Particle],
    ball2_i: f64,
    pi: usize,
    nn: &[usize],
    d2: &[f64],
    period: &Period,
    density: &[f64],
    div_v: &mut [f64],
) {
    let ih2 = 4.0 / ball2_i;
    let f1 = norm_dw(ih2);
    let mi = parts[pi].mass;
    let rho_i = density[pi];
    for (&pj, &r2) in nn.iter().zip(d2) {
        let g = f1 * spline_weight_gradient(r2 * ih2);
        let mut dvdr = 0.0;
        for k in 0..3 {
            let dr = wrap_delta(parts[pi].r[k] - parts[pj].r[k], period[k]);
            let dv = parts[pi].v[k] - parts[pj].v[k];
            dvdr += dv * dr;
        }
        div_v[pi] -= g * dvdr * parts[pj].mass / density[pj];
        div_v[pj] -= g * dvdr * mi / rho_i;
    }
}

/// Mean-square residual velocity, with the local bulk flow removed: the
/// residual of j seen from i is v_j - vmean_i - (div_i / 3) (r_j - r_i),
/// hence the dependency on completed mean velocities and divergences.
#[allow(clippy::too_many_arguments)]
pub fn vel_disp_sym(
    parts: &[Particle],
    ball2_i: f64,
    pi: usize,
    nn: &[usize],
    d2: &[f64],
    period: &Period,
    density: &[f64],
    v_mean: &[[f64; 3]],
    div_v: &[f64],
    vel2: &mut [f64],
) {
    let ih2 = 4.0 / ball2_i;
    let f = norm_w(ih2);
    let mi = parts[pi].mass;
    let rho_i = density[pi];
    for (&pj, &r2) in nn.iter().zip(d2) {
        let w = f * spline_weight(r2 * ih2);
        let mut t2_i = 0.0;
        let mut t2_j = 0.0;
        for k in 0..3 {
            // r_j relative to r_i, minimum image
            let dr = wrap_delta(parts[pj].r[k] - parts[pi].r[k], period[k]);
            let ti = parts[pj].v[k] - v_mean[pi][k] - div_v[pi] * dr / 3.0;
            let tj = parts[pi].v[k] - v_mean[pj][k] + div_v[pj] * dr / 3.0;
            t2_i += ti * ti;
            t2_j += tj * tj;
        }
        vel2[pi] += w * parts[pj].mass / density[pj] * t2_i;
        vel2[pj] += w * mi / rho_i * t2_j;
    }
}
