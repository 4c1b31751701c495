//! KD-tree neighbour search and SPH-style kernel smoothing for particle
//! sets: adaptive smoothing lengths, densities, mean velocities,
//! velocity divergence and velocity dispersion, driven through a
//! resumable per-particle session protocol.

pub mod direct;
pub mod error;
pub mod kernel;
pub mod particle;
pub mod smooth;
pub mod tree;

pub use crate::error::SmoothError;
pub use crate::particle::{Particle, ParticleStore};
pub use crate::smooth::{
    Property, PropertyOutput, SmoothStep, SmoothingSession, MAX_DOUBLINGS,
};
pub use crate::tree::{period_from_options, wrapped_dist2, Bounds, KdNode, KdTree, Period, NO_WRAP};
