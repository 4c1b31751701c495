use thiserror::Error;

/// Errors reported by the load, query and smoothing layers.
///
/// Load errors leave no partial index behind; phase errors leave the
/// session untouched so the caller can run the missing pass and retry.
#[derive(Debug, Error)]
pub enum SmoothError {
    #[error("empty particle set")]
    EmptyParticleSet,

    #[error("array length mismatch: positions {positions}, velocities {velocities}, masses {masses}")]
    LengthMismatch {
        positions: usize,
        velocities: usize,
        masses: usize,
    },

    #[error("non-finite position coordinate at particle {index}")]
    NonFinitePosition { index: usize },

    #[error("target neighbour count must be at least 1")]
    ZeroNeighbourCount,

    #[error("target neighbour count {n_smooth} exceeds particle count {n_particles}")]
    NeighbourCountExceedsParticles {
        n_smooth: usize,
        n_particles: usize,
    },

    #[error("search radius for particle {order} failed to enclose {n_smooth} neighbours after {doublings} doublings")]
    RadiusDiverged {
        order: usize,
        n_smooth: usize,
        doublings: usize,
    },

    #[error("seed array has length {got}, expected {expected}")]
    SeedLengthMismatch { got: usize, expected: usize },

    #[error("seed value for particle {order} is not finite and positive")]
    InvalidSeedValue { order: usize },

    #[error("{property} requires the {missing} pass to have completed over all particles")]
    MissingDependencyPass {
        property: &'static str,
        missing: &'static str,
    },

    #[error("output array has length {got}, expected {expected}")]
    OutputLengthMismatch { got: usize, expected: usize },

    #[error("wrong output shape for property {property}")]
    OutputShapeMismatch { property: &'static str },
}
