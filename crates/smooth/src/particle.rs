use crate::error::SmoothError;

/// One particle record. `order` is the caller-visible identifier assigned
/// at load time; the tree build permutes storage order but never `order`.
#[derive(Clone, Copy, Debug)]
pub struct Particle {
    pub order: usize,
    pub r: [f64; 3],
    pub v: [f64; 3],
    pub mass: f64,
}

/// Flat, owned particle array. Storage order is internal: after a tree
/// build it follows the leaf layout, and `order` is the only stable key.
#[derive(Clone, Debug)]
pub struct ParticleStore {
    particles: Vec<Particle>,
}

impl ParticleStore {
    /// Build a store from three equal-length arrays.
    ///
    /// Fails on an empty set, mismatched lengths, or non-finite position
    /// coordinates; no partial store is returned.
    pub fn from_arrays(
        positions: &[[f64; 3]],
        velocities: &[[f64; 3]],
        masses: &[f64],
    ) -> Result<Self, SmoothError> {
        if positions.len() != velocities.len() || positions.len() != masses.len() {
            return Err(SmoothError::LengthMismatch {
                positions: positions.len(),
                velocities: velocities.len(),
                masses: masses.len(),
            });
        }
        if positions.is_empty() {
            return Err(SmoothError::EmptyParticleSet);
        }
        for (i, p) in positions.iter().enumerate() {
            if !(p[0].is_finite() && p[1].is_finite() && p[2].is_finite()) {
                return Err(SmoothError::NonFinitePosition { index: i });
            }
        }

        let particles = positions
            .iter()
            .zip(velocities.iter())
            .zip(masses.iter())
            .enumerate()
            .map(|(i, ((&r, &v), &mass))| Particle {
                order: i,
                r,
                v,
                mass,
            })
            .collect();

        Ok(ParticleStore { particles })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    #[inline]
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    #[inline]
    pub(crate) fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
}
