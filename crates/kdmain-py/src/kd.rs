use std::sync::Arc;

use ndarray::ArrayView2;
use numpy::{PyArray1, PyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use rayon::ThreadPoolBuilder;

use smooth::{
    KdTree as CoreTree, ParticleStore, Property, PropertyOutput, SmoothError, SmoothingSession,
};

pub const PROPID_HSM: i64 = 1;
pub const PROPID_RHO: i64 = 2;
pub const PROPID_MEANVEL: i64 = 3;
pub const PROPID_VELDISP: i64 = 4;
pub const PROPID_DIVV: i64 = 5;

/// Helper: run a closure inside a dedicated rayon thread pool
/// when `threads > 0`; otherwise execute it directly (using the
/// global Rayon pool or pure serial code, depending on caller).
fn with_thread_pool<F, R>(threads: usize, f: F) -> PyResult<R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    if threads > 0 {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| PyRuntimeError::new_err(format!("failed to build thread pool: {e}")))?;
        Ok(pool.install(f))
    } else {
        Ok(f())
    }
}

fn to_py_err(err: SmoothError) -> PyErr {
    match err {
        SmoothError::RadiusDiverged { .. } | SmoothError::MissingDependencyPass { .. } => {
            PyRuntimeError::new_err(err.to_string())
        }
        _ => PyValueError::new_err(err.to_string()),
    }
}

fn read_vec3_array(arr: &PyArray2<f64>, what: &str) -> PyResult<Vec<[f64; 3]>> {
    let view: ArrayView2<'_, f64> = unsafe { arr.as_array() };
    if view.ndim() != 2 || view.shape()[1] != 3 {
        return Err(PyValueError::new_err(format!(
            "{what} must be (N,3) float64 array"
        )));
    }
    let n = view.shape()[0];
    let mut out: Vec<[f64; 3]> = Vec::with_capacity(n);
    for i in 0..n {
        out.push([view[[i, 0]], view[[i, 1]], view[[i, 2]]]);
    }
    Ok(out)
}

fn parse_period(period: Option<Vec<f64>>) -> PyResult<[Option<f64>; 3]> {
    match period {
        None => Ok([None, None, None]),
        Some(p) => {
            if p.len() != 3 {
                return Err(PyValueError::new_err("period must have three components"));
            }
            let mut out = [None, None, None];
            for k in 0..3 {
                if p[k].is_finite() {
                    if p[k] <= 0.0 {
                        return Err(PyValueError::new_err(
                            "period components must be positive or infinite",
                        ));
                    }
                    out[k] = Some(p[k]);
                }
            }
            Ok(out)
        }
    }
}

/// Python-facing KD-tree over a fixed particle set. The tree itself is
/// immutable after construction; all per-pass state lives in the
/// `SmoothCtx` objects handed out by `nn_start`.
#[pyclass]
pub struct KdTree {
    inner: Arc<CoreTree>,
}

#[pymethods]
impl KdTree {
    #[new]
    #[pyo3(signature = (positions, velocities, masses, n_bucket=16))]
    fn new(
        py: Python<'_>,
        positions: &PyArray2<f64>,
        velocities: &PyArray2<f64>,
        masses: &PyArray1<f64>,
        n_bucket: usize,
    ) -> PyResult<Self> {
        let pos = read_vec3_array(positions, "positions")?;
        let vel = read_vec3_array(velocities, "velocities")?;
        let mass = {
            let slice = unsafe { masses.as_slice()? };
            slice.to_vec()
        };
        if n_bucket == 0 {
            return Err(PyValueError::new_err("n_bucket must be at least 1"));
        }

        let inner = py.allow_threads(|| -> Result<CoreTree, SmoothError> {
            let store = ParticleStore::from_arrays(&pos, &vel, &mass)?;
            CoreTree::build(store, n_bucket)
        });
        Ok(KdTree {
            inner: Arc::new(inner.map_err(to_py_err)?),
        })
    }

    #[getter]
    fn n_particles(&self) -> usize {
        self.inner.store().len()
    }

    /// Open a smoothing context targeting `n_smooth` neighbours per
    /// particle. `smooth` and `rho` optionally seed the smoothing
    /// lengths and densities; `period` gives per-axis wrap lengths,
    /// with non-finite entries meaning no wrap on that axis.
    #[pyo3(signature = (n_smooth, smooth=None, rho=None, period=None))]
    fn nn_start(
        &self,
        n_smooth: usize,
        smooth: Option<&PyArray1<f64>>,
        rho: Option<&PyArray1<f64>>,
        period: Option<Vec<f64>>,
    ) -> PyResult<SmoothCtx> {
        let period = parse_period(period)?;
        let mut session =
            SmoothingSession::open(Arc::clone(&self.inner), n_smooth, period).map_err(to_py_err)?;
        if let Some(h) = smooth {
            let slice = unsafe { h.as_slice()? };
            session.seed_smoothing_lengths(slice).map_err(to_py_err)?;
        }
        if let Some(r) = rho {
            let slice = unsafe { r.as_slice()? };
            session.seed_densities(slice).map_err(to_py_err)?;
        }
        Ok(SmoothCtx {
            inner: Some(session),
        })
    }
}

/// A smoothing context: one resumable pass over the particle set plus
/// the accumulators behind `populate`. Explicitly closed by `nn_stop`;
/// any use after that raises instead of touching freed state.
#[pyclass]
pub struct SmoothCtx {
    inner: Option<SmoothingSession>,
}

impl SmoothCtx {
    fn session(&mut self) -> PyResult<&mut SmoothingSession> {
        self.inner
            .as_mut()
            .ok_or_else(|| PyRuntimeError::new_err("smoothing context already closed"))
    }
}

#[pymethods]
impl SmoothCtx {
    /// Advance to the next particle. Returns `(order, ball2, neighbours,
    /// dist2)` or `None` once the pass is exhausted.
    fn nn_next(
        &mut self,
        py: Python<'_>,
    ) -> PyResult<Option<(usize, f64, Vec<usize>, Vec<f64>)>> {
        let session = self.session()?;
        let stepped = py.allow_threads(|| {
            session.step().map(|rec| {
                rec.map(|r| (r.order, r.ball2, r.neighbours.to_vec(), r.dist2.to_vec()))
            })
        });
        stepped.map_err(to_py_err)
    }

    /// Restart the pass at the first particle. Converged radii are kept
    /// as seeds, so the rewound pass needs no doubling retries.
    fn nn_rewind(&mut self) -> PyResult<()> {
        self.session()?.rewind();
        Ok(())
    }

    /// Close the context and release its state. Further calls on this
    /// object raise.
    fn nn_stop(&mut self) -> PyResult<()> {
        if self.inner.take().is_none() {
            return Err(PyRuntimeError::new_err("smoothing context already closed"));
        }
        Ok(())
    }

    /// Compute one smoothed property into `dest`, indexed by the
    /// external particle order. `propid` is one of the PROPID_*
    /// constants; mean velocity takes an (N,3) destination, everything
    /// else a length-N one. `threads > 0` runs the radius convergence
    /// on a dedicated pool of that many workers.
    #[pyo3(signature = (dest, propid, threads=0))]
    fn populate(
        &mut self,
        py: Python<'_>,
        dest: &PyAny,
        propid: i64,
        threads: usize,
    ) -> PyResult<()> {
        let property = match propid {
            PROPID_HSM => Property::SmoothingLength,
            PROPID_RHO => Property::Density,
            PROPID_MEANVEL => Property::MeanVelocity,
            PROPID_VELDISP => Property::VelocityDispersion,
            PROPID_DIVV => Property::VelocityDivergence,
            _ => {
                return Err(PyValueError::new_err(format!(
                    "unknown property id {propid}"
                )))
            }
        };
        let session = self.session()?;
        let n = session.n_particles();

        match property {
            Property::MeanVelocity => {
                let arr: &PyArray2<f64> = dest.downcast().map_err(|_| {
                    PyValueError::new_err("mean velocity needs an (N,3) float64 destination")
                })?;
                let view: ArrayView2<'_, f64> = unsafe { arr.as_array() };
                if view.ndim() != 2 || view.shape() != [n, 3] {
                    return Err(PyValueError::new_err(
                        "mean velocity needs an (N,3) float64 destination",
                    ));
                }
                let mut buf = vec![[0.0f64; 3]; n];
                py.allow_threads(|| {
                    with_thread_pool(threads, || {
                        session.compute(property, PropertyOutput::Vector(&mut buf))
                    })
                })?
                .map_err(to_py_err)?;
                let mut view = unsafe { arr.as_array_mut() };
                for i in 0..n {
                    for k in 0..3 {
                        view[[i, k]] = buf[i][k];
                    }
                }
            }
            _ => {
                let arr: &PyArray1<f64> = dest.downcast().map_err(|_| {
                    PyValueError::new_err("scalar properties need a length-N float64 destination")
                })?;
                let slice = unsafe { arr.as_slice_mut()? };
                if slice.len() != n {
                    return Err(PyValueError::new_err(
                        "scalar properties need a length-N float64 destination",
                    ));
                }
                let mut buf = vec![0.0f64; n];
                py.allow_threads(|| {
                    with_thread_pool(threads, || {
                        session.compute(property, PropertyOutput::Scalar(&mut buf))
                    })
                })?
                .map_err(to_py_err)?;
                slice.copy_from_slice(&buf);
            }
        }
        Ok(())
    }
}
