use pyo3::prelude::*;

mod kd;

/// Python bindings entry point for the KD-tree smoothing engine.
///
/// Exposes tree construction, the resumable neighbour-search context
/// and the smoothed-property passes under the `kdmain` namespace.
#[pymodule]
fn kdmain(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_class::<kd::KdTree>()?;
    m.add_class::<kd::SmoothCtx>()?;

    m.add("PROPID_HSM", kd::PROPID_HSM)?;
    m.add("PROPID_RHO", kd::PROPID_RHO)?;
    m.add("PROPID_MEANVEL", kd::PROPID_MEANVEL)?;
    m.add("PROPID_VELDISP", kd::PROPID_VELDISP)?;
    m.add("PROPID_DIVV", kd::PROPID_DIVV)?;

    Ok(())
}
