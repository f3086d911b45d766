use botm::{BotmError, SpikeTrainSet, TraceView};
use numpy::{PyArray1, PyReadonlyArray2, PyUntypedArrayMethods};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

/// Maps sorter errors onto Python exceptions.
pub fn to_py_err(err: BotmError) -> PyErr {
    match err {
        BotmError::Configuration(_) | BotmError::Value { .. } | BotmError::DimensionMismatch { .. } => {
            PyValueError::new_err(err.to_string())
        }
        BotmError::Linalg(_) => PyRuntimeError::new_err(err.to_string()),
    }
}

/// Borrows a C-contiguous `(samples, channels)` float32 array.
pub fn trace_view<'a>(data: &'a PyReadonlyArray2<'_, f32>) -> PyResult<TraceView<'a>> {
    let channels = data.shape()[1];
    let slice = data
        .as_slice()
        .map_err(|_| PyValueError::new_err("data must be a C-contiguous (samples, channels) array"))?;
    TraceView::new(slice, channels).map_err(to_py_err)
}

/// `{unit: int64 array}` dict of spike trains.
pub fn trains_to_dict<'py>(py: Python<'py>, set: &SpikeTrainSet) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    for (id, times) in set.iter() {
        dict.set_item(id, PyArray1::from_slice(py, times))?;
    }
    Ok(dict)
}
