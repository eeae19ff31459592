//! Backend selection for the prediction tool.

use burn::tensor::backend::Backend;

/// CPU backend used for inference
pub type DefaultBackend = burn_ndarray::NdArray<f32>;

pub fn default_device() -> <DefaultBackend as Backend>::Device {
    <DefaultBackend as Backend>::Device::default()
}

/// Human-readable name of the active backend
pub fn backend_name() -> &'static str {
    "NdArray (CPU)"
}
