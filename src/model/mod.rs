pub mod checkpoint;
pub mod config;
pub mod device;
pub mod model_metadata;
pub mod model_storage;
pub mod taxonomy;

pub use checkpoint::{ExtractionStrategy, ParameterMap};
pub use config::{AppConfig, LoggingSettings, ModelSettings, ServerSettings, UploadSettings};
pub use device::{ComputeBackend, ComputeDevice, DefaultBackend, DeviceBinding};
pub use model_metadata::{ModelInfo, Normalization};
pub use model_storage::{ModelHandle, ModelProfile, ModelStore};
pub use taxonomy::ClassTaxonomy;
