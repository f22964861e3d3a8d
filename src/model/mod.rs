pub mod class_catalog;
pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use class_catalog::ClassCatalog;
pub use config::{AppConfig, DeviceType, InferenceSettings, ModelSettings};
pub use model_metadata::ModelMetadata;
pub use model_storage::{
    load_metadata, load_model_archive, save_model_archive, save_model_with_catalog,
};
