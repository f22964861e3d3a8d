pub mod augment;
pub mod backbone;
pub mod class_weights;
pub mod dataset;
pub mod evaluation;
pub mod inference;
pub mod ml_model;
pub mod training;

pub use augment::{AugmentationConfig, Augmenter};
pub use backbone::{BackboneWeights, MobileNetV2, MobileNetV2Config, BACKBONE_LAYERS};
pub use class_weights::ClassWeightTable;
pub use dataset::{load_split, scan_directory, DatasetSplit, ImageBatch, ImageBatcher, SampleRef};
pub use evaluation::{evaluate_directory, ClassificationReport, ConfusionMatrix};
pub use inference::{InferenceEngine, PredictionVector};
pub use ml_model::{ClassifierConfig, Mode, Normalization, Preprocessor, WasteClassifier, IMAGE_SIZE};
pub use training::{
    train_model, ClassifierTemplate, EpochStats, Phase, Trainability, TrainingConfig,
    TrainingHistory, TrainingReport, TrainingRequest, TwoPhaseTrainer,
};
