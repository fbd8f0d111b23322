pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod preprocess;
pub mod training;

pub use dataset::{build_training_set, build_training_set_with_summary, DatasetSummary};
pub use inference::{InferenceEngine, ProbabilityModel};
pub use ml_model::{ModelConfig, PreferenceClassifier};
pub use preprocess::preprocess;
pub use training::{
    fit, train_model, EpochMetrics, FitOptions, SampleBatch, SampleBatcher, SampleDataset,
    SampleItem, TrainOutcome, TrainRequest, TrainingLog,
};
