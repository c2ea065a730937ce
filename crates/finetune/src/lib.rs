pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod samples;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManifest, CheckpointStore};
pub use codec::{build_codec, ByteCodec, TextCodec};
pub use config::{FinetuneConfig, RestoreFrom};
pub use data::{load_chunks, ChunkSampler, Sample};
pub use error::{FinetuneError, Result};
pub use logging::{Logger, LoggingSettings};
pub use loss::CrossEntropyLoss;
pub use metrics::LossAverage;
pub use model::{BigramModel, GenerationOptions, LanguageModel};
pub use optimizer::{Adafactor, AdafactorConfig, Gradient, GradientSource, ParameterSet, ParameterStore};
pub use samples::SampleStore;
pub use scheduler::{DecayRateSchedule, LearningRateSchedule};
pub use trainer::{
    CheckpointDecision, CheckpointPolicy, ResumeOutcome, RestoredWeights, StopReason,
    TrainingController, TrainingState,
};
