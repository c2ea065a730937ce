use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    scheduler::{DecayRateSchedule, LearningRateSchedule},
    FinetuneError, Result,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneConfig {
    #[serde(default = "default_run_name")]
    pub run_name: String,
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl FinetuneConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and resolves relative paths without validating, so that
    /// command-line overrides can still be applied.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: FinetuneConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(FinetuneError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.run_name.trim().is_empty() {
            errors.push("run_name must not be empty".to_string());
        }
        if self.run_name.contains(['/', '\\']) {
            errors.push("run_name must not contain path separators".to_string());
        }

        if self.data.dataset.is_empty() {
            errors.push("data.dataset must not be empty".to_string());
        }
        if self.data.valset.is_empty() {
            errors.push("data.valset must not be empty".to_string());
        }

        if let Some(0) = self.model.vocab_size {
            errors.push("model.vocab_size must be greater than 0".to_string());
        }
        if self.model.context_window == 0 {
            errors.push("model.context_window must be greater than 0".to_string());
        }
        if let Some(0) = self.model.layers_to_train {
            errors.push("model.layers_to_train must be greater than 0".to_string());
        }

        let optimizer = &self.optimizer;
        optimizer
            .learning_rate
            .validate("optimizer.learning_rate", &mut errors);
        optimizer
            .decay_rate
            .validate("optimizer.decay_rate", &mut errors);
        if !(0.0..1.0).contains(&optimizer.beta1) {
            errors.push("optimizer.beta1 must be in [0, 1)".to_string());
        }
        if let Some(threshold) = optimizer.clipping_threshold {
            if threshold <= 0.0 {
                errors.push("optimizer.clipping_threshold must be greater than 0".to_string());
            }
        }
        if optimizer.epsilon1 < 0.0 {
            errors.push("optimizer.epsilon1 must be >= 0".to_string());
        }
        if optimizer.epsilon2 < 0.0 {
            errors.push("optimizer.epsilon2 must be >= 0".to_string());
        }

        let training = &self.training;
        if training.batch_size == 0 {
            errors.push("training.batch_size must be greater than 0".to_string());
        }
        if training.batch_length < 2 {
            errors.push("training.batch_length must be at least 2".to_string());
        }
        if training.batch_length > self.model.context_window {
            errors.push(format!(
                "training.batch_length ({}) exceeds model.context_window ({})",
                training.batch_length, self.model.context_window
            ));
        }
        if let Some(0) = training.stop_after {
            errors.push("training.stop_after must be greater than 0".to_string());
        }
        if training.save_every == 0 {
            errors.push("training.save_every must be greater than 0".to_string());
        }
        if training.validate_every == 0 {
            errors.push("training.validate_every must be greater than 0".to_string());
        }
        if training.patience == 0 {
            errors.push("training.patience must be greater than 0".to_string());
        }
        if let RestoreFrom::Path(path) = &training.restore_from {
            if path.as_os_str().is_empty() {
                errors.push("training.restore_from must not be an empty path".to_string());
            }
        }

        let sampling = &self.sampling;
        if sampling.sample_num == 0 {
            errors.push("sampling.sample_num must be greater than 0".to_string());
        }
        if let Some(length) = sampling.sample_length {
            if length > self.model.context_window {
                errors.push(format!(
                    "Can't get samples longer than window size: {}",
                    self.model.context_window
                ));
            }
        }
        if sampling.temperature <= 0.0 {
            errors.push("sampling.temperature must be greater than 0".to_string());
        }

        if self.runtime.checkpoint_dir.as_os_str().is_empty() {
            errors.push("runtime.checkpoint_dir must not be empty".to_string());
        }
        if self.runtime.sample_dir.as_os_str().is_empty() {
            errors.push("runtime.sample_dir must not be empty".to_string());
        }
        if let Some(0) = self.runtime.max_keep {
            errors.push("runtime.max_keep must be greater than 0".to_string());
        }
        if self.runtime.logging.tensorboard_flush_every_n == 0 {
            errors.push("runtime.logging.tensorboard_flush_every_n must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(FinetuneError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.model.apply_base_path(base);
        if let RestoreFrom::Path(path) = &mut self.training.restore_from {
            absolutize_in_place(path, base);
        }
        self.runtime.apply_base_path(base);
    }

    /// Directory holding this run's checkpoints and counter file.
    pub fn run_checkpoint_dir(&self) -> PathBuf {
        self.runtime.checkpoint_dir.join(&self.run_name)
    }

    pub fn run_sample_dir(&self) -> PathBuf {
        self.runtime.sample_dir.join(&self.run_name)
    }

    /// Directory holding the pretrained weights for `model.name`.
    pub fn pretrained_dir(&self) -> PathBuf {
        self.model.models_dir.join(&self.model.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub dataset: Vec<PathBuf>,
    pub valset: Vec<PathBuf>,
    /// Hugging Face `tokenizer.json`; raw bytes are used when absent.
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in self.dataset.iter_mut().chain(self.valset.iter_mut()) {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.tokenizer_json.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Only the last `layers_to_train` parameters receive updates.
    #[serde(default)]
    pub layers_to_train: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            models_dir: default_models_dir(),
            vocab_size: None,
            context_window: default_context_window(),
            layers_to_train: None,
        }
    }
}

impl ModelConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.models_dir, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub learning_rate: LearningRateSchedule,
    #[serde(default)]
    pub decay_rate: DecayRateSchedule,
    #[serde(default)]
    pub beta1: f64,
    #[serde(default = "default_clipping_threshold")]
    pub clipping_threshold: Option<f64>,
    #[serde(default = "default_true")]
    pub factored: bool,
    #[serde(default = "default_true")]
    pub multiply_by_parameter_scale: bool,
    #[serde(default = "default_epsilon1")]
    pub epsilon1: f64,
    #[serde(default = "default_epsilon2")]
    pub epsilon2: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: LearningRateSchedule::default(),
            decay_rate: DecayRateSchedule::default(),
            beta1: 0.0,
            clipping_threshold: default_clipping_threshold(),
            factored: true,
            multiply_by_parameter_scale: true,
            epsilon1: default_epsilon1(),
            epsilon2: default_epsilon2(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_length")]
    pub batch_length: usize,
    /// Iteration budget; `None` trains until early stop or interrupt.
    #[serde(default)]
    pub stop_after: Option<usize>,
    #[serde(default = "default_save_every")]
    pub save_every: usize,
    #[serde(default = "default_validate_every")]
    pub validate_every: usize,
    /// Consecutive non-improving checkpoint opportunities tolerated.
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub restore_from: RestoreFrom,
    #[serde(default)]
    pub save_on_interrupt: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            batch_size: default_batch_size(),
            batch_length: default_batch_length(),
            stop_after: None,
            save_every: default_save_every(),
            validate_every: default_validate_every(),
            patience: default_patience(),
            restore_from: RestoreFrom::default(),
            save_on_interrupt: false,
        }
    }
}

/// Where initial weights come from.
///
/// Serialized as a plain string: `"latest"`, `"fresh"`, or a checkpoint path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RestoreFrom {
    #[default]
    Latest,
    Fresh,
    Path(PathBuf),
}

impl Serialize for RestoreFrom {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RestoreFrom::Latest => serializer.serialize_str("latest"),
            RestoreFrom::Fresh => serializer.serialize_str("fresh"),
            RestoreFrom::Path(path) => serializer.serialize_str(&path.to_string_lossy()),
        }
    }
}

impl<'de> Deserialize<'de> for RestoreFrom {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "latest" => RestoreFrom::Latest,
            "fresh" => RestoreFrom::Fresh,
            _ => RestoreFrom::Path(PathBuf::from(raw)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Generate samples every N iterations; 0 disables sampling.
    #[serde(default = "default_sample_every")]
    pub sample_every: usize,
    /// Defaults to half the model's context window.
    #[serde(default)]
    pub sample_length: Option<usize>,
    #[serde(default = "default_sample_num")]
    pub sample_num: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_every: default_sample_every(),
            sample_length: None,
            sample_num: default_sample_num(),
            temperature: default_temperature(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_sample_dir")]
    pub sample_dir: PathBuf,
    #[serde(default = "default_max_keep")]
    pub max_keep: Option<usize>,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            sample_dir: default_sample_dir(),
            max_keep: default_max_keep(),
            device: DeviceKind::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint_dir, base);
        absolutize_in_place(&mut self.sample_dir, base);
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_run_name() -> String {
    "run1".to_string()
}

fn default_model_name() -> String {
    "bigram".to_string()
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_context_window() -> usize {
    1024
}

fn default_clipping_threshold() -> Option<f64> {
    Some(1.0)
}

fn default_true() -> bool {
    true
}

fn default_epsilon1() -> f64 {
    1e-30
}

fn default_epsilon2() -> f64 {
    1e-3
}

fn default_seed() -> u64 {
    42
}

fn default_batch_size() -> usize {
    1
}

fn default_batch_length() -> usize {
    1024
}

fn default_save_every() -> usize {
    1000
}

fn default_validate_every() -> usize {
    5
}

fn default_patience() -> usize {
    10
}

fn default_sample_every() -> usize {
    100
}

fn default_sample_num() -> usize {
    1
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_k() -> usize {
    40
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoint")
}

fn default_sample_dir() -> PathBuf {
    PathBuf::from("samples")
}

fn default_max_keep() -> Option<usize> {
    Some(5)
}

fn default_tensorboard_flush_every_n() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data]
        dataset = ["train.txt"]
        valset = ["valid.txt"]
    "#;

    #[test]
    fn defaults_follow_reference_run() {
        let config: FinetuneConfig = toml::from_str(MINIMAL).expect("parse");
        assert_eq!(config.run_name, "run1");
        assert_eq!(config.training.batch_size, 1);
        assert_eq!(config.training.batch_length, 1024);
        assert_eq!(config.training.save_every, 1000);
        assert_eq!(config.training.validate_every, 5);
        assert_eq!(config.training.patience, 10);
        assert_eq!(config.training.restore_from, RestoreFrom::Latest);
        assert!(!config.training.save_on_interrupt);
        assert_eq!(config.sampling.sample_every, 100);
        assert_eq!(config.sampling.top_k, 40);
        assert_eq!(config.runtime.max_keep, Some(5));
        assert_eq!(config.optimizer.clipping_threshold, Some(1.0));
        assert_eq!(config.optimizer.decay_rate, DecayRateSchedule::Pow { exponent: 0.8 });
        config.validate().expect("valid");
    }

    #[test]
    fn restore_from_accepts_keywords_and_paths() {
        let parse = |value: &str| -> RestoreFrom {
            let text = format!("{MINIMAL}\n[training]\nrestore_from = \"{value}\"\n");
            toml::from_str::<FinetuneConfig>(&text)
                .expect("parse")
                .training
                .restore_from
        };
        assert_eq!(parse("latest"), RestoreFrom::Latest);
        assert_eq!(parse("fresh"), RestoreFrom::Fresh);
        assert_eq!(
            parse("checkpoint/other"),
            RestoreFrom::Path(PathBuf::from("checkpoint/other"))
        );
    }

    #[test]
    fn schedules_deserialize_from_tables() {
        let text = format!(
            "{MINIMAL}\n[optimizer]\nbeta1 = 0.9\nlearning_rate = {{ kind = \"constant\", value = 0.001 }}\ndecay_rate = {{ kind = \"adam\", beta2 = 0.999 }}\n"
        );
        let config: FinetuneConfig = toml::from_str(&text).expect("parse");
        assert_eq!(
            config.optimizer.learning_rate,
            LearningRateSchedule::Constant { value: 0.001 }
        );
        assert_eq!(
            config.optimizer.decay_rate,
            DecayRateSchedule::Adam { beta2: 0.999 }
        );
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: FinetuneConfig = toml::from_str(MINIMAL).expect("parse");
        config.training.batch_size = 0;
        config.training.save_every = 0;
        config.sampling.sample_length = Some(4096);
        match config.validate() {
            Err(FinetuneError::Validation(messages)) => {
                assert_eq!(messages.len(), 3, "{messages:?}");
                assert!(messages
                    .iter()
                    .any(|m| m.contains("Can't get samples longer than window size")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
