//! On-disk checkpoints for one run.
//!
//! ```text
//! <checkpoint_dir>/<run_name>/
//!     counter                      decimal step number + "\n"
//!     step_000000001000/
//!         model.safetensors
//!         optimizer.safetensors    (optional)
//!         manifest.json
//! ```

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{FinetuneConfig, FinetuneError, Result};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const COUNTER_FILENAME: &str = "counter";
pub const PRETRAINED_FILENAME: &str = "model.safetensors";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub counter: usize,
    pub config_sha256: Option<String>,
    pub model: FileRecord,
    pub optimizer: Option<FileRecord>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub model_weights_path: PathBuf,
    pub optimizer_state: Option<HashMap<String, Tensor>>,
}

/// Checkpoints and the step counter of a single run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    run_dir: PathBuf,
    max_keep: Option<usize>,
    config_sha256: Option<String>,
}

impl CheckpointStore {
    pub fn new(run_dir: impl Into<PathBuf>, max_keep: Option<usize>) -> Self {
        Self {
            run_dir: run_dir.into(),
            max_keep,
            config_sha256: None,
        }
    }

    /// Records a fingerprint of `config` in every manifest written from now on.
    pub fn with_config(mut self, config: &FinetuneConfig) -> Result<Self> {
        self.config_sha256 = Some(fingerprint_config(config)?);
        Ok(self)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn config_sha256(&self) -> Option<&str> {
        self.config_sha256.as_deref()
    }

    pub fn counter_path(&self) -> PathBuf {
        self.run_dir.join(COUNTER_FILENAME)
    }

    /// The persisted step number, if this run has saved before.
    pub fn read_counter(&self) -> Result<Option<usize>> {
        let path = self.counter_path();
        if !path.is_file() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path).map_err(|err| {
            FinetuneError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        let counter = contents.trim().parse::<usize>().map_err(|err| {
            FinetuneError::runtime(format!(
                "counter file {} is not a step number: {err}",
                path.display()
            ))
        })?;
        Ok(Some(counter))
    }

    pub fn write_counter(&self, counter: usize) -> Result<()> {
        create_dir(&self.run_dir)?;
        let path = self.counter_path();
        fs::write(&path, format!("{counter}\n")).map_err(|err| {
            FinetuneError::runtime(format!("failed to write {}: {err}", path.display()))
        })
    }

    /// Writes parameters (and optimizer slots) for `counter`, updates the
    /// counter file and prunes old step directories.
    pub fn save(
        &self,
        counter: usize,
        parameters: &[(String, Var)],
        optimizer_state: Option<&HashMap<String, Tensor>>,
    ) -> Result<CheckpointDescriptor> {
        create_dir(&self.run_dir)?;

        let checkpoint_dir = self.run_dir.join(format!("step_{:012}", counter));
        if checkpoint_dir.exists() {
            fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
                FinetuneError::runtime(format!(
                    "failed to remove existing checkpoint directory {}: {err}",
                    checkpoint_dir.display()
                ))
            })?;
        }
        create_dir(&checkpoint_dir)?;

        let model_path = checkpoint_dir.join(MODEL_FILENAME);
        save_parameters(parameters, &model_path)?;
        let model_record = file_record(&model_path)?;

        let optimizer_record = match optimizer_state {
            Some(state) if !state.is_empty() => {
                let path = checkpoint_dir.join(OPTIMIZER_FILENAME);
                candle_core::safetensors::save(state, &path).map_err(|err| {
                    FinetuneError::runtime(format!(
                        "failed to serialize optimizer state to {}: {err}",
                        path.display()
                    ))
                })?;
                Some(file_record(&path)?)
            }
            _ => None,
        };

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            counter,
            config_sha256: self.config_sha256.clone(),
            model: model_record,
            optimizer: optimizer_record,
        };
        write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

        self.write_counter(counter)?;
        prune_checkpoints(&self.run_dir, self.max_keep)?;

        Ok(CheckpointDescriptor {
            directory: checkpoint_dir,
            manifest,
        })
    }

    pub fn latest(&self) -> Result<Option<CheckpointDescriptor>> {
        latest_checkpoint(&self.run_dir)
    }

    /// Step directories of this run, oldest first.
    pub fn checkpoints(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = checkpoint_directories(&self.run_dir)?;
        dirs.sort();
        Ok(dirs)
    }
}

pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>> {
    let entries = checkpoint_directories(base_dir)?;
    let Some(path) = entries.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

/// Resolves `path` to a checkpoint: either a step directory itself or a run
/// directory whose newest step is used.
pub fn resolve_checkpoint(path: &Path) -> Result<Option<CheckpointDescriptor>> {
    if path.join(MANIFEST_FILENAME).is_file() {
        let manifest = load_manifest(path)?;
        return Ok(Some(CheckpointDescriptor {
            directory: path.to_path_buf(),
            manifest,
        }));
    }
    latest_checkpoint(path)
}

/// Verifies checksums and reads optimizer slots onto `device`.
pub fn load_checkpoint(directory: &Path, device: &Device) -> Result<LoadOutcome> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let optimizer_state = match manifest.optimizer.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(load_safetensors(&path, device)?)
        }
        None => None,
    };

    Ok(LoadOutcome {
        manifest,
        model_weights_path: model_path,
        optimizer_state,
    })
}

/// Copies tensors from a safetensors file into `parameters`, matching by name.
pub fn apply_weights(parameters: &[(String, Var)], weights_path: &Path) -> Result<()> {
    let Some((_, first)) = parameters.first() else {
        return Err(FinetuneError::runtime("model contains no parameters to restore"));
    };
    let device = first.as_tensor().device().clone();
    let tensors = load_safetensors(weights_path, &device).map_err(|err| {
        FinetuneError::runtime(format!(
            "failed to read weights {}: {err}",
            weights_path.display()
        ))
    })?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in parameters {
        let tensor = params_by_name.remove(name).ok_or_else(|| {
            FinetuneError::runtime(format!(
                "{} is missing parameter {name}",
                weights_path.display()
            ))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(FinetuneError::runtime(format!(
                "parameter {name} has shape {:?} in {} but {:?} in the model",
                tensor.dims(),
                weights_path.display(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        var.set(&tensor)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(FinetuneError::runtime(format!(
            "{} contains unused parameters: {}",
            weights_path.display(),
            extra.join(", ")
        )));
    }

    Ok(())
}

fn save_parameters(parameters: &[(String, Var)], path: &Path) -> Result<()> {
    if parameters.is_empty() {
        return Err(FinetuneError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<_, _> = parameters
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        FinetuneError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

pub fn fingerprint_config(config: &FinetuneConfig) -> Result<String> {
    let json = serde_json::to_vec(config)
        .map_err(|err| FinetuneError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|err| {
        FinetuneError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            path.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            FinetuneError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            FinetuneError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        FinetuneError::runtime(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            FinetuneError::runtime(format!("failed to read checkpoint entry: {err}"))
        })?;
        if !entry.path().is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with("step_") {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(FinetuneError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<()> {
    if version != CHECKPOINT_VERSION {
        return Err(FinetuneError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(FinetuneError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|err| {
        FinetuneError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            FinetuneError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = File::create(path).map_err(|err| {
        FinetuneError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| FinetuneError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| FinetuneError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| {
        FinetuneError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        FinetuneError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<()> {
    let Some(limit) = max_keep else {
        return Ok(());
    };
    if limit == 0 {
        return Ok(());
    }
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort();
    while dirs.len() > limit {
        let victim = dirs.remove(0);
        log::debug!("pruning checkpoint {}", victim.display());
        fs::remove_dir_all(&victim).map_err(|err| {
            FinetuneError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use candle_core::DType;
    use tempfile::tempdir;

    use super::*;

    fn params(value: f32) -> Result<Vec<(String, Var)>> {
        let device = Device::Cpu;
        Ok(vec![
            (
                "w".to_string(),
                Var::from_tensor(&Tensor::full(value, (2, 3), &device)?)?,
            ),
            ("b".to_string(), Var::zeros(3, DType::F32, &device)?),
        ])
    }

    #[test]
    fn counter_file_holds_decimal_and_newline() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run1"), None);
        assert_eq!(store.read_counter()?, None);
        store.write_counter(500)?;
        assert_eq!(fs::read_to_string(store.counter_path())?, "500\n");
        assert_eq!(store.read_counter()?, Some(500));
        Ok(())
    }

    #[test]
    fn save_and_restore_parameters() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run1"), Some(5));
        let saved = params(0.5)?;
        let descriptor = store.save(100, &saved, None)?;
        assert_eq!(descriptor.manifest.counter, 100);
        assert!(descriptor.manifest.optimizer.is_none());

        let target = params(0.0)?;
        let outcome = load_checkpoint(&descriptor.directory, &Device::Cpu)?;
        apply_weights(&target, &outcome.model_weights_path)?;
        assert_eq!(
            target[0].1.as_tensor().to_vec2::<f32>()?,
            vec![vec![0.5; 3]; 2]
        );
        assert_eq!(store.read_counter()?, Some(100));
        Ok(())
    }

    #[test]
    fn prunes_beyond_max_keep() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run1"), Some(2));
        let saved = params(1.0)?;
        for counter in [100, 200, 300] {
            store.save(counter, &saved, None)?;
        }
        let names: Vec<String> = store
            .checkpoints()?
            .iter()
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["step_000000000200", "step_000000000300"]);
        assert_eq!(store.latest()?.map(|d| d.manifest.counter), Some(300));
        Ok(())
    }

    #[test]
    fn tampered_weights_fail_validation() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run1"), None);
        let descriptor = store.save(5, &params(1.0)?, None)?;
        fs::write(descriptor.directory.join(MODEL_FILENAME), b"garbage")?;
        assert!(load_checkpoint(&descriptor.directory, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn resolve_accepts_run_or_step_directory() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run1"), None);
        let first = store.save(10, &params(1.0)?, None)?;
        store.save(20, &params(2.0)?, None)?;
        let from_run = resolve_checkpoint(store.run_dir())?.map(|d| d.manifest.counter);
        let from_step = resolve_checkpoint(&first.directory)?.map(|d| d.manifest.counter);
        assert_eq!(from_run, Some(20));
        assert_eq!(from_step, Some(10));
        Ok(())
    }
}
