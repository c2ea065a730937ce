use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{FinetuneError, Result};

/// Writes generated text to `<sample_dir>/<run_name>/samples-<counter>`.
#[derive(Debug, Clone)]
pub struct SampleStore {
    run_dir: PathBuf,
}

impl SampleStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn path_for(&self, counter: usize) -> PathBuf {
        self.run_dir.join(format!("samples-{counter}"))
    }

    pub fn write(&self, counter: usize, texts: &[String]) -> Result<PathBuf> {
        fs::create_dir_all(&self.run_dir).map_err(|err| {
            FinetuneError::runtime(format!(
                "failed to create sample directory {}: {err}",
                self.run_dir.display()
            ))
        })?;
        let path = self.path_for(counter);
        fs::write(&path, format_samples(texts)).map_err(|err| {
            FinetuneError::runtime(format!("failed to write {}: {err}", path.display()))
        })?;
        Ok(path)
    }
}

/// Numbered `======== SAMPLE <n> ========` blocks joined by newlines.
pub fn format_samples(texts: &[String]) -> String {
    texts
        .iter()
        .enumerate()
        .map(|(index, text)| format!("======== SAMPLE {} ========\n{}\n", index + 1, text))
        .collect::<Vec<_>>()
        .join("\n")
}
