use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{safetensors::load as load_safetensors, DType, Device, Tensor};

use crate::{codec::TextCodec, FinetuneError, Result};

/// Loads token chunks from files and directories.
///
/// `.npz` archives contribute one chunk per named array and `.safetensors`
/// files one chunk per tensor (in name order). Every other file is read as
/// UTF-8 text and encoded with `codec` into a single chunk. Directories are
/// walked recursively in sorted order. A path that names neither a file nor a
/// directory is expanded as a glob pattern. Empty chunks are skipped.
pub fn load_chunks(paths: &[PathBuf], codec: &dyn TextCodec) -> Result<Vec<Vec<u32>>> {
    let mut files = Vec::new();
    for path in paths {
        collect_files(path, &mut files)?;
    }
    if files.is_empty() {
        return Err(FinetuneError::initialization(format!(
            "no corpus files found in {}",
            display_paths(paths)
        )));
    }

    let mut chunks = Vec::new();
    for file in &files {
        log::info!("reading {}", file.display());
        let before = chunks.len();
        match file.extension().and_then(|ext| ext.to_str()) {
            Some("npz") => {
                let arrays = Tensor::read_npz(file).map_err(|err| {
                    FinetuneError::initialization(format!(
                        "failed to read npz archive {}: {err}",
                        file.display()
                    ))
                })?;
                for (name, array) in arrays {
                    push_chunk(&mut chunks, tensor_to_ids(&array, file, &name)?);
                }
            }
            Some("safetensors") => {
                let tensors = load_safetensors(file, &Device::Cpu).map_err(|err| {
                    FinetuneError::initialization(format!(
                        "failed to read safetensors file {}: {err}",
                        file.display()
                    ))
                })?;
                let mut named: Vec<_> = tensors.into_iter().collect();
                named.sort_by(|a, b| a.0.cmp(&b.0));
                for (name, tensor) in named {
                    push_chunk(&mut chunks, tensor_to_ids(&tensor, file, &name)?);
                }
            }
            _ => {
                let text = fs::read_to_string(file).map_err(|err| {
                    FinetuneError::initialization(format!(
                        "failed to read text file {}: {err}",
                        file.display()
                    ))
                })?;
                push_chunk(&mut chunks, codec.encode(&text)?);
            }
        }
        if chunks.len() == before {
            log::warn!("{} contributed no tokens", file.display());
        }
    }

    if chunks.is_empty() {
        return Err(FinetuneError::initialization(format!(
            "corpus {} contains no tokens",
            display_paths(paths)
        )));
    }
    Ok(chunks)
}

fn collect_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }
    if !path.is_dir() {
        return collect_glob(path, files);
    }

    let mut entries = fs::read_dir(path)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    for entry in entries {
        collect_files(&entry, files)?;
    }
    Ok(())
}

fn collect_glob(pattern: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let pattern_text = pattern.to_string_lossy();
    let matches = glob::glob(&pattern_text).map_err(|err| {
        FinetuneError::initialization(format!("invalid corpus pattern {pattern_text}: {err}"))
    })?;
    let mut matches = matches
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| {
            FinetuneError::initialization(format!(
                "failed to expand corpus pattern {pattern_text}: {err}"
            ))
        })?;
    if matches.is_empty() {
        return Err(FinetuneError::initialization(format!(
            "corpus path {} does not exist",
            pattern.display()
        )));
    }

    matches.sort();
    for entry in matches {
        collect_files(&entry, files)?;
    }
    Ok(())
}

fn tensor_to_ids(tensor: &Tensor, file: &Path, name: &str) -> Result<Vec<u32>> {
    let flat = tensor.flatten_all()?;
    let ids = match flat.dtype() {
        DType::U32 => flat,
        DType::U8 | DType::I64 => flat.to_dtype(DType::U32)?,
        dtype => {
            return Err(FinetuneError::initialization(format!(
                "unsupported dtype {:?} for token array '{}' in {}; expected u8, u32 or i64",
                dtype,
                name,
                file.display()
            )))
        }
    };
    Ok(ids.to_vec1::<u32>()?)
}

fn push_chunk(chunks: &mut Vec<Vec<u32>>, ids: Vec<u32>) {
    if !ids.is_empty() {
        chunks.push(ids);
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;
    use crate::codec::ByteCodec;

    #[test]
    fn walks_directories_in_sorted_order() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("b.txt"), "bb").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(nested.join("c.txt"), "ccc").unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();

        let chunks = load_chunks(&[dir.path().to_path_buf()], &ByteCodec).unwrap();
        let lengths: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![1, 2, 3]);
    }

    #[test]
    fn safetensors_arrays_become_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "doc_b".to_string(),
            Tensor::new(&[4u32, 5, 6], &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "doc_a".to_string(),
            Tensor::new(&[1i64, 2], &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let chunks = load_chunks(&[path], &ByteCodec).unwrap();
        assert_eq!(chunks, vec![vec![1, 2], vec![4, 5, 6]]);
    }

    #[test]
    fn glob_patterns_expand_in_sorted_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "bb").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("c.md"), "cccc").unwrap();

        let chunks = load_chunks(&[dir.path().join("*.txt")], &ByteCodec).unwrap();
        let lengths: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![1, 2]);

        let err = load_chunks(&[dir.path().join("*.json")], &ByteCodec).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unsupported_npz_dtype_names_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("floats.npz");
        let array = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        Tensor::write_npz(&[("doc", &array)], &path).unwrap();

        let err = load_chunks(&[path], &ByteCodec).unwrap_err().to_string();
        assert!(err.contains("floats.npz"), "{err}");
        assert!(err.contains("'doc'"), "{err}");
    }

    #[test]
    fn missing_paths_are_reported() {
        let dir = tempdir().unwrap();
        let err = load_chunks(&[dir.path().join("absent")], &ByteCodec).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
