use std::{ops::Deref, path::Path};

use tokenizers::Tokenizer;

use crate::{FinetuneError, Result};

/// Converts between text and token ids.
pub trait TextCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn vocab_size(&self) -> usize;
}

impl TextCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = Deref::deref(self)
            .encode(text, false)
            .map_err(|err| FinetuneError::Tokenizer(format!("failed to encode text: {err}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Deref::deref(self)
            .decode(ids, true)
            .map_err(|err| FinetuneError::Tokenizer(format!("failed to decode tokens: {err}")))
    }

    fn vocab_size(&self) -> usize {
        self.get_vocab_size(true)
    }
}

/// One token per byte. Used when no tokenizer file is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCodec;

impl TextCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes = ids
            .iter()
            .map(|&id| {
                u8::try_from(id).map_err(|_| {
                    FinetuneError::runtime(format!("token id {id} is outside the byte range"))
                })
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        256
    }
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|err| {
        FinetuneError::Tokenizer(format!(
            "failed to load tokenizer json {}: {}",
            path.display(),
            err
        ))
    })
}

/// Builds the codec named by the config: a tokenizer file when given, bytes otherwise.
pub fn build_codec(tokenizer_json: Option<&Path>) -> Result<Box<dyn TextCodec>> {
    match tokenizer_json {
        Some(path) => Ok(Box::new(load_tokenizer(path)?)),
        None => Ok(Box::new(ByteCodec)),
    }
}
