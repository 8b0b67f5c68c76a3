use std::{path::Path, str::FromStr};

use tokenizers::Tokenizer;

use crate::error::ServiceError;

/// Text <-> id mapping for one backend.
pub struct Vocabulary {
    tokenizer: Tokenizer,
}

impl Vocabulary {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(Self::new(tokenizer))
    }

    /// Parses a serialized `tokenizer.json` document.
    pub fn from_json(json: &str) -> Result<Self, ServiceError> {
        let tokenizer =
            Tokenizer::from_str(json).map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(Self::new(tokenizer))
    }

    pub fn from_hub(identifier: &str) -> Result<Self, ServiceError> {
        let tokenizer = Tokenizer::from_pretrained(identifier, None)
            .map_err(|e| ServiceError::Tokenizer(format!("{identifier}: {e}")))?;
        Ok(Self::new(tokenizer))
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ServiceError> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}
