//! Model identity, descriptors and handles
//!
//! The variant key `(model_id, draft, revision, quantization)` is the
//! identity used for inflight load deduplication; the artifact cache
//! key adds modality instead of draft. Descriptors are immutable once
//! resolved; handles are created by the manager on successful load and
//! removed only after a successful unload RPC.

pub mod manager;

pub use manager::{ModelManager, ModelManagerConfig, VariantStats};

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKey;
use crate::types::{GantryError, Result};

/// Where a model's artifacts come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    HuggingFace,
    Local,
}

/// Weight quantization applied at load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    None,
    Int8,
    Int4,
}

impl Quantization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantization::None => "none",
            Quantization::Int8 => "int8",
            Quantization::Int4 => "int4",
        }
    }
}

impl std::str::FromStr for Quantization {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Quantization::None),
            "int8" => Ok(Quantization::Int8),
            "int4" => Ok(Quantization::Int4),
            other => Err(GantryError::Validation(format!(
                "unknown quantization '{other}'"
            ))),
        }
    }
}

/// Immutable model descriptor, resolved at load time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub source: ModelSource,
    pub modality: String,
    pub family: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Handle lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Loading,
    Ready,
    Failed,
}

/// Worker-reported model properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub parameter_count: Option<u64>,
    pub dtype: Option<String>,
    pub quantization: Quantization,
    pub revision: Option<String>,
    pub tokenizer_type: Option<String>,
    pub is_vision_model: bool,
    pub memory_usage: Option<u64>,
}

/// In-memory record of a loaded model
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub descriptor: ModelDescriptor,
    pub state: ModelState,
    pub context_length: u32,
    pub metadata: ModelMetadata,
    pub draft: bool,
}

/// Options for one load request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub model_id: String,
    pub draft: bool,
    pub revision: Option<String>,
    pub quantization: Option<Quantization>,
    pub local_path: Option<String>,
}

impl LoadOptions {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            draft: false,
            revision: None,
            quantization: None,
            local_path: None,
        }
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = Some(revision.to_string());
        self
    }

    pub fn with_quantization(mut self, quantization: Quantization) -> Self {
        self.quantization = Some(quantization);
        self
    }

    pub fn as_draft(mut self) -> Self {
        self.draft = true;
        self
    }

    /// The identity used for inflight dedup and the handle cache
    pub fn variant_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.model_id,
            self.draft,
            self.revision.as_deref().unwrap_or("main"),
            self.quantization.unwrap_or_default().as_str(),
        )
    }

    /// The corresponding artifact cache key
    pub fn artifact_key(&self, modality: Option<&str>) -> ArtifactKey {
        ArtifactKey {
            model_id: self.model_id.clone(),
            revision: self.revision.clone(),
            quantization: self.quantization.map(|q| q.as_str().to_string()),
            modality: modality.map(str::to_string),
        }
    }
}

/// Family is the leading segment of the id, e.g. `llama` for
/// `llama-3.2-1B-instruct` or `meta/llama-3` for org-prefixed ids.
pub fn family_of(model_id: &str) -> String {
    let name = model_id.rsplit('/').next().unwrap_or(model_id);
    name.split('-').next().unwrap_or(name).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_key_covers_tuple() {
        let base = LoadOptions::new("llama-3.2-1b");
        assert_eq!(base.variant_key(), "llama-3.2-1b:false:main:none");

        let draft = LoadOptions::new("llama-3.2-1b").as_draft();
        assert_ne!(draft.variant_key(), base.variant_key());

        let rev = LoadOptions::new("llama-3.2-1b").with_revision("dev");
        assert_ne!(rev.variant_key(), base.variant_key());

        let quant = LoadOptions::new("llama-3.2-1b").with_quantization(Quantization::Int4);
        assert_ne!(quant.variant_key(), base.variant_key());
    }

    #[test]
    fn test_artifact_key_uses_modality_not_draft() {
        let options = LoadOptions::new("m").as_draft();
        let key = options.artifact_key(Some("text"));
        let (full, _) = key.derive();
        assert!(!full.contains("true"));
        assert!(full.starts_with("m:main:none:text@"));
    }

    #[test]
    fn test_family_of() {
        assert_eq!(family_of("llama-3.2-1B-instruct"), "llama");
        assert_eq!(family_of("meta/Llama-3-8b"), "llama");
        assert_eq!(family_of("qwen2.5"), "qwen2.5");
    }

    #[test]
    fn test_quantization_parse() {
        assert_eq!("int4".parse::<Quantization>().unwrap(), Quantization::Int4);
        assert!("fp8".parse::<Quantization>().is_err());
    }
}
