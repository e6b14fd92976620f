//! Local BERT embedding provider (feature `bert`).

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::search::embedding::EmbeddingProvider;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use hf_hub::api::sync::Api;
use std::path::Path;
use std::sync::Mutex;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer};

/// Default embedding model (small, strong, good for semantic search)
/// https://huggingface.co/BAAI/bge-small-en-v1.5
pub const DEFAULT_MODEL: &str = "BAAI/bge-small-en-v1.5";

const MODEL_FILES: [&str; 3] = ["config.json", "tokenizer.json", "model.safetensors"];

fn model_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Model(format!("{}: {}", context, e))
}

/// BERT sentence embedder with CLS pooling and L2-normalized output.
pub struct BertEmbedder {
    model: Mutex<BertModel>,
    tokenizer: Mutex<Tokenizer>,
    device: Device,
    dimensions: usize,
    model_id: String,
}

impl BertEmbedder {
    /// Load [`DEFAULT_MODEL`] from the models directory, downloading it
    /// from the Hugging Face Hub first if any file is missing.
    pub fn init(config: &Config) -> Result<Self> {
        Self::init_model(config, DEFAULT_MODEL)
    }

    pub fn init_model(config: &Config, model_id: &str) -> Result<Self> {
        let model_dir = config.models_dir.join(model_id.replace('/', "--"));
        std::fs::create_dir_all(&model_dir)?;

        if MODEL_FILES.iter().any(|f| !model_dir.join(f).exists()) {
            Self::download(model_id, &model_dir)?;
        }
        Self::load(&model_dir, model_id)
    }

    fn download(model_id: &str, model_dir: &Path) -> Result<()> {
        tracing::info!(model = model_id, "downloading embedding model");
        let api = Api::new().map_err(|e| model_err("Failed to reach the Hugging Face Hub", e))?;
        let repo = api.model(model_id.to_string());
        for file in MODEL_FILES {
            let fetched = repo
                .get(file)
                .map_err(|e| model_err(&format!("Failed to download {}", file), e))?;
            std::fs::copy(&fetched, model_dir.join(file))?;
        }
        Ok(())
    }

    fn load(model_dir: &Path, model_id: &str) -> Result<Self> {
        let config_content = std::fs::read_to_string(model_dir.join("config.json"))?;
        let bert_config: BertConfig = serde_json::from_str(&config_content)
            .map_err(|e| model_err("Failed to parse config", e))?;
        let dimensions = serde_json::from_str::<serde_json::Value>(&config_content)?
            .get("hidden_size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::Model("model config has no hidden_size".to_string()))?
            as usize;

        let mut tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| model_err("Failed to load tokenizer", e))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
        let weights = model_dir.join("model.safetensors");
        // SAFETY: the weights file is only read, and nothing else maps it mutably.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DTYPE, &device)
                .map_err(|e| model_err("Failed to load weights", e))?
        };
        let model = BertModel::load(vb, &bert_config).map_err(|e| model_err("Failed to load model", e))?;

        tracing::info!(model = model_id, dimensions, "embedding model loaded");
        Ok(Self {
            model: Mutex::new(model),
            tokenizer: Mutex::new(tokenizer),
            device,
            dimensions,
            model_id: model_id.to_string(),
        })
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self
            .model
            .lock()
            .map_err(|e| model_err("Failed to lock model", e))?;
        let tokenizer = self
            .tokenizer
            .lock()
            .map_err(|e| model_err("Failed to lock tokenizer", e))?;

        let encodings = tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| model_err("Tokenization failed", e))?;

        let rows = encodings
            .iter()
            .map(|enc| Tensor::new(enc.get_ids(), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(|e| model_err("Failed to build input tensor", e))?;

        let embed = || -> candle_core::Result<Vec<Vec<f32>>> {
            let token_ids = Tensor::stack(&rows, 0)?;
            let token_type_ids = token_ids.zeros_like()?;
            let hidden = model.forward(&token_ids, &token_type_ids)?;

            // CLS pooling: [batch, seq, hidden] -> [batch, hidden]
            let pooled = hidden.narrow(1, 0, 1)?.squeeze(1)?;
            let normalized = pooled.broadcast_div(&pooled.sqr()?.sum_keepdim(1)?.sqrt()?)?;
            normalized.to_vec2::<f32>()
        };
        embed().map_err(|e| model_err("Forward pass failed", e))
    }
}

impl EmbeddingProvider for BertEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed(texts)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
