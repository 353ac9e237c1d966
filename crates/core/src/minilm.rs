//! Local sentence embeddings with `all-MiniLM-L6-v2` exported to ONNX.
//!
//! The model directory holds `model.onnx` and the matching `tokenizer.json`
//! (the sentence-transformers export). Vectors are mean-pooled over the
//! attention mask and L2-normalised, 384 dimensions.

use crate::embeddings::Embedder;
use crate::SearchError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tract_onnx::prelude::tract_ndarray::{ArrayView2, ArrayView3, Axis, Ix3};
use tract_onnx::prelude::*;
use tracing::{debug, info};

pub const MINILM_MODEL_NAME: &str = "all-MiniLM-L6-v2";
pub const MINILM_DIMENSIONS: usize = 384;
pub const MODEL_FILE: &str = "model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// sentence-transformers truncates this model's inputs at 256 word pieces.
const MAX_SEQUENCE_LENGTH: usize = 256;
const BATCH_SIZE: usize = 32;

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Token ids, attention mask and segment ids for one padded batch, row-major.
#[derive(Debug, Clone, PartialEq)]
struct EncodedBatch {
    rows: usize,
    columns: usize,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    token_type_ids: Vec<i64>,
}

struct MiniLmModel {
    plan: OnnxPlan,
    tokenizer: Tokenizer,
}

pub struct MiniLmEmbedder {
    model: Arc<MiniLmModel>,
}

impl MiniLmEmbedder {
    pub fn load(directory: impl AsRef<Path>) -> Result<Self, SearchError> {
        let directory = directory.as_ref();
        let model_path = directory.join(MODEL_FILE);
        let tokenizer_path = directory.join(TOKENIZER_FILE);

        for required in [&model_path, &tokenizer_path] {
            if !required.is_file() {
                return Err(SearchError::Config(format!(
                    "{} not found; export {MINILM_MODEL_NAME} to ONNX into {}",
                    required.display(),
                    directory.display()
                )));
            }
        }

        let plan = tract_onnx::onnx()
            .model_for_path(&model_path)
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|error| load_error(&model_path, error))?;
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|error| load_error(&tokenizer_path, error))?;

        info!(model = MINILM_MODEL_NAME, directory = %directory.display(), "onnx embedder loaded");
        Ok(Self {
            model: Arc::new(MiniLmModel { plan, tokenizer }),
        })
    }
}

fn load_error(path: &Path, error: impl std::fmt::Display) -> SearchError {
    SearchError::Config(format!("failed to load {}: {error}", path.display()))
}

fn inference_error(error: impl std::fmt::Display) -> SearchError {
    SearchError::BackendResponse {
        backend: MINILM_MODEL_NAME.to_string(),
        details: error.to_string(),
    }
}

#[async_trait]
impl Embedder for MiniLmEmbedder {
    fn name(&self) -> String {
        format!("onnx:{MINILM_MODEL_NAME}")
    }

    fn dimensions(&self) -> usize {
        MINILM_DIMENSIONS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut vectors = Vec::with_capacity(texts.len());
            for batch in texts.chunks(BATCH_SIZE) {
                vectors.extend(model.embed(batch)?);
            }
            Ok::<_, SearchError>(vectors)
        })
        .await
        .map_err(inference_error)?
    }
}

impl MiniLmModel {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        let mut encoded = Vec::with_capacity(texts.len());
        for text in texts {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), true)
                .map_err(inference_error)?;
            encoded.push((
                encoding.get_ids().to_vec(),
                encoding.get_attention_mask().to_vec(),
                encoding.get_type_ids().to_vec(),
            ));
        }
        let batch = pad_batch(&encoded, MAX_SEQUENCE_LENGTH);
        debug!(rows = batch.rows, columns = batch.columns, "running onnx embedder");

        let shape = [batch.rows, batch.columns];
        let inputs: TVec<TValue> = tvec![
            Tensor::from_shape(&shape, &batch.input_ids[..]).map_err(inference_error)?.into(),
            Tensor::from_shape(&shape, &batch.attention_mask[..]).map_err(inference_error)?.into(),
            Tensor::from_shape(&shape, &batch.token_type_ids[..]).map_err(inference_error)?.into(),
        ];
        let outputs = self.plan.run(inputs).map_err(inference_error)?;

        let hidden = outputs[0]
            .to_array_view::<f32>()
            .map_err(inference_error)?
            .into_dimensionality::<Ix3>()
            .map_err(inference_error)?;
        let mask = ArrayView2::from_shape(shape, &batch.attention_mask[..]).map_err(inference_error)?;

        Ok(mean_pool(hidden, mask).into_iter().map(l2_normalize).collect())
    }
}

/// Truncates to `max_len` tokens and right-pads with zeros to the longest row.
fn pad_batch(encoded: &[(Vec<u32>, Vec<u32>, Vec<u32>)], max_len: usize) -> EncodedBatch {
    let columns = encoded
        .iter()
        .map(|(ids, _, _)| ids.len().min(max_len))
        .max()
        .unwrap_or(0);

    let mut batch = EncodedBatch {
        rows: encoded.len(),
        columns,
        input_ids: Vec::with_capacity(encoded.len() * columns),
        attention_mask: Vec::with_capacity(encoded.len() * columns),
        token_type_ids: Vec::with_capacity(encoded.len() * columns),
    };

    for (ids, mask, types) in encoded {
        for (target, source) in [
            (&mut batch.input_ids, ids),
            (&mut batch.attention_mask, mask),
            (&mut batch.token_type_ids, types),
        ] {
            let kept = source.len().min(columns);
            target.extend(source[..kept].iter().map(|&value| i64::from(value)));
            target.extend(std::iter::repeat(0).take(columns - kept));
        }
    }

    batch
}

fn mean_pool(hidden: ArrayView3<f32>, mask: ArrayView2<i64>) -> Vec<Vec<f32>> {
    hidden
        .outer_iter()
        .zip(mask.outer_iter())
        .map(|(tokens, row_mask)| {
            let mut sum = vec![0.0f32; tokens.len_of(Axis(1))];
            let mut count = 0.0f32;
            for (token, &keep) in tokens.outer_iter().zip(row_mask.iter()) {
                if keep > 0 {
                    sum.iter_mut().zip(token.iter()).for_each(|(acc, value)| *acc += value);
                    count += 1.0;
                }
            }
            if count > 0.0 {
                sum.iter_mut().for_each(|value| *value /= count);
            }
            sum
        })
        .collect()
}

fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|value| *value /= norm);
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tract_onnx::prelude::tract_ndarray::{Array2, Array3};

    #[test]
    fn padding_truncates_and_fills_with_zeros() {
        let encoded = vec![
            (vec![101, 7592, 102], vec![1, 1, 1], vec![0, 0, 0]),
            (vec![101, 102], vec![1, 1], vec![0, 0]),
        ];

        let batch = pad_batch(&encoded, 512);
        assert_eq!(batch.rows, 2);
        assert_eq!(batch.columns, 3);
        assert_eq!(batch.input_ids, vec![101, 7592, 102, 101, 102, 0]);
        assert_eq!(batch.attention_mask, vec![1, 1, 1, 1, 1, 0]);
        assert_eq!(batch.token_type_ids, vec![0; 6]);

        let truncated = pad_batch(&encoded, 2);
        assert_eq!(truncated.columns, 2);
        assert_eq!(truncated.input_ids, vec![101, 7592, 101, 102]);
    }

    #[test]
    fn mean_pool_ignores_padding_tokens() {
        let hidden = Array3::from_shape_vec(
            (2, 3, 2),
            vec![
                1.0, 2.0, 3.0, 4.0, 100.0, 100.0, //
                5.0, 6.0, 7.0, 8.0, 9.0, 10.0,
            ],
        )
        .expect("shape");
        let mask = Array2::from_shape_vec((2, 3), vec![1, 1, 0, 1, 1, 1]).expect("shape");

        let pooled = mean_pool(hidden.view(), mask.view());

        assert_eq!(pooled, vec![vec![2.0, 3.0], vec![7.0, 8.0]]);
    }

    #[test]
    fn normalized_vectors_have_unit_length() {
        let vector = l2_normalize(vec![3.0, 4.0]);
        assert!((vector[0] - 0.6).abs() < 1e-6);
        assert!((vector[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn missing_model_files_are_a_config_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = MiniLmEmbedder::load(dir.path());
        assert!(matches!(result, Err(SearchError::Config(message)) if message.contains(MODEL_FILE)));

        std::fs::write(dir.path().join(MODEL_FILE), b"not an onnx graph")?;
        let result = MiniLmEmbedder::load(dir.path());
        assert!(matches!(result, Err(SearchError::Config(message)) if message.contains(TOKENIZER_FILE)));
        Ok(())
    }
}
