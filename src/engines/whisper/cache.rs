//! Key/value caching for the merged Whisper decoder.
//!
//! The decoder attends over every previously generated position; caching the
//! per-layer attention keys and values means each step only has to score the
//! newest token. Cache entries are addressed by integer layer index, matching
//! the `past_key_values.N.*` / `present.N.*` tensor names of the ONNX export.
//! Beam search reorders hypotheses between steps, so the cache supports
//! gathering its batch rows by source index.

use ndarray::{Array2, Array3, ArrayD, Axis, IxDyn};
use ort::session::SessionOutputs;
use ort::value::DynValue;
use std::borrow::Cow;

use super::decoding::Inference;
use super::model::{WhisperError, WhisperModel};

#[derive(Debug, Default, Clone)]
struct LayerKV {
    self_key: Option<ArrayD<f32>>,
    self_value: Option<ArrayD<f32>>,
    cross_key: Option<ArrayD<f32>>,
    cross_value: Option<ArrayD<f32>>,
}

/// Per-layer attention key/value tensors accumulated across decoding steps.
///
/// Each tensor is shaped `[batch, n_heads, steps, head_dim]`, where `steps`
/// is the number of already-scored positions; the current step is never in
/// the cache.
pub struct KVCache {
    n_layers: usize,
    n_heads: usize,
    head_dim: usize,
    layers: Vec<LayerKV>,
}

impl KVCache {
    pub fn new(n_layers: usize, n_heads: usize, head_dim: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            head_dim,
            layers: vec![LayerKV::default(); n_layers],
        }
    }

    /// True once the first decoder call has populated the cache.
    pub fn is_seeded(&self) -> bool {
        self.layers
            .first()
            .map(|l| l.self_key.is_some())
            .unwrap_or(false)
    }

    /// Build the `past_key_values.*` feed list for the merged decoder.
    ///
    /// Unseeded entries are zero-length along the step axis; the decoder's
    /// no-cache branch ignores them but the graph still requires the inputs.
    pub(crate) fn feeds(&self, batch: usize) -> Vec<(String, ArrayD<f32>)> {
        let empty = || ArrayD::<f32>::zeros(IxDyn(&[batch, self.n_heads, 0, self.head_dim]));
        let mut feeds = Vec::with_capacity(self.n_layers * 4);
        for (n, layer) in self.layers.iter().enumerate() {
            feeds.push((
                format!("past_key_values.{n}.decoder.key"),
                layer.self_key.clone().unwrap_or_else(empty),
            ));
            feeds.push((
                format!("past_key_values.{n}.decoder.value"),
                layer.self_value.clone().unwrap_or_else(empty),
            ));
            feeds.push((
                format!("past_key_values.{n}.encoder.key"),
                layer.cross_key.clone().unwrap_or_else(empty),
            ));
            feeds.push((
                format!("past_key_values.{n}.encoder.value"),
                layer.cross_value.clone().unwrap_or_else(empty),
            ));
        }
        feeds
    }

    /// Absorb the decoder's `present.*` outputs after a step.
    ///
    /// Self-attention entries are replaced every call (the decoder emits the
    /// full accumulated tensors). Cross-attention entries depend only on the
    /// audio features, so they are captured once on the seeding call; the
    /// cache branch emits dummies for them afterwards.
    pub(crate) fn absorb_outputs(
        &mut self,
        outputs: &SessionOutputs<'_>,
        seed_cross: bool,
    ) -> Result<(), WhisperError> {
        for n in 0..self.n_layers {
            let extract = |name: String| -> Result<ArrayD<f32>, WhisperError> {
                Ok(outputs
                    .get(name.as_str())
                    .ok_or(WhisperError::OutputNotFound(name))?
                    .try_extract_array::<f32>()?
                    .to_owned())
            };

            self.layers[n].self_key = Some(extract(format!("present.{n}.decoder.key"))?);
            self.layers[n].self_value = Some(extract(format!("present.{n}.decoder.value"))?);
            if seed_cross {
                self.layers[n].cross_key = Some(extract(format!("present.{n}.encoder.key"))?);
                self.layers[n].cross_value = Some(extract(format!("present.{n}.encoder.value"))?);
            }
        }
        Ok(())
    }

    /// Gather every cached tensor's batch rows by `source_indices`.
    ///
    /// Row `i` of each rearranged tensor equals row `source_indices[i]` of
    /// the tensor before the call. The index count must match the batch
    /// dimension exactly.
    pub fn rearrange(&mut self, source_indices: &[usize]) -> Result<(), WhisperError> {
        for layer in &mut self.layers {
            for entry in [
                &mut layer.self_key,
                &mut layer.self_value,
                &mut layer.cross_key,
                &mut layer.cross_value,
            ] {
                if let Some(tensor) = entry {
                    let batch = tensor.shape()[0];
                    if batch != source_indices.len() {
                        return Err(WhisperError::BatchMismatch {
                            expected: batch,
                            actual: source_indices.len(),
                        });
                    }
                    *tensor = tensor.select(Axis(0), source_indices);
                }
            }
        }
        Ok(())
    }

    /// Drop all cache entries.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            *layer = LayerKV::default();
        }
    }
}

/// One decode's scoring function: the merged decoder session plus the cache
/// policy around it.
///
/// The first `logits` call passes the full token prefix and seeds the cache;
/// subsequent calls pass only the newest token per row, since everything
/// earlier is already cached.
pub struct CachedInference<'m> {
    model: &'m mut WhisperModel,
    cache: KVCache,
    initial_token_length: usize,
}

impl<'m> CachedInference<'m> {
    pub fn new(model: &'m mut WhisperModel, initial_token_length: usize) -> Self {
        let dims = model.dims();
        let cache = KVCache::new(dims.n_text_layer, dims.n_text_head, dims.head_dim());
        Self {
            model,
            cache,
            initial_token_length,
        }
    }
}

impl Inference for CachedInference<'_> {
    fn logits(
        &mut self,
        tokens: &Array2<i64>,
        audio_features: &ArrayD<f32>,
    ) -> Result<Array3<f32>, WhisperError> {
        let batch = tokens.nrows();
        let use_cache = self.cache.is_seeded();

        // Only the newest token needs scoring once the prefix is cached.
        let input_ids: Array2<i64> = if use_cache && tokens.ncols() > self.initial_token_length {
            let last = tokens.ncols() - 1;
            tokens
                .column(last)
                .to_owned()
                .into_shape_with_order((batch, 1))?
        } else {
            tokens.clone()
        };

        let input_ids_dyn = input_ids.into_dyn();
        let use_cache_arr = ndarray::arr1(&[use_cache]).into_dyn();

        let mut ort_inputs: Vec<(Cow<'_, str>, DynValue)> = vec![
            (
                "input_ids".into(),
                ort::value::Value::from_array(input_ids_dyn)?.into_dyn(),
            ),
            (
                "encoder_hidden_states".into(),
                ort::value::Value::from_array(audio_features.clone())?.into_dyn(),
            ),
            (
                "use_cache_branch".into(),
                ort::value::Value::from_array(use_cache_arr)?.into_dyn(),
            ),
        ];
        for (name, arr) in self.cache.feeds(batch) {
            ort_inputs.push((name.into(), ort::value::Value::from_array(arr)?.into_dyn()));
        }

        let outputs = self.model.decoder_session().run(ort_inputs)?;

        let logits = outputs
            .get("logits")
            .ok_or_else(|| WhisperError::OutputNotFound("logits".to_string()))?
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<ndarray::Ix3>()?;

        self.cache.absorb_outputs(&outputs, !use_cache)?;

        Ok(logits)
    }

    fn rearrange_kv_cache(&mut self, source_indices: &[usize]) -> Result<(), WhisperError> {
        self.cache.rearrange(source_indices)
    }

    fn cleanup_caching(&mut self) {
        self.cache.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn seeded_cache() -> KVCache {
        let mut cache = KVCache::new(2, 2, 3);
        for (n, layer) in cache.layers.iter_mut().enumerate() {
            // Rows are distinguishable by their leading value.
            let tensor = Array4::from_shape_fn((4, 2, 5, 3), |(b, h, s, d)| {
                (b * 1000 + n * 100 + h * 10 + s) as f32 + d as f32 * 0.1
            })
            .into_dyn();
            layer.self_key = Some(tensor.clone());
            layer.self_value = Some(tensor.clone());
            layer.cross_key = Some(tensor.clone());
            layer.cross_value = Some(tensor);
        }
        cache
    }

    #[test]
    fn rearrange_gathers_rows_by_source_index() {
        let mut cache = seeded_cache();
        let before: Vec<ArrayD<f32>> = cache
            .layers
            .iter()
            .map(|l| l.self_key.clone().unwrap())
            .collect();

        let indices = [2usize, 2, 0, 1];
        cache.rearrange(&indices).unwrap();

        for (layer, original) in cache.layers.iter().zip(&before) {
            let rearranged = layer.self_key.as_ref().unwrap();
            for (i, &src) in indices.iter().enumerate() {
                assert_eq!(
                    rearranged.index_axis(Axis(0), i),
                    original.index_axis(Axis(0), src)
                );
            }
        }
    }

    #[test]
    fn rearrange_rejects_index_count_mismatch() {
        let mut cache = seeded_cache();
        let result = cache.rearrange(&[0, 1]);
        assert!(matches!(result, Err(WhisperError::BatchMismatch { .. })));
    }

    #[test]
    fn reset_drops_all_entries() {
        let mut cache = seeded_cache();
        assert!(cache.is_seeded());
        cache.reset();
        assert!(!cache.is_seeded());
        assert!(cache.layers.iter().all(|l| l.self_key.is_none()
            && l.self_value.is_none()
            && l.cross_key.is_none()
            && l.cross_value.is_none()));
    }

    #[test]
    fn unseeded_feeds_are_zero_length() {
        let cache = KVCache::new(2, 4, 8);
        let feeds = cache.feeds(3);
        assert_eq!(feeds.len(), 8);
        for (name, arr) in &feeds {
            assert!(name.starts_with("past_key_values."));
            assert_eq!(arr.shape(), &[3, 4, 0, 8]);
        }
    }
}
