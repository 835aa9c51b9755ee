//! Autoregressive text-to-waveform orchestration.
//!
//! One `generate_audio` call is a single synchronous state machine:
//!
//! ```text
//! text ──tokenize──▶ ids
//!   ──language_model (+ shallow cache)──▶ per-token hidden states
//!   ──+ text type embedding──▶ tagged states
//!   ──tts_prefill ×2 (positive / negative deep cache)──▶ context pair
//!   ─┬─▶ frame loop (≤ max_frames):
//!     │     stop_classifier(positive condition)      after frame 0
//!     │     diffusion sub-loop (CFG over both paths) → frame latent
//!     │     acoustic_connector + speech type embedding
//!     │     tts_step ×2 (both contexts advance in lockstep)
//!   ──rescale + stack ──▶ acoustic_decoder ──▶ clipped waveform
//! ```
//!
//! Guidance combines the two paths as `negative + scale * (positive - negative)`.
//!
//! Requests never share mutable state: each call owns its context pair, its
//! noise source and its frame list, and only contends for the engine's
//! sessions. A failure anywhere aborts the whole request; no partial audio is
//! ever returned.

use crate::audio::Waveform;
use crate::config::ModelConfig;
use crate::engine::{self, EngineConfig, Graph, InferenceEngine};
use crate::error::{LyrebirdError, Result};
use crate::npy::{self, TensorData};
use crate::rng::GaussianRng;
use crate::scheduler::DiffusionScheduler;
use crate::tokenizer::Tokenizer;
use crate::utils::vector_stats;
use crate::voices::{GuidancePath, VoiceLibrary, VoicePreset};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, checked once per frame.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the running generation aborts at the next frame
    /// boundary with [`LyrebirdError::Cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Builder for [`InferencePipeline`].
///
/// # Example
///
/// ```no_run
/// use lyrebird::PipelineBuilder;
///
/// let pipeline = PipelineBuilder::new("models")
///     .seed(42)
///     .diffusion_steps(5)
///     .build()?;
/// let audio = pipeline.generate_audio("Hello.", "en-Carter_man")?;
/// # Ok::<(), lyrebird::LyrebirdError>(())
/// ```
pub struct PipelineBuilder {
    models_dir: PathBuf,
    seed: u64,
    cfg_scale: Option<f32>,
    diffusion_steps: Option<usize>,
    max_frames: Option<usize>,
    engine_config: EngineConfig,
}

impl PipelineBuilder {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            seed: 524242,
            cfg_scale: None,
            diffusion_steps: None,
            max_frames: None,
            engine_config: EngineConfig::default(),
        }
    }

    /// Seed for the diffusion noise source.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Override the classifier-free guidance scale.
    pub fn cfg_scale(mut self, scale: f32) -> Self {
        self.cfg_scale = Some(scale);
        self
    }

    /// Override the diffusion step count.
    pub fn diffusion_steps(mut self, steps: usize) -> Self {
        self.diffusion_steps = Some(steps);
        self
    }

    /// Override the frame-loop safety ceiling.
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    /// Load every model asset and build the pipeline.
    pub fn build(self) -> Result<InferencePipeline> {
        let dir = &self.models_dir;
        if !dir.is_dir() {
            return Err(LyrebirdError::NotFound(format!(
                "models directory {} does not exist",
                dir.display()
            )));
        }

        if let Some(scale) = self.cfg_scale {
            if !scale.is_finite() {
                return Err(LyrebirdError::InvalidArgument(
                    "cfg scale must be finite".to_string(),
                ));
            }
        }
        if self.max_frames == Some(0) {
            return Err(LyrebirdError::InvalidArgument(
                "max frames must be positive".to_string(),
            ));
        }

        let config = ModelConfig::from_file(&dir.join("model_config.json"))?;
        let tokenizer = Tokenizer::from_file(&dir.join("tokenizer.json"))?;

        let type_table = npy::read_tensor(&dir.join("type_embeddings.npy"))?;
        let (speech_embedding, text_embedding) =
            split_type_embeddings(&type_table, config.hidden_size)?;

        let steps = self
            .diffusion_steps
            .unwrap_or(config.ddpm_num_inference_steps);
        let scheduler = DiffusionScheduler::new(
            steps,
            config.ddpm_num_steps,
            config.ddpm_beta_schedule.parse()?,
            config.prediction_type.parse()?,
        )?;

        let voices = VoiceLibrary::open(
            &dir.join("voices"),
            config.lm_num_hidden_layers,
            config.tts_backbone_num_hidden_layers,
        )?;

        let engine = InferenceEngine::load(dir, &self.engine_config)?;

        info!(
            "pipeline ready: {} diffusion steps, cfg {}, {} voices",
            steps,
            self.cfg_scale.unwrap_or(config.cfg_scale),
            voices.voice_names().len()
        );

        Ok(InferencePipeline {
            cfg_scale: self.cfg_scale.unwrap_or(config.cfg_scale),
            max_frames: self.max_frames.unwrap_or(config.max_frames),
            seed: self.seed,
            engine,
            tokenizer,
            scheduler,
            voices,
            text_embedding,
            speech_embedding,
            config,
        })
    }
}

/// Mutable per-request state of one guidance path: the growing deep cache
/// and the most recent hidden vector.
struct AutoregressiveContext {
    cache: Vec<(TensorData, TensorData)>,
    cache_len: usize,
    hidden: Vec<f32>,
}

impl AutoregressiveContext {
    fn seed_from(path: &GuidancePath, hidden_size: usize) -> Result<Self> {
        let cache = path
            .tts_cache
            .iter()
            .map(|(k, v)| ((**k).clone(), (**v).clone()))
            .collect();
        let hidden = last_hidden_vector(path.hidden.data(), hidden_size)?;
        Ok(Self {
            cache,
            cache_len: path.tts_cache_len(),
            hidden,
        })
    }
}

/// The positive/negative pair. Always advanced together: guidance requires
/// both paths at the same relative position.
struct GuidanceContexts {
    positive: AutoregressiveContext,
    negative: AutoregressiveContext,
}

/// End-to-end text → waveform state machine over one loaded model.
///
/// `generate_audio` takes `&self`; independent requests may run concurrently
/// against one pipeline instance.
#[derive(Debug)]
pub struct InferencePipeline {
    engine: InferenceEngine,
    tokenizer: Tokenizer,
    scheduler: DiffusionScheduler,
    voices: VoiceLibrary,
    config: ModelConfig,
    text_embedding: Vec<f32>,
    speech_embedding: Vec<f32>,
    cfg_scale: f32,
    max_frames: usize,
    seed: u64,
}

impl InferencePipeline {
    /// Names of every loadable voice. No model invocation.
    pub fn available_voices(&self) -> Vec<String> {
        self.voices.voice_names()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Synthesize a waveform for `text` in the given voice.
    pub fn generate_audio(&self, text: &str, voice_name: &str) -> Result<Waveform> {
        self.generate_audio_cancellable(text, voice_name, &CancelToken::new())
    }

    /// Synthesize with cooperative cancellation, checked once per frame.
    pub fn generate_audio_cancellable(
        &self,
        text: &str,
        voice_name: &str,
        cancel: &CancelToken,
    ) -> Result<Waveform> {
        validate_request(text, voice_name)?;

        let token_ids = self.tokenizer.encode(text);
        if token_ids.is_empty() {
            return Err(LyrebirdError::InvalidArgument(
                "text produced no representable tokens".to_string(),
            ));
        }

        let preset = self.voices.load_preset(voice_name)?;
        info!(
            "generating: {} tokens, voice '{}', {} diffusion steps",
            token_ids.len(),
            voice_name,
            self.scheduler.num_inference_steps()
        );

        // Text-only stage: one base-LM pass over the ids, voice-independent
        // downstream of the shallow cache seed.
        let hidden_states = self.run_base_lm(&token_ids, preset.positive())?;
        let tagged = self.tag_text(hidden_states)?;

        let mut contexts = GuidanceContexts {
            positive: AutoregressiveContext::seed_from(preset.positive(), self.config.hidden_size)?,
            negative: AutoregressiveContext::seed_from(preset.negative(), self.config.hidden_size)?,
        };
        self.advance_both(&mut contexts, &tagged, Graph::TtsPrefill)?;

        let mut rng = GaussianRng::new(self.seed);
        let mut frames: Vec<Vec<f32>> = Vec::new();

        for frame_index in 0..self.max_frames {
            if cancel.is_cancelled() {
                debug!("cancellation observed at frame {}", frame_index);
                return Err(LyrebirdError::Cancelled);
            }

            let positive_condition = contexts.positive.hidden.clone();
            let negative_condition = contexts.negative.hidden.clone();

            if frame_index > 0 && self.should_stop(&positive_condition)? {
                debug!("stop classifier fired at frame {}", frame_index);
                break;
            }

            let latent = self.sample_frame(&positive_condition, &negative_condition, &mut rng)?;
            if frame_index == 0 {
                debug!("frame 0 latent: {}", vector_stats(&latent));
            }

            let embedding = self.connect_latent(&latent)?;
            let embedding =
                TensorData::new(vec![1, 1, self.config.hidden_size], embedding)?;
            self.advance_both(&mut contexts, &embedding, Graph::TtsStep)?;

            frames.push(latent);
        }

        if frames.len() == self.max_frames {
            warn!(
                "reached maximum frame count {} without a stop decision",
                self.max_frames
            );
        }
        info!("generated {} frames", frames.len());

        self.decode_frames(&frames, &preset)
    }

    /// Base-LM pass over the token ids, seeded with the shallow cache.
    fn run_base_lm(&self, token_ids: &[u32], seed_path: &GuidancePath) -> Result<TensorData> {
        let ids: Vec<i64> = token_ids.iter().map(|&id| i64::from(id)).collect();
        let mut inputs = Vec::with_capacity(1 + 2 * seed_path.lm_cache.len());
        inputs.push(engine::i64_input(
            "input_ids",
            vec![1, ids.len() as i64],
            ids,
        )?);
        push_cache_inputs(&mut inputs, &seed_path.lm_cache)?;

        let outputs = self.engine.run(Graph::LanguageModel, inputs)?;
        let hidden_states = outputs.into_iter().next().ok_or_else(|| {
            LyrebirdError::ModelExecution("language_model produced no outputs".to_string())
        })?;

        if hidden_states.rank() != 3 || hidden_states.dim(2)? != self.config.hidden_size {
            return Err(LyrebirdError::ModelExecution(format!(
                "language_model hidden states have shape {:?}, expected [1, seq, {}]",
                hidden_states.shape(),
                self.config.hidden_size
            )));
        }
        Ok(hidden_states)
    }

    /// Mark every position as text input.
    fn tag_text(&self, hidden_states: TensorData) -> Result<TensorData> {
        let shape = hidden_states.shape().to_vec();
        let mut data = hidden_states.into_data();
        add_embedding(&mut data, &self.text_embedding);
        TensorData::new(shape, data)
    }

    /// Advance both guidance contexts with the same embedded input.
    fn advance_both(
        &self,
        contexts: &mut GuidanceContexts,
        embeds: &TensorData,
        graph: Graph,
    ) -> Result<()> {
        let before = (contexts.positive.cache_len, contexts.negative.cache_len);
        self.advance_context(&mut contexts.positive, embeds, graph)?;
        self.advance_context(&mut contexts.negative, embeds, graph)?;
        let grew_positive = contexts.positive.cache_len - before.0;
        let grew_negative = contexts.negative.cache_len - before.1;
        if grew_positive != grew_negative {
            return Err(LyrebirdError::ModelExecution(format!(
                "guidance contexts diverged: positive grew {grew_positive}, negative grew {grew_negative}"
            )));
        }
        Ok(())
    }

    /// One prefill or single-step pass; replaces the context's cache with the
    /// presents.
    fn advance_context(
        &self,
        context: &mut AutoregressiveContext,
        embeds: &TensorData,
        graph: Graph,
    ) -> Result<()> {
        let seq = embeds.dim(1)?;
        let layers = self.config.tts_backbone_num_hidden_layers;

        let mut inputs = Vec::with_capacity(1 + 2 * layers);
        inputs.push(engine::f32_input(
            "inputs_embeds",
            shape_i64(embeds.shape()),
            embeds.data().to_vec(),
        )?);
        push_cache_inputs(&mut inputs, &context.cache)?;

        let outputs = self.engine.run(graph, inputs)?;
        if outputs.len() != 1 + 2 * layers {
            return Err(LyrebirdError::ModelExecution(format!(
                "expected hidden states plus {layers} present cache pairs, got {} outputs",
                outputs.len()
            )));
        }

        let mut outputs = outputs.into_iter();
        let hidden_states = outputs.next().ok_or_else(|| {
            LyrebirdError::ModelExecution("missing hidden-state output".to_string())
        })?;
        let hidden = last_hidden_vector(hidden_states.data(), self.config.hidden_size)?;

        let mut cache = Vec::with_capacity(layers);
        while let Some(key) = outputs.next() {
            let value = outputs.next().ok_or_else(|| {
                LyrebirdError::ModelExecution("present cache key without value".to_string())
            })?;
            cache.push((key, value));
        }

        let new_len = cache
            .first()
            .ok_or_else(|| {
                LyrebirdError::ModelExecution("present cache is empty".to_string())
            })?
            .0
            .dim(2)?;
        let expected = context.cache_len + seq;
        if new_len != expected {
            return Err(LyrebirdError::ModelExecution(format!(
                "cache advanced to {new_len} positions, expected {expected}"
            )));
        }

        context.cache = cache;
        context.cache_len = new_len;
        context.hidden = hidden;
        Ok(())
    }

    /// Stop decision from the learned classifier over the positive condition.
    fn should_stop(&self, condition: &[f32]) -> Result<bool> {
        let inputs = vec![engine::f32_input(
            "hidden_state",
            vec![1, condition.len() as i64],
            condition.to_vec(),
        )?];
        let outputs = self.engine.run(Graph::StopClassifier, inputs)?;
        let logit = outputs
            .first()
            .and_then(|t| t.data().first().copied())
            .ok_or_else(|| {
                LyrebirdError::ModelExecution("stop_classifier produced no logit".to_string())
            })?;
        Ok(sigmoid(logit) > 0.5)
    }

    /// Diffusion sub-loop for one frame: both conditions in one batched call,
    /// guidance combination, solver advance per timestep.
    fn sample_frame(
        &self,
        positive_condition: &[f32],
        negative_condition: &[f32],
        rng: &mut GaussianRng,
    ) -> Result<Vec<f32>> {
        let latent_size = self.config.latent_size;
        let hidden_size = self.config.hidden_size;

        let mut conditions = Vec::with_capacity(2 * hidden_size);
        conditions.extend_from_slice(positive_condition);
        conditions.extend_from_slice(negative_condition);

        let mut latent = rng.normal_vec(latent_size);
        let mut solver = self.scheduler.begin();

        for &t in self.scheduler.timesteps() {
            let mut noisy = Vec::with_capacity(2 * latent_size);
            noisy.extend_from_slice(&latent);
            noisy.extend_from_slice(&latent);

            let inputs = vec![
                engine::f32_input("noisy_latent", vec![2, latent_size as i64], noisy)?,
                engine::f32_input("timestep", vec![2], vec![t as f32; 2])?,
                engine::f32_input(
                    "condition",
                    vec![2, hidden_size as i64],
                    conditions.clone(),
                )?,
            ];
            let outputs = self.engine.run(Graph::DiffusionHead, inputs)?;
            let model_output = outputs.into_iter().next().ok_or_else(|| {
                LyrebirdError::ModelExecution("diffusion_head produced no output".to_string())
            })?;
            if model_output.len() != 2 * latent_size {
                return Err(LyrebirdError::ModelExecution(format!(
                    "diffusion_head output has {} elements, expected {}",
                    model_output.len(),
                    2 * latent_size
                )));
            }

            let (positive_out, negative_out) = model_output.data().split_at(latent_size);
            let guided = apply_guidance(positive_out, negative_out, self.cfg_scale);
            latent = solver.step(&guided, t, &latent)?;
        }

        Ok(latent)
    }

    /// Project a frame latent into the LLM embedding space and mark it as
    /// speech input.
    fn connect_latent(&self, latent: &[f32]) -> Result<Vec<f32>> {
        let inputs = vec![engine::f32_input(
            "latent",
            vec![1, 1, latent.len() as i64],
            latent.to_vec(),
        )?];
        let outputs = self.engine.run(Graph::AcousticConnector, inputs)?;
        let output = outputs.into_iter().next().ok_or_else(|| {
            LyrebirdError::ModelExecution("acoustic_connector produced no output".to_string())
        })?;
        if output.len() != self.config.hidden_size {
            return Err(LyrebirdError::ModelExecution(format!(
                "acoustic_connector produced {} values, expected {}",
                output.len(),
                self.config.hidden_size
            )));
        }
        let mut embedding = output.into_data();
        add_embedding(&mut embedding, &self.speech_embedding);
        Ok(embedding)
    }

    /// Rescale, stack and batch-decode every collected frame, clipping the
    /// result to the valid amplitude range.
    fn decode_frames(&self, frames: &[Vec<f32>], preset: &VoicePreset) -> Result<Waveform> {
        let latent_size = self.config.latent_size;
        let scaling = preset
            .metadata()
            .speech_scaling_factor
            .unwrap_or(self.config.speech_scaling_factor);
        let bias = preset
            .metadata()
            .speech_bias_factor
            .unwrap_or(self.config.speech_bias_factor);
        if !scaling.is_finite() || scaling == 0.0 {
            return Err(LyrebirdError::DataFormat(format!(
                "voice '{}' has unusable speech scaling factor {scaling}",
                preset.name()
            )));
        }

        let stacked = stack_frames(frames, latent_size, scaling, bias);
        let inputs = vec![engine::f32_input(
            "latents",
            vec![1, latent_size as i64, frames.len() as i64],
            stacked,
        )?];
        let outputs = self.engine.run(Graph::AcousticDecoder, inputs)?;
        let samples = outputs
            .into_iter()
            .next()
            .ok_or_else(|| {
                LyrebirdError::ModelExecution("acoustic_decoder produced no output".to_string())
            })?
            .into_data();

        debug!("decoded waveform: {}", vector_stats(&samples));
        Ok(Waveform::from_samples_clipped(
            samples,
            self.config.sample_rate,
        ))
    }
}

fn validate_request(text: &str, voice_name: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(LyrebirdError::InvalidArgument(
            "text must not be empty".to_string(),
        ));
    }
    if voice_name.trim().is_empty() {
        return Err(LyrebirdError::InvalidArgument(
            "voice name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// `negative + scale * (positive - negative)`.
fn apply_guidance(positive: &[f32], negative: &[f32], scale: f32) -> Vec<f32> {
    negative
        .iter()
        .zip(positive)
        .map(|(&n, &p)| n + scale * (p - n))
        .collect()
}

/// Add a type embedding to every position of a `[.., hidden]` buffer.
fn add_embedding(hidden: &mut [f32], embedding: &[f32]) {
    for position in hidden.chunks_exact_mut(embedding.len()) {
        for (value, &e) in position.iter_mut().zip(embedding) {
            *value += e;
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Final hidden-size chunk of a `[.., hidden]` buffer.
fn last_hidden_vector(data: &[f32], hidden_size: usize) -> Result<Vec<f32>> {
    if data.is_empty() || data.len() % hidden_size != 0 {
        return Err(LyrebirdError::DataFormat(format!(
            "hidden-state buffer of {} values is not a multiple of hidden size {}",
            data.len(),
            hidden_size
        )));
    }
    Ok(data[data.len() - hidden_size..].to_vec())
}

/// Rescale each frame by the preset's affine constants and stack along the
/// frame axis into `[1, latent, frames]` layout.
fn stack_frames(frames: &[Vec<f32>], latent_size: usize, scaling: f32, bias: f32) -> Vec<f32> {
    let count = frames.len();
    let mut out = vec![0.0f32; latent_size * count];
    for (frame_index, frame) in frames.iter().enumerate() {
        for (channel, &value) in frame.iter().enumerate() {
            out[channel * count + frame_index] = value / scaling - bias;
        }
    }
    out
}

/// Row 0 is the speech embedding, row 1 the text embedding.
fn split_type_embeddings(table: &TensorData, hidden_size: usize) -> Result<(Vec<f32>, Vec<f32>)> {
    if table.shape() != [2, hidden_size] {
        return Err(LyrebirdError::DataFormat(format!(
            "type embedding table has shape {:?}, expected [2, {}]",
            table.shape(),
            hidden_size
        )));
    }
    let (speech, text) = table.data().split_at(hidden_size);
    Ok((speech.to_vec(), text.to_vec()))
}

fn shape_i64(shape: &[usize]) -> Vec<i64> {
    shape.iter().map(|&d| d as i64).collect()
}

fn push_cache_inputs<K, V>(
    inputs: &mut Vec<(
        std::borrow::Cow<'static, str>,
        ort::session::SessionInputValue<'static>,
    )>,
    cache: &[(K, V)],
) -> Result<()>
where
    K: std::borrow::Borrow<TensorData>,
    V: std::borrow::Borrow<TensorData>,
{
    for (layer, (key, value)) in cache.iter().enumerate() {
        let (key, value) = (key.borrow(), value.borrow());
        inputs.push(engine::f32_input_named(
            format!("past_key_{layer}"),
            shape_i64(key.shape()),
            key.data().to_vec(),
        )?);
        inputs.push(engine::f32_input_named(
            format!("past_value_{layer}"),
            shape_i64(value.shape()),
            value.data().to_vec(),
        )?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guidance_sharpens_towards_positive() {
        let positive = [1.0f32, 2.0, -1.0];
        let negative = [0.0f32, 1.0, 1.0];
        assert_eq!(apply_guidance(&positive, &negative, 1.0), vec![1.0, 2.0, -1.0]);
        assert_eq!(apply_guidance(&positive, &negative, 0.0), vec![0.0, 1.0, 1.0]);
        assert_eq!(apply_guidance(&positive, &negative, 2.0), vec![2.0, 3.0, -3.0]);
    }

    #[test]
    fn type_embedding_is_added_per_position() {
        let mut hidden = vec![1.0f32, 2.0, 3.0, 4.0];
        add_embedding(&mut hidden, &[10.0, 20.0]);
        assert_eq!(hidden, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn sigmoid_thresholds_at_zero_logit() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(4.0) > 0.5);
        assert!(sigmoid(-4.0) < 0.5);
    }

    #[test]
    fn empty_arguments_are_rejected() {
        assert!(matches!(
            validate_request("", "voice"),
            Err(LyrebirdError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_request("   \n", "voice"),
            Err(LyrebirdError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_request("hello", ""),
            Err(LyrebirdError::InvalidArgument(_))
        ));
        assert!(validate_request("hello", "voice").is_ok());
    }

    #[test]
    fn last_hidden_vector_takes_final_position() {
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(last_hidden_vector(&data, 2).unwrap(), vec![5.0, 6.0]);
        assert!(last_hidden_vector(&data, 4).is_err());
        assert!(last_hidden_vector(&[], 2).is_err());
    }

    #[test]
    fn frames_are_rescaled_and_stacked_channel_major() {
        let frames = vec![vec![2.0f32, 4.0], vec![6.0f32, 8.0]];
        // layout [1, latent, frames]: channel rows, frame columns
        let stacked = stack_frames(&frames, 2, 2.0, 1.0);
        assert_eq!(stacked, vec![0.0, 2.0, 1.0, 3.0]);
    }

    #[test]
    fn type_embedding_table_must_be_two_rows() {
        let table = TensorData::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let (speech, text) = split_type_embeddings(&table, 3).unwrap();
        assert_eq!(speech, vec![1.0, 2.0, 3.0]);
        assert_eq!(text, vec![4.0, 5.0, 6.0]);

        let bad = TensorData::new(vec![3, 2], vec![0.0; 6]).unwrap();
        assert!(split_type_embeddings(&bad, 2).is_err());
    }

    #[test]
    fn cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn missing_models_dir_fails_before_session_load() {
        let err = PipelineBuilder::new("/nonexistent/models").build().unwrap_err();
        assert!(matches!(err, LyrebirdError::NotFound(_)));
    }

    #[test]
    fn zero_max_frames_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineBuilder::new(dir.path())
            .max_frames(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, LyrebirdError::InvalidArgument(_)));
    }
}
