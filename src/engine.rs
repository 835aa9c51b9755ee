//! ONNX Runtime session pool for the pipeline's computation graphs.
//!
//! Seven precompiled graphs make up one exported model:
//!
//! ```text
//! language_model.onnx      text ids + shallow cache → per-token hidden states
//! tts_prefill.onnx         tagged embeddings + deep cache → hidden + presents
//! tts_step.onnx            one embedded frame + deep cache → hidden + presents
//! diffusion_head.onnx      noisy latent + timestep + condition → model output
//! acoustic_connector.onnx  frame latent → hidden-sized embedding
//! acoustic_decoder.onnx    stacked latents → waveform samples
//! stop_classifier.onnx     condition → stop logit
//! ```
//!
//! Sessions are loaded once at construction (amortizing graph load cost) and
//! shared behind mutexes: concurrent requests contend for the same graphs but
//! cannot corrupt them. Dropping the engine releases every session.
//! Execution-provider selection is deliberately left to the embedding
//! application's process-wide `ort` configuration.

use crate::error::{LyrebirdError, Result};
use crate::npy::TensorData;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor as OrtTensor;
use std::borrow::Cow;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Session construction options, pass-through to ONNX Runtime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub intra_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { intra_threads: 4 }
    }
}

/// The computation graphs of one model, addressable by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Graph {
    LanguageModel,
    TtsPrefill,
    TtsStep,
    DiffusionHead,
    AcousticConnector,
    AcousticDecoder,
    StopClassifier,
}

impl Graph {
    const ALL: [Graph; 7] = [
        Graph::LanguageModel,
        Graph::TtsPrefill,
        Graph::TtsStep,
        Graph::DiffusionHead,
        Graph::AcousticConnector,
        Graph::AcousticDecoder,
        Graph::StopClassifier,
    ];

    fn file_name(self) -> &'static str {
        match self {
            Graph::LanguageModel => "language_model.onnx",
            Graph::TtsPrefill => "tts_prefill.onnx",
            Graph::TtsStep => "tts_step.onnx",
            Graph::DiffusionHead => "diffusion_head.onnx",
            Graph::AcousticConnector => "acoustic_connector.onnx",
            Graph::AcousticDecoder => "acoustic_decoder.onnx",
            Graph::StopClassifier => "stop_classifier.onnx",
        }
    }
}

/// Owned handle over all loaded sessions.
///
/// Constructed once and passed into the pipeline; intentionally not a global.
#[derive(Debug)]
pub struct InferenceEngine {
    language_model: Mutex<Session>,
    tts_prefill: Mutex<Session>,
    tts_step: Mutex<Session>,
    diffusion_head: Mutex<Session>,
    acoustic_connector: Mutex<Session>,
    acoustic_decoder: Mutex<Session>,
    stop_classifier: Mutex<Session>,
}

impl InferenceEngine {
    /// Load every graph from `models_dir`.
    ///
    /// All files are checked for existence first, so a missing graph fails
    /// fast before any session memory is committed.
    pub fn load(models_dir: &Path, config: &EngineConfig) -> Result<Self> {
        for graph in Graph::ALL {
            let path = models_dir.join(graph.file_name());
            if !path.is_file() {
                return Err(LyrebirdError::NotFound(format!(
                    "required model file {} is missing",
                    path.display()
                )));
            }
        }

        let load = |graph: Graph| -> Result<Mutex<Session>> {
            let path = models_dir.join(graph.file_name());
            Ok(Mutex::new(load_session(&path, graph.file_name(), config)?))
        };
        let engine = Self {
            language_model: load(Graph::LanguageModel)?,
            tts_prefill: load(Graph::TtsPrefill)?,
            tts_step: load(Graph::TtsStep)?,
            diffusion_head: load(Graph::DiffusionHead)?,
            acoustic_connector: load(Graph::AcousticConnector)?,
            acoustic_decoder: load(Graph::AcousticDecoder)?,
            stop_classifier: load(Graph::StopClassifier)?,
        };

        info!(
            "inference engine ready: {} graphs loaded from {}",
            Graph::ALL.len(),
            models_dir.display()
        );
        Ok(engine)
    }

    /// Run one graph and extract every f32 output in declaration order.
    pub(crate) fn run(
        &self,
        graph: Graph,
        inputs: Vec<(Cow<'static, str>, SessionInputValue<'static>)>,
    ) -> Result<Vec<TensorData>> {
        let session = match graph {
            Graph::LanguageModel => &self.language_model,
            Graph::TtsPrefill => &self.tts_prefill,
            Graph::TtsStep => &self.tts_step,
            Graph::DiffusionHead => &self.diffusion_head,
            Graph::AcousticConnector => &self.acoustic_connector,
            Graph::AcousticDecoder => &self.acoustic_decoder,
            Graph::StopClassifier => &self.stop_classifier,
        };

        let mut session = session.lock().map_err(|_| {
            LyrebirdError::ModelExecution(format!("{} session lock poisoned", graph.file_name()))
        })?;

        let outputs = session.run(inputs).map_err(|e| {
            LyrebirdError::ModelExecution(format!("{} failed: {}", graph.file_name(), e))
        })?;

        let mut extracted = Vec::with_capacity(outputs.len());
        for i in 0..outputs.len() {
            let (shape, data) = outputs[i].try_extract_tensor::<f32>().map_err(|e| {
                LyrebirdError::ModelExecution(format!(
                    "{} output {} is not an f32 tensor: {}",
                    graph.file_name(),
                    i,
                    e
                ))
            })?;
            let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            extracted.push(TensorData::new(shape, data.to_vec())?);
        }
        Ok(extracted)
    }
}

fn load_session(path: &Path, name: &str, config: &EngineConfig) -> Result<Session> {
    debug!("loading session {} from {}", name, path.display());
    Session::builder()
        .map_err(|e| {
            LyrebirdError::ModelExecution(format!("session builder failed for {name}: {e}"))
        })?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| {
            LyrebirdError::ModelExecution(format!("optimization level rejected for {name}: {e}"))
        })?
        .with_intra_threads(config.intra_threads)
        .map_err(|e| {
            LyrebirdError::ModelExecution(format!("thread config rejected for {name}: {e}"))
        })?
        .commit_from_file(path)
        .map_err(|e| {
            LyrebirdError::ModelExecution(format!(
                "failed loading {name} from {}: {e}",
                path.display()
            ))
        })
}

/// Build a named f32 tensor input.
pub(crate) fn f32_input(
    name: &'static str,
    shape: Vec<i64>,
    data: Vec<f32>,
) -> Result<(Cow<'static, str>, SessionInputValue<'static>)> {
    let tensor = OrtTensor::from_array((shape, data))?;
    Ok((Cow::Borrowed(name), tensor.into()))
}

/// Build a dynamically named f32 tensor input (cache layers).
pub(crate) fn f32_input_named(
    name: String,
    shape: Vec<i64>,
    data: Vec<f32>,
) -> Result<(Cow<'static, str>, SessionInputValue<'static>)> {
    let tensor = OrtTensor::from_array((shape, data))?;
    Ok((Cow::Owned(name), tensor.into()))
}

/// Build a named i64 tensor input.
pub(crate) fn i64_input(
    name: &'static str,
    shape: Vec<i64>,
    data: Vec<i64>,
) -> Result<(Cow<'static, str>, SessionInputValue<'static>)> {
    let tensor = OrtTensor::from_array((shape, data))?;
    Ok((Cow::Borrowed(name), tensor.into()))
}
