//! lyrebird: autoregressive text-to-speech inference over precompiled ONNX
//! graphs.
//!
//! Turns text into a waveform with no training-framework dependency at
//! runtime: byte-level BPE tokenization, a deterministic multistep diffusion
//! solver, a minimal `.npy` voice-preset loader, and an autoregressive
//! generation loop running two parallel guidance contexts plus a learned stop
//! classifier, all reimplemented from first principles against a reference
//! model's numerics.
//!
//! # Quick Start
//!
//! ```no_run
//! use lyrebird::PipelineBuilder;
//!
//! let pipeline = PipelineBuilder::new("models").seed(42).build()?;
//!
//! for voice in pipeline.available_voices() {
//!     println!("voice: {voice}");
//! }
//!
//! let audio = pipeline.generate_audio("Hello, world!", "en-Carter_man")?;
//! println!("{} samples at {} Hz", audio.num_samples(), audio.sample_rate());
//! # Ok::<(), lyrebird::LyrebirdError>(())
//! ```
//!
//! The models directory is produced by the export tooling and contains the
//! seven computation graphs, `tokenizer.json`, `type_embeddings.npy`,
//! `model_config.json` and a `voices/` tree. Acquiring those files (and
//! encoding the returned [`Waveform`] into an audio container) is the
//! embedding application's responsibility; nothing here touches the network.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod npy;
pub mod pipeline;
pub mod scheduler;
pub mod tokenizer;
pub mod voices;

mod rng;
mod utils;

pub use audio::Waveform;
pub use config::ModelConfig;
pub use engine::{EngineConfig, InferenceEngine};
pub use error::{LyrebirdError, Result};
pub use npy::TensorData;
pub use pipeline::{CancelToken, InferencePipeline, PipelineBuilder};
pub use scheduler::{BetaSchedule, DiffusionScheduler, PredictionType, SolverState};
pub use tokenizer::Tokenizer;
pub use voices::{VoiceLibrary, VoiceMetadata, VoicePreset};

pub use utils::init_file_logging;
