//! Voice preset discovery and loading.
//!
//! A voice preset is an immutable bundle of conditioning tensors computed from
//! a reference recording: per-layer attention key/value caches at two depths
//! (shallow base-LM cache and deep TTS cache) for both guidance paths, one
//! cached hidden-state vector per path, plus speaker metadata.
//!
//! # Layout
//!
//! Discovery prefers an explicit `manifest.json`; without one, every
//! subdirectory of `voices/` is a voice whose `.npy` files are its tensors
//! (named by file stem), and every loose top-level `.npy` file is a
//! single-tensor voice named after the file.
//!
//! ```text
//! voices/
//! ├── manifest.json                 (optional)
//! └── en-Carter_man/
//!     ├── metadata.json
//!     ├── positive_lm_0_key.npy     … positive_lm_3_value.npy
//!     ├── positive_tts_0_key.npy    … positive_tts_19_value.npy
//!     ├── positive_hidden.npy
//!     └── negative_…                (same set for the unconditioned path)
//! ```

use crate::error::{LyrebirdError, Result};
use crate::npy::{self, TensorData};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Speaker metadata stored next to the tensors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceMetadata {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// Per-voice latent rescale overrides; pipeline defaults apply when absent.
    #[serde(default)]
    pub speech_scaling_factor: Option<f32>,
    #[serde(default)]
    pub speech_bias_factor: Option<f32>,
}

/// One guidance path's seed state: both cache depths plus the cached hidden
/// vector.
#[derive(Debug)]
pub struct GuidancePath {
    /// Shallow base-LM cache, one `(key, value)` per layer.
    pub lm_cache: Vec<(Arc<TensorData>, Arc<TensorData>)>,
    /// Deep TTS cache, one `(key, value)` per layer.
    pub tts_cache: Vec<(Arc<TensorData>, Arc<TensorData>)>,
    /// Most recent hidden state from preparing the reference recording.
    pub hidden: Arc<TensorData>,
    lm_len: usize,
    tts_len: usize,
}

impl GuidancePath {
    fn from_tensors(
        tensors: &BTreeMap<String, Arc<TensorData>>,
        prefix: &str,
        lm_layers: usize,
        tts_layers: usize,
    ) -> Result<Self> {
        let fetch = |name: String| -> Result<Arc<TensorData>> {
            tensors.get(&name).cloned().ok_or_else(|| {
                LyrebirdError::DataFormat(format!("voice tensor '{name}' is missing"))
            })
        };

        let load_depth = |group: &str, layers: usize| -> Result<Vec<(Arc<TensorData>, Arc<TensorData>)>> {
            let mut cache = Vec::with_capacity(layers);
            for layer in 0..layers {
                let key = fetch(format!("{prefix}_{group}_{layer}_key"))?;
                let value = fetch(format!("{prefix}_{group}_{layer}_value"))?;
                if key.shape() != value.shape() {
                    return Err(LyrebirdError::DataFormat(format!(
                        "voice tensor {prefix}_{group}_{layer}: key shape {:?} != value shape {:?}",
                        key.shape(),
                        value.shape()
                    )));
                }
                if key.rank() != 4 {
                    return Err(LyrebirdError::DataFormat(format!(
                        "voice tensor {prefix}_{group}_{layer}_key: expected rank 4 cache, got shape {:?}",
                        key.shape()
                    )));
                }
                cache.push((key, value));
            }
            Ok(cache)
        };

        let lm_cache = load_depth("lm", lm_layers)?;
        let tts_cache = load_depth("tts", tts_layers)?;
        let hidden = fetch(format!("{prefix}_hidden"))?;
        if hidden.is_empty() {
            return Err(LyrebirdError::DataFormat(format!(
                "voice tensor {prefix}_hidden is empty"
            )));
        }

        let lm_len = cache_seq_len(&lm_cache, prefix, "lm")?;
        let tts_len = cache_seq_len(&tts_cache, prefix, "tts")?;

        Ok(Self {
            lm_cache,
            tts_cache,
            hidden,
            lm_len,
            tts_len,
        })
    }

    /// Sequence length already held in the shallow cache.
    pub fn lm_cache_len(&self) -> usize {
        self.lm_len
    }

    /// Sequence length already held in the deep cache.
    pub fn tts_cache_len(&self) -> usize {
        self.tts_len
    }
}

/// Every layer of one depth must agree on its cached sequence length.
fn cache_seq_len(
    cache: &[(Arc<TensorData>, Arc<TensorData>)],
    prefix: &str,
    group: &str,
) -> Result<usize> {
    let mut seq_len = None;
    for (layer, (key, _)) in cache.iter().enumerate() {
        let len = key.dim(2)?;
        match seq_len {
            None => seq_len = Some(len),
            Some(expected) if expected != len => {
                return Err(LyrebirdError::DataFormat(format!(
                    "voice cache {prefix}_{group}: layer {layer} holds {len} positions, expected {expected}"
                )));
            }
            Some(_) => {}
        }
    }
    seq_len.ok_or_else(|| {
        LyrebirdError::DataFormat(format!("voice cache {prefix}_{group} has no layers"))
    })
}

/// An immutable, named conditioning bundle. Shared read-only across requests.
#[derive(Debug)]
pub struct VoicePreset {
    name: String,
    metadata: VoiceMetadata,
    positive: GuidancePath,
    negative: GuidancePath,
    tensors: BTreeMap<String, Arc<TensorData>>,
}

impl VoicePreset {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &VoiceMetadata {
        &self.metadata
    }

    /// Voice-conditioned guidance path.
    pub fn positive(&self) -> &GuidancePath {
        &self.positive
    }

    /// Unconditioned guidance path.
    pub fn negative(&self) -> &GuidancePath {
        &self.negative
    }

    /// Raw named-tensor access.
    pub fn tensor(&self, name: &str) -> Option<&TensorData> {
        self.tensors.get(name).map(Arc::as_ref)
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    voices: BTreeMap<String, ManifestVoice>,
}

#[derive(Deserialize)]
struct ManifestVoice {
    #[serde(default)]
    metadata: Option<String>,
    tensors: BTreeMap<String, String>,
}

#[derive(Debug)]
enum VoiceSource {
    Manifest {
        tensors: BTreeMap<String, PathBuf>,
        metadata: Option<PathBuf>,
    },
    Directory(PathBuf),
    LooseFile(PathBuf),
}

/// Voice discovery and preset loading over one `voices/` tree.
///
/// Presets are loaded once and cached; repeated loads return the same
/// immutable snapshot.
#[derive(Debug)]
pub struct VoiceLibrary {
    sources: BTreeMap<String, VoiceSource>,
    lm_layers: usize,
    tts_layers: usize,
    cache: Mutex<HashMap<String, Arc<VoicePreset>>>,
}

impl VoiceLibrary {
    /// Scan a voices directory.
    ///
    /// `lm_layers` / `tts_layers` are the cache depths every structured
    /// preset must provide for both guidance paths.
    pub fn open(root: &Path, lm_layers: usize, tts_layers: usize) -> Result<Self> {
        if !root.is_dir() {
            return Err(LyrebirdError::NotFound(format!(
                "voices directory {} does not exist",
                root.display()
            )));
        }

        let manifest_path = root.join("manifest.json");
        let sources = if manifest_path.is_file() {
            let raw = std::fs::read_to_string(&manifest_path)?;
            let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| {
                LyrebirdError::DataFormat(format!(
                    "malformed voice manifest {}: {}",
                    manifest_path.display(),
                    e
                ))
            })?;
            debug!("voice manifest lists {} voices", manifest.voices.len());
            manifest
                .voices
                .into_iter()
                .map(|(name, voice)| {
                    let tensors = voice
                        .tensors
                        .into_iter()
                        .map(|(tensor, rel)| (tensor, root.join(rel)))
                        .collect();
                    let metadata = voice.metadata.map(|rel| root.join(rel));
                    (name, VoiceSource::Manifest { tensors, metadata })
                })
                .collect()
        } else {
            let mut sources = BTreeMap::new();
            for entry in std::fs::read_dir(root)? {
                let entry = entry?;
                let path = entry.path();
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if path.is_dir() {
                    sources.insert(name.to_string(), VoiceSource::Directory(path));
                } else if path.extension().and_then(|e| e.to_str()) == Some("npy") {
                    sources.insert(name.to_string(), VoiceSource::LooseFile(path));
                }
            }
            sources
        };

        info!("voice library: {} voices available", sources.len());

        Ok(Self {
            sources,
            lm_layers,
            tts_layers,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Known voice names, sorted.
    pub fn voice_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Load a voice's raw named tensors without structuring them.
    pub fn load_tensors(&self, name: &str) -> Result<BTreeMap<String, Arc<TensorData>>> {
        let source = self.source(name)?;
        let mut tensors = BTreeMap::new();
        match source {
            VoiceSource::Manifest { tensors: files, .. } => {
                for (tensor, path) in files {
                    tensors.insert(tensor.clone(), Arc::new(read_voice_tensor(name, path)?));
                }
            }
            VoiceSource::Directory(dir) => {
                for entry in std::fs::read_dir(dir)? {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("npy") {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    tensors.insert(stem.to_string(), Arc::new(read_voice_tensor(name, &path)?));
                }
            }
            VoiceSource::LooseFile(path) => {
                tensors.insert(name.to_string(), Arc::new(read_voice_tensor(name, path)?));
            }
        }
        Ok(tensors)
    }

    /// Load (or return the cached) structured preset for a voice.
    pub fn load_preset(&self, name: &str) -> Result<Arc<VoicePreset>> {
        if let Some(preset) = self
            .cache
            .lock()
            .map_err(|_| LyrebirdError::ModelExecution("voice cache lock poisoned".to_string()))?
            .get(name)
        {
            return Ok(Arc::clone(preset));
        }

        let tensors = self.load_tensors(name)?;
        let metadata = self.load_metadata(name)?;
        let positive =
            GuidancePath::from_tensors(&tensors, "positive", self.lm_layers, self.tts_layers)?;
        let negative =
            GuidancePath::from_tensors(&tensors, "negative", self.lm_layers, self.tts_layers)?;

        debug!(
            "loaded voice '{}': {} tensors, lm cache {} positions, tts cache {} positions",
            name,
            tensors.len(),
            positive.lm_cache_len(),
            positive.tts_cache_len()
        );

        let preset = Arc::new(VoicePreset {
            name: name.to_string(),
            metadata,
            positive,
            negative,
            tensors,
        });

        self.cache
            .lock()
            .map_err(|_| LyrebirdError::ModelExecution("voice cache lock poisoned".to_string()))?
            .insert(name.to_string(), Arc::clone(&preset));
        Ok(preset)
    }

    fn source(&self, name: &str) -> Result<&VoiceSource> {
        self.sources.get(name).ok_or_else(|| {
            LyrebirdError::NotFound(format!(
                "unknown voice '{}' (known voices: {})",
                name,
                self.voice_names().join(", ")
            ))
        })
    }

    fn load_metadata(&self, name: &str) -> Result<VoiceMetadata> {
        let path = match self.source(name)? {
            VoiceSource::Manifest { metadata, .. } => metadata.clone(),
            VoiceSource::Directory(dir) => {
                let candidate = dir.join("metadata.json");
                candidate.is_file().then_some(candidate)
            }
            VoiceSource::LooseFile(_) => None,
        };
        let Some(path) = path else {
            return Ok(VoiceMetadata::default());
        };
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| {
            LyrebirdError::DataFormat(format!(
                "malformed voice metadata {}: {}",
                path.display(),
                e
            ))
        })
    }
}

fn read_voice_tensor(voice: &str, path: &Path) -> Result<TensorData> {
    if !path.is_file() {
        return Err(LyrebirdError::DataFormat(format!(
            "voice '{}' references missing tensor file {}",
            voice,
            path.display()
        )));
    }
    npy::read_tensor(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LM_LAYERS: usize = 1;
    const TTS_LAYERS: usize = 2;

    fn write_tensor(path: &Path, shape: Vec<usize>, fill: f32) {
        let count = shape.iter().product();
        let tensor = TensorData::new(shape, vec![fill; count]).unwrap();
        npy::write_tensor(path, &tensor).unwrap();
    }

    fn write_voice(dir: &Path, fill: f32) {
        std::fs::create_dir_all(dir).unwrap();
        for prefix in ["positive", "negative"] {
            for layer in 0..LM_LAYERS {
                for part in ["key", "value"] {
                    write_tensor(
                        &dir.join(format!("{prefix}_lm_{layer}_{part}.npy")),
                        vec![1, 1, 3, 2],
                        fill,
                    );
                }
            }
            for layer in 0..TTS_LAYERS {
                for part in ["key", "value"] {
                    write_tensor(
                        &dir.join(format!("{prefix}_tts_{layer}_{part}.npy")),
                        vec![1, 1, 4, 2],
                        fill,
                    );
                }
            }
            write_tensor(&dir.join(format!("{prefix}_hidden.npy")), vec![8], fill);
        }
    }

    fn library(root: &Path) -> VoiceLibrary {
        VoiceLibrary::open(root, LM_LAYERS, TTS_LAYERS).unwrap()
    }

    #[test]
    fn convention_layout_is_discovered() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(&dir.path().join("carter"), 0.5);
        write_voice(&dir.path().join("emma"), 0.25);

        let lib = library(dir.path());
        assert_eq!(lib.voice_names(), vec!["carter", "emma"]);

        let preset = lib.load_preset("carter").unwrap();
        assert_eq!(preset.name(), "carter");
        assert_eq!(preset.positive().tts_cache.len(), TTS_LAYERS);
        assert_eq!(preset.positive().tts_cache_len(), 4);
        assert_eq!(preset.positive().lm_cache_len(), 3);
        assert_eq!(preset.negative().hidden.data()[0], 0.5);
    }

    #[test]
    fn unknown_voice_lists_known_names() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(&dir.path().join("carter"), 0.5);
        write_voice(&dir.path().join("emma"), 0.25);

        let err = library(dir.path()).load_preset("nobody").unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, LyrebirdError::NotFound(_)));
        assert!(message.contains("carter"));
        assert!(message.contains("emma"));
    }

    #[test]
    fn repeated_loads_return_the_same_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(&dir.path().join("carter"), 0.5);

        let lib = library(dir.path());
        let first = lib.load_preset("carter").unwrap();
        let second = lib.load_preset("carter").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            first.tensor("positive_hidden").unwrap().data(),
            second.tensor("positive_hidden").unwrap().data()
        );
    }

    #[test]
    fn metadata_is_read_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let voice_dir = dir.path().join("carter");
        write_voice(&voice_dir, 0.5);
        std::fs::write(
            voice_dir.join("metadata.json"),
            r#"{"display_name": "Carter", "speech_scaling_factor": 0.75}"#,
        )
        .unwrap();

        let preset = library(dir.path()).load_preset("carter").unwrap();
        assert_eq!(preset.metadata().display_name.as_deref(), Some("Carter"));
        assert_eq!(preset.metadata().speech_scaling_factor, Some(0.75));
        assert_eq!(preset.metadata().speech_bias_factor, None);
    }

    #[test]
    fn manifest_takes_precedence_over_convention() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(&dir.path().join("carter"), 0.5);
        write_voice(&dir.path().join("hidden-from-manifest"), 0.25);

        let mut manifest = String::from(r#"{"voices": {"carter": {"tensors": {"#);
        let mut first = true;
        for prefix in ["positive", "negative"] {
            for layer in 0..LM_LAYERS {
                for part in ["key", "value"] {
                    if !first {
                        manifest.push(',');
                    }
                    first = false;
                    manifest.push_str(&format!(
                        r#""{prefix}_lm_{layer}_{part}": "carter/{prefix}_lm_{layer}_{part}.npy""#
                    ));
                }
            }
            for layer in 0..TTS_LAYERS {
                for part in ["key", "value"] {
                    manifest.push_str(&format!(
                        r#","{prefix}_tts_{layer}_{part}": "carter/{prefix}_tts_{layer}_{part}.npy""#
                    ));
                }
            }
            manifest.push_str(&format!(
                r#","{prefix}_hidden": "carter/{prefix}_hidden.npy""#
            ));
        }
        manifest.push_str("}}}}");
        std::fs::write(dir.path().join("manifest.json"), manifest).unwrap();

        let lib = library(dir.path());
        assert_eq!(lib.voice_names(), vec!["carter"]);
        let preset = lib.load_preset("carter").unwrap();
        assert_eq!(preset.positive().tts_cache_len(), 4);
    }

    #[test]
    fn loose_file_is_a_single_tensor_voice() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(&dir.path().join("carter"), 0.5);
        write_tensor(&dir.path().join("solo.npy"), vec![4], 1.0);

        let lib = library(dir.path());
        assert_eq!(lib.voice_names(), vec!["carter", "solo"]);

        let tensors = lib.load_tensors("solo").unwrap();
        assert_eq!(tensors.len(), 1);
        assert_eq!(tensors["solo"].shape(), &[4]);

        // A bare tensor cannot seed the guidance caches.
        let err = lib.load_preset("solo").unwrap_err();
        assert!(matches!(err, LyrebirdError::DataFormat(_)));
    }

    #[test]
    fn missing_cache_tensor_is_data_format() {
        let dir = tempfile::tempdir().unwrap();
        let voice_dir = dir.path().join("carter");
        write_voice(&voice_dir, 0.5);
        std::fs::remove_file(voice_dir.join("negative_tts_1_value.npy")).unwrap();

        let err = library(dir.path()).load_preset("carter").unwrap_err();
        assert!(err.to_string().contains("negative_tts_1_value"));
    }

    #[test]
    fn inconsistent_cache_lengths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let voice_dir = dir.path().join("carter");
        write_voice(&voice_dir, 0.5);
        write_tensor(
            &voice_dir.join("positive_tts_1_key.npy"),
            vec![1, 1, 9, 2],
            0.5,
        );
        write_tensor(
            &voice_dir.join("positive_tts_1_value.npy"),
            vec![1, 1, 9, 2],
            0.5,
        );

        let err = library(dir.path()).load_preset("carter").unwrap_err();
        assert!(matches!(err, LyrebirdError::DataFormat(_)));
    }

    #[test]
    fn missing_root_is_not_found() {
        let err = VoiceLibrary::open(Path::new("/nonexistent/voices"), 1, 1).unwrap_err();
        assert!(matches!(err, LyrebirdError::NotFound(_)));
    }
}
