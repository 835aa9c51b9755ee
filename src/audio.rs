//! Waveform container returned by the pipeline.
//!
//! Container encoding (WAV and friends) is the embedding application's job;
//! this type only carries clipped samples at a fixed rate.

/// Final audio of one generation request.
#[derive(Clone, PartialEq)]
pub struct Waveform {
    /// Samples in [-1.0, 1.0].
    samples: Vec<f32>,
    /// Sample rate in Hz.
    sample_rate: u32,
}

impl Waveform {
    /// Build a waveform, clamping every sample into the valid amplitude range.
    pub fn from_samples_clipped(mut samples: Vec<f32>, sample_rate: u32) -> Self {
        for sample in &mut samples {
            *sample = sample.clamp(-1.0, 1.0);
        }
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

impl std::fmt::Debug for Waveform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waveform")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("duration_secs", &self.duration_secs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_clipped_into_range() {
        let wav = Waveform::from_samples_clipped(vec![-2.0, -0.5, 0.0, 0.5, 3.0], 24000);
        assert_eq!(wav.samples(), &[-1.0, -0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn duration_follows_sample_rate() {
        let wav = Waveform::from_samples_clipped(vec![0.0; 48000], 24000);
        assert_eq!(wav.num_samples(), 48000);
        assert!((wav.duration_secs() - 2.0).abs() < 1e-6);
    }
}
