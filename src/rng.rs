//! Seeded gaussian sampling for the per-frame initial latent.
//!
//! Generation must be byte-identical across calls and process restarts for a
//! fixed seed, so the noise source is a small self-contained PRNG rather than
//! `rand`'s thread-local entropy.

/// xorshift64*-backed normal sampler (Box-Muller).
pub(crate) struct GaussianRng {
    state: u64,
    spare: Option<f32>,
}

impl GaussianRng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero-only cycle in xorshift.
        let state = if seed == 0 {
            0x9E37_79B9_7F4A_7C15
        } else {
            seed
        };
        Self { state, spare: None }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform draw in the half-open interval [0, 1).
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Standard normal draw.
    pub fn next_normal(&mut self) -> f32 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        // Box-Muller; u1 shifted away from zero so the log stays finite.
        let u1 = 1.0 - self.next_f64();
        let u2 = self.next_f64();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// Draw `n` standard normal samples.
    pub fn normal_vec(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.next_normal()).collect()
    }
}
