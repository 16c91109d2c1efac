/// Mono floating point PCM in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Peak-safe RMS normalization towards `target_rms`; silent input is left as-is.
    pub fn normalize_rms(&mut self, target_rms: f32) {
        if self.samples.is_empty() {
            return;
        }
        let sum_sq: f32 = self.samples.iter().map(|s| s * s).sum();
        let rms = (sum_sq / self.samples.len() as f32).sqrt();
        if rms <= f32::EPSILON {
            return;
        }
        let peak = self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let gain = (target_rms / rms).min(0.99 / peak.max(f32::EPSILON));
        for s in &mut self.samples {
            *s *= gain;
        }
    }
}
