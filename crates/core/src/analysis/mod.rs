use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use tracing::trace;

use crate::{config::AudioConfig, HueTempoError, Result};

const SILENCE_RMS: f32 = 1e-3;
/// Centre of the log-tempo prior used to break octave ambiguity.
const PRIOR_BPM: f32 = 120.0;
/// Width of the prior, in octaves.
const PRIOR_OCTAVES: f32 = 1.0;

/// Result of analysing one captured clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoEstimate {
    pub bpm: f32,
    /// Peak autocorrelation relative to the lag-zero energy, in [0, 1].
    pub confidence: f32,
}

/// Estimates the dominant tempo of a mono clip from the periodicity of its
/// spectral-flux onset envelope.
pub struct TempoEstimator {
    frame_size: usize,
    hop_size: usize,
    min_bpm: f32,
    max_bpm: f32,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl TempoEstimator {
    /// Creates an estimator searching `min_bpm..=max_bpm`. The FFT plan is
    /// built on first use.
    pub fn new(frame_size: usize, hop_size: usize, min_bpm: f32, max_bpm: f32) -> Self {
        Self {
            frame_size,
            hop_size,
            min_bpm,
            max_bpm,
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Creates an estimator from the audio section of the configuration.
    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(
            config.frame_size,
            config.hop_size,
            config.min_bpm,
            config.max_bpm,
        )
    }

    /// Returns `None` when the clip is silent, too short to contain two beats
    /// at the slowest tempo, or shows no periodicity.
    pub fn estimate(&mut self, samples: &[f32], sample_rate: u32) -> Result<Option<TempoEstimate>> {
        if self.frame_size < 2 || self.hop_size == 0 {
            return Err(HueTempoError::InvalidInput(
                "frame size must be at least two samples and hop size non-zero",
            ));
        }
        if sample_rate == 0 {
            return Err(HueTempoError::InvalidInput("sample rate must be non-zero"));
        }
        if !(self.min_bpm > 0.0 && self.max_bpm > self.min_bpm) {
            return Err(HueTempoError::InvalidInput("tempo range must be positive and ordered"));
        }

        if samples.len() < self.frame_size || compute_rms(samples) < SILENCE_RMS {
            return Ok(None);
        }

        let envelope = self.onset_envelope(samples)?;
        let hop_seconds = self.hop_size as f32 / sample_rate as f32;
        let min_lag = ((60.0 / self.max_bpm) / hop_seconds).floor().max(1.0) as usize;
        let max_lag = ((60.0 / self.min_bpm) / hop_seconds).ceil() as usize;
        if envelope.len() < 2 * max_lag {
            trace!(frames = envelope.len(), max_lag, "clip too short for tempo range");
            return Ok(None);
        }

        let energy: f32 = envelope.iter().map(|value| value * value).sum();
        if energy <= f32::EPSILON {
            return Ok(None);
        }

        let scores: Vec<f32> = (min_lag - 1..=max_lag + 1)
            .map(|lag| {
                let bpm = 60.0 / (lag.max(1) as f32 * hop_seconds);
                autocorrelation(&envelope, lag) * tempo_prior(bpm)
            })
            .collect();

        let (best, &peak) = scores[1..scores.len() - 1]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, score)| (index + 1, score))
            .ok_or(HueTempoError::InvalidInput("empty tempo search range"))?;
        if peak <= 0.0 {
            return Ok(None);
        }

        let offset = parabolic_offset(scores[best - 1], peak, scores[best + 1]);
        let lag = (min_lag - 1 + best) as f32 + offset;
        let bpm = 60.0 / (lag * hop_seconds);
        let confidence = (autocorrelation(&envelope, min_lag - 1 + best) / energy).clamp(0.0, 1.0);
        trace!(bpm, lag, confidence, "tempo estimated");

        Ok(Some(TempoEstimate { bpm, confidence }))
    }

    /// Half-wave rectified spectral flux per hop, mean removed.
    fn onset_envelope(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let frame_size = self.frame_size;
        let hop_size = self.hop_size;
        let fft = self.prepare_fft(frame_size);
        let mut previous = vec![0.0_f32; fft.spectrum.len()];
        let mut envelope = Vec::with_capacity(samples.len() / hop_size);

        for start in (0..=samples.len() - frame_size).step_by(hop_size) {
            let frame = &samples[start..start + frame_size];
            for (index, value) in frame.iter().enumerate() {
                fft.input[index] = *value * hann_value(index, frame_size);
            }
            fft.plan
                .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
                .map_err(|err| HueTempoError::msg(format!("fft failed: {err}")))?;

            let mut flux = 0.0;
            for (bin, last) in fft.spectrum.iter().zip(previous.iter_mut()) {
                let magnitude = bin.norm();
                flux += (magnitude - *last).max(0.0);
                *last = magnitude;
            }
            envelope.push(flux);
        }

        // The first frame is measured against silence.
        if let Some(first) = envelope.first_mut() {
            *first = 0.0;
        }

        let mean = envelope.iter().sum::<f32>() / envelope.len().max(1) as f32;
        for value in &mut envelope {
            *value -= mean;
        }
        Ok(envelope)
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if self.fft.as_ref().is_some_and(|fft| fft.size != size) {
            self.fft = None;
        }

        let planner = &mut self.fft_planner;
        self.fft.get_or_insert_with(|| FftResources::new(planner, size))
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for TempoEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempoEstimator")
            .field("frame_size", &self.frame_size)
            .field("hop_size", &self.hop_size)
            .field("min_bpm", &self.min_bpm)
            .field("max_bpm", &self.max_bpm)
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

fn autocorrelation(signal: &[f32], lag: usize) -> f32 {
    if lag >= signal.len() {
        return 0.0;
    }
    signal
        .iter()
        .zip(&signal[lag..])
        .map(|(a, b)| a * b)
        .sum()
}

/// Log-normal weight favouring tempi near [`PRIOR_BPM`].
fn tempo_prior(bpm: f32) -> f32 {
    let octaves = (bpm / PRIOR_BPM).log2() / PRIOR_OCTAVES;
    (-0.5 * octaves * octaves).exp()
}

/// Sub-sample position of a peak given its neighbours, in [-0.5, 0.5].
fn parabolic_offset(left: f32, centre: f32, right: f32) -> f32 {
    let denominator = left - 2.0 * centre + right;
    if denominator.abs() <= f32::EPSILON {
        return 0.0;
    }
    (0.5 * (left - right) / denominator).clamp(-0.5, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: u32 = 44_100;

    fn click_track(bpm: f32, seconds: f32) -> Vec<f32> {
        let total = (seconds * SAMPLE_RATE as f32) as usize;
        let period = (60.0 / bpm * SAMPLE_RATE as f32) as usize;
        let click_len = (0.03 * SAMPLE_RATE as f32) as usize;
        let mut samples = vec![0.0; total];

        for start in (0..total).step_by(period) {
            for n in 0..click_len.min(total - start) {
                let t = n as f32 / SAMPLE_RATE as f32;
                let decay = 1.0 - n as f32 / click_len as f32;
                samples[start + n] = (2.0 * PI * 1000.0 * t).sin() * decay;
            }
        }
        samples
    }

    fn estimator() -> TempoEstimator {
        TempoEstimator::from_config(&AudioConfig::default())
    }

    #[test]
    fn finds_tempo_of_click_track() {
        let estimate = estimator()
            .estimate(&click_track(120.0, 5.0), SAMPLE_RATE)
            .unwrap()
            .expect("click track has a tempo");

        assert!((estimate.bpm - 120.0).abs() < 3.0, "got {}", estimate.bpm);
        assert!(estimate.confidence > 0.0);
    }

    #[test]
    fn follows_a_slower_track() {
        let estimate = estimator()
            .estimate(&click_track(96.0, 5.0), SAMPLE_RATE)
            .unwrap()
            .expect("click track has a tempo");

        assert!((estimate.bpm - 96.0).abs() < 3.0, "got {}", estimate.bpm);
    }

    #[test]
    fn silence_has_no_tempo() {
        let silence = vec![0.0; SAMPLE_RATE as usize * 5];
        assert_eq!(estimator().estimate(&silence, SAMPLE_RATE).unwrap(), None);
    }

    #[test]
    fn short_clips_have_no_tempo() {
        let clip = click_track(120.0, 1.0);
        assert_eq!(estimator().estimate(&clip, SAMPLE_RATE).unwrap(), None);
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut estimator = TempoEstimator::new(1024, 0, 60.0, 180.0);
        let err = estimator.estimate(&[0.5; 2048], SAMPLE_RATE).unwrap_err();
        assert!(matches!(err, HueTempoError::InvalidInput(_)));
    }

    #[test]
    fn prior_prefers_moderate_tempi() {
        assert!(tempo_prior(120.0) > tempo_prior(60.0));
        assert!(tempo_prior(120.0) > tempo_prior(240.0));
        assert!((tempo_prior(60.0) - tempo_prior(240.0)).abs() < 1e-6);
    }
}
