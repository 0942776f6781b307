use std::ops::Range;

const FRAME_MS: usize = 30;
const DEFAULT_VAD_THOLD: f32 = 0.35; // frame_energy < 0.35 × energy_all ⇒ silence
const DEFAULT_PAD_MS: usize = 200;

/// Voice Activity Detector using energy-based algorithm
///
/// A frame is silent when its mean absolute amplitude drops below
/// `vad_thold` times the mean over the whole clip. Silent runs of at least
/// `min_silence_ms` are cut, keeping 200 ms of context on each side.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    sample_rate: usize,
    frame_samples: usize,
    min_silence_frames: usize,
    pad_samples: usize,
    vad_thold: f32,
}

impl EnergyVad {
    pub fn new(sample_rate: u32, min_silence_ms: u32) -> Self {
        let sample_rate = sample_rate as usize;
        let frame_samples = (sample_rate * FRAME_MS / 1_000).max(1);
        Self {
            sample_rate,
            frame_samples,
            min_silence_frames: (min_silence_ms as usize).div_ceil(FRAME_MS).max(1),
            pad_samples: sample_rate * DEFAULT_PAD_MS / 1_000,
            vad_thold: DEFAULT_VAD_THOLD,
        }
    }

    /// Sample ranges that contain speech, sorted and non-overlapping.
    pub fn speech_spans(&self, pcm: &[f32]) -> Vec<Range<usize>> {
        if pcm.is_empty() {
            return Vec::new();
        }

        let energies: Vec<f32> = pcm
            .chunks(self.frame_samples)
            .map(|f| f.iter().map(|s| s.abs()).sum::<f32>() / f.len() as f32)
            .collect();
        let energy_all = pcm.iter().map(|s| s.abs() as f64).sum::<f64>() / pcm.len() as f64;
        if energy_all == 0.0 {
            return Vec::new();
        }
        let cutoff = self.vad_thold * energy_all as f32;

        // Silent runs long enough to drop, in frame indices.
        let mut cuts: Vec<Range<usize>> = Vec::new();
        let mut run_start = None;
        for (i, &e) in energies.iter().enumerate() {
            match (e < cutoff, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    if i - start >= self.min_silence_frames {
                        cuts.push(start..i);
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            if energies.len() - start >= self.min_silence_frames {
                cuts.push(start..energies.len());
            }
        }

        // Speech is the complement, padded and merged.
        let mut spans: Vec<Range<usize>> = Vec::new();
        let mut cursor = 0;
        cuts.push(energies.len()..energies.len());
        for cut in &cuts {
            if cut.start > cursor {
                let start = (cursor * self.frame_samples).saturating_sub(self.pad_samples);
                let end = (cut.start * self.frame_samples + self.pad_samples).min(pcm.len());
                match spans.last_mut() {
                    Some(prev) if prev.end >= start => prev.end = end,
                    _ => spans.push(start..end),
                }
            }
            cursor = cut.end;
        }
        spans
    }

    /// Drops long silences and returns the remaining audio with a timeline
    /// mapping filtered time back to the input.
    pub fn filter(&self, pcm: &[f32]) -> (Vec<f32>, SpeechTimeline) {
        let spans = self.speech_spans(pcm);
        let mut speech = Vec::with_capacity(spans.iter().map(|s| s.len()).sum());
        let mut pieces = Vec::with_capacity(spans.len());
        for span in spans {
            pieces.push(TimelinePiece {
                filtered_start: speech.len(),
                original_start: span.start,
                len: span.len(),
            });
            speech.extend_from_slice(&pcm[span]);
        }
        tracing::debug!(
            input_samples = pcm.len(),
            speech_samples = speech.len(),
            "vad filter applied"
        );
        (
            speech,
            SpeechTimeline {
                sample_rate: self.sample_rate,
                pieces,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TimelinePiece {
    filtered_start: usize,
    original_start: usize,
    len: usize,
}

/// Maps timestamps in VAD-filtered audio back onto the original clip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeechTimeline {
    sample_rate: usize,
    pieces: Vec<TimelinePiece>,
}

impl SpeechTimeline {
    /// No filtering happened; times map to themselves.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn to_original(&self, secs: f64) -> f64 {
        if self.pieces.is_empty() || self.sample_rate == 0 {
            return secs;
        }
        let sample = (secs * self.sample_rate as f64).max(0.0) as usize;
        let piece = self
            .pieces
            .iter()
            .rev()
            .find(|p| p.filtered_start <= sample)
            .unwrap_or(&self.pieces[0]);
        let offset = (sample - piece.filtered_start.min(sample)).min(piece.len);
        (piece.original_start + offset) as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 16_000;

    fn tone(ms: usize) -> Vec<f32> {
        (0..SR as usize * ms / 1000)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect()
    }

    fn silence(ms: usize) -> Vec<f32> {
        vec![0.0; SR as usize * ms / 1000]
    }

    fn clip(parts: &[Vec<f32>]) -> Vec<f32> {
        parts.concat()
    }

    #[test]
    fn long_silence_is_cut() {
        let pcm = clip(&[tone(990), silence(2010), tone(990)]);
        let (speech, _) = EnergyVad::new(SR, 500).filter(&pcm);
        assert!(speech.len() < pcm.len());
        // 2 × 990 ms of tone plus up to 200 ms padding on each inner edge
        assert!(speech.len() <= (990 + 990 + 400) * 16 + EnergyVad::new(SR, 500).frame_samples * 2);
    }

    #[test]
    fn short_pause_is_kept() {
        let pcm = clip(&[tone(990), silence(300), tone(990)]);
        let spans = EnergyVad::new(SR, 500).speech_spans(&pcm);
        assert_eq!(spans, vec![0..pcm.len()]);
    }

    #[test]
    fn digital_silence_has_no_speech() {
        let pcm = silence(1000);
        let (speech, timeline) = EnergyVad::new(SR, 500).filter(&pcm);
        assert!(speech.is_empty());
        assert_eq!(timeline.to_original(0.25), 0.25);
    }

    #[test]
    fn timeline_restores_original_offsets() {
        let pcm = clip(&[tone(990), silence(3000), tone(990)]);
        let vad = EnergyVad::new(SR, 500);
        let spans = vad.speech_spans(&pcm);
        assert_eq!(spans.len(), 2);

        let (_, timeline) = vad.filter(&pcm);
        let first_len = spans[0].len() as f64 / SR as f64;
        // Times in the second kept span shift by the removed silence.
        let mapped = timeline.to_original(first_len + 0.1);
        let expected = spans[1].start as f64 / SR as f64 + 0.1;
        assert!((mapped - expected).abs() < 1e-3);
        // Times inside the first span are untouched.
        assert!((timeline.to_original(0.5) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn identity_timeline_is_passthrough() {
        assert_eq!(SpeechTimeline::identity().to_original(12.5), 12.5);
    }
}
