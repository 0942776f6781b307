use whisper_rs::{FullParams, SamplingStrategy};

use crate::service::engine::InferenceParams;

/// whisper.cpp parameters for one inference call.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub beam_size: i32,
    pub n_threads: i32,
    // Resolved language, either the request hint or the detected one.
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub no_speech_thold: f32,
    pub logprob_thold: f32,
    // whisper.cpp's analogue of the compression-ratio cutoff
    pub entropy_thold: f32,
    // Enable token level timestamps
    pub token_timestamps: bool,
}

impl WhisperConfig {
    pub fn new(params: &InferenceParams, language: Option<String>, cpu_threads: usize) -> Self {
        Self {
            beam_size: params.beam_size as i32,
            n_threads: cpu_threads.max(1) as i32,
            language,
            initial_prompt: params.initial_prompt.clone(),
            no_speech_thold: params.no_speech_threshold,
            logprob_thold: params.log_prob_threshold,
            entropy_thold: params.compression_ratio_threshold,
            token_timestamps: params.word_timestamps,
        }
    }

    fn sampling_strategy(&self) -> SamplingStrategy {
        if self.beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size: self.beam_size,
                patience: -1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        }
    }

    pub fn to_full_params(&self) -> FullParams {
        let mut params = FullParams::new(self.sampling_strategy());
        params.set_n_threads(self.n_threads);
        if let Some(ref lang) = self.language {
            params.set_language(Some(lang.as_str()));
        }
        if let Some(ref prompt) = self.initial_prompt {
            params.set_initial_prompt(prompt);
        }
        params.set_translate(false);
        params.set_no_speech_thold(self.no_speech_thold);
        params.set_logprob_thold(self.logprob_thold);
        params.set_entropy_thold(self.entropy_thold);
        params.set_token_timestamps(self.token_timestamps);
        // Disable anything that prints to stdout.
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::InferenceConfig;

    #[test]
    fn carries_request_and_config_values() {
        let cfg = InferenceConfig::default();
        let params = InferenceParams::for_request(&cfg, "", "Names: Ada");
        let wc = WhisperConfig::new(&params, Some("en".into()), 0);

        assert_eq!(wc.beam_size, 5);
        assert_eq!(wc.n_threads, 1);
        assert_eq!(wc.language.as_deref(), Some("en"));
        assert_eq!(wc.initial_prompt.as_deref(), Some("Names: Ada"));
        assert!((wc.entropy_thold - 2.4).abs() < f32::EPSILON);
        assert!(wc.token_timestamps);
    }

    #[test]
    fn beam_of_one_is_greedy() {
        let cfg = InferenceConfig {
            beam_size: 1,
            ..InferenceConfig::default()
        };
        let wc = WhisperConfig::new(&InferenceParams::for_request(&cfg, "", ""), None, 4);
        assert!(matches!(
            wc.sampling_strategy(),
            SamplingStrategy::Greedy { best_of: 1 }
        ));
    }
}
