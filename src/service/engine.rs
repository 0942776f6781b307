//! The transcription backend seam.
//!
//! [`TranscriptionEngine`] is object-safe and `Send + Sync`; the service
//! holds it as `Arc<dyn TranscriptionEngine>` and calls it from a blocking
//! thread. Segments come back as a lazy iterator so the first chunk can be
//! sent while the model is still working on the rest.

use thiserror::Error;

use crate::{
    audio::{audio_decoder::DecodeError, audio_source::AudioStream},
    config::settings::InferenceConfig,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("model failed to load: {0}")]
    ModelLoad(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// One contiguous span of recognized speech, times in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub avg_logprob: f32,
    /// `None` when the engine produced no word-level data.
    pub words: Option<Vec<WordTiming>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WordTiming {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionInfo {
    pub language: String,
    pub language_probability: f32,
    /// Length of the decoded input, in seconds.
    pub duration: f64,
}

pub type Segments = Box<dyn Iterator<Item = Result<Segment, EngineError>> + Send>;

/// Per-request inference parameters: config defaults merged with the
/// request's language hint and prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub beam_size: u32,
    pub vad_filter: bool,
    pub vad_min_silence_ms: u32,
    pub no_speech_threshold: f32,
    pub log_prob_threshold: f32,
    pub compression_ratio_threshold: f32,
    pub word_timestamps: bool,
}

impl InferenceParams {
    pub fn for_request(cfg: &InferenceConfig, language: &str, prompt: &str) -> Self {
        Self {
            language: non_empty(language),
            initial_prompt: effective_prompt(prompt, &cfg.initial_prompt),
            beam_size: cfg.beam_size,
            vad_filter: cfg.vad_filter,
            vad_min_silence_ms: cfg.vad_min_silence_ms,
            no_speech_threshold: cfg.no_speech_threshold,
            log_prob_threshold: cfg.log_prob_threshold,
            compression_ratio_threshold: cfg.compression_ratio_threshold,
            word_timestamps: cfg.word_timestamps,
        }
    }
}

/// Request prompt, else configured default, else none.
pub fn effective_prompt(request: &str, default: &str) -> Option<String> {
    non_empty(request).or_else(|| non_empty(default))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

pub trait TranscriptionEngine: Send + Sync {
    /// Blocking. Returns once the audio is decoded and inference has
    /// started; segments arrive in temporal order through the iterator.
    fn transcribe(
        &self,
        audio: AudioStream,
        params: &InferenceParams,
    ) -> Result<(Segments, TranscriptionInfo), EngineError>;
}

// Compile-time assertion: Box<dyn TranscriptionEngine> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn TranscriptionEngine>) {}
};
