//! Wire types for `POST /v1/transcribe`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    audio::audio_source::{AudioSource, SourceError},
    service::engine::Segment,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscribeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    /// Inline audio, base64 in JSON.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_uri: Option<String>,
    /// Language hint, e.g. `en`. Empty means auto-detect.
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub options: TranscribeOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscribeOptions {
    /// Accepted for compatibility; diarization is not performed.
    pub diarization: bool,
    /// Accepted for compatibility; ignored.
    pub num_speakers: i32,
    /// Overrides the configured default prompt when non-empty.
    pub initial_prompt: String,
}

impl TranscribeRequest {
    pub fn audio_source(&self) -> Result<AudioSource, SourceError> {
        AudioSource::from_fields(
            self.audio_path.clone(),
            self.audio_data.clone(),
            self.audio_uri.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub start_time: f32,
    pub end_time: f32,
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub start_time: f32,
    pub end_time: f32,
    pub text: String,
    /// Always empty.
    pub speaker_id: String,
    /// Segment average log-probability.
    pub confidence: f32,
    pub words: Vec<Word>,
}

impl From<Segment> for TranscriptChunk {
    fn from(seg: Segment) -> Self {
        let words = seg
            .words
            .unwrap_or_default()
            .into_iter()
            .map(|w| Word {
                start_time: w.start as f32,
                end_time: w.end as f32,
                text: w.text,
                confidence: w.probability,
            })
            .collect();
        Self {
            start_time: seg.start as f32,
            end_time: seg.end as f32,
            text: seg.text.trim().to_owned(),
            speaker_id: String::new(),
            confidence: seg.avg_logprob,
            words,
        }
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(data: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let Some(encoded) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        STANDARD
            .decode(encoded.as_bytes())
            .map(|v| Some(Bytes::from(v)))
            .map_err(|e| D::Error::custom(format!("audio_data is not valid base64: {e}")))
    }
}
