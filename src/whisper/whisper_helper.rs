use std::{
    ffi::{CStr, c_void},
    sync::atomic::Ordering,
};
use whisper_rs::whisper_rs_sys;

use crate::{
    service::engine::{Segment, WordTiming},
    vad::energy_vad::SpeechTimeline,
    whisper::whisper_callback::SegmentSink,
};

/// A non-special token of a decoded segment.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    /// Raw bytes; multi-byte characters may be split across tokens.
    pub bytes: Vec<u8>,
    pub p: f32,
    pub plog: f32,
    /// Centiseconds.
    pub t0: i64,
    pub t1: i64,
}

/// whisper.cpp reports times in centiseconds.
pub fn centis_to_secs(t: i64) -> f64 {
    t.max(0) as f64 / 100.0
}

/// Mean log-probability of the segment's text tokens.
pub fn average_logprob(tokens: &[TokenInfo]) -> f32 {
    if tokens.is_empty() {
        return 0.0;
    }
    tokens.iter().map(|t| t.plog).sum::<f32>() / tokens.len() as f32
}

/// Groups subword tokens into words. A token starting with a space opens a
/// new word; anything else (continuations, punctuation) joins the previous.
pub fn build_words(tokens: &[TokenInfo], timeline: &SpeechTimeline) -> Vec<WordTiming> {
    struct Acc {
        bytes: Vec<u8>,
        t0: i64,
        t1: i64,
        probs: Vec<f32>,
    }

    let mut acc: Vec<Acc> = Vec::new();
    for tok in tokens {
        let opens_word = tok.bytes.first() == Some(&b' ') || acc.is_empty();
        match acc.last_mut() {
            Some(last) if !opens_word => {
                last.bytes.extend_from_slice(&tok.bytes);
                last.t1 = last.t1.max(tok.t1);
                last.probs.push(tok.p);
            }
            _ => acc.push(Acc {
                bytes: tok.bytes.clone(),
                t0: tok.t0,
                t1: tok.t1,
                probs: vec![tok.p],
            }),
        }
    }

    acc.into_iter()
        .filter_map(|w| {
            let text = String::from_utf8_lossy(&w.bytes).trim().to_owned();
            if text.is_empty() {
                return None;
            }
            let start = timeline.to_original(centis_to_secs(w.t0));
            let end = timeline.to_original(centis_to_secs(w.t1)).max(start);
            Some(WordTiming {
                start,
                end,
                text,
                probability: w.probs.iter().sum::<f32>() / w.probs.len() as f32,
            })
        })
        .collect()
}

/// Helper functions for safer C API interactions
pub struct WhisperHelper;

impl WhisperHelper {
    /// Safely extract text from whisper state
    pub unsafe fn extract_text(
        st: *mut whisper_rs_sys::whisper_state,
        segment_idx: i32,
    ) -> Option<String> {
        let txt_ptr =
            unsafe { whisper_rs_sys::whisper_full_get_segment_text_from_state(st, segment_idx) };
        if txt_ptr.is_null() {
            tracing::warn!("Null text pointer for segment {}", segment_idx);
            return None;
        }
        Some(
            unsafe { CStr::from_ptr(txt_ptr) }
                .to_string_lossy()
                .into_owned(),
        )
    }

    /// Segment start and end, in centiseconds
    pub unsafe fn segment_times(
        st: *mut whisper_rs_sys::whisper_state,
        segment_idx: i32,
    ) -> (i64, i64) {
        let t0 = unsafe { whisper_rs_sys::whisper_full_get_segment_t0_from_state(st, segment_idx) };
        let t1 = unsafe { whisper_rs_sys::whisper_full_get_segment_t1_from_state(st, segment_idx) };
        (t0.max(0), t1.max(t0).max(0))
    }

    /// Text tokens of a segment; special tokens (ids at or past end-of-text)
    /// are skipped.
    pub unsafe fn extract_tokens(
        ctx: *mut whisper_rs_sys::whisper_context,
        st: *mut whisper_rs_sys::whisper_state,
        segment_idx: i32,
    ) -> Vec<TokenInfo> {
        let eot = unsafe { whisper_rs_sys::whisper_token_eot(ctx) };
        let n = unsafe { whisper_rs_sys::whisper_full_n_tokens_from_state(st, segment_idx) };
        let mut tokens = Vec::with_capacity(n.max(0) as usize);
        for j in 0..n {
            let data =
                unsafe { whisper_rs_sys::whisper_full_get_token_data_from_state(st, segment_idx, j) };
            if data.id >= eot {
                continue;
            }
            let txt_ptr = unsafe {
                whisper_rs_sys::whisper_full_get_token_text_from_state(ctx, st, segment_idx, j)
            };
            if txt_ptr.is_null() {
                continue;
            }
            tokens.push(TokenInfo {
                bytes: unsafe { CStr::from_ptr(txt_ptr) }.to_bytes().to_vec(),
                p: data.p,
                plog: data.plog,
                t0: data.t0,
                t1: data.t1,
            });
        }
        tokens
    }

    unsafe fn extract_segment(
        ctx: *mut whisper_rs_sys::whisper_context,
        st: *mut whisper_rs_sys::whisper_state,
        segment_idx: i32,
        sink: &SegmentSink,
    ) -> Option<Segment> {
        let text = unsafe { Self::extract_text(st, segment_idx) }?;
        let (t0, t1) = unsafe { Self::segment_times(st, segment_idx) };
        let tokens = unsafe { Self::extract_tokens(ctx, st, segment_idx) };

        let start = sink.timeline.to_original(centis_to_secs(t0));
        let end = sink.timeline.to_original(centis_to_secs(t1)).max(start);
        let words = sink
            .word_timestamps
            .then(|| build_words(&tokens, &sink.timeline));

        Some(Segment {
            start,
            end,
            text,
            avg_logprob: average_logprob(&tokens),
            words,
        })
    }

    /// Main C callback for Whisper
    ///
    /// Forwards the `n_new` most recent segments to the sink, blocking while
    /// the consumer is behind.
    pub unsafe extern "C" fn whisper_callback(
        ctx: *mut whisper_rs_sys::whisper_context,
        st: *mut whisper_rs_sys::whisper_state,
        n_new: i32,
        user: *mut c_void,
    ) {
        if user.is_null() || st.is_null() || ctx.is_null() {
            return;
        }

        let sink = unsafe { &*(user as *const SegmentSink) };
        if sink.closed.load(Ordering::Acquire) {
            return;
        }

        let n = unsafe { whisper_rs_sys::whisper_full_n_segments_from_state(st) };
        for idx in (n - n_new).max(0)..n {
            let Some(segment) = (unsafe { Self::extract_segment(ctx, st, idx, sink) }) else {
                continue;
            };
            if sink.out.send(Ok(segment)).is_err() {
                tracing::debug!("segment receiver dropped, discarding remaining output");
                sink.closed.store(true, Ordering::Release);
                return;
            }
        }
    }
}
