use symphonia::core::{
    audio::SampleBuffer,
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};
use thiserror::Error;

use crate::audio::audio_source::AudioStream;

/// Whisper consumes 16 kHz mono f32 PCM.
pub const SAMPLE_RATE: u32 = 16_000;
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Error)]
#[error("audio decoding failed: {0}")]
pub struct DecodeError(pub String);

/// Decodes any container/codec symphonia can probe into 16 kHz mono PCM.
pub fn decode_to_pcm(stream: AudioStream) -> Result<Vec<f32>, DecodeError> {
    let mss = MediaSourceStream::new(
        stream.into_media_source(),
        MediaSourceStreamOptions::default(),
    );

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError(format!("probe: {e}")))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| DecodeError("no audio track".into()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();
    let source_rate = params
        .sample_rate
        .ok_or_else(|| DecodeError("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| DecodeError(format!("codec: {e}")))?;

    let mut mono: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError(format!("packet: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(error = %e, "skipping corrupt audio frame");
                continue;
            }
            Err(e) => return Err(DecodeError(format!("decode: {e}"))),
        };
        if decoded.frames() == 0 {
            continue;
        }

        // Containers may leave the channel layout out of the track header.
        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        downmix_into(buf.samples(), channels, &mut mono);
    }

    if mono.is_empty() {
        return Err(DecodeError("no audio samples decoded".into()));
    }

    if source_rate != SAMPLE_RATE {
        mono = resample(&mono, source_rate, SAMPLE_RATE)?;
    }
    tracing::debug!(
        samples = mono.len(),
        duration_secs = mono.len() as f32 / SAMPLE_RATE as f32,
        "audio decoded"
    );
    Ok(mono)
}

fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels == 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, DecodeError> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| DecodeError(format!("resampler init: {e}")))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in chunks.by_ref() {
        let frames = resampler
            .process(&[chunk][..], None)
            .map_err(|e| DecodeError(format!("resample: {e}")))?;
        out.extend_from_slice(&frames[0]);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let frames = resampler
            .process_partial(Some(&[tail][..]), None)
            .map_err(|e| DecodeError(format!("resample: {e}")))?;
        out.extend_from_slice(&frames[0]);
    }
    // Flush the filter delay line.
    while out.len() < expected + delay {
        let frames = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| DecodeError(format!("resample: {e}")))?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    let end = (delay + expected).min(out.len());
    Ok(out[delay.min(end)..end].to_vec())
}
