use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, atomic::AtomicBool, mpsc},
    time::Instant,
};

use whisper_rs::{WhisperContext, WhisperContextParameters, WhisperState};

use crate::{
    audio::{
        audio_decoder::{self, SAMPLE_RATE},
        audio_source::AudioStream,
    },
    config::settings::{Device, ModelConfig, Settings},
    service::engine::{EngineError, InferenceParams, Segments, TranscriptionEngine, TranscriptionInfo},
    vad::energy_vad::{EnergyVad, SpeechTimeline},
    whisper::{
        whisper_callback::{SegmentSink, WhisperCallback},
        whisper_config::WhisperConfig,
        whisper_helper::WhisperHelper,
    },
};

/// Segments buffered between whisper.cpp and the consumer before the
/// inference thread blocks.
const SEGMENT_BUFFER: usize = 16;
const QUANTIZED_SUFFIX: &str = "-q8_0";

/// Locates the ggml weights for the configured model.
///
/// `size` may be a path to a `.bin` file. Otherwise the file is looked up as
/// `<download_dir>/ggml-<size>.bin`, preferring the `-q8_0` variant when the
/// compute type is quantized.
pub fn model_path(model: &ModelConfig) -> Result<PathBuf, EngineError> {
    let direct = Path::new(&model.size);
    if direct.extension().is_some_and(|e| e == "bin") && direct.is_file() {
        return Ok(direct.to_path_buf());
    }

    let dir = Path::new(&model.download_dir);
    let plain = dir.join(format!("ggml-{}.bin", model.size));
    let mut candidates = Vec::with_capacity(2);
    if model.compute_type.is_quantized() {
        candidates.push(dir.join(format!("ggml-{}{QUANTIZED_SUFFIX}.bin", model.size)));
    }
    candidates.push(plain.clone());

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| EngineError::ModelNotFound(plain.display().to_string()))
}

/// Warm inference states shared by all requests.
struct StatePool {
    ctx: WhisperContext,
    idle: Mutex<Vec<WhisperState>>,
    capacity: usize,
}

impl StatePool {
    fn take(&self) -> Result<WhisperState, EngineError> {
        if let Some(state) = self.idle.lock().ok().and_then(|mut idle| idle.pop()) {
            return Ok(state);
        }
        tracing::debug!("state pool empty, creating a new whisper state");
        self.ctx
            .create_state()
            .map_err(|e| EngineError::Inference(format!("create state: {e:?}")))
    }

    fn give_back(&self, state: WhisperState) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.capacity {
                idle.push(state);
            }
        }
    }
}

/// [`TranscriptionEngine`] backed by whisper.cpp.
pub struct WhisperEngine {
    pool: Arc<StatePool>,
    cpu_threads: usize,
}

impl WhisperEngine {
    /// Loads the model once and prewarms `num_workers` states.
    pub fn load(settings: &Settings) -> Result<Self, EngineError> {
        let path = model_path(&settings.model)?;
        let started = Instant::now();

        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu(settings.model.device == Device::Cuda);

        let path_str = path
            .to_str()
            .ok_or_else(|| EngineError::ModelLoad(format!("non UTF-8 path {}", path.display())))?;
        let ctx = WhisperContext::new_with_params(path_str, ctx_params)
            .map_err(|e| EngineError::ModelLoad(format!("{}: {e:?}", path.display())))?;

        let capacity = settings.concurrency.num_workers.max(1);
        let mut idle = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push(
                ctx.create_state()
                    .map_err(|e| EngineError::ModelLoad(format!("create state: {e:?}")))?,
            );
        }

        tracing::info!(
            model = %settings.model.size,
            path = %path.display(),
            device = %settings.model.device,
            compute_type = %settings.model.compute_type,
            states = capacity,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Whisper model loaded"
        );

        Ok(Self {
            pool: Arc::new(StatePool {
                ctx,
                idle: Mutex::new(idle),
                capacity,
            }),
            cpu_threads: settings.concurrency.cpu_threads,
        })
    }

    /// Runs language identification on the first 30 s of audio.
    fn detect_language(
        &self,
        state: &mut WhisperState,
        pcm: &[f32],
    ) -> Result<(String, f32), EngineError> {
        state
            .pcm_to_mel(pcm, self.cpu_threads.max(1))
            .map_err(|e| EngineError::Inference(format!("mel: {e:?}")))?;
        let (id, probs) = state
            .lang_detect(0, self.cpu_threads.max(1))
            .map_err(|e| EngineError::Inference(format!("language detection: {e:?}")))?;
        let lang = whisper_rs::get_lang_str(id)
            .ok_or_else(|| EngineError::Inference(format!("unknown language id {id}")))?;
        let prob = usize::try_from(id)
            .ok()
            .and_then(|i| probs.get(i).copied())
            .unwrap_or(0.0);
        Ok((lang.to_owned(), prob))
    }
}

impl TranscriptionEngine for WhisperEngine {
    fn transcribe(
        &self,
        audio: AudioStream,
        params: &InferenceParams,
    ) -> Result<(Segments, TranscriptionInfo), EngineError> {
        let pcm = audio_decoder::decode_to_pcm(audio)?;
        let duration = pcm.len() as f64 / SAMPLE_RATE as f64;

        let (mut speech, timeline) = if params.vad_filter {
            EnergyVad::new(SAMPLE_RATE, params.vad_min_silence_ms).filter(&pcm)
        } else {
            (pcm, SpeechTimeline::identity())
        };

        if speech.is_empty() {
            tracing::debug!(duration, "no speech in input");
            let info = TranscriptionInfo {
                language: params.language.clone().unwrap_or_else(|| "en".into()),
                language_probability: if params.language.is_some() { 1.0 } else { 0.0 },
                duration,
            };
            return Ok((Box::new(std::iter::empty()), info));
        }
        // whisper.cpp skips inputs shorter than one second.
        if speech.len() < SAMPLE_RATE as usize {
            speech.resize(SAMPLE_RATE as usize + SAMPLE_RATE as usize / 10, 0.0);
        }

        let mut state = self.pool.take()?;
        let (language, language_probability) = match &params.language {
            Some(lang) => (lang.clone(), 1.0),
            None => match self.detect_language(&mut state, &speech) {
                Ok(found) => found,
                Err(e) => {
                    self.pool.give_back(state);
                    return Err(e);
                }
            },
        };

        let cfg = WhisperConfig::new(params, Some(language.clone()), self.cpu_threads);
        let (tx, rx) = mpsc::sync_channel(SEGMENT_BUFFER);
        let err_tx = tx.clone();
        let sink = SegmentSink {
            out: tx,
            timeline,
            word_timestamps: params.word_timestamps,
            closed: AtomicBool::new(false),
        };

        let pool = self.pool.clone();
        std::thread::Builder::new()
            .name("whisper-infer".into())
            .spawn(move || {
                let callback = WhisperCallback::new(sink);
                let mut fp = cfg.to_full_params();
                callback.setup_callback(&mut fp, WhisperHelper::whisper_callback);

                let started = Instant::now();
                match state.full(fp, &speech) {
                    Ok(_) => tracing::debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "inference finished"
                    ),
                    Err(e) => {
                        tracing::error!("Whisper processing error: {:?}", e);
                        let _ = err_tx.send(Err(EngineError::Inference(format!("{e:?}"))));
                    }
                }
                drop(callback);
                pool.give_back(state);
            })
            .map_err(|e| EngineError::Inference(format!("spawn inference thread: {e}")))?;

        let info = TranscriptionInfo {
            language,
            language_probability,
            duration,
        };
        Ok((Box::new(rx.into_iter()), info))
    }
}
