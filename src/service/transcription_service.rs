use std::{sync::Arc, time::Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::{
    audio::audio_source::{AudioSource, AudioSourceResolver},
    config::settings::{InferenceConfig, Settings},
    service::{
        concurrency_gate::ConcurrencyGate,
        engine::{EngineError, InferenceParams, TranscriptionEngine},
        errors::TranscribeError,
        transcribe_types::{TranscribeRequest, TranscriptChunk},
    },
};

/// Chunks buffered ahead of a slow client.
const CHUNK_BUFFER: usize = 32;

/// Ordered chunks of one transcription. A failure after streaming started is
/// delivered as the last item.
pub type ChunkStream = ReceiverStream<Result<TranscriptChunk, TranscribeError>>;

pub struct TranscriptionService {
    engine: Arc<dyn TranscriptionEngine>,
    resolver: AudioSourceResolver,
    gate: ConcurrencyGate,
    inference: InferenceConfig,
}

impl TranscriptionService {
    pub fn new(
        settings: &Settings,
        engine: Arc<dyn TranscriptionEngine>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            engine,
            resolver: AudioSourceResolver::new(settings.service.max_audio_bytes)?,
            gate: ConcurrencyGate::new(settings.concurrency.max_workers),
            inference: settings.inference.clone(),
        })
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Resolves the audio, starts inference and returns the chunk stream.
    ///
    /// Returns once the engine has started; errors up to that point come
    /// back as `Err`. The gate slot is held while chunks are produced and
    /// released at the first segment nobody is left to receive.
    pub async fn transcribe(&self, request: TranscribeRequest) -> Result<ChunkStream, TranscribeError> {
        let result = match request.audio_source() {
            Ok(source) => {
                let span = tracing::info_span!("transcribe", source_kind = source.kind());
                self.start(source, &request).instrument(span).await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &result {
            if e.is_client_fault() {
                tracing::warn!(code = e.code(), "Transcription rejected: {e}");
            } else {
                tracing::error!(code = e.code(), "Transcription failed: {e}");
            }
        }
        result
    }

    async fn start(
        &self,
        source: AudioSource,
        request: &TranscribeRequest,
    ) -> Result<ChunkStream, TranscribeError> {
        let permit = self.gate.acquire().await?;
        let audio = self.resolver.resolve(&source).await?;
        let params = InferenceParams::for_request(
            &self.inference,
            &request.language,
            &request.options.initial_prompt,
        );

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let (started_tx, started_rx) = oneshot::channel::<Result<(), EngineError>>();
        let engine = self.engine.clone();
        let label = source.label();
        let kind = source.kind();
        let span = tracing::Span::current();

        tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            let permit = permit;
            let started = Instant::now();

            let (segments, info) = match engine.transcribe(audio, &params) {
                Ok(out) => out,
                Err(e) => {
                    drop(permit);
                    let _ = started_tx.send(Err(e));
                    return;
                }
            };
            tracing::info!(
                language = %info.language,
                language_probability = info.language_probability,
                duration_secs = info.duration,
                source_kind = kind,
                source = %label,
                "Transcription started"
            );
            if started_tx.send(Ok(())).is_err() {
                return;
            }

            let mut chunks = 0usize;
            for segment in segments {
                let item = segment
                    .map(TranscriptChunk::from)
                    .map_err(TranscribeError::from);
                if let Err(e) = &item {
                    tracing::error!(chunks, "Transcription failed mid-stream: {e}");
                }
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() {
                    tracing::info!(chunks, "Client disconnected, stopping stream");
                    return;
                }
                if failed {
                    return;
                }
                chunks += 1;
            }
            drop(permit);
            tracing::info!(
                chunks,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Transcription completed"
            );
        });

        match started_rx.await {
            Ok(Ok(())) => Ok(ReceiverStream::new(rx)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TranscribeError::Internal(EngineError::Inference(
                "inference task ended before starting".into(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::audio_source::{AudioStream, SourceError},
        config::settings::{
            ComputeType, ConcurrencyConfig, Device, ModelConfig, ServiceConfig,
        },
        service::engine::{Segment, Segments, TranscriptionInfo},
    };
    use bytes::Bytes;
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use tokio_stream::StreamExt;

    fn test_settings(max_workers: usize) -> Settings {
        Settings {
            service: ServiceConfig {
                socket_path: "/tmp/unused.sock".into(),
                log_level: "info".into(),
                max_audio_bytes: 1024 * 1024,
            },
            model: ModelConfig {
                size: "tiny".into(),
                download_dir: "/tmp".into(),
                device: Device::Cpu,
                compute_type: ComputeType::Int8,
            },
            inference: InferenceConfig {
                initial_prompt: "Configured prompt".into(),
                ..InferenceConfig::default()
            },
            concurrency: ConcurrencyConfig {
                max_workers,
                cpu_threads: 1,
                num_workers: 1,
            },
        }
    }

    fn segment(start: f64, end: f64, text: &str) -> Segment {
        Segment {
            start,
            end,
            text: text.into(),
            avg_logprob: -0.25,
            words: None,
        }
    }

    /// Scripted engine: records params, optionally sleeps, then yields
    /// `outcome` (or fails to start with `start_error`). `segment_gap` is
    /// slept before each segment, like a decoder still working.
    #[derive(Default)]
    struct FakeEngine {
        pub outcome: Vec<Result<Segment, String>>,
        pub start_error: Option<String>,
        pub delay: Duration,
        pub segment_gap: Duration,
        pub seen: Mutex<Vec<InferenceParams>>,
        active: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl FakeEngine {
        fn with_segments(segments: Vec<Segment>) -> Self {
            Self {
                outcome: segments.into_iter().map(Ok).collect(),
                ..Self::default()
            }
        }
    }

    impl TranscriptionEngine for FakeEngine {
        fn transcribe(
            &self,
            _audio: AudioStream,
            params: &InferenceParams,
        ) -> Result<(Segments, TranscriptionInfo), EngineError> {
            self.seen.lock().unwrap().push(params.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);

            if let Some(msg) = &self.start_error {
                return Err(EngineError::Inference(msg.clone()));
            }
            let items: Vec<_> = self
                .outcome
                .iter()
                .cloned()
                .map(|r| r.map_err(EngineError::Inference))
                .collect();
            let info = TranscriptionInfo {
                language: params.language.clone().unwrap_or_else(|| "en".into()),
                language_probability: 0.98,
                duration: 3.0,
            };
            let gap = self.segment_gap;
            let segments = items.into_iter().map(move |item| {
                std::thread::sleep(gap);
                item
            });
            Ok((Box::new(segments), info))
        }
    }

    fn inline_request() -> TranscribeRequest {
        TranscribeRequest {
            audio_data: Some(Bytes::from_static(b"RIFF....WAVE")),
            ..TranscribeRequest::default()
        }
    }

    fn service(engine: FakeEngine, max_workers: usize) -> (TranscriptionService, Arc<FakeEngine>) {
        let engine = Arc::new(engine);
        let svc = TranscriptionService::new(&test_settings(max_workers), engine.clone()).unwrap();
        (svc, engine)
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<TranscriptChunk, TranscribeError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn segments_stream_in_order() {
        let (svc, _) = service(
            FakeEngine::with_segments(vec![
                segment(0.0, 1.5, " Hello world. "),
                segment(1.5, 3.0, " Second sentence."),
            ]),
            2,
        );

        let chunks: Vec<_> = collect(svc.transcribe(inline_request()).await.unwrap())
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Hello world.");
        assert_eq!(chunks[1].text, "Second sentence.");
        assert!(chunks[0].start_time <= chunks[0].end_time);
        assert!(chunks[0].end_time <= chunks[1].start_time);
        assert!(chunks.iter().all(|c| c.words.is_empty() && c.speaker_id.is_empty()));
    }

    #[tokio::test]
    async fn prompt_and_language_reach_the_engine() {
        let (svc, engine) = service(FakeEngine::default(), 1);

        let mut req = inline_request();
        req.language = "fr".into();
        req.options.initial_prompt = "Custom".into();
        collect(svc.transcribe(req).await.unwrap()).await;
        collect(svc.transcribe(inline_request()).await.unwrap()).await;

        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen[0].language.as_deref(), Some("fr"));
        assert_eq!(seen[0].initial_prompt.as_deref(), Some("Custom"));
        assert_eq!(seen[1].language, None);
        assert_eq!(seen[1].initial_prompt.as_deref(), Some("Configured prompt"));
    }

    #[tokio::test]
    async fn silent_audio_completes_without_chunks() {
        let (svc, _) = service(FakeEngine::default(), 1);
        let chunks = collect(svc.transcribe(inline_request()).await.unwrap()).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn engine_start_failure_is_internal() {
        let (svc, _) = service(
            FakeEngine {
                start_error: Some("decoder exploded".into()),
                ..FakeEngine::default()
            },
            1,
        );
        let err = svc.transcribe(inline_request()).await.unwrap_err();
        assert_eq!(err.code(), "internal");
        assert!(err.to_string().contains("decoder exploded"));
        assert_eq!(svc.gate().available(), 1, "slot released after failure");
    }

    #[tokio::test]
    async fn mid_stream_failure_is_the_last_item() {
        let (svc, _) = service(
            FakeEngine {
                outcome: vec![
                    Ok(segment(0.0, 1.0, "first")),
                    Err("lost the GPU".into()),
                    Ok(segment(1.0, 2.0, "never sent")),
                ],
                ..FakeEngine::default()
            },
            1,
        );
        let items = collect(svc.transcribe(inline_request()).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text, "first");
        assert_eq!(items[1].as_ref().unwrap_err().code(), "internal");
        assert_eq!(svc.gate().available(), 1, "slot released after mid-stream failure");
    }

    #[tokio::test]
    async fn dropping_the_stream_frees_the_slot() {
        let (svc, _) = service(
            FakeEngine {
                outcome: (0..100)
                    .map(|i| Ok(segment(i as f64, i as f64 + 1.0, "words")))
                    .collect(),
                segment_gap: Duration::from_millis(5),
                ..FakeEngine::default()
            },
            1,
        );

        let mut stream = svc.transcribe(inline_request()).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(svc.gate().available(), 0);

        drop(stream);
        for _ in 0..100 {
            if svc.gate().available() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.gate().available(), 1, "slot released after client went away");
    }

    #[tokio::test]
    async fn missing_source_is_invalid_argument() {
        let (svc, engine) = service(FakeEngine::default(), 1);
        let err = svc.transcribe(TranscribeRequest::default()).await.unwrap_err();
        assert!(matches!(err, TranscribeError::InvalidArgument(SourceError::Missing)));
        assert!(engine.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn absent_file_is_invalid_argument() {
        let (svc, _) = service(FakeEngine::default(), 1);
        let req = TranscribeRequest {
            audio_path: Some("/definitely/not/here.wav".into()),
            ..TranscribeRequest::default()
        };
        let err = svc.transcribe(req).await.unwrap_err();
        assert!(matches!(err, TranscribeError::InvalidArgument(SourceError::NotFound(_))));
        assert_eq!(svc.gate().available(), 1);
    }

    #[tokio::test]
    async fn unreachable_uri_is_invalid_argument() {
        let (svc, _) = service(FakeEngine::default(), 1);
        let req = TranscribeRequest {
            audio_uri: Some("http://127.0.0.1:9/a.wav".into()),
            ..TranscribeRequest::default()
        };
        let err = svc.transcribe(req).await.unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[tokio::test]
    async fn concurrent_requests_respect_the_gate() {
        let (svc, engine) = service(
            FakeEngine {
                outcome: vec![Ok(segment(0.0, 1.0, "x"))],
                delay: Duration::from_millis(50),
                ..FakeEngine::default()
            },
            1,
        );

        let svc = &svc;
        let run = || async move { collect(svc.transcribe(inline_request()).await.unwrap()).await };
        let (a, b, c) = tokio::join!(run(), run(), run());

        assert_eq!(a.len() + b.len() + c.len(), 3);
        assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
        assert_eq!(svc.gate().available(), 1);
    }

    #[tokio::test]
    async fn closed_gate_is_unavailable() {
        let (svc, _) = service(FakeEngine::default(), 1);
        svc.gate().close();
        let err = svc.transcribe(inline_request()).await.unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }
}
