//! Turns a request's audio source into a readable byte stream.

use std::{
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom},
    path::PathBuf,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use symphonia::core::io::MediaSource;
use thiserror::Error;

/// Remote fetches give up after this long.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Client-side faults while materializing audio. All of them map to
/// invalid-argument on the wire.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no audio source provided")]
    Missing,
    #[error("more than one audio source provided ({0})")]
    Conflict(String),
    #[error("audio file not found: {0}")]
    NotFound(PathBuf),
    #[error("audio file {path} is not readable: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("failed to fetch audio URI: {0}")]
    FetchFailed(String),
    #[error("audio is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
}

/// Exactly one way of supplying audio.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSource {
    Path(PathBuf),
    Data(Bytes),
    Uri(String),
}

impl AudioSource {
    /// Builds the source from the three optional wire fields; exactly one
    /// must be present.
    pub fn from_fields(
        path: Option<String>,
        data: Option<Bytes>,
        uri: Option<String>,
    ) -> Result<Self, SourceError> {
        match (path, data, uri) {
            (Some(p), None, None) => Ok(AudioSource::Path(PathBuf::from(p))),
            (None, Some(d), None) => Ok(AudioSource::Data(d)),
            (None, None, Some(u)) => Ok(AudioSource::Uri(u)),
            (None, None, None) => Err(SourceError::Missing),
            (p, d, u) => {
                let set: Vec<&str> = [
                    p.map(|_| "audio_path"),
                    d.map(|_| "audio_data"),
                    u.map(|_| "audio_uri"),
                ]
                .into_iter()
                .flatten()
                .collect();
                Err(SourceError::Conflict(set.join(", ")))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AudioSource::Path(_) => "audio_path",
            AudioSource::Data(_) => "audio_data",
            AudioSource::Uri(_) => "audio_uri",
        }
    }

    /// Loggable description; inline payloads are never logged.
    pub fn label(&self) -> String {
        match self {
            AudioSource::Path(p) => p.display().to_string(),
            AudioSource::Data(_) => "<bytes_payload>".into(),
            AudioSource::Uri(u) => u.clone(),
        }
    }
}

/// Seekable audio bytes handed to the engine.
#[derive(Debug)]
pub enum AudioStream {
    File(File),
    Memory(Cursor<Bytes>),
}

impl AudioStream {
    pub fn from_bytes(bytes: Bytes) -> Self {
        AudioStream::Memory(Cursor::new(bytes))
    }

    pub fn into_media_source(self) -> Box<dyn MediaSource> {
        match self {
            AudioStream::File(f) => Box::new(f),
            AudioStream::Memory(c) => Box::new(c),
        }
    }
}

impl Read for AudioStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            AudioStream::File(f) => f.read(buf),
            AudioStream::Memory(c) => c.read(buf),
        }
    }
}

impl Seek for AudioStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            AudioStream::File(f) => f.seek(pos),
            AudioStream::Memory(c) => c.seek(pos),
        }
    }
}

pub struct AudioSourceResolver {
    client: reqwest::Client,
    max_bytes: u64,
}

impl AudioSourceResolver {
    pub fn new(max_bytes: u64) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self { client, max_bytes })
    }

    pub async fn resolve(&self, source: &AudioSource) -> Result<AudioStream, SourceError> {
        match source {
            AudioSource::Path(path) => self.open_file(path.clone()).await,
            AudioSource::Data(data) => {
                self.check_size(data.len() as u64)?;
                Ok(AudioStream::from_bytes(data.clone()))
            }
            AudioSource::Uri(uri) => self.fetch(uri).await.map(AudioStream::from_bytes),
        }
    }

    async fn open_file(&self, path: PathBuf) -> Result<AudioStream, SourceError> {
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(path));
            }
            Err(e) => {
                return Err(SourceError::Unreadable {
                    path,
                    reason: e.to_string(),
                });
            }
        };
        if !meta.is_file() {
            return Err(SourceError::Unreadable {
                path,
                reason: "not a regular file".into(),
            });
        }
        self.check_size(meta.len())?;

        match tokio::fs::File::open(&path).await {
            Ok(f) => Ok(AudioStream::File(f.into_std().await)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SourceError::NotFound(path)),
            Err(e) => Err(SourceError::Unreadable {
                path,
                reason: e.to_string(),
            }),
        }
    }

    async fn fetch(&self, uri: &str) -> Result<Bytes, SourceError> {
        let fetch_failed = |e: reqwest::Error| SourceError::FetchFailed(e.to_string());

        let mut response = self
            .client
            .get(uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_failed)?;

        if let Some(len) = response.content_length() {
            self.check_size(len)?;
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(fetch_failed)? {
            body.extend_from_slice(&chunk);
            self.check_size(body.len() as u64)?;
        }
        Ok(body.freeze())
    }

    fn check_size(&self, size: u64) -> Result<(), SourceError> {
        if size > self.max_bytes {
            return Err(SourceError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}
