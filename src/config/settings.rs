use std::fmt;

use serde::Deserialize;

const DEFAULT_SOCKET_PATH: &str = "/tmp/whisper.sock";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_MAX_AUDIO_BYTES: u64 = 100 * 1024 * 1024; // 100 MiB

const DEFAULT_MODEL: &str = "large-v3";
const DEFAULT_DOWNLOAD_DIR: &str = "/var/lib/whisper/models";

const DEFAULT_BEAM_SIZE: u32 = 5;
const DEFAULT_VAD_MIN_SILENCE_MS: u32 = 500;
const DEFAULT_NO_SPEECH_THRESHOLD: f32 = 0.6;
const DEFAULT_LOG_PROB_THRESHOLD: f32 = -1.0;
const DEFAULT_COMPRESSION_RATIO_THRESHOLD: f32 = 2.4;

const DEFAULT_NUM_WORKERS: usize = 1;

/// Device as written in the config source, before hardware resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestedDevice {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

/// Device after hardware resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestedComputeType {
    #[default]
    Auto,
    Float16,
    Int8Float16,
    Int8,
    Float32,
}

/// Numeric precision used by the inference backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeType {
    Float16,
    Int8Float16,
    Int8,
    Float32,
}

impl ComputeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::Float16 => "float16",
            ComputeType::Int8Float16 => "int8_float16",
            ComputeType::Int8 => "int8",
            ComputeType::Float32 => "float32",
        }
    }

    /// Integer precisions run on 8-bit quantized weights.
    pub fn is_quantized(&self) -> bool {
        matches!(self, ComputeType::Int8 | ComputeType::Int8Float16)
    }
}

impl fmt::Display for ComputeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved, immutable process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub service: ServiceConfig,
    pub model: ModelConfig,
    pub inference: InferenceConfig,
    pub concurrency: ConcurrencyConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
    /// Upper bound for an audio payload, whatever its source.
    pub max_audio_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Model identifier, e.g. `large-v3` or `base.en`.
    pub size: String,
    pub download_dir: String,
    pub device: Device,
    pub compute_type: ComputeType,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub beam_size: u32,
    pub vad_filter: bool,
    pub vad_min_silence_ms: u32,
    pub no_speech_threshold: f32,
    pub log_prob_threshold: f32,
    pub compression_ratio_threshold: f32,
    pub word_timestamps: bool,
    pub initial_prompt: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            beam_size: DEFAULT_BEAM_SIZE,
            vad_filter: true,
            vad_min_silence_ms: DEFAULT_VAD_MIN_SILENCE_MS,
            no_speech_threshold: DEFAULT_NO_SPEECH_THRESHOLD,
            log_prob_threshold: DEFAULT_LOG_PROB_THRESHOLD,
            compression_ratio_threshold: DEFAULT_COMPRESSION_RATIO_THRESHOLD,
            word_timestamps: true,
            initial_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyConfig {
    /// Concurrent inference calls admitted by the gate.
    pub max_workers: usize,
    pub cpu_threads: usize,
    /// Inference states the engine keeps warm.
    pub num_workers: usize,
}

// ── Raw (pre-resolution) sections ───────────────────────────────────────────
// Mirror the config document; sentinel values ("auto", 0) are resolved
// against the host by `config::loader`.

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawSettings {
    pub service: RawServiceConfig,
    pub model: RawModelConfig,
    pub inference: InferenceConfig,
    pub concurrency: RawConcurrencyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct RawServiceConfig {
    pub socket_path: String,
    pub log_level: String,
    pub max_audio_bytes: u64,
}

impl Default for RawServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.into(),
            log_level: DEFAULT_LOG_LEVEL.into(),
            max_audio_bytes: DEFAULT_MAX_AUDIO_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct RawModelConfig {
    pub size: String,
    pub download_dir: String,
    pub device: RequestedDevice,
    pub compute_type: RequestedComputeType,
}

impl Default for RawModelConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_MODEL.into(),
            download_dir: DEFAULT_DOWNLOAD_DIR.into(),
            device: RequestedDevice::Auto,
            compute_type: RequestedComputeType::Auto,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct RawConcurrencyConfig {
    pub max_workers: usize,
    pub cpu_threads: usize,
    pub num_workers: usize,
}

impl Default for RawConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            cpu_threads: 0,
            num_workers: DEFAULT_NUM_WORKERS,
        }
    }
}
