//! Settings resolution: config file, then `WHISPER_<SECTION>_<FIELD>`
//! environment overrides, then hardware defaults for "auto" fields.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use serde::Deserialize;
use thiserror::Error;

use crate::config::{
    hardware::{HardwareProbe, HardwareProfile, HardwareResolver, SystemProbe},
    settings::{ConcurrencyConfig, ModelConfig, RawSettings, ServiceConfig, Settings},
};

pub const ENV_PREFIX: &str = "WHISPER";

static SETTINGS: OnceLock<Arc<Settings>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}: {source}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Bool,
    Int,
    Float,
    Str,
}

/// Every overridable field and the type its environment value is cast to.
const FIELDS: &[(&str, &str, FieldKind)] = &[
    ("service", "socket_path", FieldKind::Str),
    ("service", "log_level", FieldKind::Str),
    ("service", "max_audio_bytes", FieldKind::Int),
    ("model", "size", FieldKind::Str),
    ("model", "download_dir", FieldKind::Str),
    ("model", "device", FieldKind::Str),
    ("model", "compute_type", FieldKind::Str),
    ("inference", "beam_size", FieldKind::Int),
    ("inference", "vad_filter", FieldKind::Bool),
    ("inference", "vad_min_silence_ms", FieldKind::Int),
    ("inference", "no_speech_threshold", FieldKind::Float),
    ("inference", "log_prob_threshold", FieldKind::Float),
    ("inference", "compression_ratio_threshold", FieldKind::Float),
    ("inference", "word_timestamps", FieldKind::Bool),
    ("inference", "initial_prompt", FieldKind::Str),
    ("concurrency", "max_workers", FieldKind::Int),
    ("concurrency", "cpu_threads", FieldKind::Int),
    ("concurrency", "num_workers", FieldKind::Int),
];

/// Source of environment-style overrides.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

pub fn env_key(section: &str, field: &str) -> String {
    format!(
        "{ENV_PREFIX}_{}_{}",
        section.to_uppercase(),
        field.to_uppercase()
    )
}

/// Resolves settings once per process; later calls return the first result.
pub fn init_settings(path: impl AsRef<Path>) -> Result<Arc<Settings>, ConfigError> {
    if let Some(settings) = SETTINGS.get() {
        return Ok(settings.clone());
    }
    let settings = Arc::new(load_settings(path)?);
    Ok(SETTINGS.get_or_init(|| settings).clone())
}

/// Loads settings using the process environment and the real host.
pub fn load_settings(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    load_settings_with(path, &ProcessEnv, &SystemProbe)
}

pub fn load_settings_with(
    path: impl AsRef<Path>,
    env: &dyn EnvSource,
    probe: &dyn HardwareProbe,
) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::NotFound {
        path: path.to_path_buf(),
        source,
    })?;
    let table: toml::Table = text
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}: {e}", path.display())))?;

    let (settings, profile) = resolve(table, env, probe)?;
    log_summary(&settings, &profile);
    Ok(settings)
}

fn resolve(
    mut table: toml::Table,
    env: &dyn EnvSource,
    probe: &dyn HardwareProbe,
) -> Result<(Settings, HardwareProfile), ConfigError> {
    apply_env_overrides(&mut table, env)?;

    let raw = RawSettings::deserialize(toml::Value::Table(table))
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let hw = HardwareResolver::new(probe);
    let device = hw.resolve_device(raw.model.device);
    let compute_type = hw.resolve_compute_type(raw.model.compute_type, device);
    let cpu_threads = hw.resolve_cpu_threads(raw.concurrency.cpu_threads);
    let max_workers = hw.resolve_max_workers(raw.concurrency.max_workers, device);

    let settings = Settings {
        service: ServiceConfig {
            socket_path: raw.service.socket_path,
            log_level: raw.service.log_level,
            max_audio_bytes: raw.service.max_audio_bytes,
        },
        model: ModelConfig {
            size: raw.model.size,
            download_dir: raw.model.download_dir,
            device,
            compute_type,
        },
        inference: raw.inference,
        concurrency: ConcurrencyConfig {
            max_workers,
            cpu_threads,
            num_workers: raw.concurrency.num_workers,
        },
    };
    check(&settings)?;
    Ok((settings, hw.profile()))
}

fn apply_env_overrides(table: &mut toml::Table, env: &dyn EnvSource) -> Result<(), ConfigError> {
    for &(section, field, kind) in FIELDS {
        let key = env_key(section, field);
        let Some(raw) = env.var(&key) else {
            continue;
        };
        let value = cast_env_value(&key, &raw, kind)?;

        let entry = table
            .entry(section)
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let toml::Value::Table(section_table) = entry else {
            return Err(ConfigError::Invalid(format!(
                "[{section}] must be a table"
            )));
        };
        section_table.insert(field.to_owned(), value);
    }
    Ok(())
}

fn cast_env_value(key: &str, raw: &str, kind: FieldKind) -> Result<toml::Value, ConfigError> {
    let invalid = |ty: &str| ConfigError::Invalid(format!("{key}={raw:?} is not a valid {ty}"));
    Ok(match kind {
        FieldKind::Bool => toml::Value::Boolean(matches!(
            raw.trim().to_lowercase().as_str(),
            "1" | "true" | "yes"
        )),
        FieldKind::Int => toml::Value::Integer(raw.trim().parse().map_err(|_| invalid("integer"))?),
        FieldKind::Float => toml::Value::Float(raw.trim().parse().map_err(|_| invalid("float"))?),
        FieldKind::Str => toml::Value::String(raw.to_owned()),
    })
}

fn check(s: &Settings) -> Result<(), ConfigError> {
    if s.service.socket_path.trim().is_empty() {
        return Err(ConfigError::Invalid("service.socket_path must not be empty".into()));
    }
    if s.service.max_audio_bytes == 0 {
        return Err(ConfigError::Invalid("service.max_audio_bytes must be > 0".into()));
    }
    if s.model.size.trim().is_empty() {
        return Err(ConfigError::Invalid("model.size must not be empty".into()));
    }
    if s.inference.beam_size == 0 {
        return Err(ConfigError::Invalid("inference.beam_size must be > 0".into()));
    }
    if s.concurrency.num_workers == 0 {
        return Err(ConfigError::Invalid("concurrency.num_workers must be > 0".into()));
    }
    Ok(())
}

fn log_summary(s: &Settings, hw: &HardwareProfile) {
    tracing::info!(
        os = ?hw.os,
        arch = ?hw.arch,
        physical_cores = hw.physical_cores,
        vram_mb = ?hw.vram_mb,
        device = %s.model.device,
        compute_type = %s.model.compute_type,
        model = %s.model.size,
        cpu_threads = s.concurrency.cpu_threads,
        max_workers = s.concurrency.max_workers,
        socket = %s.service.socket_path,
        "settings resolved"
    );
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::{
        hardware::tests::FakeProbe,
        settings::{ComputeType, Device},
    };

    fn config_file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load_settings_with(
            "/definitely/not/here/config.toml",
            &env(&[]),
            &FakeProbe::cpu_host(8),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn empty_file_yields_defaults_resolved_for_host() {
        let f = config_file("");
        let s = load_settings_with(f.path(), &env(&[]), &FakeProbe::cpu_host(8)).unwrap();

        assert_eq!(s.service.socket_path, "/tmp/whisper.sock");
        assert_eq!(s.model.size, "large-v3");
        assert_eq!(s.model.device, Device::Cpu);
        assert_eq!(s.model.compute_type, ComputeType::Int8);
        assert_eq!(s.concurrency.cpu_threads, 4);
        assert_eq!(s.concurrency.max_workers, 2);
        assert_eq!(s.concurrency.num_workers, 1);
        assert_eq!(s.inference.beam_size, 5);
        assert!(s.inference.vad_filter);
        assert_eq!(s.inference.initial_prompt, "");
    }

    #[test]
    fn file_values_override_defaults() {
        let f = config_file(
            r#"
            [service]
            socket_path = "/run/stt.sock"

            [model]
            size = "small"
            device = "cuda"

            [inference]
            beam_size = 2
            log_prob_threshold = -0.5

            [concurrency]
            max_workers = 3
            "#,
        );
        let s = load_settings_with(f.path(), &env(&[]), &FakeProbe::gpu_host(Some(4000))).unwrap();

        assert_eq!(s.service.socket_path, "/run/stt.sock");
        assert_eq!(s.model.size, "small");
        assert_eq!(s.model.device, Device::Cuda);
        assert_eq!(s.model.compute_type, ComputeType::Int8Float16);
        assert_eq!(s.inference.beam_size, 2);
        assert_eq!(s.inference.log_prob_threshold, -0.5);
        assert_eq!(s.concurrency.max_workers, 3);
    }

    #[test]
    fn env_overrides_file_with_typed_casts() {
        let f = config_file(
            r#"
            [model]
            size = "small"
            [inference]
            vad_filter = true
            "#,
        );
        let vars = env(&[
            ("WHISPER_MODEL_SIZE", "medium"),
            ("WHISPER_INFERENCE_VAD_FILTER", "no"),
            ("WHISPER_INFERENCE_BEAM_SIZE", "1"),
            ("WHISPER_INFERENCE_NO_SPEECH_THRESHOLD", "0.4"),
            ("WHISPER_INFERENCE_WORD_TIMESTAMPS", "YES"),
            ("WHISPER_SERVICE_SOCKET_PATH", "/run/whisper.sock"),
            ("WHISPER_CONCURRENCY_CPU_THREADS", "6"),
        ]);
        let s = load_settings_with(f.path(), &vars, &FakeProbe::cpu_host(8)).unwrap();

        assert_eq!(s.model.size, "medium");
        assert!(!s.inference.vad_filter);
        assert!(s.inference.word_timestamps);
        assert_eq!(s.inference.beam_size, 1);
        assert!((s.inference.no_speech_threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(s.service.socket_path, "/run/whisper.sock");
        assert_eq!(s.concurrency.cpu_threads, 6);
    }

    #[test]
    fn non_numeric_env_for_numeric_field_is_invalid() {
        let f = config_file("");
        let vars = env(&[("WHISPER_INFERENCE_BEAM_SIZE", "five")]);
        let err = load_settings_with(f.path(), &vars, &FakeProbe::cpu_host(8)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("WHISPER_INFERENCE_BEAM_SIZE")));
    }

    #[test]
    fn non_numeric_env_for_float_field_is_invalid() {
        let f = config_file("");
        let vars = env(&[("WHISPER_INFERENCE_NO_SPEECH_THRESHOLD", "abc")]);
        let err = load_settings_with(f.path(), &vars, &FakeProbe::cpu_host(8)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid(msg)
                if msg.contains("WHISPER_INFERENCE_NO_SPEECH_THRESHOLD") && msg.contains("float")
        ));
    }

    #[test]
    fn type_mismatch_in_file_is_invalid() {
        let f = config_file(
            r#"
            [inference]
            beam_size = "wide"
            "#,
        );
        let err = load_settings_with(f.path(), &env(&[]), &FakeProbe::cpu_host(8)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn section_that_is_not_a_table_is_invalid() {
        let f = config_file("model = 5\n");
        let err = load_settings_with(f.path(), &env(&[]), &FakeProbe::cpu_host(8)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_device_is_invalid() {
        let f = config_file("");
        let vars = env(&[("WHISPER_MODEL_DEVICE", "tpu")]);
        let err = load_settings_with(f.path(), &vars, &FakeProbe::cpu_host(8)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_key_is_uppercased() {
        assert_eq!(
            env_key("concurrency", "max_workers"),
            "WHISPER_CONCURRENCY_MAX_WORKERS"
        );
    }
}
