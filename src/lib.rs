pub mod audio {
    pub mod audio_decoder;
    pub mod audio_source;
}

pub mod config {
    pub mod hardware;
    pub mod loader;
    pub mod settings;
}

pub mod service {
    pub mod concurrency_gate;
    pub mod engine;
    pub mod errors;
    pub mod socket_server;
    pub mod transcribe_types;
    pub mod transcription_service;
}

pub mod vad {
    pub mod energy_vad;
}

pub mod whisper {
    pub mod whisper_callback;
    pub mod whisper_config;
    pub mod whisper_engine;
    pub mod whisper_helper;
}
