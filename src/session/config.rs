/// Configuration for a live conversation session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capture sample rate sent to the endpoint (16kHz)
    pub input_sample_rate: u32,

    /// Sample rate of synthesized audio from the endpoint (24kHz)
    pub output_sample_rate: u32,

    /// Number of output channels (1 = mono)
    pub output_channels: u16,

    /// Samples per capture frame
    /// Default: 1600 (100ms at 16kHz)
    pub frame_samples: usize,

    /// Capture backend buffer length in milliseconds
    pub capture_buffer_ms: u64,

    /// Model requested from the endpoint
    pub model: String,

    /// Prebuilt voice used for responses
    pub voice: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            output_channels: 1,
            frame_samples: 1600,
            capture_buffer_ms: 100,
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Zephyr".to_string(),
        }
    }
}
