pub mod backend;
pub mod capture;
pub mod codec;
pub mod file;
pub mod output;
pub mod playback;

pub use backend::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource, CaptureDevices,
    MicrophoneStream,
};
pub use capture::{normalize_frame, AudioCaptureChannel, CaptureFormat, Framer};
pub use codec::{decode_blob, decode_to_playable, encode_frame, AudioBlob, PlayableBuffer};
pub use file::{AudioFile, FileBackend, SilenceBackend};
pub use output::{RenderDevice, RenderOutput};
pub use playback::{AudioPlaybackScheduler, OutputContext, OutputDevice, ScheduledFragment, SourceId};
