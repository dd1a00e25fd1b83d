//! Consumers of captured frames: recording and live preview.

mod ffmpeg;
mod preview;
mod recording;

pub use ffmpeg::{ffmpeg_args, FfmpegRecorder};
pub use preview::{spawn_preview, AsciiPreview, NullPreview, PreviewSink, StatusPreview};
pub use recording::{FrameWriter, RecordingSink, RecordingWriter, SinkError};
