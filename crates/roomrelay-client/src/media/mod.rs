//! Capture and render seams
//!
//! The session controller never touches media. It asks a [`MediaSource`] for
//! the tracks to send and hands every receiving flow to a [`RenderSink`].

use roomrelay_protocol::MediaKind;
use serde_json::{Value, json};
use uuid::Uuid;

/// A local track ready to be produced
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

pub trait MediaSource: Send {
    /// Tracks to produce once the send transport is up
    fn tracks(&mut self) -> Vec<LocalTrack>;

    /// Stop sending a track, e.g. because its producer was refused or closed
    fn stop(&mut self, kind: MediaKind);
}

pub trait RenderSink: Send {
    fn attach(&mut self, peer_name: &str, consumer_id: Uuid, kind: MediaKind, rtp_parameters: &Value);

    fn detach(&mut self, consumer_id: Uuid);
}

/// Source describing one audio and one video track, without capturing
pub struct SyntheticSource {
    ssrc_base: u32,
    stopped: Vec<MediaKind>,
}

impl SyntheticSource {
    pub fn new(ssrc_base: u32) -> Self {
        Self {
            ssrc_base,
            stopped: vec![],
        }
    }

    pub fn stopped(&self) -> &[MediaKind] {
        &self.stopped
    }
}

impl MediaSource for SyntheticSource {
    fn tracks(&mut self) -> Vec<LocalTrack> {
        vec![
            LocalTrack {
                kind: MediaKind::Audio,
                rtp_parameters: json!({
                    "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }],
                    "encodings": [{ "ssrc": self.ssrc_base }],
                }),
            },
            LocalTrack {
                kind: MediaKind::Video,
                rtp_parameters: json!({
                    "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000 }],
                    "encodings": [{ "ssrc": self.ssrc_base + 1 }],
                }),
            },
        ]
    }

    fn stop(&mut self, kind: MediaKind) {
        tracing::info!("Stopped local {} track", kind);
        self.stopped.push(kind);
    }
}

/// Sink that only logs what it would render
#[derive(Default)]
pub struct LoggingSink {
    attached: Vec<(Uuid, MediaKind)>,
}

impl LoggingSink {
    pub fn attached(&self) -> usize {
        self.attached.len()
    }
}

impl RenderSink for LoggingSink {
    fn attach(&mut self, peer_name: &str, consumer_id: Uuid, kind: MediaKind, _rtp_parameters: &Value) {
        tracing::info!("Rendering {} of {} (consumer {})", kind, peer_name, consumer_id);
        self.attached.push((consumer_id, kind));
    }

    fn detach(&mut self, consumer_id: Uuid) {
        tracing::info!("Stopped rendering consumer {}", consumer_id);
        self.attached.retain(|(id, _)| *id != consumer_id);
    }
}
