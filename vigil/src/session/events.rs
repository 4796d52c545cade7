//! Session lifecycle events.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

use crate::capture::CaptureKind;

/// Events emitted by a [`RecordingSession`](super::RecordingSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Capture is running.
    Started { source_uri: String, kind: CaptureKind },
    /// A finished chunk was handed to the pipeline.
    ChunkReady { path: PathBuf },
    /// The session stopped because it was asked to.
    Stopped,
    /// Recording stopped unexpectedly; the session is idle again.
    Failed { reason: String },
}

impl SessionEvent {
    pub fn description(&self) -> String {
        match self {
            Self::Started { source_uri, kind } => {
                format!("Recording started: {} ({})", source_uri, kind)
            }
            Self::ChunkReady { path } => format!("Chunk ready: {}", path.display()),
            Self::Stopped => "Recording stopped".to_string(),
            Self::Failed { reason } => format!("Recording stopped unexpectedly: {}", reason),
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out of [`SessionEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct SessionEventBroadcaster {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event, returning how many subscribers received it.
    pub fn publish(&self, event: SessionEvent) -> usize {
        tracing::debug!("Session event: {}", event.description());
        // No subscribers is fine.
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for SessionEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let events = SessionEventBroadcaster::new();
        assert_eq!(events.publish(SessionEvent::Stopped), 0);

        let mut rx = events.subscribe();
        assert_eq!(
            events.publish(SessionEvent::Failed {
                reason: "ffmpeg exited".into()
            }),
            1
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.description(), "Recording stopped unexpectedly: ffmpeg exited");
    }
}
