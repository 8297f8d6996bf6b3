use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Page → worker commands.
#[derive(Debug)]
pub enum PageMessage {
    /// Promote a waiting generation immediately.
    SkipWaiting,
    /// Delete every cache, then promote a waiting generation.
    ForceUpdate,
    /// Ask for the active generation; answered with [`WorkerEvent::VersionResponse`].
    VersionCheck { reply: oneshot::Sender<WorkerEvent> },
}

impl PageMessage {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            PageMessage::SkipWaiting => "SKIP_WAITING",
            PageMessage::ForceUpdate => "FORCE_UPDATE",
            PageMessage::VersionCheck { .. } => "VERSION_CHECK",
        }
    }
}

/// Worker → page events, broadcast to every connected page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    /// Activation finished; `version` is the new generation id.
    SwUpdated { version: String },
    /// A new generation installed and is waiting.
    UpdateAvailable { version: String },
    /// Reply to a version check. `None` before any generation is active.
    VersionResponse { version: Option<String> },
}
