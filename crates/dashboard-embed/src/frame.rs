//! Frame creation and the one-time port handshake with the embedded app.

use std::fmt;
use std::sync::Arc;

use message_channel::{MessageChannel, MessagePort};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::switchboard::Switchboard;
use crate::telemetry::EmbedLog;
use crate::ui_config::{query_suffix, DashboardUiConfig};

pub const IFRAME_COMMS_MESSAGE_TYPE: &str = "embedded comms init";
pub const PORT_TRANSFER_HANDSHAKE: &str = "port transfer";
pub const SWITCHBOARD_NAME: &str = "dashboard-embed";

/// A single capability granted to the sandboxed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxCapability {
    AllowSameOrigin,
    AllowScripts,
    AllowPresentation,
    AllowDownloads,
    AllowForms,
    AllowPopups,
    AllowTopNavigation,
}

impl SandboxCapability {
    pub fn token(self) -> &'static str {
        match self {
            SandboxCapability::AllowSameOrigin => "allow-same-origin",
            SandboxCapability::AllowScripts => "allow-scripts",
            SandboxCapability::AllowPresentation => "allow-presentation",
            SandboxCapability::AllowDownloads => "allow-downloads",
            SandboxCapability::AllowForms => "allow-forms",
            SandboxCapability::AllowPopups => "allow-popups",
            SandboxCapability::AllowTopNavigation => "allow-top-navigation",
        }
    }
}

/// The complete capability set of a frame, fixed when the frame is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxPolicy(&'static [SandboxCapability]);

/// What every embedded dashboard frame gets. Same-origin access lets the port
/// handshake through; popups back client-side exports.
pub const EMBED_SANDBOX: SandboxPolicy = SandboxPolicy(&[
    SandboxCapability::AllowSameOrigin,
    SandboxCapability::AllowScripts,
    SandboxCapability::AllowPresentation,
    SandboxCapability::AllowDownloads,
    SandboxCapability::AllowForms,
    SandboxCapability::AllowPopups,
    SandboxCapability::AllowTopNavigation,
]);

impl SandboxPolicy {
    pub fn capabilities(&self) -> &'static [SandboxCapability] {
        self.0
    }

    pub fn contains(&self, capability: SandboxCapability) -> bool {
        self.0.contains(&capability)
    }

    pub fn tokens(&self) -> Vec<&'static str> {
        self.0.iter().map(|capability| capability.token()).collect()
    }
}

impl fmt::Display for SandboxPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens().join(" "))
    }
}

/// The message that carries the transferred port into the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub handshake: String,
}

impl HandshakeMessage {
    pub fn port_transfer() -> Self {
        Self {
            kind: IFRAME_COMMS_MESSAGE_TYPE.to_string(),
            handshake: PORT_TRANSFER_HANDSHAKE.to_string(),
        }
    }

    pub fn is_port_transfer(&self) -> bool {
        self.kind == IFRAME_COMMS_MESSAGE_TYPE && self.handshake == PORT_TRANSFER_HANDSHAKE
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame has no content window")]
    NoContentWindow,
    #[error("handshake to {origin} rejected: {reason}")]
    PostMessage { origin: String, reason: String },
    #[error("frame discarded its load listener without loading")]
    LoadListenerDropped,
}

pub type LoadListener = Box<dyn FnOnce() + Send>;

/// A child frame created by a [`MountPoint`].
pub trait EmbeddedFrame: Send + Sync {
    fn sandbox(&self) -> SandboxPolicy;

    /// Registers a listener for the frame's next load. It fires at most once.
    fn on_load(&self, listener: LoadListener);

    fn set_src(&self, src: &str);

    fn src(&self) -> Option<String>;

    /// Posts `message` to the frame's content, delivered only if the content's
    /// origin is `target_origin`. `transfer` moves into the frame.
    fn post_message(
        &self,
        message: HandshakeMessage,
        target_origin: &str,
        transfer: MessagePort,
    ) -> Result<(), FrameError>;
}

/// The host page element the dashboard is mounted into.
pub trait MountPoint: Send + Sync {
    fn create_frame(&self, sandbox: SandboxPolicy) -> Arc<dyn EmbeddedFrame>;

    /// Replaces everything inside the element with `frame`, or empties it.
    fn replace_children(&self, frame: Option<Arc<dyn EmbeddedFrame>>);
}

/// `{host_origin}/embedded/{id}` plus the encoded UI configuration.
pub fn embed_url(
    host_origin: &str,
    id: &str,
    ui_config: Option<&DashboardUiConfig>,
    log: &EmbedLog,
) -> String {
    format!(
        "{host_origin}/embedded/{id}{}",
        query_suffix(ui_config, log)
    )
}

/// Mounts a sandboxed frame at `src` and, once it has loaded, hands it one end
/// of a fresh channel. Resolves with a switchboard on the end we keep.
///
/// If the frame never loads this never resolves.
pub async fn mount_iframe(
    mount_point: &dyn MountPoint,
    host_origin: &str,
    src: &str,
    log: &EmbedLog,
) -> Result<Switchboard, FrameError> {
    let frame = mount_point.create_frame(EMBED_SANDBOX);

    // Listen before setting the source so a fast load cannot be missed.
    let (loaded_tx, loaded_rx) = oneshot::channel();
    frame.on_load(Box::new(move || {
        let _ = loaded_tx.send(());
    }));
    frame.set_src(src);
    mount_point.replace_children(Some(frame.clone()));
    log.debug("placed the iframe");

    loaded_rx
        .await
        .map_err(|_| FrameError::LoadListenerDropped)?;

    let MessageChannel {
        port1: ours,
        port2: theirs,
    } = MessageChannel::new();
    frame.post_message(HandshakeMessage::port_transfer(), host_origin, theirs)?;
    log.debug("sent message channel to the iframe");

    Ok(Switchboard::new(ours, SWITCHBOARD_NAME, log.enabled()))
}
