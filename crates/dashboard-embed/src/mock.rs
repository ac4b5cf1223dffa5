//! In-process stand-ins for the host page and the embedded dashboard app.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use message_channel::MessagePort;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, Notify};

use crate::embed::ScrollSize;
use crate::frame::{
    EmbeddedFrame, FrameError, HandshakeMessage, LoadListener, MountPoint, SandboxPolicy,
};
use crate::guest_token::{Clock, GUEST_TOKEN_METHOD};
use crate::switchboard::Switchboard;

/// A page element that records what was mounted into it.
pub struct MockMountPoint {
    dashboard: Option<MockDashboard>,
    auto_load: bool,
    content_origin: Option<String>,
    frames: Mutex<Vec<Arc<MockFrame>>>,
    children: Mutex<Vec<Arc<dyn EmbeddedFrame>>>,
    frame_created: Notify,
}

impl MockMountPoint {
    /// Frames load on their own shortly after their source is set.
    pub fn new(dashboard: MockDashboard) -> Arc<Self> {
        Arc::new(Self::build(Some(dashboard), true, None))
    }

    /// Frames only load when [`MockFrame::fire_load`] is called.
    pub fn manual_load(dashboard: MockDashboard) -> Arc<Self> {
        Arc::new(Self::build(Some(dashboard), false, None))
    }

    /// Frames load content served from `origin` regardless of their source.
    pub fn serving_origin(dashboard: MockDashboard, origin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(Some(dashboard), true, Some(origin.into())))
    }

    /// Frames load but nothing inside them answers the handshake.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::build(None, true, None))
    }

    fn build(dashboard: Option<MockDashboard>, auto_load: bool, content_origin: Option<String>) -> Self {
        Self {
            dashboard,
            auto_load,
            content_origin,
            frames: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            frame_created: Notify::new(),
        }
    }

    pub fn frames(&self) -> Vec<Arc<MockFrame>> {
        self.frames.lock().clone()
    }

    pub fn last_frame(&self) -> Option<Arc<MockFrame>> {
        self.frames.lock().last().cloned()
    }

    pub async fn wait_for_frame(&self) -> Arc<MockFrame> {
        loop {
            let created = self.frame_created.notified();
            if let Some(frame) = self.last_frame() {
                return frame;
            }
            created.await;
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_mounted(&self) -> bool {
        self.child_count() > 0
    }
}

impl MountPoint for MockMountPoint {
    fn create_frame(&self, sandbox: SandboxPolicy) -> Arc<dyn EmbeddedFrame> {
        let frame = Arc::new(MockFrame {
            sandbox,
            auto_load: self.auto_load,
            content_origin: self.content_origin.clone(),
            dashboard: self.dashboard.clone(),
            src: Mutex::new(None),
            listener: Arc::new(Mutex::new(None)),
            events: Mutex::new(Vec::new()),
            handshakes: Mutex::new(Vec::new()),
        });
        self.frames.lock().push(frame.clone());
        self.frame_created.notify_waiters();
        frame
    }

    fn replace_children(&self, frame: Option<Arc<dyn EmbeddedFrame>>) {
        let mut children = self.children.lock();
        children.clear();
        children.extend(frame);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameEvent {
    ListenerRegistered,
    SrcSet,
}

/// A handshake the host posted into a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedHandshake {
    pub message: HandshakeMessage,
    pub target_origin: String,
    pub delivered: bool,
}

pub struct MockFrame {
    sandbox: SandboxPolicy,
    auto_load: bool,
    content_origin: Option<String>,
    dashboard: Option<MockDashboard>,
    src: Mutex<Option<String>>,
    listener: Arc<Mutex<Option<LoadListener>>>,
    events: Mutex<Vec<FrameEvent>>,
    handshakes: Mutex<Vec<PostedHandshake>>,
}

impl MockFrame {
    /// Fires the load listener. Returns false if none was waiting.
    pub fn fire_load(&self) -> bool {
        fire(&self.listener)
    }

    pub fn handshakes(&self) -> Vec<PostedHandshake> {
        self.handshakes.lock().clone()
    }

    pub fn listener_registered_before_src(&self) -> bool {
        let events = self.events.lock();
        let listener = events
            .iter()
            .position(|event| *event == FrameEvent::ListenerRegistered);
        let src = events.iter().position(|event| *event == FrameEvent::SrcSet);
        matches!((listener, src), (Some(listener), Some(src)) if listener < src)
    }

    fn content_origin(&self) -> Option<String> {
        self.content_origin
            .clone()
            .or_else(|| self.src.lock().as_deref().and_then(origin_of))
    }
}

fn fire(listener: &Mutex<Option<LoadListener>>) -> bool {
    let listener = listener.lock().take();
    match listener {
        Some(listener) => {
            listener();
            true
        }
        None => false,
    }
}

/// `scheme://host[:port]` of an absolute URL.
fn origin_of(url: &str) -> Option<String> {
    let scheme_end = url.find("://")? + 3;
    let path_start = url[scheme_end..]
        .find(['/', '?', '#'])
        .map_or(url.len(), |offset| scheme_end + offset);
    Some(url[..path_start].to_string())
}

impl EmbeddedFrame for MockFrame {
    fn sandbox(&self) -> SandboxPolicy {
        self.sandbox
    }

    fn on_load(&self, listener: LoadListener) {
        *self.listener.lock() = Some(listener);
        self.events.lock().push(FrameEvent::ListenerRegistered);
    }

    fn set_src(&self, src: &str) {
        *self.src.lock() = Some(src.to_string());
        self.events.lock().push(FrameEvent::SrcSet);
        if self.auto_load {
            let listener = self.listener.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                fire(&listener);
            });
        }
    }

    fn src(&self) -> Option<String> {
        self.src.lock().clone()
    }

    fn post_message(
        &self,
        message: HandshakeMessage,
        target_origin: &str,
        transfer: MessagePort,
    ) -> Result<(), FrameError> {
        let content_origin = self.content_origin().ok_or(FrameError::NoContentWindow)?;
        // Like a browser, a mismatched target origin drops the message silently.
        let delivered = content_origin == target_origin && message.is_port_transfer();
        self.handshakes.lock().push(PostedHandshake {
            message,
            target_origin: target_origin.to_string(),
            delivered,
        });
        if delivered {
            if let Some(dashboard) = &self.dashboard {
                dashboard.connect(transfer);
            }
        }
        Ok(())
    }
}

struct DashboardState {
    scroll_size: Mutex<ScrollSize>,
    active_tabs: Mutex<Vec<String>>,
    permalink_base: String,
    guest_tokens: watch::Sender<Vec<String>>,
    switchboard: Mutex<Option<Switchboard>>,
    connections: AtomicUsize,
}

/// The embedded app's side of the channel: records guest tokens and answers
/// the host's requests.
#[derive(Clone)]
pub struct MockDashboard {
    inner: Arc<DashboardState>,
}

impl Default for MockDashboard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDashboard {
    pub fn new() -> Self {
        let (guest_tokens, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(DashboardState {
                scroll_size: Mutex::new(ScrollSize {
                    width: 800,
                    height: 600,
                }),
                active_tabs: Mutex::new(vec!["TAB-overview".to_string()]),
                permalink_base: "https://dash.example.com/dashboard/p".to_string(),
                guest_tokens,
                switchboard: Mutex::new(None),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_scroll_size(&self, width: u32, height: u32) {
        *self.inner.scroll_size.lock() = ScrollSize { width, height };
    }

    pub fn set_active_tabs<I, S>(&self, tabs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.inner.active_tabs.lock() = tabs.into_iter().map(Into::into).collect();
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::Acquire)
    }

    pub fn guest_tokens(&self) -> Vec<String> {
        self.inner.guest_tokens.borrow().clone()
    }

    pub async fn wait_for_guest_tokens(&self, count: usize) -> Vec<String> {
        let mut updates = self.inner.guest_tokens.subscribe();
        let tokens = match updates.wait_for(|tokens| tokens.len() >= count).await {
            Ok(tokens) => tokens.clone(),
            Err(_) => self.guest_tokens(),
        };
        tokens
    }

    /// Accepts the port transferred by the host handshake.
    pub fn connect(&self, port: MessagePort) {
        let switchboard = Switchboard::new(port, "mock-dashboard", false);
        let state = Arc::downgrade(&self.inner);

        switchboard.define_method(GUEST_TOKEN_METHOD, {
            let state = state.clone();
            move |args: Value| {
                let outcome = with_state(&state, |state| {
                    let token = args
                        .get("guestToken")
                        .and_then(Value::as_str)
                        .ok_or_else(|| "guestToken missing".to_string())?;
                    state
                        .guest_tokens
                        .send_modify(|tokens| tokens.push(token.to_string()));
                    Ok(Value::Null)
                });
                async move { outcome }
            }
        });

        switchboard.define_method("getScrollSize", {
            let state = state.clone();
            move |_| {
                let outcome = with_state(&state, |state| {
                    serde_json::to_value(*state.scroll_size.lock()).map_err(|err| err.to_string())
                });
                async move { outcome }
            }
        });

        switchboard.define_method("getActiveTabs", {
            let state = state.clone();
            move |_| {
                let outcome = with_state(&state, |state| {
                    Ok(Value::from(state.active_tabs.lock().clone()))
                });
                async move { outcome }
            }
        });

        switchboard.define_method("getDashboardPermalink", move |args: Value| {
            let outcome = with_state(&state, |state| {
                let anchor = args
                    .get("anchor")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "anchor missing".to_string())?;
                Ok(Value::from(format!("{}/{anchor}/", state.permalink_base)))
            });
            async move { outcome }
        });

        if let Some(previous) = self.inner.switchboard.lock().replace(switchboard) {
            previous.close();
        }
        self.inner.connections.fetch_add(1, Ordering::AcqRel);
    }
}

fn with_state(
    state: &Weak<DashboardState>,
    f: impl FnOnce(&DashboardState) -> Result<Value, String>,
) -> Result<Value, String> {
    match state.upgrade() {
        Some(state) => f(&state),
        None => Err("dashboard unloaded".to_string()),
    }
}

/// Wall clock that advances with tokio's (possibly paused) clock.
#[derive(Debug, Clone)]
pub struct MockClock {
    origin: SystemTime,
    started: tokio::time::Instant,
}

impl MockClock {
    pub fn starting_at(origin: SystemTime) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        self.origin + self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_strips_path_and_query() {
        assert_eq!(
            origin_of("https://dash.example.com:8443/embedded/abc?uiConfig=1").as_deref(),
            Some("https://dash.example.com:8443")
        );
        assert_eq!(
            origin_of("http://localhost?x=1").as_deref(),
            Some("http://localhost")
        );
        assert_eq!(origin_of("not a url"), None);
    }

    #[tokio::test]
    async fn guest_tokens_wait_until_enough_arrive() {
        let dashboard = MockDashboard::new();
        let (host, theirs) = message_channel::MessageChannel::new().into_ports();
        dashboard.connect(theirs);
        let host = Switchboard::new(host, "host", false);

        let waiting = {
            let dashboard = dashboard.clone();
            tokio::spawn(async move { dashboard.wait_for_guest_tokens(2).await })
        };
        host.emit(GUEST_TOKEN_METHOD, serde_json::json!({ "guestToken": "tok1" }))
            .expect("emit");
        host.emit(GUEST_TOKEN_METHOD, serde_json::json!({ "guestToken": "tok2" }))
            .expect("emit");

        let tokens = tokio::time::timeout(std::time::Duration::from_secs(2), waiting)
            .await
            .expect("tokens timeout")
            .expect("join");
        assert_eq!(tokens, vec!["tok1", "tok2"]);
        assert_eq!(dashboard.connection_count(), 1);
    }
}
