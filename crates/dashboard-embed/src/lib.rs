//! Embeds a remote dashboard inside a sandboxed child frame.
//!
//! The host hands the frame one end of a private [`message_channel`] pair once
//! the frame has loaded, delivers a guest token over it, and keeps that token
//! fresh for as long as the dashboard stays mounted. The returned
//! [`EmbeddedDashboard`] proxies a handful of calls to the embedded app over
//! the same channel.

pub mod config;
pub mod embed;
pub mod error;
pub mod frame;
pub mod guest_token;
pub mod mock;
pub mod switchboard;
pub mod telemetry;
pub mod ui_config;

pub use config::EmbedSettings;
pub use embed::{embed_dashboard, EmbedRequest, EmbeddedDashboard, ScrollSize};
pub use error::{ConfigError, EmbedError};
pub use frame::{EmbeddedFrame, FrameError, MountPoint, SandboxCapability, SandboxPolicy};
pub use guest_token::{Clock, GuestTokenFetcher, RefreshTiming, SystemClock};
pub use switchboard::{Switchboard, SwitchboardError};
pub use ui_config::DashboardUiConfig;
