use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::EmbedSettings;
use crate::error::EmbedError;
use crate::frame::{embed_url, mount_iframe, MountPoint};
use crate::guest_token::{
    deliver_guest_token, Clock, GuestTokenFetcher, GuestTokenRefresher, RefreshHandle,
    RefreshTiming, SystemClock,
};
use crate::switchboard::Switchboard;
use crate::telemetry::EmbedLog;
use crate::ui_config::DashboardUiConfig;

/// Everything needed to embed one dashboard. Required fields start empty so a
/// half-filled request can be represented and rejected by [`EmbedRequest::validate`].
pub struct EmbedRequest {
    id: Option<String>,
    host_origin: Option<String>,
    mount_point: Option<Arc<dyn MountPoint>>,
    fetch_guest_token: Option<Arc<dyn GuestTokenFetcher>>,
    ui_config: Option<DashboardUiConfig>,
    debug: bool,
    refresh_timing: RefreshTiming,
    clock: Arc<dyn Clock>,
}

impl Default for EmbedRequest {
    fn default() -> Self {
        Self {
            id: None,
            host_origin: None,
            mount_point: None,
            fetch_guest_token: None,
            ui_config: None,
            debug: false,
            refresh_timing: RefreshTiming::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl EmbedRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_host_origin(mut self, origin: impl Into<String>) -> Self {
        self.host_origin = Some(origin.into());
        self
    }

    pub fn with_mount_point(mut self, mount_point: Arc<dyn MountPoint>) -> Self {
        self.mount_point = Some(mount_point);
        self
    }

    pub fn with_guest_token_fetcher<F>(mut self, fetcher: F) -> Self
    where
        F: GuestTokenFetcher + 'static,
    {
        self.fetch_guest_token = Some(Arc::new(fetcher));
        self
    }

    pub fn with_shared_fetcher(mut self, fetcher: Arc<dyn GuestTokenFetcher>) -> Self {
        self.fetch_guest_token = Some(fetcher);
        self
    }

    pub fn with_ui_config(mut self, config: DashboardUiConfig) -> Self {
        self.ui_config = Some(config);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_refresh_timing(mut self, timing: RefreshTiming) -> Self {
        self.refresh_timing = timing;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Applies environment-derived defaults. An explicit `with_debug(true)`
    /// is kept.
    pub fn with_settings(mut self, settings: &EmbedSettings) -> Self {
        self.debug |= settings.debug;
        self.refresh_timing = settings.refresh;
        self
    }

    /// Checks the required fields in order: id, host origin, mount point,
    /// fetcher.
    pub fn validate(&self) -> Result<(), EmbedError> {
        if self.id.as_deref().map_or(true, str::is_empty) {
            return Err(EmbedError::InvalidId);
        }
        if self.host_origin.as_deref().map_or(true, str::is_empty) {
            return Err(EmbedError::InvalidOrigin);
        }
        if self.mount_point.is_none() {
            return Err(EmbedError::InvalidMountTarget);
        }
        if self.fetch_guest_token.is_none() {
            return Err(EmbedError::InvalidFetcher);
        }
        Ok(())
    }

    fn into_validated(self) -> Result<ValidatedRequest, EmbedError> {
        self.validate()?;
        Ok(ValidatedRequest {
            id: self.id.ok_or(EmbedError::InvalidId)?,
            host_origin: self.host_origin.ok_or(EmbedError::InvalidOrigin)?,
            mount_point: self.mount_point.ok_or(EmbedError::InvalidMountTarget)?,
            fetcher: self.fetch_guest_token.ok_or(EmbedError::InvalidFetcher)?,
            ui_config: self.ui_config,
            debug: self.debug,
            refresh_timing: self.refresh_timing,
            clock: self.clock,
        })
    }
}

struct ValidatedRequest {
    id: String,
    host_origin: String,
    mount_point: Arc<dyn MountPoint>,
    fetcher: Arc<dyn GuestTokenFetcher>,
    ui_config: Option<DashboardUiConfig>,
    debug: bool,
    refresh_timing: RefreshTiming,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollSize {
    pub width: u32,
    pub height: u32,
}

/// Embeds the dashboard described by `request` and returns a handle to it.
///
/// The first guest token is fetched while the frame loads; it is only sent
/// once both have finished. If either fails, nothing is returned and no
/// refresh loop is started.
pub async fn embed_dashboard(request: EmbedRequest) -> Result<EmbeddedDashboard, EmbedError> {
    let request = request.into_validated()?;
    let log = EmbedLog::new(&request.id, request.debug);
    log.debug("embedding");

    let src = embed_url(
        &request.host_origin,
        &request.id,
        request.ui_config.as_ref(),
        &log,
    );

    let fetch = async {
        request
            .fetcher
            .fetch_guest_token()
            .await
            .map_err(EmbedError::GuestTokenFetch)
    };
    let mount = async {
        mount_iframe(
            request.mount_point.as_ref(),
            &request.host_origin,
            &src,
            &log,
        )
        .await
        .map_err(EmbedError::from)
    };
    let (guest_token, switchboard) = tokio::try_join!(fetch, mount)?;

    deliver_guest_token(&switchboard, &guest_token)?;
    log.debug("sent guest token");

    let refresher = GuestTokenRefresher::new(
        request.fetcher.clone(),
        switchboard.clone(),
        request.refresh_timing,
        request.clock.clone(),
        log.clone(),
    )
    .spawn(guest_token);

    Ok(EmbeddedDashboard {
        log,
        mount_point: request.mount_point,
        switchboard,
        refresher,
        mounted: AtomicBool::new(true),
    })
}

/// A mounted dashboard. Calls are proxied to the embedded app over the
/// private channel.
pub struct EmbeddedDashboard {
    log: EmbedLog,
    mount_point: Arc<dyn MountPoint>,
    switchboard: Switchboard,
    refresher: RefreshHandle,
    mounted: AtomicBool,
}

impl EmbeddedDashboard {
    pub fn dashboard_id(&self) -> &str {
        self.log.dashboard()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub fn switchboard(&self) -> &Switchboard {
        &self.switchboard
    }

    /// Removes the frame and stops token refreshes. Pending and later calls
    /// fail with a closed-switchboard error.
    pub fn unmount(&self) {
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return;
        }
        self.log.debug("unmounting");
        self.mount_point.replace_children(None);
        self.refresher.cancel();
        self.switchboard.close();
    }

    pub async fn get_scroll_size(&self) -> Result<ScrollSize, EmbedError> {
        Ok(self.switchboard.get_as("getScrollSize", Value::Null).await?)
    }

    pub async fn get_dashboard_permalink(&self, anchor: &str) -> Result<String, EmbedError> {
        Ok(self
            .switchboard
            .get_as("getDashboardPermalink", json!({ "anchor": anchor }))
            .await?)
    }

    pub async fn get_active_tabs(&self) -> Result<Vec<String>, EmbedError> {
        Ok(self.switchboard.get_as("getActiveTabs", Value::Null).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDashboard, MockMountPoint};
    use std::sync::atomic::AtomicUsize;

    fn counting_fetcher(calls: Arc<AtomicUsize>) -> impl GuestTokenFetcher {
        move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, anyhow::Error>(format!("tok{n}"))
            }
        }
    }

    fn complete_request(mount: Arc<MockMountPoint>, calls: Arc<AtomicUsize>) -> EmbedRequest {
        EmbedRequest::new()
            .with_id("abc")
            .with_host_origin("https://dash.example.com")
            .with_mount_point(mount)
            .with_guest_token_fetcher(counting_fetcher(calls))
    }

    #[test]
    fn validation_reports_the_first_missing_field() {
        let mount = MockMountPoint::empty();
        let calls = Arc::new(AtomicUsize::new(0));

        let missing_id = EmbedRequest::new()
            .with_host_origin("https://dash.example.com")
            .with_mount_point(mount.clone())
            .with_guest_token_fetcher(counting_fetcher(calls.clone()));
        assert!(matches!(missing_id.validate(), Err(EmbedError::InvalidId)));

        let empty_id = complete_request(mount.clone(), calls.clone()).with_id("");
        assert!(matches!(empty_id.validate(), Err(EmbedError::InvalidId)));

        let empty_origin = complete_request(mount.clone(), calls.clone()).with_host_origin("");
        assert!(matches!(
            empty_origin.validate(),
            Err(EmbedError::InvalidOrigin)
        ));

        let no_mount = EmbedRequest::new()
            .with_id("abc")
            .with_host_origin("https://dash.example.com")
            .with_guest_token_fetcher(counting_fetcher(calls.clone()));
        assert!(matches!(
            no_mount.validate(),
            Err(EmbedError::InvalidMountTarget)
        ));

        let no_fetcher = EmbedRequest::new()
            .with_id("abc")
            .with_host_origin("https://dash.example.com")
            .with_mount_point(mount.clone());
        assert!(matches!(
            no_fetcher.validate(),
            Err(EmbedError::InvalidFetcher)
        ));

        assert!(complete_request(mount, calls).validate().is_ok());
    }

    #[tokio::test]
    async fn invalid_request_touches_nothing() {
        let mount = MockMountPoint::new(MockDashboard::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let request = complete_request(mount.clone(), calls.clone()).with_host_origin("");

        let err = embed_dashboard(request).await.err().expect("rejected");
        assert!(matches!(err, EmbedError::InvalidOrigin));
        assert!(mount.frames().is_empty());
        assert!(!mount.is_mounted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn debug_flag_comes_from_settings() {
        let settings = EmbedSettings {
            debug: true,
            ..EmbedSettings::default()
        };
        let request = EmbedRequest::new().with_settings(&settings);
        assert!(request.debug);
        let request = EmbedRequest::new()
            .with_debug(true)
            .with_settings(&EmbedSettings::default());
        assert!(request.debug);
    }
}
