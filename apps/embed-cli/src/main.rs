mod cli;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use uuid::Uuid;

use cli::{Cli, Command, DemoArgs, UrlArgs};
use dashboard_embed::frame::{embed_url, EMBED_SANDBOX};
use dashboard_embed::mock::{MockDashboard, MockMountPoint};
use dashboard_embed::telemetry::{logging, EmbedLog};
use dashboard_embed::{
    embed_dashboard, DashboardUiConfig, EmbedRequest, EmbedSettings, EmbeddedFrame,
};

const DEMO_ORIGIN: &str = "https://dash.example.com";
const REFRESH_SLACK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initializing logging")?;

    match cli.command {
        Command::Url(args) => print_url(args),
        Command::Sandbox => {
            println!("{EMBED_SANDBOX}");
            Ok(())
        }
        Command::Demo(args) => run_demo(args).await,
    }
}

fn print_url(args: UrlArgs) -> Result<()> {
    ensure!(!args.origin.is_empty(), "--origin must not be empty");
    ensure!(!args.id.is_empty(), "--id must not be empty");
    let settings = EmbedSettings::from_env()?;

    let mut config = match args.ui_config.as_deref() {
        Some(raw) => serde_json::from_str::<DashboardUiConfig>(raw)
            .context("parsing --ui-config as JSON")?,
        None => DashboardUiConfig::default(),
    };
    config.hide_title |= args.hide_title;
    config.hide_tab |= args.hide_tab;
    config.hide_chart_controls |= args.hide_chart_controls;
    for (key, value) in args.params {
        config = config.with_param(key, value);
    }

    let log = EmbedLog::new(&args.id, args.debug || settings.debug);
    println!("{}", embed_url(&args.origin, &args.id, Some(&config), &log));
    Ok(())
}

fn mint_guest_token(key: &EncodingKey, ttl: Duration) -> Result<String> {
    let exp = (SystemTime::now() + ttl)
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_secs();
    let claims = json!({
        "sub": "demo-guest",
        "jti": Uuid::new_v4().to_string(),
        "exp": exp,
    });
    encode(&Header::default(), &claims, key).context("signing demo guest token")
}

async fn run_demo(args: DemoArgs) -> Result<()> {
    let settings = EmbedSettings::from_env()?;
    let ttl = Duration::from_secs(args.ttl_secs);
    let key = EncodingKey::from_secret(Uuid::new_v4().as_bytes());

    let dashboard = MockDashboard::new();
    let mount = MockMountPoint::new(dashboard.clone());
    let fetcher = move || {
        let token = mint_guest_token(&key, ttl);
        async move { token }
    };

    let embedded = embed_dashboard(
        EmbedRequest::new()
            .with_id(args.id.as_str())
            .with_host_origin(DEMO_ORIGIN)
            .with_mount_point(mount.clone())
            .with_guest_token_fetcher(fetcher)
            .with_settings(&settings),
    )
    .await
    .context("embedding demo dashboard")?;
    tracing::info!(dashboard = %embedded.dashboard_id(), "embedded");

    if let Some(src) = mount.last_frame().and_then(|frame| frame.src()) {
        println!("frame src:   {src}");
    }
    let size = embedded.get_scroll_size().await?;
    println!("scroll size: {}x{}", size.width, size.height);
    println!("active tabs: {}", embedded.get_active_tabs().await?.join(", "));
    println!(
        "permalink:   {}",
        embedded.get_dashboard_permalink("demo-anchor").await?
    );

    let per_refresh = ttl.max(settings.refresh.min_wait) + REFRESH_SLACK;
    let expected = 1 + args.refreshes as usize;
    let tokens = tokio::time::timeout(
        per_refresh * args.refreshes.max(1),
        dashboard.wait_for_guest_tokens(expected),
    )
    .await
    .context("timed out waiting for guest token refreshes")?;
    println!("guest tokens delivered: {}", tokens.len());

    embedded.unmount();
    println!("unmounted: {}", !mount.is_mounted());
    Ok(())
}
