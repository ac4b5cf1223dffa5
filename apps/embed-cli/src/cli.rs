use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use dashboard_embed::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "dashboard-embed",
    about = "Inspect and exercise dashboard embeddings",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "DASHBOARD_EMBED_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "DASHBOARD_EMBED_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the frame URL for an embedding
    Url(UrlArgs),
    /// Print the sandbox policy applied to every dashboard frame
    Sandbox,
    /// Embed a dashboard into an in-process mock page and exercise it
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
pub struct UrlArgs {
    #[arg(
        long,
        env = "DASHBOARD_EMBED_ORIGIN",
        value_name = "ORIGIN",
        help = "Origin serving the dashboard, e.g. https://dash.example.com"
    )]
    pub origin: String,

    #[arg(long, value_name = "ID", help = "Embedded dashboard id")]
    pub id: String,

    #[arg(
        long = "ui-config",
        value_name = "JSON",
        help = "UI configuration as JSON (hideTitle, hideTab, hideChartControls, filters, params)"
    )]
    pub ui_config: Option<String>,

    #[arg(long = "hide-title", action = clap::ArgAction::SetTrue)]
    pub hide_title: bool,

    #[arg(long = "hide-tab", action = clap::ArgAction::SetTrue)]
    pub hide_tab: bool,

    #[arg(long = "hide-chart-controls", action = clap::ArgAction::SetTrue)]
    pub hide_chart_controls: bool,

    #[arg(
        long = "param",
        value_name = "KEY=VALUE",
        value_parser = parse_param,
        help = "Extra query parameter passed through to the dashboard (repeatable)"
    )]
    pub params: Vec<(String, String)>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Log encoder diagnostics such as unrecognized filter keys"
    )]
    pub debug: bool,
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    #[arg(long, default_value = "demo-dashboard", value_name = "ID")]
    pub id: String,

    #[arg(
        long = "ttl-secs",
        default_value_t = 12,
        value_name = "SECONDS",
        help = "Lifetime of each minted guest token"
    )]
    pub ttl_secs: u64,

    #[arg(
        long,
        default_value_t = 1,
        value_name = "COUNT",
        help = "Number of token refreshes to wait for before unmounting"
    )]
    pub refreshes: u32,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
