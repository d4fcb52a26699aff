use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "qbridge",
    about = "Bridge the QQ official bot webhook API to OneBot v11 reverse WebSocket",
    version
)]
pub struct Cli {
    #[arg(
        long = "webhook-bind",
        env = "QBRIDGE_WEBHOOK_BIND",
        default_value = "0.0.0.0:8080",
        help = "Socket address the QQ webhook listener binds to"
    )]
    pub webhook_bind: String,

    #[arg(
        long = "webhook-path",
        env = "QBRIDGE_WEBHOOK_PATH",
        default_value = "/qqbot",
        help = "HTTP path QQ delivers webhook callbacks to"
    )]
    pub webhook_path: String,

    #[arg(
        long = "app-id",
        env = "QBRIDGE_APP_ID",
        help = "QQ bot app id; overrides [qq].app_id from the config file"
    )]
    pub app_id: Option<String>,

    #[arg(
        long = "app-secret",
        env = "QBRIDGE_APP_SECRET",
        hide_env_values = true,
        help = "QQ bot app secret; overrides [qq].app_secret from the config file"
    )]
    pub app_secret: Option<String>,

    #[arg(
        long,
        env = "QBRIDGE_SANDBOX",
        default_value_t = false,
        help = "Use the sandbox OpenAPI base URL"
    )]
    pub sandbox: bool,

    #[arg(
        long = "database-path",
        env = "QBRIDGE_DATABASE_PATH",
        default_value = "data/qbridge.db",
        help = "SQLite file holding the id correlation tables"
    )]
    pub database_path: PathBuf,

    #[arg(
        long = "queue-capacity",
        env = "QBRIDGE_QUEUE_CAPACITY",
        default_value_t = qbridge_core::DEFAULT_QUEUE_CAPACITY,
        help = "Capacity of each internal hand-off queue; the oldest item is dropped when full"
    )]
    pub queue_capacity: usize,

    #[arg(
        long = "http-timeout-ms",
        env = "QBRIDGE_HTTP_TIMEOUT_MS",
        default_value_t = 10_000,
        help = "Timeout for QQ OpenAPI requests in milliseconds"
    )]
    pub http_timeout_ms: u64,

    #[arg(
        long,
        env = "QBRIDGE_CONFIG",
        help = "TOML file with [qq] credentials and [[reverse_ws]] endpoints"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "log-level",
        env = "QBRIDGE_LOG_LEVEL",
        default_value = "info",
        help = "Default tracing directive; RUST_LOG takes precedence when set"
    )]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::Cli;

    #[test]
    fn unit_defaults_match_documented_values() {
        let cli = Cli::try_parse_from(["qbridge"]).expect("parse");
        assert_eq!(cli.webhook_bind, "0.0.0.0:8080");
        assert_eq!(cli.webhook_path, "/qqbot");
        assert_eq!(cli.database_path, PathBuf::from("data/qbridge.db"));
        assert_eq!(cli.queue_capacity, 100);
        assert_eq!(cli.http_timeout_ms, 10_000);
        assert_eq!(cli.log_level, "info");
        assert!(!cli.sandbox);
    }

    #[test]
    fn functional_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "qbridge",
            "--app-id",
            "102005",
            "--app-secret",
            "secret",
            "--sandbox",
            "--queue-capacity",
            "16",
            "--config",
            "bridge.toml",
        ])
        .expect("parse");
        assert_eq!(cli.app_id.as_deref(), Some("102005"));
        assert_eq!(cli.app_secret.as_deref(), Some("secret"));
        assert!(cli.sandbox);
        assert_eq!(cli.queue_capacity, 16);
        assert_eq!(cli.config, Some(PathBuf::from("bridge.toml")));
    }
}
