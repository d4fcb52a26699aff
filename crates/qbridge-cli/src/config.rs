//! Config file loading and resolution against the command line.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use qbridge_reverse_ws::EndpointConfig;
use serde::Deserialize;

use crate::cli_args::Cli;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QqFileConfig {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub sandbox: Option<bool>,
}

/// Contents of the `--config` TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub qq: QqFileConfig,
    #[serde(default)]
    pub reverse_ws: Vec<EndpointConfig>,
}

pub fn parse_file_config(raw: &str) -> Result<FileConfig> {
    toml::from_str(raw).context("failed to parse config file")
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_file_config(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub webhook_bind: String,
    pub webhook_path: String,
    pub app_id: String,
    pub app_secret: String,
    pub sandbox: bool,
    pub database_path: PathBuf,
    pub queue_capacity: usize,
    pub http_timeout_ms: u64,
    pub endpoints: Vec<EndpointConfig>,
}

impl BridgeSettings {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Merges the file under the command line; flags and env values win.
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let app_id = pick(cli.app_id.as_deref(), file.qq.app_id.as_deref());
        let app_secret = pick(cli.app_secret.as_deref(), file.qq.app_secret.as_deref());
        if app_id.is_empty() {
            bail!("app id is required (--app-id, QBRIDGE_APP_ID or [qq].app_id)");
        }
        if app_secret.is_empty() {
            bail!("app secret is required (--app-secret, QBRIDGE_APP_SECRET or [qq].app_secret)");
        }
        let webhook_path = cli.webhook_path.trim().to_string();
        if !webhook_path.starts_with('/') {
            bail!("webhook path '{webhook_path}' must start with '/'");
        }
        if cli.queue_capacity == 0 {
            bail!("queue capacity must be greater than 0");
        }

        let mut seen = BTreeSet::new();
        for endpoint in &file.reverse_ws {
            endpoint.validate()?;
            if !seen.insert(endpoint.id.as_str()) {
                bail!("duplicate reverse websocket endpoint id '{}'", endpoint.id);
            }
        }

        Ok(Self {
            webhook_bind: cli.webhook_bind.trim().to_string(),
            webhook_path,
            app_id,
            app_secret,
            sandbox: cli.sandbox || file.qq.sandbox.unwrap_or(false),
            database_path: cli.database_path.clone(),
            queue_capacity: cli.queue_capacity,
            http_timeout_ms: cli.http_timeout_ms,
            endpoints: file.reverse_ws,
        })
    }
}

fn pick(preferred: Option<&str>, fallback: Option<&str>) -> String {
    preferred
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| fallback.map(str::trim))
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tempfile::tempdir;

    use super::{load_file_config, parse_file_config, BridgeSettings};
    use crate::cli_args::Cli;

    const SAMPLE: &str = r#"
[qq]
app_id = "102005"
app_secret = "from-file"
sandbox = true

[[reverse_ws]]
id = "nonebot"
url = "ws://127.0.0.1:8081/onebot/v11/ws"
self_id = 10001
access_token = "t0ken"
max_retries = 3

[[reverse_ws]]
id = "koishi"
url = "wss://bot.example/onebot"
self_id = 10002
reconnect_interval_ms = 1000
"#;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["qbridge"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("parse")
    }

    #[test]
    fn functional_file_supplies_credentials_and_endpoints() {
        let settings = BridgeSettings::resolve(&cli(&[]), parse_file_config(SAMPLE).expect("toml"))
            .expect("settings");
        assert_eq!(settings.app_id, "102005");
        assert_eq!(settings.app_secret, "from-file");
        assert!(settings.sandbox);
        assert_eq!(settings.endpoints.len(), 2);
        assert_eq!(settings.endpoints[0].max_retries, 3);
        assert_eq!(settings.endpoints[0].heartbeat_interval_ms, 5_000);
        assert_eq!(settings.endpoints[1].retry_delay_ms, 1_000);
    }

    #[test]
    fn functional_command_line_wins_over_file() {
        let settings = BridgeSettings::resolve(
            &cli(&["--app-secret", "from-cli"]),
            parse_file_config(SAMPLE).expect("toml"),
        )
        .expect("settings");
        assert_eq!(settings.app_secret, "from-cli");
        assert_eq!(settings.app_id, "102005");
    }

    #[test]
    fn regression_invalid_settings_are_rejected() {
        let missing = BridgeSettings::resolve(&cli(&[]), Default::default());
        assert!(missing.is_err());

        let duplicate = SAMPLE.replace("\"koishi\"", "\"nonebot\"");
        let error = BridgeSettings::resolve(&cli(&[]), parse_file_config(&duplicate).expect("toml"))
            .expect_err("duplicate ids");
        assert!(error.to_string().contains("duplicate"));

        let http = SAMPLE.replace("wss://bot.example", "https://bot.example");
        assert!(
            BridgeSettings::resolve(&cli(&[]), parse_file_config(&http).expect("toml")).is_err()
        );
        assert!(parse_file_config("[qq]\nunknown = 1\n").is_err());
    }

    #[test]
    fn integration_config_file_loads_from_disk() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("qbridge.toml");
        std::fs::write(&path, SAMPLE).expect("write");
        let file = load_file_config(&path).expect("load");
        assert_eq!(file.reverse_ws[0].bearer_token(), Some("t0ken"));
        assert!(load_file_config(&temp.path().join("missing.toml")).is_err());
    }
}
