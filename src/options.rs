//! Client options, engine address parsing and synchronous validation.
//!
//! [`ClientOptions`] can be built in code with the `with_*` methods or loaded
//! from a TOML file. Validation happens in [`ClientOptions::resolve`], which
//! [`crate::CopilotClient::new`] calls before anything is spawned or
//! connected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CopilotError, Result};

/// Environment variable consulted for the default engine executable.
pub const CLI_PATH_ENV: &str = "COPILOT_CLI_PATH";

/// Default engine executable when neither the option nor the environment
/// variable is set.
pub const DEFAULT_CLI_PATH: &str = "copilot";

/// Log verbosity requested from the engine (`--log-level`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
    All,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::None => "none",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::All => "all",
        }
    }
}

/// Options for [`crate::CopilotClient`].
///
/// `use_stdio` and `cli_path` are optional so that an explicit setting can be
/// told apart from the default; both conflict with `cli_url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Engine executable. Defaults to `$COPILOT_CLI_PATH`, then `copilot`.
    pub cli_path: Option<String>,
    /// Extra arguments placed before the server flags. In TOML this may be a
    /// list or a single shell-style string.
    #[serde(deserialize_with = "deserialize_cli_args")]
    pub cli_args: Vec<String>,
    /// Working directory for the engine process (default: inherit).
    pub cwd: Option<PathBuf>,
    /// Port for TCP-spawn mode; 0 lets the engine pick.
    pub port: u16,
    /// Talk to the spawned engine over its stdio (default) or over TCP.
    pub use_stdio: Option<bool>,
    /// Address of an already running engine: `port`, `host:port`,
    /// `http://host:port` or `https://host:port`.
    pub cli_url: Option<String>,
    pub log_level: LogLevel,
    /// Start the engine on first use.
    pub auto_start: bool,
    /// Restart the engine after an unexpected exit.
    pub auto_restart: bool,
    /// Complete environment for the engine process. `None` inherits ours.
    pub env: Option<HashMap<String, String>>,
    /// Token handed to the spawned engine through its environment.
    pub github_token: Option<String>,
    /// Whether the engine may fall back to stored credentials. Defaults to
    /// `true`, or `false` when `github_token` is set.
    pub use_logged_in_user: Option<bool>,
    /// Default deadline for calls issued without their own timeout.
    #[serde(rename = "request_timeout_ms", deserialize_with = "deserialize_opt_millis")]
    pub request_timeout: Option<Duration>,
    /// Consecutive failed restarts tolerated before giving up.
    pub max_restart_attempts: u32,
    /// Base delay before a restart; doubled per consecutive failure.
    #[serde(rename = "restart_backoff_ms", deserialize_with = "deserialize_millis")]
    pub restart_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cli_path: None,
            cli_args: Vec::new(),
            cwd: None,
            port: 0,
            use_stdio: None,
            cli_url: None,
            log_level: LogLevel::Info,
            auto_start: true,
            auto_restart: true,
            env: None,
            github_token: None,
            use_logged_in_user: None,
            request_timeout: None,
            max_restart_attempts: 3,
            restart_backoff: Duration::from_millis(500),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_path(mut self, path: impl Into<String>) -> Self {
        self.cli_path = Some(path.into());
        self
    }

    pub fn with_cli_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cli_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_use_stdio(mut self, use_stdio: bool) -> Self {
        self.use_stdio = Some(use_stdio);
        self
    }

    pub fn with_cli_url(mut self, url: impl Into<String>) -> Self {
        self.cli_url = Some(url.into());
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_github_token(mut self, token: impl Into<String>) -> Self {
        self.github_token = Some(token.into());
        self
    }

    pub fn with_use_logged_in_user(mut self, value: bool) -> Self {
        self.use_logged_in_user = Some(value);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = attempts;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    /// Parse options from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| CopilotError::Configuration(format!("Invalid client options: {e}")))
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CopilotError::Configuration(format!(
                "Failed to read client options from {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// `<config dir>/copilot-sdk/client.toml`, if the platform has a config dir.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("copilot-sdk").join("client.toml"))
    }

    /// The engine executable that would be launched.
    pub fn effective_cli_path(&self) -> String {
        self.cli_path
            .clone()
            .or_else(|| std::env::var(CLI_PATH_ENV).ok().filter(|p| !p.is_empty()))
            .unwrap_or_else(|| DEFAULT_CLI_PATH.to_string())
    }

    /// Whether the engine may use stored credentials.
    pub fn effective_use_logged_in_user(&self) -> bool {
        self.use_logged_in_user
            .unwrap_or(self.github_token.is_none())
    }

    /// Validate the options and decide how the engine is reached.
    ///
    /// All checks are synchronous; nothing is spawned or connected here.
    pub fn resolve(&self) -> Result<ServerEndpoint> {
        let Some(url) = self.cli_url.as_deref() else {
            return Ok(if self.use_stdio.unwrap_or(true) {
                ServerEndpoint::Stdio
            } else {
                ServerEndpoint::Tcp { port: self.port }
            });
        };

        if self.use_stdio == Some(true) || self.cli_path.is_some() {
            return Err(CopilotError::Configuration(
                "cli_url is mutually exclusive with use_stdio and cli_path".to_string(),
            ));
        }
        if self.github_token.is_some() || self.use_logged_in_user.is_some() {
            return Err(CopilotError::Configuration(
                "github_token and use_logged_in_user cannot be used with cli_url \
                 (external server manages its own auth)"
                    .to_string(),
            ));
        }

        let (host, port) = parse_cli_url(url)?;
        Ok(ServerEndpoint::External { host, port })
    }
}

/// How the client reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEndpoint {
    /// Spawn the engine and speak over its stdin/stdout.
    Stdio,
    /// Spawn the engine as a TCP server on `port` (0 = engine picks).
    Tcp { port: u16 },
    /// Connect to an engine this client does not own.
    External { host: String, port: u16 },
}

impl ServerEndpoint {
    /// Whether the engine process is owned by someone else.
    pub fn is_external(&self) -> bool {
        matches!(self, ServerEndpoint::External { .. })
    }
}

/// Parse an engine address into `(host, port)`.
///
/// Accepted forms: `8080`, `host:8080`, `http://host:8080`,
/// `https://host:8080`. The host defaults to `localhost`; the port must be in
/// `1..=65535`.
pub fn parse_cli_url(url: &str) -> Result<(String, u16)> {
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let rest = rest.trim_end_matches('/');

    let (host, port_text) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => {
            // A bare value must at least look like a number to be a port.
            if rest.parse::<i64>().is_err() {
                return Err(CopilotError::Configuration(format!(
                    "Invalid cli_url format: {url}"
                )));
            }
            ("", rest)
        }
    };

    if host.contains('/') || host.contains(' ') {
        return Err(CopilotError::Configuration(format!(
            "Invalid cli_url format: {url}"
        )));
    }

    let port = port_text
        .parse::<i64>()
        .ok()
        .filter(|p| (1..=i64::from(u16::MAX)).contains(p))
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| CopilotError::Configuration(format!("Invalid port in cli_url: {url}")))?;

    let host = if host.is_empty() { "localhost" } else { host };
    Ok((host.to_string(), port))
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum ArgsRepr {
    List(Vec<String>),
    Line(String),
}

fn deserialize_cli_args<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match ArgsRepr::deserialize(deserializer)? {
        ArgsRepr::List(list) => Ok(list),
        ArgsRepr::Line(line) => shell_words::split(&line).map_err(serde::de::Error::custom),
    }
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn deserialize_opt_millis<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config_error(result: Result<impl std::fmt::Debug>) -> String {
        match result {
            Err(CopilotError::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_all_address_forms() {
        assert_eq!(parse_cli_url("8080").unwrap(), ("localhost".into(), 8080));
        assert_eq!(
            parse_cli_url("127.0.0.1:9000").unwrap(),
            ("127.0.0.1".into(), 9000)
        );
        assert_eq!(
            parse_cli_url("http://localhost:7000").unwrap(),
            ("localhost".into(), 7000)
        );
        assert_eq!(
            parse_cli_url("https://example.com:443").unwrap(),
            ("example.com".into(), 443)
        );
        assert_eq!(parse_cli_url(":8081").unwrap(), ("localhost".into(), 8081));
    }

    #[test]
    fn test_port_out_of_range() {
        for url in ["localhost:0", "localhost:-1", "localhost:99999", "0", "70000"] {
            let msg = config_error(parse_cli_url(url));
            assert_eq!(msg, format!("Invalid port in cli_url: {url}"));
        }
        let msg = config_error(parse_cli_url("localhost:http"));
        assert!(msg.starts_with("Invalid port in cli_url"));
    }

    #[test]
    fn test_bad_format() {
        let msg = config_error(parse_cli_url("invalid-url"));
        assert_eq!(msg, "Invalid cli_url format: invalid-url");
    }

    #[test]
    fn test_resolve_defaults_to_stdio() {
        assert_eq!(ClientOptions::default().resolve().unwrap(), ServerEndpoint::Stdio);
        assert_eq!(
            ClientOptions::new()
                .with_use_stdio(false)
                .with_port(4321)
                .resolve()
                .unwrap(),
            ServerEndpoint::Tcp { port: 4321 }
        );
    }

    #[test]
    fn test_resolve_external() {
        let endpoint = ClientOptions::new().with_cli_url("8080").resolve().unwrap();
        assert!(endpoint.is_external());
        assert_eq!(
            endpoint,
            ServerEndpoint::External {
                host: "localhost".into(),
                port: 8080
            }
        );
    }

    #[test]
    fn test_cli_url_conflicts() {
        let msg = config_error(
            ClientOptions::new()
                .with_cli_url("localhost:8080")
                .with_use_stdio(true)
                .resolve(),
        );
        assert_eq!(msg, "cli_url is mutually exclusive with use_stdio and cli_path");

        let msg = config_error(
            ClientOptions::new()
                .with_cli_url("localhost:8080")
                .with_cli_path("/path/to/cli")
                .resolve(),
        );
        assert_eq!(msg, "cli_url is mutually exclusive with use_stdio and cli_path");

        // An explicit `use_stdio = false` is compatible.
        assert!(
            ClientOptions::new()
                .with_cli_url("localhost:8080")
                .with_use_stdio(false)
                .resolve()
                .is_ok()
        );
    }

    #[test]
    fn test_auth_options_rejected_with_cli_url() {
        for opts in [
            ClientOptions::new()
                .with_cli_url("localhost:8080")
                .with_github_token("gho_test_token"),
            ClientOptions::new()
                .with_cli_url("localhost:8080")
                .with_use_logged_in_user(false),
        ] {
            let msg = config_error(opts.resolve());
            assert!(msg.starts_with("github_token and use_logged_in_user cannot be used with cli_url"));
        }
    }

    #[test]
    fn test_logged_in_user_default_follows_token() {
        assert!(ClientOptions::new().effective_use_logged_in_user());
        assert!(
            !ClientOptions::new()
                .with_github_token("gho_x")
                .effective_use_logged_in_user()
        );
        assert!(
            ClientOptions::new()
                .with_github_token("gho_x")
                .with_use_logged_in_user(true)
                .effective_use_logged_in_user()
        );
    }

    #[test]
    fn test_parse_toml_options() {
        let toml_str = r#"
cli_path = "/opt/copilot/index.js"
cli_args = "--config-dir '/tmp/my config'"
log_level = "debug"
auto_restart = false
request_timeout_ms = 1500
restart_backoff_ms = 100

[env]
HOME = "/tmp/home"
"#;
        let opts = ClientOptions::from_toml_str(toml_str).unwrap();
        assert_eq!(opts.cli_path.as_deref(), Some("/opt/copilot/index.js"));
        assert_eq!(opts.cli_args, vec!["--config-dir", "/tmp/my config"]);
        assert_eq!(opts.log_level, LogLevel::Debug);
        assert!(!opts.auto_restart);
        assert!(opts.auto_start);
        assert_eq!(opts.request_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(opts.restart_backoff, Duration::from_millis(100));
        assert_eq!(opts.max_restart_attempts, 3);
        assert_eq!(opts.env.unwrap()["HOME"], "/tmp/home");
    }

    #[test]
    fn test_parse_toml_args_list() {
        let opts = ClientOptions::from_toml_str(r#"cli_args = ["--a", "b c"]"#).unwrap();
        assert_eq!(opts.cli_args, vec!["--a", "b c"]);
    }

    #[test]
    fn test_bad_toml_is_configuration_error() {
        let msg = config_error(ClientOptions::from_toml_str("log_level = \"loud\""));
        assert!(msg.starts_with("Invalid client options"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "cli_url = \"127.0.0.1:9000\"\n").unwrap();
        let opts = ClientOptions::load(&path).unwrap();
        assert_eq!(
            opts.resolve().unwrap(),
            ServerEndpoint::External {
                host: "127.0.0.1".into(),
                port: 9000
            }
        );
        assert!(ClientOptions::load(&dir.path().join("missing.toml")).is_err());
    }
}
