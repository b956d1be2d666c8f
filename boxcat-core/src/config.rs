use crate::error::{BoxcatError, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Defaults to `go build`; `program = ""` turns the build off
    #[serde(default = "default_build")]
    pub build: Option<BuildConfig>,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Directory the server is built and launched in
    #[serde(default = "default_server_dir")]
    pub directory: Utf8PathBuf,
    /// Binary to launch, relative to `directory` unless absolute
    #[serde(default = "default_binary")]
    pub binary: Utf8PathBuf,
    /// Leading arguments, placed before the config and descriptor flags
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_conf_flag")]
    pub conf_flag: String,
    #[serde(default = "default_listen_fd_flag")]
    pub listen_fd_flag: String,
    /// Written to the generated config as `server-name`
    #[serde(default = "default_server_name")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub strategy: ListenStrategy,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

/// How the harness hands a listening socket to the server.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenStrategy {
    /// Bind in the harness and pass the live descriptor to the child.
    #[default]
    InheritFd,
    /// Bind, note the port, release it, and let the child bind it again.
    EphemeralPort,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            directory: default_server_dir(),
            binary: default_binary(),
            args: Vec::new(),
            conf_flag: default_conf_flag(),
            listen_fd_flag: default_listen_fd_flag(),
            name: default_server_name(),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            strategy: ListenStrategy::default(),
            ready_timeout_ms: default_ready_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            start_attempts: default_start_attempts(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            dial_timeout_ms: default_dial_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl LaunchConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ClientConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl ServerConfig {
    /// Absolute path of the binary to launch.
    pub fn binary_path(&self) -> Utf8PathBuf {
        if self.binary.is_absolute() {
            self.binary.clone()
        } else {
            self.directory.join(&self.binary)
        }
    }
}

// Default value functions
fn default_server_dir() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("BOXCAT_SERVER_DIR") {
        return Utf8PathBuf::from(dir);
    }
    let gopath = std::env::var("GOPATH").ok().or_else(|| {
        dirs::home_dir()
            .map(|home| home.join("go"))
            .and_then(|p| p.to_str().map(str::to_owned))
    });
    match gopath {
        Some(gopath) => Utf8PathBuf::from(gopath).join("src/github.com/horgh/catbox"),
        None => Utf8PathBuf::from("catbox"),
    }
}

fn default_build() -> Option<BuildConfig> {
    Some(BuildConfig {
        program: "go".to_owned(),
        args: vec!["build".to_owned()],
    })
}

fn default_binary() -> Utf8PathBuf {
    Utf8PathBuf::from("catbox")
}

fn default_conf_flag() -> String {
    "-conf".to_owned()
}

fn default_listen_fd_flag() -> String {
    "-listen-fd".to_owned()
}

fn default_server_name() -> String {
    "irc.example.org".to_owned()
}

const fn default_ready_timeout_ms() -> u64 {
    3000
}

const fn default_poll_interval_ms() -> u64 {
    100
}

const fn default_start_attempts() -> u32 {
    3
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_dial_timeout_ms() -> u64 {
    30_000
}

const fn default_keepalive_secs() -> u64 {
    30
}

const fn default_read_timeout_ms() -> u64 {
    100
}

const fn default_write_timeout_ms() -> u64 {
    5000
}

impl HarnessConfig {
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BoxcatError::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: HarnessConfig = toml::from_str(content)
            .map_err(|e| BoxcatError::Config(format!("Failed to parse config: {}", e)))?;

        // An empty build program means the binary is built some other way
        if config
            .build
            .as_ref()
            .is_some_and(|build| build.program.trim().is_empty())
        {
            config.build = None;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::debug!("Using default harness config: {}", e);
            Self::default()
        })
    }

    fn find_config_file() -> Result<PathBuf> {
        let candidates = [
            Some(PathBuf::from("boxcat.toml")),
            dirs::config_dir().map(|p| p.join("boxcat/boxcat.toml")),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        Err(BoxcatError::Config("Config file not found".to_owned()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.launch.start_attempts == 0 {
            return Err(BoxcatError::Config(
                "launch.start_attempts must be at least 1".to_owned(),
            ));
        }
        if self.launch.ready_timeout_ms == 0 || self.launch.poll_interval_ms == 0 {
            return Err(BoxcatError::Config(
                "launch timeouts must be non-zero".to_owned(),
            ));
        }
        if self.client.read_timeout_ms == 0
            || self.client.write_timeout_ms == 0
            || self.client.dial_timeout_ms == 0
        {
            return Err(BoxcatError::Config(
                "client timeouts must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            build: default_build(),
            launch: LaunchConfig::default(),
            client: ClientConfig::default(),
        }
    }
}
