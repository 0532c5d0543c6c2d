use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{DazeError, Result};

/// Which half of the system this process runs. Decided by the CLI
/// subcommand, never by the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Tunnel wire protocol between the local agent and the relay.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ashe,
    Baboon,
    Czar,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ashe" => Ok(Protocol::Ashe),
            "baboon" => Ok(Protocol::Baboon),
            "czar" => Ok(Protocol::Czar),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

/// How the local agent routes destinations.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Rules file, then CIDR file, then remote by default.
    #[default]
    Rule,
    /// Reserved ranges stay local, everything else goes remote.
    Remote,
    /// Everything connects directly.
    Locale,
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rule" => Ok(RoutingMode::Rule),
            "remote" => Ok(RoutingMode::Remote),
            "locale" => Ok(RoutingMode::Locale),
            other => Err(format!("unknown routing mode {other:?}")),
        }
    }
}

/// Default listen addresses per role.
pub const SERVER_LISTEN: &str = "0.0.0.0:1081";
pub const CLIENT_LISTEN: &str = "127.0.0.1:1080";

fn default_masker() -> String {
    "http://example.com".to_string()
}

/// Values read from a configuration file. Every field is optional so
/// explicit flags can fill or override them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub server: Option<String>,
    pub password: Option<String>,
    pub protocol: Option<Protocol>,
    pub mode: Option<RoutingMode>,
    pub rule_file: Option<String>,
    pub cidr_file: Option<String>,
    pub masker: Option<String>,
    pub android: Option<bool>,
}

/// Flag-level settings merged over a configuration file; a set flag
/// always wins.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub server: Option<String>,
    pub password: Option<String>,
    pub protocol: Option<Protocol>,
    pub mode: Option<RoutingMode>,
    pub rule_file: Option<String>,
    pub cidr_file: Option<String>,
    pub masker: Option<String>,
    pub android: bool,
}

/// The resolved, validated configuration the runtime consumes.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    /// Address the local agent or the relay listens on.
    pub listen: String,
    /// Relay address the client tunnels to. Required for the client.
    pub server: Option<String>,
    /// Pre-shared password; both sides derive the 32-byte key from it.
    pub password: String,
    pub protocol: Protocol,
    pub mode: RoutingMode,
    /// Rule file (`L`/`R`/`B` glob directives), client side.
    pub rule_file: Option<String>,
    /// CIDR file with the same grammar, client side.
    pub cidr_file: Option<String>,
    /// Site unauthorized masquerade requests are reverse-proxied to.
    pub masker: String,
    /// Use the public resolver instead of the system one.
    pub android: bool,
}

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<FileConfig> {
    let txt = fs::read_to_string(p)
        .map_err(|e| DazeError::Config(format!("Failed to read config file: {e}")))?;
    toml::from_str(&txt).map_err(|e| DazeError::Config(format!("Failed to parse config: {e}")))
}

impl FileConfig {
    /// Resolve the final configuration: explicit flags win over file
    /// values and role-appropriate defaults fill the rest.
    pub fn resolve(self, role: Role, flags: Overrides) -> Result<Config> {
        let listen = flags.listen.or(self.listen).unwrap_or_else(|| {
            match role {
                Role::Server => SERVER_LISTEN,
                Role::Client => CLIENT_LISTEN,
            }
            .to_string()
        });
        let cfg = Config {
            role,
            listen,
            server: flags.server.or(self.server),
            password: flags.password.or(self.password).unwrap_or_default(),
            protocol: flags.protocol.or(self.protocol).unwrap_or_default(),
            mode: flags.mode.or(self.mode).unwrap_or_default(),
            rule_file: flags.rule_file.or(self.rule_file),
            cidr_file: flags.cidr_file.or(self.cidr_file),
            masker: flags.masker.or(self.masker).unwrap_or_else(default_masker),
            android: flags.android || self.android.unwrap_or(false),
        };

        validate_config(&cfg)?;

        Ok(cfg)
    }
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.listen.is_empty() {
        return Err(DazeError::Config("listen address is empty".into()));
    }
    if cfg.password.is_empty() {
        return Err(DazeError::Config("password is empty".into()));
    }
    if cfg.role == Role::Client && cfg.server.as_deref().unwrap_or("").is_empty() {
        return Err(DazeError::Config("client needs a server address".into()));
    }
    for file in [&cfg.rule_file, &cfg.cidr_file].into_iter().flatten() {
        if !Path::new(file).exists() {
            return Err(DazeError::Config(format!("file not found: {file}")));
        }
    }
    Ok(())
}
