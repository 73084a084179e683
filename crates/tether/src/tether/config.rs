use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::tether::{net, tunnel::client::MIN_HEARTBEAT_DELAY};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps TETHER_CONFIG into the flag already; this covers callers that bypass the CLI.
    if let Some(p) = std::env::var_os("TETHER_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("tether.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["tether.toml", "tether.yaml", "tether.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no tether.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/tether/tether.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "tether", "tether")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("tether.toml"))
    }
}

/// Writes the default template if `path` does not exist. Returns whether it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {}", other),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub auth_token: String,
    pub secret: String,
    pub key: String,
    pub judge_delay: Duration,
    pub heartbeat_delay: Duration,
    pub allow_host_override: bool,
    pub unbound_ttl: Duration,
    pub default_bind_host: String,
    pub close_on_auth_failure: bool,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub auth_token: String,
    pub min_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub heartbeat_delay: Duration,
    pub dial_timeout: Duration,
    pub proxy: Option<ClientProxyConfig>,
}

#[derive(Debug, Clone)]
pub struct ClientProxyConfig {
    pub name: String,
    pub local_addr: String,
    pub remote_port: u16,
    pub remote_host: Option<String>,
    pub secret: String,
    pub key: String,
    pub data_host: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    server: Option<FileServer>,

    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    listen_addr: Option<String>,
    auth_token: Option<String>,
    #[serde(default)]
    secret: String,
    key: Option<String>,
    judge_delay_ms: Option<i64>,
    heartbeat_delay_ms: Option<i64>,
    #[serde(default)]
    allow_host_override: bool,
    unbound_ttl_ms: Option<i64>,
    default_bind_host: Option<String>,
    #[serde(default)]
    close_on_auth_failure: bool,
}

#[derive(Debug, Deserialize)]
struct FileClient {
    server_addr: String,
    auth_token: Option<String>,
    min_reconnect_delay_ms: Option<i64>,
    max_reconnect_delay_ms: Option<i64>,
    heartbeat_delay_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    proxy: Option<FileClientProxy>,
}

#[derive(Debug, Deserialize)]
struct FileClientProxy {
    name: String,
    local_addr: String,
    #[serde(default)]
    remote_port: u16,
    remote_host: Option<String>,
    #[serde(default)]
    secret: String,
    key: Option<String>,
    data_host: Option<String>,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|n| n.max(0) as u64).unwrap_or(default))
}

fn trimmed(v: Option<&String>) -> String {
    v.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn non_empty(v: Option<&String>, default: &str) -> String {
    match v.map(|s| s.trim()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            server: None,
            client: None,
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            cfg.logging.level = non_empty(l.level.as_ref(), &cfg.logging.level);
            cfg.logging.format = non_empty(l.format.as_ref(), &cfg.logging.format);
            cfg.logging.output = non_empty(l.output.as_ref(), &cfg.logging.output);
            cfg.logging.add_source = l.add_source;
        }

        // --- Server ---
        if let Some(s) = &fc.server {
            let judge_delay = millis(s.judge_delay_ms, 300);
            if judge_delay.is_zero() {
                anyhow::bail!("config: server.judge_delay_ms must be positive");
            }
            let unbound_ttl = match s.unbound_ttl_ms {
                Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
                _ => judge_delay * 100,
            };
            if unbound_ttl <= judge_delay {
                anyhow::bail!("config: server.unbound_ttl_ms must exceed judge_delay_ms");
            }
            let secret = s.secret.trim().to_string();
            let key = non_empty(s.key.as_ref(), &secret);
            if key.is_empty() {
                anyhow::bail!("config: server.secret (or server.key) is required");
            }
            cfg.server = Some(ServerConfig {
                listen_addr: non_empty(s.listen_addr.as_ref(), ":7000"),
                auth_token: trimmed(s.auth_token.as_ref()),
                secret,
                key,
                judge_delay,
                heartbeat_delay: millis(s.heartbeat_delay_ms, 10_000).max(MIN_HEARTBEAT_DELAY),
                allow_host_override: s.allow_host_override,
                unbound_ttl,
                default_bind_host: non_empty(s.default_bind_host.as_ref(), "0.0.0.0"),
                close_on_auth_failure: s.close_on_auth_failure,
            });
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            let server_addr = c.server_addr.trim().to_string();
            if server_addr.is_empty() {
                anyhow::bail!("config: client.server_addr is required");
            }

            let proxy = match &c.proxy {
                Some(p) => {
                    let name = p.name.trim().to_string();
                    if name.is_empty() {
                        anyhow::bail!("config: client.proxy.name is required");
                    }
                    let local_addr = p.local_addr.trim().to_string();
                    if local_addr.is_empty() {
                        anyhow::bail!("config: client.proxy.local_addr is required");
                    }
                    let secret = p.secret.trim().to_string();
                    Some(ClientProxyConfig {
                        name,
                        local_addr,
                        remote_port: p.remote_port,
                        remote_host: p
                            .remote_host
                            .as_ref()
                            .map(|h| h.trim().to_string())
                            .filter(|h| !h.is_empty()),
                        key: non_empty(p.key.as_ref(), &secret),
                        secret,
                        data_host: non_empty(p.data_host.as_ref(), net::host_of(&server_addr)),
                    })
                }
                None => None,
            };

            let min_reconnect_delay = millis(c.min_reconnect_delay_ms, 1000);
            cfg.client = Some(ClientConfig {
                auth_token: trimmed(c.auth_token.as_ref()),
                min_reconnect_delay,
                max_reconnect_delay: millis(c.max_reconnect_delay_ms, 60_000)
                    .max(min_reconnect_delay),
                heartbeat_delay: millis(c.heartbeat_delay_ms, 10_000).max(MIN_HEARTBEAT_DELAY),
                dial_timeout: millis(c.dial_timeout_ms, 5000),
                proxy,
                server_addr,
            });
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Tether configuration (auto-generated)
#
# This file was created because Tether could not find a configuration file at the
# resolved config path.
#
# The default runs a tunnel server only. Clients authenticate with auth_token and
# provision public ports with the shared secret. Add a [client] section to run the
# client side in this process as well.

admin_addr = ":8080"

[server]
listen_addr = ":7000"
auth_token = ""
secret = "change-me"
judge_delay_ms = 300
heartbeat_delay_ms = 10000
allow_host_override = false

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

# [client]
# server_addr = "tunnel.example.com:7000"
# auth_token = ""
# min_reconnect_delay_ms = 1000
# max_reconnect_delay_ms = 60000
#
# [client.proxy]
# name = "web"
# local_addr = "127.0.0.1:8080"
# remote_port = 9000
# secret = "change-me"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Tether configuration (auto-generated)
#
# This file was created because Tether could not find a configuration file at the
# resolved config path.
#
# The default runs a tunnel server only. Clients authenticate with auth_token and
# provision public ports with the shared secret. Add a client section to run the
# client side in this process as well.

admin_addr: ":8080"

server:
  listen_addr: ":7000"
  auth_token: ""
  secret: "change-me"
  judge_delay_ms: 300
  heartbeat_delay_ms: 10000
  allow_host_override: false

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

# client:
#   server_addr: "tunnel.example.com:7000"
#   proxy:
#     name: "web"
#     local_addr: "127.0.0.1:8080"
#     remote_port: 9000
#     secret: "change-me"
"#;
