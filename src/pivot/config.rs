use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
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

    // clap already maps PIVOT_CONFIG into the flag value when unset; keep the
    // precedence visible by reporting it as "env" when present.
    if let Some(p) = std::env::var_os("PIVOT_CONFIG") {
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

    let meta = fs::metadata(&p);
    if let Ok(m) = meta {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("pivot.toml"));
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
    let candidates = ["pivot.toml", "pivot.yaml", "pivot.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no pivot.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/pivot/pivot.toml"));
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        let proj =
            ProjectDirs::from("com", "pivot", "pivot").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("pivot.toml"))
    }
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!("config: {} exists but is not a regular file", path.display());
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
        .create_new(true)
        .write(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
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

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
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
    pub control_addr: String,
    pub swap_addr: String,
    pub auth_token: String,
    pub swap_timeout: Duration,
    pub grace_period: Duration,
    pub buffer_size: usize,
    pub ping_interval: Duration,
    pub forwards: Vec<ForwardConfig>,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub listen_addr: String,
    pub client_id: String,
    pub local_host: String,
    pub local_port: u16,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub control_addr: String,
    pub swap_addr: String,
    pub id: String,
    pub auth_token: String,
    pub dial_timeout: Duration,
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
#[serde(deny_unknown_fields)]
struct FileServer {
    control_addr: String,
    swap_addr: String,
    auth_token: Option<String>,
    swap_timeout_ms: Option<i64>,
    grace_ms: Option<i64>,
    buffer_size: Option<i64>,
    ping_interval_ms: Option<i64>,
    #[serde(default)]
    forwards: Vec<FileForward>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileForward {
    listen_addr: String,
    client: String,
    local_host: Option<String>,
    local_port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    control_addr: String,
    swap_addr: String,
    id: String,
    auth_token: Option<String>,
    dial_timeout_ms: Option<i64>,
}

fn ms_or(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match &fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.clone().unwrap_or_else(|| "info".into()),
                format: l.format.clone().unwrap_or_else(|| "json".into()),
                output: l.output.clone().unwrap_or_else(|| "stderr".into()),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let server = match fc.server {
            Some(s) => {
                let control_addr = s.control_addr.trim().to_string();
                let swap_addr = s.swap_addr.trim().to_string();
                if control_addr.is_empty() {
                    anyhow::bail!("config: server.control_addr is required");
                }
                if swap_addr.is_empty() {
                    anyhow::bail!("config: server.swap_addr is required");
                }

                let mut forwards = Vec::with_capacity(s.forwards.len());
                for (i, f) in s.forwards.iter().enumerate() {
                    let listen_addr = f.listen_addr.trim().to_string();
                    let client_id = f.client.trim().to_string();
                    if listen_addr.is_empty() {
                        anyhow::bail!("config: server.forwards[{i}] missing listen_addr");
                    }
                    if client_id.is_empty() {
                        anyhow::bail!("config: server.forwards[{i}] missing client");
                    }
                    if f.local_port == 0 {
                        anyhow::bail!("config: server.forwards[{i}] missing local_port");
                    }
                    let local_host = f
                        .local_host
                        .as_deref()
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .unwrap_or("127.0.0.1")
                        .to_string();
                    forwards.push(ForwardConfig {
                        listen_addr,
                        client_id,
                        local_host,
                        local_port: f.local_port,
                    });
                }

                let buffer_size = match s.buffer_size {
                    Some(n) if n > 0 => n as usize,
                    _ => 32 * 1024,
                };

                Some(ServerConfig {
                    control_addr,
                    swap_addr,
                    auth_token: s.auth_token.clone().unwrap_or_default().trim().to_string(),
                    swap_timeout: ms_or(s.swap_timeout_ms, 10_000),
                    grace_period: ms_or(s.grace_ms, 2_000),
                    buffer_size,
                    ping_interval: ms_or(s.ping_interval_ms, 30_000),
                    forwards,
                })
            }
            None => None,
        };

        let client = match fc.client {
            Some(c) => {
                let control_addr = c.control_addr.trim().to_string();
                let swap_addr = c.swap_addr.trim().to_string();
                let id = c.id.trim().to_string();
                if control_addr.is_empty() {
                    anyhow::bail!("config: client.control_addr is required");
                }
                if swap_addr.is_empty() {
                    anyhow::bail!("config: client.swap_addr is required");
                }
                if id.is_empty() {
                    anyhow::bail!("config: client.id is required");
                }
                Some(ClientConfig {
                    control_addr,
                    swap_addr,
                    id,
                    auth_token: c.auth_token.clone().unwrap_or_default().trim().to_string(),
                    dial_timeout: ms_or(c.dial_timeout_ms, 5_000),
                })
            }
            None => None,
        };

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            server,
            client,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# pivot configuration
# Run a relay, a client, or both. Delete the section you don't need.

# admin_addr = ":9690"

[logging]
level = "info"     # trace | debug | info | warn | error
format = "json"    # json | text
output = "stderr"  # stderr | stdout | discard | <file path>

[server]
control_addr = ":7000"
swap_addr = ":7001"
# auth_token = ""
# swap_timeout_ms = 10000
# grace_ms = 2000
# buffer_size = 32768
# ping_interval_ms = 30000

# [[server.forwards]]
# listen_addr = ":8080"
# client = "laptop"
# local_host = "127.0.0.1"
# local_port = 3000

# [client]
# control_addr = "relay.example.com:7000"
# swap_addr = "relay.example.com:7001"
# id = "laptop"
# auth_token = ""
# dial_timeout_ms = 5000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# pivot configuration
# Run a relay, a client, or both. Delete the section you don't need.

# admin_addr: ":9690"

logging:
  level: info      # trace | debug | info | warn | error
  format: json     # json | text
  output: stderr   # stderr | stdout | discard | <file path>

server:
  control_addr: ":7000"
  swap_addr: ":7001"
  # auth_token: ""
  # swap_timeout_ms: 10000
  # grace_ms: 2000
  # buffer_size: 32768
  # ping_interval_ms: 30000
  forwards: []
  # - listen_addr: ":8080"
  #   client: laptop
  #   local_host: 127.0.0.1
  #   local_port: 3000

# client:
#   control_addr: relay.example.com:7000
#   swap_addr: relay.example.com:7001
#   id: laptop
#   auth_token: ""
#   dial_timeout_ms: 5000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_toml_roundtrip() {
        let fc: FileConfig = toml::from_str(
            r#"
admin_addr = ":9690"

[logging]
level = "debug"
format = "text"
output = "stdout"

[server]
control_addr = ":7000"
swap_addr = ":7001"
auth_token = " tok "
swap_timeout_ms = 1500
grace_ms = 300

[[server.forwards]]
listen_addr = ":8080"
client = "laptop"
local_port = 3000

[client]
control_addr = "relay:7000"
swap_addr = "relay:7001"
id = "laptop"
"#,
        )
        .unwrap();

        let cfg = Config::from_file_config(fc).unwrap();
        assert_eq!(cfg.admin_addr, ":9690");
        assert_eq!(cfg.logging.level, "debug");

        let srv = cfg.server.unwrap();
        assert_eq!(srv.control_addr, ":7000");
        assert_eq!(srv.auth_token, "tok");
        assert_eq!(srv.swap_timeout, Duration::from_millis(1500));
        assert_eq!(srv.grace_period, Duration::from_millis(300));
        assert_eq!(srv.buffer_size, 32 * 1024);
        assert_eq!(srv.ping_interval, Duration::from_millis(30_000));
        assert_eq!(srv.forwards.len(), 1);
        assert_eq!(srv.forwards[0].local_host, "127.0.0.1");
        assert_eq!(srv.forwards[0].local_port, 3000);

        let cli = cfg.client.unwrap();
        assert_eq!(cli.id, "laptop");
        assert_eq!(cli.dial_timeout, Duration::from_millis(5_000));
    }

    #[test]
    fn forward_validation_errors_name_the_entry() {
        let fc: FileConfig = toml::from_str(
            r#"
[server]
control_addr = ":7000"
swap_addr = ":7001"

[[server.forwards]]
listen_addr = ":8080"
client = ""
local_port = 3000
"#,
        )
        .unwrap();

        let err = Config::from_file_config(fc).unwrap_err();
        assert!(err.to_string().contains("forwards[0]"), "{err}");
    }

    #[test]
    fn templates_parse() {
        let fc: FileConfig = toml::from_str(DEFAULT_CONFIG_TEMPLATE_TOML).unwrap();
        let cfg = Config::from_file_config(fc).unwrap();
        assert!(cfg.server.is_some());
        assert!(cfg.client.is_none());

        let fc: FileConfig = serde_yaml::from_str(DEFAULT_CONFIG_TEMPLATE_YAML).unwrap();
        let cfg = Config::from_file_config(fc).unwrap();
        assert!(cfg.server.is_some());
    }

    #[test]
    fn yaml_parses_too() {
        let fc: FileConfig = serde_yaml::from_str(
            r#"
server:
  control_addr: ":7000"
  swap_addr: ":7001"
  forwards:
    - listen_addr: ":8080"
      client: laptop
      local_host: 10.0.0.5
      local_port: 8000
"#,
        )
        .unwrap();

        let cfg = Config::from_file_config(fc).unwrap();
        let srv = cfg.server.unwrap();
        assert_eq!(srv.forwards[0].local_host, "10.0.0.5");
    }
}
