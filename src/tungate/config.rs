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

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps TUNGATE_CONFIG into the flag value when unset, but keep the
    // precedence explicit by treating it as "env" when present.
    if let Some(p) = std::env::var_os("TUNGATE_CONFIG") {
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
            return Ok(p.join("tungate.toml"));
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
    let candidates = ["tungate.toml", "tungate.yaml", "tungate.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no tungate.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("com", "tungate", "tungate")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("tungate.toml"))
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

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
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

    Config::from_file_config(&fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub tun: TunConfig,
    pub timeouts: Timeouts,
    pub buffer_size: usize,
    pub flow_backlog_cap: usize,
    pub health_check: HealthCheckConfig,
    pub public_ip_probe: PublicIpProbeConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunPrefix {
    None,
    Four,
}

#[derive(Debug, Clone)]
pub struct TunConfig {
    pub name: String,
    pub address: String,
    pub netmask: String,
    pub mtu: u16,
    pub prefix: TunPrefix,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub proxy_handshake_timeout: Duration,
    pub proxy_dial_timeout: Duration,
    pub flow_idle_timeout: Duration,
    pub dns_query_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub dead_threshold: Duration,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct PublicIpProbeConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    admin_addr: Option<String>,
    logging: Option<FileLogging>,
    tun: Option<FileTun>,
    timeouts: Option<FileTimeouts>,
    #[serde(default)]
    buffer_size: Option<i64>,
    #[serde(default)]
    flow_backlog_cap: Option<i64>,
    health_check: Option<FileHealthCheck>,
    public_ip_probe: Option<FilePublicIpProbe>,
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
struct FileTun {
    name: Option<String>,
    address: Option<String>,
    netmask: Option<String>,
    mtu: Option<u16>,
    /// "none" | "four" — whether a 4-byte platform prefix precedes every frame.
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    proxy_handshake_timeout_ms: Option<u64>,
    proxy_dial_timeout_ms: Option<u64>,
    flow_idle_timeout_ms: Option<u64>,
    dns_query_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileHealthCheck {
    interval_ms: Option<u64>,
    dead_threshold_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilePublicIpProbe {
    #[serde(default)]
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

impl Config {
    fn from_file_config(fc: &FileConfig) -> anyhow::Result<Config> {
        let logging = &fc.logging;
        let tun = &fc.tun;
        let timeouts = &fc.timeouts;
        let health_check = &fc.health_check;
        let probe = &fc.public_ip_probe;

        let prefix = match tun.as_ref().and_then(|t| t.prefix.as_deref()) {
            None | Some("") => TunPrefix::None,
            Some("none") => TunPrefix::None,
            Some("four") => TunPrefix::Four,
            Some(other) => anyhow::bail!("config: tun.prefix must be \"none\" or \"four\", got {other:?}"),
        };

        let cfg = Config {
            admin_addr: fc
                .admin_addr
                .clone()
                .unwrap_or_else(|| "127.0.0.1:7870".to_string())
                .trim()
                .to_string(),
            logging: LoggingConfig {
                level: logging
                    .as_ref()
                    .and_then(|l| l.level.clone())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "info".into()),
                format: logging
                    .as_ref()
                    .and_then(|l| l.format.clone())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "text".into()),
                output: logging
                    .as_ref()
                    .and_then(|l| l.output.clone())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "stderr".into()),
                add_source: logging.as_ref().map(|l| l.add_source).unwrap_or(false),
            },
            tun: TunConfig {
                name: tun
                    .as_ref()
                    .and_then(|t| t.name.clone())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "tun0".into()),
                address: tun
                    .as_ref()
                    .and_then(|t| t.address.clone())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "10.0.0.2".into()),
                netmask: tun
                    .as_ref()
                    .and_then(|t| t.netmask.clone())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "255.255.255.0".into()),
                mtu: tun.as_ref().and_then(|t| t.mtu).unwrap_or(1500),
                prefix,
            },
            timeouts: Timeouts {
                proxy_handshake_timeout: Duration::from_millis(
                    timeouts
                        .as_ref()
                        .and_then(|t| t.proxy_handshake_timeout_ms)
                        .unwrap_or(10_000),
                ),
                proxy_dial_timeout: Duration::from_millis(
                    timeouts
                        .as_ref()
                        .and_then(|t| t.proxy_dial_timeout_ms)
                        .unwrap_or(10_000),
                ),
                flow_idle_timeout: Duration::from_millis(
                    timeouts
                        .as_ref()
                        .and_then(|t| t.flow_idle_timeout_ms)
                        .unwrap_or(600_000),
                ),
                dns_query_timeout: Duration::from_millis(
                    timeouts
                        .as_ref()
                        .and_then(|t| t.dns_query_timeout_ms)
                        .unwrap_or(3_000),
                ),
            },
            buffer_size: fc.buffer_size.filter(|v| *v > 0).unwrap_or(32 * 1024) as usize,
            flow_backlog_cap: fc
                .flow_backlog_cap
                .filter(|v| *v > 0)
                .unwrap_or(64 * 1024) as usize,
            health_check: HealthCheckConfig {
                interval: Duration::from_millis(
                    health_check.as_ref().and_then(|h| h.interval_ms).unwrap_or(10_000),
                ),
                dead_threshold: Duration::from_millis(
                    health_check
                        .as_ref()
                        .and_then(|h| h.dead_threshold_ms)
                        .unwrap_or(600_000),
                ),
                reconnect_delay: Duration::from_millis(
                    health_check
                        .as_ref()
                        .and_then(|h| h.reconnect_delay_ms)
                        .unwrap_or(2_000),
                ),
            },
            public_ip_probe: PublicIpProbeConfig {
                enabled: probe.as_ref().and_then(|p| p.enabled).unwrap_or(true),
                host: probe
                    .as_ref()
                    .and_then(|p| p.host.clone())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "api.ipify.org".into()),
                port: probe.as_ref().and_then(|p| p.port).unwrap_or(443),
                path: probe
                    .as_ref()
                    .and_then(|p| p.path.clone())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "/?format=json".into()),
                interval: Duration::from_millis(
                    probe.as_ref().and_then(|p| p.interval_ms).unwrap_or(60_000),
                ),
                timeout: Duration::from_millis(
                    probe.as_ref().and_then(|p| p.timeout_ms).unwrap_or(10_000),
                ),
            },
        };

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# tungate configuration (auto-generated)
#
# This file was created because tungate could not find a configuration file at the
# resolved config path. It is runnable as-is; profiles (host/port/credentials) live
# in a separate profiles.json under the workdir, managed through the admin API.

admin_addr = "127.0.0.1:7870"

[logging]
level = "info"
format = "text"
output = "stderr"
add_source = false

[tun]
name = "tun0"
address = "10.0.0.2"
netmask = "255.255.255.0"
mtu = 1500
prefix = "none" # "none" | "four"

[timeouts]
proxy_handshake_timeout_ms = 10000
proxy_dial_timeout_ms = 10000
flow_idle_timeout_ms = 600000
dns_query_timeout_ms = 3000

[health_check]
interval_ms = 10000
dead_threshold_ms = 600000
reconnect_delay_ms = 2000

[public_ip_probe]
enabled = true
host = "api.ipify.org"
port = 443
path = "/?format=json"
interval_ms = 60000
timeout_ms = 10000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# tungate configuration (auto-generated)
#
# This file was created because tungate could not find a configuration file at the
# resolved config path. It is runnable as-is; profiles (host/port/credentials) live
# in a separate profiles.json under the workdir, managed through the admin API.

admin_addr: "127.0.0.1:7870"

logging:
  level: "info"
  format: "text"
  output: "stderr"
  add_source: false

tun:
  name: "tun0"
  address: "10.0.0.2"
  netmask: "255.255.255.0"
  mtu: 1500
  prefix: "none" # "none" | "four"

timeouts:
  proxy_handshake_timeout_ms: 10000
  proxy_dial_timeout_ms: 10000
  flow_idle_timeout_ms: 600000
  dns_query_timeout_ms: 3000

health_check:
  interval_ms: 10000
  dead_threshold_ms: 600000
  reconnect_delay_ms: 2000

public_ip_probe:
  enabled: true
  host: "api.ipify.org"
  port: 443
  path: "/?format=json"
  interval_ms: 60000
  timeout_ms: 10000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_file() {
        let fc = FileConfig::default();
        let cfg = Config::from_file_config(&fc).expect("defaults");
        assert_eq!(cfg.admin_addr, "127.0.0.1:7870");
        assert_eq!(cfg.tun.mtu, 1500);
        assert_eq!(cfg.tun.prefix, TunPrefix::None);
        assert_eq!(cfg.timeouts.flow_idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn toml_template_round_trips() {
        let fc: FileConfig = toml::from_str(DEFAULT_CONFIG_TEMPLATE_TOML).expect("parse toml");
        let cfg = Config::from_file_config(&fc).expect("build");
        assert_eq!(cfg.tun.name, "tun0");
        assert!(cfg.public_ip_probe.enabled);
    }

    #[test]
    fn yaml_template_round_trips() {
        let fc: FileConfig = serde_yaml::from_str(DEFAULT_CONFIG_TEMPLATE_YAML).expect("parse yaml");
        let cfg = Config::from_file_config(&fc).expect("build");
        assert_eq!(cfg.tun.address, "10.0.0.2");
    }

    #[test]
    fn bad_prefix_value_is_rejected() {
        let mut fc = FileConfig::default();
        fc.tun = Some(FileTun {
            name: None,
            address: None,
            netmask: None,
            mtu: None,
            prefix: Some("weird".into()),
        });
        assert!(Config::from_file_config(&fc).is_err());
    }
}
