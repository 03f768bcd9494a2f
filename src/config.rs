use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::LevelFilter;

/// Environment-sourced runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub dev_mode: bool,
    pub dev_uuid: Option<String>,
    pub rw_api_url: Option<String>,
    pub rw_api_key: Option<String>,
    pub uuid_api_url: Option<String>,
    pub uuid_cache_ttl: Duration,
    pub uuid_cache_file: Option<PathBuf>,
    pub proxy_ip: Option<String>,
    pub dns_server: String,
    pub mux_enabled: bool,
    pub max_subrequests: u32,
    pub stats_report_url: Option<String>,
    pub stats_report_token: Option<String>,
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            api_key: None,
            dev_mode: false,
            dev_uuid: None,
            rw_api_url: None,
            rw_api_key: None,
            uuid_api_url: None,
            uuid_cache_ttl: Duration::from_secs(300),
            uuid_cache_file: None,
            proxy_ip: None,
            dns_server: "https://1.1.1.1/dns-query".to_string(),
            mux_enabled: true,
            max_subrequests: 48,
            stats_report_url: None,
            stats_report_token: None,
            log_level: LevelFilter::Info,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> std::io::Result<Self> {
        let mut config = Config::default();

        if let Some(addr) = env_string("LISTEN_ADDR") {
            config.listen_addr = addr.parse().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid LISTEN_ADDR {}: {}", addr, e),
                )
            })?;
        }

        config.api_key = env_string("API_KEY");
        config.dev_mode = matches!(env_string("DEV_MODE").as_deref(), Some("true"));
        config.dev_uuid = env_string("UUID");
        config.rw_api_url = env_string("RW_API_URL").map(|u| u.trim_end_matches('/').to_string());
        config.rw_api_key = env_string("RW_API_KEY");
        config.uuid_api_url = env_string("UUID_API_URL");

        if let Some(ttl) = env_string("UUID_CACHE_TTL") {
            let secs = ttl.parse::<u64>().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid UUID_CACHE_TTL {}: {}", ttl, e),
                )
            })?;
            config.uuid_cache_ttl = Duration::from_secs(secs);
        }

        config.uuid_cache_file = env_string("UUID_CACHE_FILE").map(PathBuf::from);
        config.proxy_ip = env_string("PROXY_IP");

        if let Some(dns) = env_string("DNS_SERVER") {
            config.dns_server = dns;
        }

        if let Some(v) = env_string("MUX_ENABLED") {
            config.mux_enabled = v != "false";
        }

        if let Some(max) = env_string("MAX_SUBREQUESTS") {
            config.max_subrequests = max.parse::<u32>().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid MAX_SUBREQUESTS {}: {}", max, e),
                )
            })?;
        }

        config.stats_report_url = env_string("STATS_REPORT_URL");
        config.stats_report_token = env_string("STATS_REPORT_TOKEN");

        if let Some(level) = env_string("LOG_LEVEL") {
            config.log_level = parse_log_level(&level)?;
        }

        Ok(config)
    }
}

fn parse_log_level(s: &str) -> std::io::Result<LevelFilter> {
    match s.to_ascii_uppercase().as_str() {
        "OFF" => Ok(LevelFilter::Off),
        "ERROR" => Ok(LevelFilter::Error),
        "WARN" => Ok(LevelFilter::Warn),
        "INFO" => Ok(LevelFilter::Info),
        "DEBUG" => Ok(LevelFilter::Debug),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid LOG_LEVEL: {}", s),
        )),
    }
}
