use crate::resp::RespLimits;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_AOF_PATH: &str = "appendonly.aof";
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

pub const DEFAULT_MAX_RESP_ARGS: usize = 1024 * 1024;
pub const DEFAULT_MAX_RESP_BULK_LEN: usize = 512 * 1024 * 1024; // 512 MiB
pub const DEFAULT_MAX_RESP_LINE_LEN: usize = 64 * 1024;

pub struct Config {
    pub port: u16,
    pub host: String,
    pub metrics_port: u16,
    pub metrics_host: String,
    /// Path of the append-only log. `None` disables durability entirely.
    pub aof_path: Option<String>,
    /// The single durability knob: `false` (default) drops frames when the
    /// log queue is full, `true` makes handlers wait for queue space.
    pub aof_blocking: bool,
    pub max_connections: usize,
    pub max_resp_args: usize,
    pub max_resp_bulk_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: "0.0.0.0".to_string(),
            metrics_port: 9090,
            metrics_host: "0.0.0.0".to_string(),
            aof_path: Some(DEFAULT_AOF_PATH.to_string()),
            aof_blocking: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_resp_args: DEFAULT_MAX_RESP_ARGS,
            max_resp_bulk_len: DEFAULT_MAX_RESP_BULK_LEN,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("RESPD_PORT").ok().as_deref(),
            std::env::var("RESPD_HOST").ok().as_deref(),
            std::env::var("RESPD_METRICS_PORT").ok().as_deref(),
            std::env::var("RESPD_METRICS_HOST").ok().as_deref(),
            std::env::var("RESPD_AOF_PATH").ok().as_deref(),
            std::env::var("RESPD_AOF_BLOCKING").ok().as_deref(),
            std::env::var("RESPD_MAX_CONNECTIONS").ok().as_deref(),
            std::env::var("RESPD_MAX_ARGS").ok().as_deref(),
            std::env::var("RESPD_MAX_BULK_LEN").ok().as_deref(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_vars(
        port: Option<&str>,
        host: Option<&str>,
        metrics_port: Option<&str>,
        metrics_host: Option<&str>,
        aof_path: Option<&str>,
        aof_blocking: Option<&str>,
        max_connections: Option<&str>,
        max_resp_args: Option<&str>,
        max_resp_bulk_len: Option<&str>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            port: port.and_then(|s| s.parse().ok()).unwrap_or(defaults.port),
            host: host.map(|s| s.to_string()).unwrap_or(defaults.host),
            metrics_port: metrics_port
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.metrics_port),
            metrics_host: metrics_host
                .map(|s| s.to_string())
                .unwrap_or(defaults.metrics_host),
            // An explicitly empty path switches the log off.
            aof_path: match aof_path {
                None => defaults.aof_path,
                Some("") => None,
                Some(path) => Some(path.to_string()),
            },
            aof_blocking: aof_blocking.map(parse_bool).unwrap_or(defaults.aof_blocking),
            max_connections: max_connections
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_connections),
            max_resp_args: max_resp_args
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_resp_args),
            max_resp_bulk_len: max_resp_bulk_len
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_resp_bulk_len),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_listen_addr(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }

    pub(crate) fn resp_limits(&self) -> RespLimits {
        RespLimits {
            max_array_len: self.max_resp_args,
            max_bulk_len: self.max_resp_bulk_len,
            max_line_len: DEFAULT_MAX_RESP_LINE_LEN,
        }
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_vars(vars: [Option<&str>; 9]) -> Config {
        let [port, host, mport, mhost, aof, blocking, conns, args, bulk] = vars;
        Config::from_vars(port, host, mport, mhost, aof, blocking, conns, args, bulk)
    }

    #[test]
    fn defaults_are_correct() {
        let c = Config::default();
        assert_eq!(c.port, 6379);
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.aof_path.as_deref(), Some("appendonly.aof"));
        assert!(!c.aof_blocking);
        assert_eq!(c.max_connections, 1024);
    }

    #[test]
    fn all_none_yields_defaults() {
        let c = from_vars([None; 9]);
        assert_eq!(c.port, Config::default().port);
        assert_eq!(c.aof_path, Config::default().aof_path);
        assert_eq!(c.max_resp_args, DEFAULT_MAX_RESP_ARGS);
    }

    #[test]
    fn explicit_values_are_used() {
        let c = from_vars([
            Some("7000"),
            Some("127.0.0.1"),
            Some("9999"),
            Some("127.0.0.1"),
            Some("/tmp/my.aof"),
            Some("true"),
            Some("64"),
            Some("100"),
            Some("1000"),
        ]);
        assert_eq!(c.port, 7000);
        assert_eq!(c.listen_addr(), "127.0.0.1:7000");
        assert_eq!(c.metrics_listen_addr(), "127.0.0.1:9999");
        assert_eq!(c.aof_path.as_deref(), Some("/tmp/my.aof"));
        assert!(c.aof_blocking);
        assert_eq!(c.max_connections, 64);
        assert_eq!(c.resp_limits().max_array_len, 100);
        assert_eq!(c.resp_limits().max_bulk_len, 1000);
    }

    #[test]
    fn empty_aof_path_disables_the_log() {
        let c = from_vars([None, None, None, None, Some(""), None, None, None, None]);
        assert!(c.aof_path.is_none());
    }

    #[test]
    fn unparseable_port_falls_back_to_default() {
        let c = from_vars([Some("not-a-port"), None, None, None, None, None, None, None, None]);
        assert_eq!(c.port, DEFAULT_PORT);
    }

    #[test]
    fn zero_limits_fall_back_to_defaults() {
        let c = from_vars([None, None, None, None, None, None, Some("0"), Some("0"), Some("0")]);
        assert_eq!(c.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(c.max_resp_args, DEFAULT_MAX_RESP_ARGS);
        assert_eq!(c.max_resp_bulk_len, DEFAULT_MAX_RESP_BULK_LEN);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }
}
