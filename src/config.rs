use std::io::Read;
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 上游解析器端口固定为 53
pub const DNS_PORT: u16 = 53;

/// 运行期调优参数，由命令行给出，随启动交接传入工作进程。
/// Runtime tunables; they travel from the monitor to the worker inside the
/// startup handoff rather than being re-parsed from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// 缓存最大条目数，超出后从最旧条目开始淘汰。
    pub max_cache_entries: usize,
    /// 最大并发请求数，超出后淘汰最旧的在途请求。
    pub max_requests: usize,
    /// 请求绝对超时（秒）。
    pub request_timeout_secs: u64,
    /// 缓存 TTL 上限（秒）。
    pub ttl_ceiling_secs: u64,
    /// 统计日志间隔（秒）。
    pub stats_interval_secs: u64,
    /// TCP accept 失败后的退避窗口（毫秒）。
    pub accept_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_cache_entries: 10_000,
            max_requests: 512,
            request_timeout_secs: 30,
            ttl_ceiling_secs: 300,
            stats_interval_secs: 60,
            accept_backoff_ms: 1000,
        }
    }
}

/// Pick the upstream resolver out of a resolv.conf style file: the first
/// `nameserver` directive naming a non-loopback IPv4 or IPv6 address wins.
/// Loopback entries would point the proxy at itself through the port-53
/// redirection and are skipped.
pub fn parse_resolver_conf(text: &str) -> Result<SocketAddr> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut parts = line.split_whitespace();
        if parts.next() != Some("nameserver") {
            continue;
        }
        let Some(addr) = parts.next() else {
            continue;
        };
        let Ok(ip) = addr.parse::<IpAddr>() else {
            debug!(target = "config", addr, "unparseable nameserver, skipped");
            continue;
        };
        if ip.is_loopback() {
            debug!(target = "config", addr, "loopback nameserver, skipped");
            continue;
        }
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }
    anyhow::bail!("no usable nameserver directive")
}

/// Read the upstream from an already-open descriptor. The worker has no
/// filesystem access of its own, so this is the only way config reaches it.
pub fn read_upstream(file: &mut std::fs::File) -> Result<SocketAddr> {
    let mut text = String::new();
    file.read_to_string(&mut text)
        .context("read resolver config")?;
    parse_resolver_conf(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_usable_nameserver_wins() {
        let text = "# comment\nsearch example.net\nnameserver 8.8.8.8\nnameserver 9.9.9.9\n";
        let addr = parse_resolver_conf(text).expect("parse");
        assert_eq!(addr, "8.8.8.8:53".parse().unwrap());
    }

    #[test]
    fn loopback_nameservers_are_skipped() {
        let text = "nameserver 127.0.0.1\nnameserver ::1\nnameserver 1.1.1.1\n";
        let addr = parse_resolver_conf(text).expect("parse");
        assert_eq!(addr, "1.1.1.1:53".parse().unwrap());
    }

    #[test]
    fn ipv6_nameserver_is_accepted() {
        let text = "nameserver 2001:db8::53\n";
        let addr = parse_resolver_conf(text).expect("parse");
        assert_eq!(addr, "[2001:db8::53]:53".parse().unwrap());
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let text = "nameserver\nnameserver not-an-ip\noptions edns0\nnameserver 9.9.9.9 extra\n";
        let addr = parse_resolver_conf(text).expect("parse");
        assert_eq!(addr, "9.9.9.9:53".parse().unwrap());
    }

    #[test]
    fn missing_nameserver_is_an_error() {
        assert!(parse_resolver_conf("search example.net\n").is_err());
        assert!(parse_resolver_conf("").is_err());
        assert!(parse_resolver_conf("nameserver 127.0.0.1\n").is_err());
    }
}
