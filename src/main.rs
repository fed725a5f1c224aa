mod cache;
mod codec;
mod config;
mod engine;
mod handoff;
mod monitor;
mod watcher;
mod worker;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Settings;

#[derive(Parser, Debug)]
#[command(author, version, about = "VeilDNS privilege-separated caching DNS forwarder", long_about = None)]
pub struct Args {
    /// 解析器配置文件路径（resolv.conf 格式）
    #[arg(short = 'c', long = "config", default_value = "/etc/resolv.conf")]
    pub config: PathBuf,
    /// IPv4 监听地址
    #[arg(long = "listen", default_value = "127.0.0.1:53")]
    pub listen4: String,
    /// IPv6 监听地址
    #[arg(long = "listen6", default_value = "[::1]:53")]
    pub listen6: String,
    /// 工作进程降权用户
    #[arg(long = "user", default_value = "nobody")]
    pub user: String,
    /// 工作进程 chroot 目录
    #[arg(long = "chroot", default_value = "/var/empty")]
    pub chroot_dir: String,
    /// 缓存最大条目数
    #[arg(long = "max-cache", default_value_t = 10_000)]
    pub max_cache: usize,
    /// 最大并发请求数
    #[arg(long = "max-requests", default_value_t = 512)]
    pub max_requests: usize,
    /// 请求超时（秒）
    #[arg(long = "timeout", default_value_t = 30)]
    pub timeout_secs: u64,
    /// 缓存 TTL 上限（秒）
    #[arg(long = "max-ttl", default_value_t = 300)]
    pub max_ttl_secs: u64,
    /// 统计日志间隔（秒）
    #[arg(long = "stats-interval", default_value_t = 60)]
    pub stats_interval_secs: u64,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    pub debug: bool,
    /// 内部使用：以工作进程身份运行
    #[arg(long = "worker", hide = true, default_value_t = false)]
    pub worker: bool,
    /// 内部使用：监督进程传入的启动交接（JSON）
    #[arg(long = "handoff", hide = true)]
    pub handoff: Option<String>,
}

impl Args {
    pub fn settings(&self) -> Settings {
        Settings {
            max_cache_entries: self.max_cache,
            max_requests: self.max_requests,
            request_timeout_secs: self.timeout_secs,
            ttl_ceiling_secs: self.max_ttl_secs,
            stats_interval_secs: self.stats_interval_secs,
            accept_backoff_ms: 1000,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    if args.worker {
        let handoff = args
            .handoff
            .as_deref()
            .context("--worker requires --handoff")?;
        worker::run(handoff)
    } else {
        monitor::run(args)
    }
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
