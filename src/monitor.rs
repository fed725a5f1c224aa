use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::Args;
use crate::handoff::{HANDOFF_VERSION, Handoff};
use crate::watcher;

const STOP_GRACE: Duration = Duration::from_secs(2);

/// 监督进程：在特权身份下绑定监听套接字并打开配置文件，之后只负责
/// 工作进程的生命周期管理。
pub fn run(args: Args) -> Result<()> {
    let listen4: SocketAddr = args.listen4.parse().context("parse --listen")?;
    let listen6: SocketAddr = args.listen6.parse().context("parse --listen6")?;
    if !listen4.is_ipv4() || !listen6.is_ipv6() {
        anyhow::bail!("--listen must be an IPv4 address and --listen6 an IPv6 address");
    }

    // bind every privileged resource up front; the worker never binds
    let udp4 = bind_udp(listen4)?;
    let tcp4 = bind_tcp(listen4)?;
    let udp6 = bind_udp(listen6)?;
    let tcp6 = bind_tcp(listen6)?;
    info!(listen4 = %listen4, listen6 = %listen6, "listeners bound");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    rt.block_on(supervise(args, udp4, tcp4, udp6, tcp6))
}

async fn supervise(
    args: Args,
    udp4: std::net::UdpSocket,
    tcp4: std::net::TcpListener,
    udp6: std::net::UdpSocket,
    tcp6: std::net::TcpListener,
) -> Result<()> {
    let (reload_tx, mut reload_rx) = mpsc::channel(4);
    watcher::spawn(args.config.clone(), reload_tx);
    let mut watcher_alive = true;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut backoff = RestartBackoff::default();

    enum Fate {
        Exited,
        Reload,
        Terminate,
    }
    enum Sig {
        Exited(std::io::Result<ExitStatus>),
        Reload(&'static str),
        WatcherGone,
        Stats,
        Terminate,
    }

    loop {
        // 每一代工作进程都拿到新打开的配置描述符，重启即重读配置
        let config_file = std::fs::File::open(&args.config)
            .with_context(|| format!("open config {}", args.config.display()))?;

        let handoff = Handoff {
            version: HANDOFF_VERSION,
            config_fd: config_file.as_raw_fd(),
            udp4_fd: udp4.as_raw_fd(),
            tcp4_fd: tcp4.as_raw_fd(),
            udp6_fd: udp6.as_raw_fd(),
            tcp6_fd: tcp6.as_raw_fd(),
            settings: args.settings(),
            user: args.user.clone(),
            chroot_dir: args.chroot_dir.clone(),
        };

        let mut child = spawn_worker(&handoff, args.debug)?;
        let started = Instant::now();
        info!(pid = child.id(), "worker started");

        let fate = loop {
            let sig = tokio::select! {
                status = child.wait() => Sig::Exited(status),
                _ = sighup.recv() => Sig::Reload("reload signal"),
                r = reload_rx.recv(), if watcher_alive => match r {
                    Some(()) => Sig::Reload("config file changed"),
                    None => Sig::WatcherGone,
                },
                _ = sigusr1.recv() => Sig::Stats,
                _ = sigterm.recv() => Sig::Terminate,
                _ = sigint.recv() => Sig::Terminate,
            };
            match sig {
                Sig::Exited(status) => {
                    let status = status.context("wait for worker")?;
                    warn!(%status, "worker exited");
                    break Fate::Exited;
                }
                Sig::Reload(why) => {
                    info!(why, "restarting worker");
                    break Fate::Reload;
                }
                Sig::WatcherGone => {
                    warn!("config watcher stopped, reload now requires a signal");
                    watcher_alive = false;
                }
                Sig::Stats => forward_signal(&child, libc::SIGUSR1),
                Sig::Terminate => break Fate::Terminate,
            }
        };
        drop(config_file);

        match fate {
            Fate::Exited => {
                let delay = backoff.next(started.elapsed());
                if !delay.is_zero() {
                    warn!(delay_ms = delay.as_millis() as u64, "delaying worker restart");
                    tokio::time::sleep(delay).await;
                }
            }
            Fate::Reload => {
                stop_worker(&mut child, libc::SIGHUP).await;
                // coalesce the burst of events one config write produces
                tokio::time::sleep(Duration::from_millis(100)).await;
                while reload_rx.try_recv().is_ok() {}
                backoff.reset();
            }
            Fate::Terminate => {
                info!("terminate signal, stopping worker and exiting");
                stop_worker(&mut child, libc::SIGTERM).await;
                return Ok(());
            }
        }
    }
}

/// Re-exec this binary as the worker, carrying the typed handoff on the
/// command line. The listed descriptors lose close-on-exec right before the
/// exec; nothing else is inherited.
fn spawn_worker(handoff: &Handoff, debug: bool) -> Result<Child> {
    let exe = std::env::current_exe().context("locate executable")?;
    let mut cmd = Command::new(exe);
    cmd.arg("--worker").arg("--handoff").arg(handoff.to_arg()?);
    if debug {
        cmd.arg("--debug");
    }
    cmd.kill_on_drop(true);
    let fds = handoff.fds();
    unsafe {
        cmd.pre_exec(move || {
            for fd in fds {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    cmd.spawn().context("spawn worker")
}

fn forward_signal(child: &Child, sig: libc::c_int) {
    if let Some(pid) = child.id() {
        unsafe { libc::kill(pid as libc::pid_t, sig) };
    }
}

/// Signal the worker and wait briefly for a clean exit; a worker still
/// running after the grace period is force-killed.
async fn stop_worker(child: &mut Child, sig: libc::c_int) {
    forward_signal(child, sig);
    if timeout(STOP_GRACE, child.wait()).await.is_err() {
        warn!("worker did not exit in time, killing");
        let _ = child.kill().await;
    }
}

fn bind_udp(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create udp socket")?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind udp {addr}"))?;
    Ok(socket.into())
}

fn bind_tcp(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).context("create tcp socket")?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind tcp {addr}"))?;
    socket.listen(128).context("listen")?;
    Ok(socket.into())
}

/// 崩溃重启退避：指数增长、设上限，健康运行一段时间后复位。
struct RestartBackoff {
    delay: Duration,
}

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
const HEALTHY_UPTIME: Duration = Duration::from_secs(10);

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            delay: BACKOFF_BASE,
        }
    }
}

impl RestartBackoff {
    /// Delay before the next restart, given how long the last worker lived.
    fn next(&mut self, uptime: Duration) -> Duration {
        if uptime >= HEALTHY_UPTIME {
            self.delay = BACKOFF_BASE;
            return Duration::ZERO;
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.delay = BACKOFF_BASE;
    }
}
