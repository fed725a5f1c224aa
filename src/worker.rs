use std::fs::File;
use std::os::fd::FromRawFd;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::config;
use crate::engine::{Engine, Listeners};
use crate::handoff::Handoff;

/// 工作进程入口：验证交接契约、收养描述符、降权、解析配置、运行事件循环。
/// Everything the worker touches afterwards reaches it through the handoff;
/// it has no filesystem or bind privileges of its own.
pub fn run(handoff_arg: &str) -> Result<()> {
    let handoff = Handoff::from_arg(handoff_arg)?;
    handoff.validate()?;

    #[cfg(target_os = "linux")]
    arm_parent_death_signal()?;

    // adopt every inherited descriptor before dropping privilege
    let mut config_file = unsafe { File::from_raw_fd(handoff.config_fd) };
    let udp4 = unsafe { std::net::UdpSocket::from_raw_fd(handoff.udp4_fd) };
    let tcp4 = unsafe { std::net::TcpListener::from_raw_fd(handoff.tcp4_fd) };
    let udp6 = unsafe { std::net::UdpSocket::from_raw_fd(handoff.udp6_fd) };
    let tcp6 = unsafe { std::net::TcpListener::from_raw_fd(handoff.tcp6_fd) };

    drop_privilege(&handoff.user, &handoff.chroot_dir)?;

    // a worker with no usable upstream must not run at all
    let upstream = config::read_upstream(&mut config_file).context("resolver config")?;
    drop(config_file);

    let l4 = udp4.local_addr().context("udp4 local addr")?;
    let t4 = tcp4.local_addr().context("tcp4 local addr")?;
    let l6 = udp6.local_addr().context("udp6 local addr")?;
    let t6 = tcp6.local_addr().context("tcp6 local addr")?;
    if !l4.is_ipv4() || !t4.is_ipv4() || !l6.is_ipv6() || !t6.is_ipv6() {
        bail!("handoff descriptor address family mismatch");
    }

    udp4.set_nonblocking(true).context("udp4 nonblocking")?;
    tcp4.set_nonblocking(true).context("tcp4 nonblocking")?;
    udp6.set_nonblocking(true).context("udp6 nonblocking")?;
    tcp6.set_nonblocking(true).context("tcp6 nonblocking")?;

    info!(upstream = %upstream, udp4 = %l4, tcp4 = %t4, udp6 = %l6, tcp6 = %t6, "worker starting");

    // exactly one OS thread of control; all proxy state is single-owner
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    rt.block_on(async move {
        let listeners = Listeners {
            udp4: tokio::net::UdpSocket::from_std(udp4).context("udp4 register")?,
            udp6: tokio::net::UdpSocket::from_std(udp6).context("udp6 register")?,
            tcp4: tokio::net::TcpListener::from_std(tcp4).context("tcp4 register")?,
            tcp6: tokio::net::TcpListener::from_std(tcp6).context("tcp6 register")?,
        };
        let (engine, events) = Engine::new(listeners, upstream, handoff.settings.clone());
        engine.run(events).await
    })
}

/// Drop to the unprivileged identity inside an empty chroot. Skipped when
/// not started as root.
fn drop_privilege(user: &str, dir: &str) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        debug!("not running as root, privilege drop skipped");
        return Ok(());
    }
    let c_user = std::ffi::CString::new(user).context("user name")?;
    let pw = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pw.is_null() {
        bail!("unknown user: {user}");
    }
    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };
    let c_dir = std::ffi::CString::new(dir).context("chroot dir")?;
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(os_err("setgroups"));
        }
        if libc::setgid(gid) != 0 {
            return Err(os_err("setgid"));
        }
        if libc::chroot(c_dir.as_ptr()) != 0 {
            return Err(os_err("chroot"));
        }
        if libc::chdir(c"/".as_ptr()) != 0 {
            return Err(os_err("chdir"));
        }
        if libc::setuid(uid) != 0 {
            return Err(os_err("setuid"));
        }
        // the drop must be irreversible
        if libc::setuid(0) == 0 {
            bail!("privilege drop did not stick");
        }
    }
    info!(user, chroot = dir, "privilege dropped");
    Ok(())
}

/// Have the kernel deliver SIGTERM when the monitor dies; only the monitor
/// can restart this process.
#[cfg(target_os = "linux")]
fn arm_parent_death_signal() -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) } != 0 {
        return Err(os_err("prctl"));
    }
    // the monitor may already be gone
    if unsafe { libc::getppid() } == 1 {
        bail!("monitor exited before worker start");
    }
    Ok(())
}

fn os_err(what: &str) -> anyhow::Error {
    anyhow::Error::new(std::io::Error::last_os_error()).context(what.to_string())
}
