use std::os::fd::RawFd;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// 监督进程与工作进程之间的启动交接契约版本。
/// Bumped whenever the shape of the handoff changes; the worker refuses to
/// start against a version it does not understand.
pub const HANDOFF_VERSION: u32 = 1;

/// The entire startup input of the worker: one config-file descriptor, four
/// listening sockets, and the runtime tunables. Descriptor numbers are named
/// explicitly here and validated on the far side instead of being assumed by
/// position in the inherited descriptor table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub version: u32,
    /// 已打开的解析器配置文件描述符
    pub config_fd: RawFd,
    pub udp4_fd: RawFd,
    pub tcp4_fd: RawFd,
    pub udp6_fd: RawFd,
    pub tcp6_fd: RawFd,
    pub settings: Settings,
    /// 降权目标用户
    pub user: String,
    /// 降权 chroot 目录
    pub chroot_dir: String,
}

impl Handoff {
    pub fn to_arg(&self) -> Result<String> {
        serde_json::to_string(self).context("encode handoff")
    }

    pub fn from_arg(arg: &str) -> Result<Self> {
        let handoff: Handoff = serde_json::from_str(arg).context("decode handoff")?;
        if handoff.version != HANDOFF_VERSION {
            bail!(
                "handoff version mismatch: got {}, expected {}",
                handoff.version,
                HANDOFF_VERSION
            );
        }
        Ok(handoff)
    }

    pub fn fds(&self) -> [RawFd; 5] {
        [
            self.config_fd,
            self.udp4_fd,
            self.tcp4_fd,
            self.udp6_fd,
            self.tcp6_fd,
        ]
    }

    /// Validate the contract before any descriptor is adopted: every listed
    /// descriptor must be distinct and actually open in this process.
    pub fn validate(&self) -> Result<()> {
        let fds = self.fds();
        for (i, fd) in fds.iter().enumerate() {
            if *fd < 0 {
                bail!("handoff descriptor {} is negative", fd);
            }
            if fds[..i].contains(fd) {
                bail!("handoff descriptor {} listed twice", fd);
            }
            if unsafe { libc::fcntl(*fd, libc::F_GETFD) } < 0 {
                bail!("handoff descriptor {} is not open", fd);
            }
        }
        Ok(())
    }
}
