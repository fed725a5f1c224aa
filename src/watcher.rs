use std::path::PathBuf;
use std::thread;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 在独立线程上监视配置文件，外部修改时通知监督循环重启工作进程。
pub fn spawn(path: PathBuf, reload: mpsc::Sender<()>) {
    // 使用阻塞线程持有 watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, reload) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, reload: mpsc::Sender<()>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                    if reload.blocking_send(()).is_err() {
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}
