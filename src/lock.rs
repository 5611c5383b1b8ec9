use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    process,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};

use crate::error::{SiteError, SiteResult};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Захваченная блокировка; снимается при уничтожении guard-а
///
/// Блокировку держит `flock` на открытом файле, pid внутри нужен только для
/// сообщений об ожидании.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Файл не удаляется: иначе ожидающий процесс захватил бы уже отвязанный inode
        match self.file.set_len(0) {
            Ok(()) => debug!("Блокировка {:?} освобождена", self.path),
            Err(e) => warn!("Не удалось очистить файл блокировки {:?}: {}", self.path, e),
        }
    }
}

/// Захватывает блокировку, ожидая не дольше `timeout`
///
/// Блокировку процесса, которого уже нет, ядро снимает само, поэтому
/// устаревший файл с чужим pid захвату не мешает.
pub async fn acquire(path: &Path, timeout: Duration) -> SiteResult<LockGuard> {
    let pid = process::id() as i32;
    let started = Instant::now();
    let mut announced = false;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SiteError::io(parent, e))?;
    }

    loop {
        if let Some(file) = try_lock(path)? {
            write_pid(&file, pid).map_err(|e| SiteError::io(path, e))?;
            debug!("Блокировка {:?} захвачена (pid {})", path, pid);
            return Ok(LockGuard {
                path: path.to_path_buf(),
                file,
            });
        }

        let holder = read_holder(path).unwrap_or(0);
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(SiteError::LockTimeout {
                path: path.to_path_buf(),
                holder,
                waited_secs: waited.as_secs(),
            });
        }
        if !announced {
            info!(
                "Ожидание блокировки {:?}, её держит процесс {}",
                path, holder
            );
            announced = true;
        }
        tokio::time::sleep(POLL_INTERVAL.min(timeout - waited)).await;
    }
}

/// Очищает pid в файле блокировки при SIGINT/SIGTERM; сам `flock` снимается при выходе
pub fn release_on_signal(path: &Path) {
    let path = path.to_path_buf();
    let pid = process::id() as i32;
    let result = ctrlc::set_handler(move || {
        if release_if_owned(&path, pid) {
            eprintln!("Получен сигнал, блокировка {:?} освобождена", path);
        }
        process::exit(130);
    });

    if let Err(e) = result {
        warn!("Не удалось установить обработчик сигналов: {}", e);
    }
}

// `None`, если блокировку держит другой процесс
fn try_lock(path: &Path) -> SiteResult<Option<File>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| SiteError::io(path, e))?;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(Some(file)),
        Err(Errno::EWOULDBLOCK) => Ok(None),
        Err(e) => Err(SiteError::io(path, e.into())),
    }
}

fn write_pid(mut file: &File, pid: i32) -> std::io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", pid)?;
    file.sync_data()
}

fn read_holder(path: &Path) -> Option<i32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0)
}

fn release_if_owned(path: &Path, pid: i32) -> bool {
    if read_holder(path) == Some(pid) {
        OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|file| file.set_len(0))
            .is_ok()
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn contents(path: &Path) -> String {
        fs::read_to_string(path).unwrap().trim().to_string()
    }

    #[tokio::test]
    async fn guard_writes_pid_and_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/site_manager.lock");

        let guard = acquire(&path, Duration::from_secs(1)).await.unwrap();
        assert_eq!(contents(&path), process::id().to_string());

        drop(guard);
        assert_eq!(contents(&path), "");
        let again = acquire(&path, Duration::from_millis(100)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn times_out_while_held_by_live_process() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site_manager.lock");

        let _held = acquire(&path, Duration::from_secs(1)).await.unwrap();
        let err = acquire(&path, Duration::from_millis(250)).await.unwrap_err();
        match err {
            SiteError::LockTimeout { holder, .. } => assert_eq!(holder, process::id() as i32),
            other => panic!("ожидался LockTimeout, получено {other:?}"),
        }
        assert_eq!(contents(&path), process::id().to_string());
    }

    #[tokio::test]
    async fn waits_for_release_then_acquires() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site_manager.lock");

        let held = acquire(&path, Duration::from_secs(1)).await.unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(held);
        });

        let second = acquire(&path, Duration::from_secs(5)).await.unwrap();
        releaser.await.unwrap();
        assert_eq!(contents(&second.path), process::id().to_string());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site_manager.lock");

        // pid, которого заведомо нет (больше pid_max в Linux)
        fs::write(&path, "4194305\n").unwrap();
        let guard = acquire(&path, Duration::from_millis(200)).await.unwrap();
        assert_eq!(contents(&guard.path), process::id().to_string());

        fs::write(dir.path().join("garbage.lock"), "not a pid").unwrap();
        let garbage = acquire(&dir.path().join("garbage.lock"), Duration::from_millis(200)).await;
        assert!(garbage.is_ok());
    }

    #[tokio::test]
    async fn only_one_of_many_waiters_holds_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site_manager.lock");
        fs::write(&path, "4194305\n").unwrap();

        // Все претенденты видят один и тот же устаревший pid
        let mut results = Vec::new();
        for _ in 0..8 {
            results.push(acquire(&path, Duration::ZERO).await);
        }
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, SiteError::LockTimeout { .. })));
        assert_eq!(contents(&path), process::id().to_string());
    }

    #[test]
    fn foreign_lock_is_not_released() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site_manager.lock");
        fs::write(&path, "1\n").unwrap();

        assert!(!release_if_owned(&path, process::id() as i32));
        assert_eq!(contents(&path), "1");
    }
}
