use std::{
    env, fs,
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use log::debug;
use nix::{sys::statvfs::statvfs, unistd::geteuid};

use crate::error::{SiteError, SiteResult};

/// Проверяет, запущен ли процесс от имени root
pub fn is_root() -> bool {
    geteuid().is_root()
}

/// Ищет исполняемый файл в PATH
pub fn command_exists(program: &str) -> bool {
    if program.contains('/') {
        return is_executable(Path::new(program));
    }

    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| is_executable(&dir.join(program))))
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Свободное место (МБ) на файловой системе, где находится `path`
///
/// Если путь ещё не создан, проверяется ближайший существующий родитель.
pub fn free_disk_mb(path: &Path) -> SiteResult<u64> {
    let existing = path
        .ancestors()
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| Path::new("/"));

    let stat = statvfs(existing)
        .map_err(|e| SiteError::io(existing, std::io::Error::from_raw_os_error(e as i32)))?;

    let bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
    Ok(bytes / 1024 / 1024)
}

/// Доступная память (МБ) по данным /proc/meminfo
pub fn free_memory_mb() -> SiteResult<u64> {
    let path = Path::new("/proc/meminfo");
    let meminfo = fs::read_to_string(path).map_err(|e| SiteError::io(path, e))?;
    parse_mem_available_mb(&meminfo).ok_or_else(|| {
        SiteError::Resource("не удалось определить объём доступной памяти".to_string())
    })
}

fn parse_mem_available_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// Удаляет файл, символическую ссылку или директорию; отсутствие пути не ошибка
pub fn remove_path(path: &Path) -> SiteResult<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(SiteError::io(path, e)),
    };

    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|e| SiteError::io(path, e))?;
    debug!("Удалено: {:?}", path);
    Ok(true)
}

/// Существует ли путь (символическая ссылка учитывается даже «битая»)
pub fn path_present(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Записывает файл атомарно: временный файл в той же директории + rename
pub fn write_atomic(path: &Path, contents: &str, mode: Option<u32>) -> SiteResult<()> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent).map_err(|e| SiteError::io(&parent, e))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    fs::write(&tmp, contents).map_err(|e| SiteError::io(&tmp, e))?;
    if let Some(mode) = mode {
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
            .map_err(|e| SiteError::io(&tmp, e))?;
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        SiteError::io(path, e)
    })
}
