use chrono::Local;
use log::{debug, info, warn};
use std::{
    fs,
    io::ErrorKind,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use crate::{
    config::Settings,
    error::{SiteError, SiteResult},
    host::Host,
    release::ReleaseId,
    site::SiteRecord,
    utils,
};

const FILES_DIR: &str = "files";
const DUMP_FILE: &str = "database.sql";

/// Резервные копии сайтов: `<backup_dir>/<имя>_<YYYYMMDD_HHMMSS>/`
#[derive(Debug, Clone)]
pub struct Backups {
    dir: PathBuf,
    retention: usize,
}

impl Backups {
    pub fn new(settings: &Settings) -> Self {
        Self {
            dir: settings.backup_dir.clone(),
            retention: settings.backup_retention.max(1),
        }
    }

    /// Создаёт пустую директорию для новой копии сайта
    fn prepare(&self, name: &str) -> SiteResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| SiteError::io(&self.dir, e))?;

        let now = Local::now();
        let mut seq = 0;
        loop {
            let path = self
                .dir
                .join(format!("{}_{}", name, ReleaseId::at(now, seq)));
            match fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(SiteError::io(&path, e)),
            }
        }
    }

    /// Копирует файлы сайта и дамп базы данных
    pub async fn backup_site<H: Host>(
        &self,
        host: &H,
        record: &SiteRecord,
        site_dir: &Path,
    ) -> SiteResult<PathBuf> {
        let target = self.prepare(record.name())?;
        info!("Резервное копирование сайта {} в {:?}", record.name(), target);

        let result = async {
            if site_dir.exists() {
                copy_tree(site_dir, &target.join(FILES_DIR))?;
            }
            host.dump_database(&record.spec.database, &target.join(DUMP_FILE))
                .await
        }
        .await;

        if let Err(e) = result {
            let _ = utils::remove_path(&target);
            return Err(e);
        }

        self.prune(record.name())?;
        Ok(target)
    }

    /// Переносит файлы удаляемого сайта в резервную копию
    pub fn archive_files(&self, name: &str, site_dir: &Path) -> SiteResult<PathBuf> {
        let target = self.prepare(name)?;
        let files = target.join(FILES_DIR);

        match fs::rename(site_dir, &files) {
            Ok(()) => {}
            // Другая файловая система
            Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
                copy_tree(site_dir, &files)?;
                utils::remove_path(site_dir)?;
            }
            Err(e) => return Err(SiteError::io(site_dir, e)),
        }

        info!("Файлы сайта {} перенесены в {:?}", name, target);
        self.prune(name)?;
        Ok(target)
    }

    /// Копии сайта от старых к новым
    pub fn list(&self, name: &str) -> SiteResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SiteError::io(&self.dir, e)),
        };

        let prefix = format!("{}_", name);
        let mut backups: Vec<(ReleaseId, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().to_str()?.to_string();
                let stamp: ReleaseId = file_name.strip_prefix(&prefix)?.parse().ok()?;
                Some((stamp, entry.path()))
            })
            .collect();
        backups.sort();
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }

    /// Оставляет последние копии сайта, остальные удаляет
    pub fn prune(&self, name: &str) -> SiteResult<usize> {
        let backups = self.list(name)?;
        let excess = backups.len().saturating_sub(self.retention);

        for path in backups.iter().take(excess) {
            if let Err(e) = utils::remove_path(path) {
                warn!("Не удалось удалить старую копию {:?}: {}", path, e);
            } else {
                debug!("Удалена старая копия: {:?}", path);
            }
        }
        Ok(excess)
    }
}

/// Рекурсивное копирование; символические ссылки копируются как ссылки
pub fn copy_tree(src: &Path, dst: &Path) -> SiteResult<()> {
    fs::create_dir_all(dst).map_err(|e| SiteError::io(dst, e))?;

    for entry in fs::read_dir(src).map_err(|e| SiteError::io(src, e))? {
        let entry = entry.map_err(|e| SiteError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let kind = entry.file_type().map_err(|e| SiteError::io(&from, e))?;

        if kind.is_symlink() {
            let target = fs::read_link(&from).map_err(|e| SiteError::io(&from, e))?;
            symlink(&target, &to).map_err(|e| SiteError::io(&to, e))?;
        } else if kind.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| SiteError::io(&from, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        site::{DbConnection, SiteSpec, SiteStatus},
        testing::FakeHost,
    };
    use tempfile::TempDir;

    fn record(settings: &Settings, name: &str) -> SiteRecord {
        let spec = SiteSpec::new(name, "blog.local", settings);
        SiteRecord {
            status: SiteStatus {
                enabled: false,
                config_valid: None,
                created_at: Local::now(),
                document_root: settings.site_dir(name).join("public"),
                config_sha256: String::new(),
                current_release: None,
                last_deployed_at: None,
            },
            spec,
        }
    }

    #[test]
    fn copy_tree_preserves_symlinks() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("site");
        fs::create_dir_all(src.join("releases/1/public")).unwrap();
        fs::write(src.join("releases/1/public/index.php"), "<?php\n").unwrap();
        symlink("releases/1", src.join("current")).unwrap();

        let dst = dir.path().join("copy");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(
            fs::read_link(dst.join("current")).unwrap(),
            PathBuf::from("releases/1")
        );
        assert_eq!(
            fs::read_to_string(dst.join("current/public/index.php")).unwrap(),
            "<?php\n"
        );
    }

    #[tokio::test]
    async fn backup_copies_files_and_dumps_database() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::rooted_at(dir.path());
        let host = FakeHost::new(&settings);
        let record = record(&settings, "blog");
        let site_dir = settings.site_dir("blog");
        fs::create_dir_all(site_dir.join("public")).unwrap();
        fs::write(site_dir.join(".env"), "APP_NAME=blog\n").unwrap();

        let backups = Backups::new(&settings);
        let target = backups.backup_site(&host, &record, &site_dir).await.unwrap();

        assert!(target.starts_with(&settings.backup_dir));
        assert_eq!(
            fs::read_to_string(target.join("files/.env")).unwrap(),
            "APP_NAME=blog\n"
        );
        assert!(fs::read_to_string(target.join(DUMP_FILE))
            .unwrap()
            .contains("blog"));
        assert!(site_dir.join(".env").exists());
    }

    #[tokio::test]
    async fn sqlite_backup_has_no_dump() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::rooted_at(dir.path());
        let host = FakeHost::new(&settings);
        let mut record = record(&settings, "notes");
        record.spec.database.connection = DbConnection::Sqlite;
        let site_dir = settings.site_dir("notes");
        fs::create_dir_all(site_dir.join("database")).unwrap();
        fs::write(site_dir.join("database/database.sqlite"), "").unwrap();

        let target = Backups::new(&settings)
            .backup_site(&host, &record, &site_dir)
            .await
            .unwrap();
        assert!(target.join("files/database/database.sqlite").exists());
        assert!(!target.join(DUMP_FILE).exists());
    }

    #[test]
    fn archive_moves_site_away() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::rooted_at(dir.path());
        let site_dir = settings.site_dir("blog");
        fs::create_dir_all(site_dir.join("public")).unwrap();

        let target = Backups::new(&settings)
            .archive_files("blog", &site_dir)
            .unwrap();
        assert!(!site_dir.exists());
        assert!(target.join("files/public").is_dir());
    }

    #[test]
    fn retention_keeps_newest_per_site() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::rooted_at(dir.path());
        settings.backup_retention = 2;
        let backups = Backups::new(&settings);

        for stamp in ["20240101_100000", "20240102_100000", "20240103_100000"] {
            fs::create_dir_all(settings.backup_dir.join(format!("blog_{}", stamp))).unwrap();
        }
        // Чужие копии и посторонние файлы не трогаются
        fs::create_dir_all(settings.backup_dir.join("blog_old_20240101_100000")).unwrap();
        fs::create_dir_all(settings.backup_dir.join("blog_manual")).unwrap();

        assert_eq!(backups.prune("blog").unwrap(), 1);
        let left: Vec<String> = backups
            .list("blog")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(left, vec!["blog_20240102_100000", "blog_20240103_100000"]);
        assert!(settings.backup_dir.join("blog_old_20240101_100000").exists());
        assert!(settings.backup_dir.join("blog_manual").exists());
    }
}
