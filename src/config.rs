use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::site::DbConnection;

// Расположение конфигурации по умолчанию
pub const DEFAULT_CONFIG_PATH: &str = "/etc/site_manager/config.toml";
pub const CONFIG_ENV: &str = "SITE_MANAGER_CONFIG";
pub const LOG_LEVEL_ENV: &str = "SITE_MANAGER_LOG_LEVEL";

/// Параметры повторов для сетевых операций (git clone)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Настройки утилиты
///
/// Передаются явно каждому компоненту, глобального состояния нет.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub sites_root: PathBuf,
    pub nginx_available_dir: PathBuf,
    pub nginx_enabled_dir: PathBuf,
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub audit_log: PathBuf,
    pub lock_file: PathBuf,
    pub lock_timeout_secs: u64,
    pub release_retention: usize,
    pub backup_retention: usize,
    pub default_php_version: String,
    pub default_db_connection: DbConnection,
    pub web_user: String,
    pub require_root: bool,
    pub min_free_disk_mb: u64,
    pub min_free_memory_mb: u64,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sites_root: PathBuf::from("/var/www"),
            nginx_available_dir: PathBuf::from("/etc/nginx/sites-available"),
            nginx_enabled_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            state_dir: PathBuf::from("/var/lib/site_manager/sites"),
            backup_dir: PathBuf::from("/var/backups/sites"),
            audit_log: PathBuf::from("/var/log/site_manager/audit.log"),
            lock_file: PathBuf::from("/var/run/site_manager.lock"),
            lock_timeout_secs: 300,
            release_retention: 5,
            backup_retention: 5,
            default_php_version: "8.1".to_string(),
            default_db_connection: DbConnection::Mysql,
            web_user: "www-data".to_string(),
            require_root: true,
            min_free_disk_mb: 1024,
            min_free_memory_mb: 256,
            retry: RetrySettings::default(),
        }
    }
}

impl Settings {
    /// Загружает настройки из TOML файла
    ///
    /// Путь берётся из аргумента, затем из `SITE_MANAGER_CONFIG`, затем
    /// используется `/etc/site_manager/config.toml`. Отсутствующий файл
    /// означает настройки по умолчанию.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(path);

        let mut settings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Не удалось прочитать файл конфигурации: {:?}", path))?;
            toml::from_str::<Settings>(&contents).with_context(|| {
                format!("Не удалось разобрать конфигурацию из файла: {:?}", path)
            })?
        } else {
            debug!("Файл конфигурации {:?} не найден, используются значения по умолчанию", path);
            Self::default()
        };

        if let Ok(level) = env::var(LOG_LEVEL_ENV) {
            settings.log_level = level;
        }

        Ok(settings)
    }

    /// Путь к файлу конфигурации с учётом `SITE_MANAGER_CONFIG`
    pub fn resolve_path(path: Option<&Path>) -> PathBuf {
        match path {
            Some(path) => path.to_path_buf(),
            None => env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).context("Не удалось сериализовать конфигурацию в TOML")?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Не удалось создать директорию: {:?}", parent))?;
        }

        fs::write(path, contents)
            .with_context(|| format!("Не удалось записать файл конфигурации: {:?}", path))?;

        info!("Конфигурация сохранена в {:?}", path);
        Ok(())
    }

    /// Директория сайта
    pub fn site_dir(&self, name: &str) -> PathBuf {
        self.sites_root.join(name)
    }

    /// Файл конфигурации сайта в sites-available
    pub fn available_path(&self, name: &str) -> PathBuf {
        self.nginx_available_dir.join(name)
    }

    /// Символическая ссылка сайта в sites-enabled
    pub fn enabled_path(&self, name: &str) -> PathBuf {
        self.nginx_enabled_dir.join(name)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Настройки, в которых все пути лежат внутри одной корневой директории
    #[cfg(test)]
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            sites_root: root.join("www"),
            nginx_available_dir: root.join("nginx/sites-available"),
            nginx_enabled_dir: root.join("nginx/sites-enabled"),
            state_dir: root.join("state"),
            backup_dir: root.join("backups"),
            audit_log: root.join("audit/audit.log"),
            lock_file: root.join("site_manager.lock"),
            lock_timeout_secs: 5,
            require_root: false,
            retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.release_retention, 5);
        assert_eq!(settings.default_php_version, "8.1");
        assert_eq!(settings.sites_root, PathBuf::from("/var/www"));
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "sites_root = \"/srv/sites\"\nrelease_retention = 3\n\n[retry]\nmax_attempts = 7\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.sites_root, PathBuf::from("/srv/sites"));
        assert_eq!(settings.release_retention, 3);
        assert_eq!(settings.retry.max_attempts, 7);
        assert_eq!(settings.retry.base_delay_ms, 2_000);
        assert_eq!(settings.web_user, "www-data");
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let settings = Settings::rooted_at(dir.path());
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(Some(&path)).unwrap(), settings);
    }

    #[test]
    fn site_paths_are_derived_from_name() {
        let settings = Settings::default();
        assert_eq!(settings.site_dir("blog"), PathBuf::from("/var/www/blog"));
        assert_eq!(
            settings.available_path("blog"),
            PathBuf::from("/etc/nginx/sites-available/blog")
        );
        assert_eq!(
            settings.enabled_path("blog"),
            PathBuf::from("/etc/nginx/sites-enabled/blog")
        );
    }
}
