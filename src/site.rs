use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Local};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    config::Settings,
    error::{SiteError, SiteResult},
    validation,
};

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_BRANCH: &str = "main";

/// Драйвер базы данных Laravel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DbConnection {
    Mysql,
    Pgsql,
    Sqlite,
}

impl DbConnection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Pgsql => "pgsql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Порт сервера БД для .env
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Mysql => Some(3306),
            Self::Pgsql => Some(5432),
            Self::Sqlite => None,
        }
    }

    /// Имя systemd-службы сервера БД
    pub fn service_name(&self) -> Option<&'static str> {
        match self {
            Self::Mysql => Some("mysql"),
            Self::Pgsql => Some("postgresql"),
            Self::Sqlite => None,
        }
    }
}

impl fmt::Display for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbConnection {
    type Err = SiteError;

    fn from_str(value: &str) -> SiteResult<Self> {
        match value {
            "mysql" => Ok(Self::Mysql),
            "pgsql" | "postgres" | "postgresql" => Ok(Self::Pgsql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(SiteError::Validation(format!(
                "неизвестный драйвер базы данных: {}",
                other
            ))),
        }
    }
}

/// Параметры базы данных сайта
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub connection: DbConnection,
    pub database: String,
    pub username: String,
}

/// Объявленная конфигурация сайта
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSpec {
    pub name: String,
    pub domain: String,
    pub port: u16,
    pub php_version: String,
    pub database: DatabaseConfig,
    pub git_repo: Option<String>,
    pub git_branch: String,
    pub auto_update: bool,
    pub ssl_enabled: bool,
}

impl SiteSpec {
    /// Создаёт описание сайта со значениями по умолчанию
    ///
    /// База данных и пользователь называются так же, как сайт.
    pub fn new(name: &str, domain: &str, settings: &Settings) -> Self {
        Self {
            name: name.to_string(),
            domain: domain.to_string(),
            port: DEFAULT_PORT,
            php_version: settings.default_php_version.clone(),
            database: DatabaseConfig {
                connection: settings.default_db_connection,
                database: name.to_string(),
                username: name.to_string(),
            },
            git_repo: None,
            git_branch: DEFAULT_BRANCH.to_string(),
            auto_update: false,
            ssl_enabled: false,
        }
    }

    pub fn validate(&self) -> SiteResult<()> {
        validation::validate_site_name(&self.name)?;
        validation::validate_domain(&self.domain)?;
        validation::validate_port(self.port)?;
        validation::validate_php_version(&self.php_version)?;
        validation::validate_identifier("имя базы данных", &self.database.database)?;
        validation::validate_identifier("пользователь базы данных", &self.database.username)?;
        if let Some(repo) = &self.git_repo {
            validation::validate_git_url(repo)?;
        }
        validation::validate_branch(&self.git_branch)?;
        Ok(())
    }

    pub fn is_git(&self) -> bool {
        self.git_repo.is_some()
    }

    pub fn php_fpm_service(&self) -> String {
        format!("php{}-fpm", self.php_version)
    }
}

/// Раскладка файлов сайта на диске
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLayout {
    pub site_dir: PathBuf,
    /// Директория приложения: сам сайт или `current` для git-сайтов
    pub app_dir: PathBuf,
    pub document_root: PathBuf,
    /// Файл окружения (в `shared` для git-сайтов)
    pub env_file: PathBuf,
    pub shared_dir: Option<PathBuf>,
}

impl SiteLayout {
    pub fn resolve(settings: &Settings, spec: &SiteSpec) -> Self {
        let site_dir = settings.site_dir(&spec.name);

        if spec.is_git() {
            let shared_dir = site_dir.join("shared");
            let app_dir = site_dir.join("current");
            Self {
                document_root: app_dir.join("public"),
                env_file: shared_dir.join(".env"),
                app_dir,
                shared_dir: Some(shared_dir),
                site_dir,
            }
        } else {
            Self {
                app_dir: site_dir.clone(),
                document_root: site_dir.join("public"),
                env_file: site_dir.join(".env"),
                shared_dir: None,
                site_dir,
            }
        }
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.site_dir.join("releases")
    }

    pub fn current_link(&self) -> PathBuf {
        self.site_dir.join("current")
    }

    /// Файл SQLite, переживающий смену релизов
    pub fn sqlite_path(&self) -> PathBuf {
        match &self.shared_dir {
            Some(shared) => shared.join("database/database.sqlite"),
            None => self.site_dir.join("database/database.sqlite"),
        }
    }
}

/// Производные атрибуты сайта, хранятся отдельно от объявленной конфигурации
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStatus {
    pub enabled: bool,
    /// Результат последней проверки `nginx -t`; `None`, пока сайт не включали
    pub config_valid: Option<bool>,
    pub created_at: DateTime<Local>,
    pub document_root: PathBuf,
    pub config_sha256: String,
    pub current_release: Option<String>,
    pub last_deployed_at: Option<DateTime<Local>>,
}

/// Запись хранилища состояния
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub spec: SiteSpec,
    pub status: SiteStatus,
}

impl SiteRecord {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> SiteState {
        if self.status.enabled {
            SiteState::Enabled
        } else {
            SiteState::CreatedDisabled
        }
    }
}

/// Состояние жизненного цикла сайта
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteState {
    Absent,
    CreatedDisabled,
    Enabled,
}

impl fmt::Display for SiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Absent => "absent",
            Self::CreatedDisabled => "disabled",
            Self::Enabled => "enabled",
        };
        f.write_str(label)
    }
}
