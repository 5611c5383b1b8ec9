use std::{
    collections::HashMap,
    fmt::Write as _,
    fs,
    io::ErrorKind,
    path::PathBuf,
};

use chrono::{DateTime, Local};
use log::{debug, warn};

use crate::{
    error::{SiteError, SiteResult},
    site::{DatabaseConfig, SiteRecord, SiteSpec, SiteStatus},
    utils,
};

const STATUS_FILE: &str = "status.env";
const SUMMARY_FILE: &str = "summary.txt";

/// Хранилище состояния: по директории на сайт с `status.env` и `summary.txt`
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn site_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn status_path(&self, name: &str) -> PathBuf {
        self.site_dir(name).join(STATUS_FILE)
    }

    pub fn summary_path(&self, name: &str) -> PathBuf {
        self.site_dir(name).join(SUMMARY_FILE)
    }

    pub fn get(&self, name: &str) -> SiteResult<Option<SiteRecord>> {
        let path = self.status_path(name);
        if !path.exists() {
            return Ok(None);
        }

        // Без переменных окружения: запись только разбирается
        #[allow(deprecated)]
        let iter = dotenv::from_path_iter(&path).map_err(|e| SiteError::CorruptRecord {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let mut values = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| SiteError::CorruptRecord {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            values.insert(key, value);
        }

        decode(name, &values).map(Some)
    }

    /// Сохраняет запись атомарно (временный файл + rename) и обновляет сводку
    pub fn put(&self, record: &SiteRecord) -> SiteResult<()> {
        let name = record.name();
        let encoded = encode(record)?;

        utils::write_atomic(&self.status_path(name), &encoded, Some(0o600))?;
        utils::write_atomic(&self.summary_path(name), &summary(record), Some(0o644))?;

        debug!("Состояние сайта {} сохранено", name);
        Ok(())
    }

    /// Удаляет запись; возвращает `false`, если её не было
    pub fn delete(&self, name: &str) -> SiteResult<bool> {
        utils::remove_path(&self.site_dir(name))
    }

    /// Все записи, отсортированные по имени
    pub fn list(&self) -> SiteResult<Vec<SiteRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SiteError::io(&self.dir, e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(STATUS_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            match self.get(&name) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Пропускаем запись {}: {}", name, e),
            }
        }
        Ok(records)
    }
}

fn quote(key: &str, value: &str) -> SiteResult<String> {
    if value.contains('\'') || value.contains('\n') {
        return Err(SiteError::Validation(format!(
            "значение {} содержит недопустимые символы",
            key
        )));
    }
    Ok(format!("{}='{}'\n", key, value))
}

fn encode(record: &SiteRecord) -> SiteResult<String> {
    let spec = &record.spec;
    let status = &record.status;

    let config_valid = match status.config_valid {
        Some(true) => "true",
        Some(false) => "false",
        None => "unknown",
    };

    let pairs: [(&str, String); 18] = [
        ("SITE_NAME", spec.name.clone()),
        ("DOMAIN", spec.domain.clone()),
        ("PORT", spec.port.to_string()),
        ("PHP_VERSION", spec.php_version.clone()),
        ("DB_CONNECTION", spec.database.connection.to_string()),
        ("DB_DATABASE", spec.database.database.clone()),
        ("DB_USERNAME", spec.database.username.clone()),
        ("GIT_REPO", spec.git_repo.clone().unwrap_or_default()),
        ("GIT_BRANCH", spec.git_branch.clone()),
        ("AUTO_UPDATE", spec.auto_update.to_string()),
        ("SSL_ENABLED", spec.ssl_enabled.to_string()),
        ("ENABLED", status.enabled.to_string()),
        ("CONFIG_VALID", config_valid.to_string()),
        ("CREATED_AT", status.created_at.to_rfc3339()),
        ("DOCUMENT_ROOT", status.document_root.display().to_string()),
        ("CONFIG_SHA256", status.config_sha256.clone()),
        (
            "CURRENT_RELEASE",
            status.current_release.clone().unwrap_or_default(),
        ),
        (
            "LAST_DEPLOYED_AT",
            status
                .last_deployed_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        ),
    ];

    let mut out = String::from("# site_manager status record\n");
    for (key, value) in &pairs {
        out.push_str(&quote(key, value)?);
    }
    Ok(out)
}

fn decode(name: &str, values: &HashMap<String, String>) -> SiteResult<SiteRecord> {
    let corrupt = |reason: String| SiteError::CorruptRecord {
        name: name.to_string(),
        reason,
    };

    let required = |key: &str| -> SiteResult<String> {
        values
            .get(key)
            .cloned()
            .ok_or_else(|| corrupt(format!("нет ключа {}", key)))
    };
    let optional = |key: &str| -> Option<String> {
        values.get(key).filter(|value| !value.is_empty()).cloned()
    };
    let flag = |key: &str| -> SiteResult<bool> {
        match required(key)?.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(corrupt(format!("{}: ожидалось true/false, получено {}", key, other))),
        }
    };
    let timestamp = |key: &str, value: &str| -> SiteResult<DateTime<Local>> {
        DateTime::parse_from_rfc3339(value)
            .map(|at| at.with_timezone(&Local))
            .map_err(|e| corrupt(format!("{}: {}", key, e)))
    };

    let stored_name = required("SITE_NAME")?;
    if stored_name != name {
        return Err(corrupt(format!("запись принадлежит сайту {}", stored_name)));
    }

    let port = required("PORT")?
        .parse::<u16>()
        .map_err(|e| corrupt(format!("PORT: {}", e)))?;

    let config_valid = match required("CONFIG_VALID")?.as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    };

    let last_deployed_at = match optional("LAST_DEPLOYED_AT") {
        Some(value) => Some(timestamp("LAST_DEPLOYED_AT", &value)?),
        None => None,
    };

    Ok(SiteRecord {
        spec: SiteSpec {
            name: stored_name,
            domain: required("DOMAIN")?,
            port,
            php_version: required("PHP_VERSION")?,
            database: DatabaseConfig {
                connection: required("DB_CONNECTION")?
                    .parse()
                    .map_err(|e: SiteError| corrupt(e.to_string()))?,
                database: required("DB_DATABASE")?,
                username: required("DB_USERNAME")?,
            },
            git_repo: optional("GIT_REPO"),
            git_branch: required("GIT_BRANCH")?,
            auto_update: flag("AUTO_UPDATE")?,
            ssl_enabled: flag("SSL_ENABLED")?,
        },
        status: SiteStatus {
            enabled: flag("ENABLED")?,
            config_valid,
            created_at: timestamp("CREATED_AT", &required("CREATED_AT")?)?,
            document_root: PathBuf::from(required("DOCUMENT_ROOT")?),
            config_sha256: required("CONFIG_SHA256")?,
            current_release: optional("CURRENT_RELEASE"),
            last_deployed_at,
        },
    })
}

/// Человекочитаемая сводка по сайту
fn summary(record: &SiteRecord) -> String {
    let spec = &record.spec;
    let status = &record.status;

    let mut out = String::new();
    let _ = writeln!(out, "Сайт:             {}", spec.name);
    let _ = writeln!(out, "Домен:            {}", spec.domain);
    let _ = writeln!(out, "Порт:             {}", spec.port);
    let _ = writeln!(out, "PHP:              {}", spec.php_version);
    let _ = writeln!(out, "Корень документов: {}", status.document_root.display());
    let _ = writeln!(
        out,
        "База данных:      {} ({}, пользователь {})",
        spec.database.database, spec.database.connection, spec.database.username
    );
    if let Some(repo) = &spec.git_repo {
        let _ = writeln!(out, "Репозиторий:      {} ({})", repo, spec.git_branch);
        let _ = writeln!(
            out,
            "Текущий релиз:    {}",
            status.current_release.as_deref().unwrap_or("-")
        );
    }
    let _ = writeln!(out, "SSL:              {}", if spec.ssl_enabled { "да" } else { "нет" });
    let _ = writeln!(out, "Включён:          {}", if status.enabled { "да" } else { "нет" });
    let _ = writeln!(
        out,
        "Создан:           {}",
        status.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    out
}
