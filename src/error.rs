use std::path::{Path, PathBuf};

use thiserror::Error;

/// Ошибки жизненного цикла сайтов
///
/// Каждому варианту соответствует стабильный код выхода (см. [`SiteError::exit_code`]),
/// чтобы скрипты поверх утилиты могли различать классы ошибок.
#[derive(Error, Debug)]
pub enum SiteError {
    #[error("Ошибка валидации: {0}")]
    Validation(String),

    #[error("Сайт {0} уже существует (используйте --force для пересоздания)")]
    Conflict(String),

    #[error("Сайт {0} не найден")]
    SiteNotFound(String),

    #[error("Конфигурация Nginx не прошла проверку: {0}")]
    Configuration(String),

    #[error("Сайт {0} создан без git-репозитория, обновление невозможно")]
    NotAGitSite(String),

    #[error("Не удалось получить блокировку {path:?} за {waited_secs} с (держатель: pid {holder})")]
    LockTimeout {
        path: PathBuf,
        holder: i32,
        waited_secs: u64,
    },

    #[error("Не найдена необходимая программа: {0}")]
    Dependency(String),

    #[error("Недостаточно прав: {0}")]
    Permission(String),

    #[error("Команда {tool} завершилась с ошибкой (код {status}): {stderr}")]
    ExternalTool {
        tool: String,
        status: i32,
        stderr: String,
    },

    #[error("Недостаточно ресурсов: {0}")]
    Resource(String),

    #[error("Ошибка ввода-вывода для {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Повреждена запись состояния сайта {name}: {reason}")]
    CorruptRecord { name: String, reason: String },
}

impl SiteError {
    /// Оборачивает ошибку ввода-вывода вместе с путём
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Код выхода процесса для данного класса ошибки
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Dependency(_) => 2,
            Self::Permission(_) => 3,
            Self::Validation(_) => 4,
            Self::LockTimeout { .. } | Self::Conflict(_) => 5,
            Self::SiteNotFound(_)
            | Self::Configuration(_)
            | Self::NotAGitSite(_)
            | Self::ExternalTool { .. }
            | Self::Resource(_)
            | Self::Io { .. }
            | Self::CorruptRecord { .. } => 1,
        }
    }

    /// Ошибки внешних программ имеет смысл повторять, остальные нет
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalTool { .. })
    }
}

pub type SiteResult<T> = std::result::Result<T, SiteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable_per_class() {
        assert_eq!(SiteError::Validation("x".into()).exit_code(), 4);
        assert_eq!(SiteError::Conflict("blog".into()).exit_code(), 5);
        assert_eq!(SiteError::Dependency("nginx".into()).exit_code(), 2);
        assert_eq!(SiteError::Permission("root".into()).exit_code(), 3);
        let timeout = SiteError::LockTimeout {
            path: PathBuf::from("/tmp/lock"),
            holder: 42,
            waited_secs: 1,
        };
        assert_eq!(timeout.exit_code(), 5);
        assert_eq!(SiteError::NotAGitSite("blog".into()).exit_code(), 1);
    }

    #[test]
    fn external_tool_error_keeps_stderr() {
        let err = SiteError::ExternalTool {
            tool: "git".into(),
            status: 128,
            stderr: "fatal: repository not found".into(),
        };
        assert!(err.to_string().contains("fatal: repository not found"));
        assert!(err.is_retryable());
        assert!(!SiteError::Resource("disk".into()).is_retryable());
    }
}
