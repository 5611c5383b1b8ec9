use std::{
    env,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use rand::{rngs::OsRng, thread_rng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use uuid::Uuid;

use crate::error::{SiteError, SiteResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditLog {
    pub id: String,
    pub timestamp: DateTime<Local>,
    pub action: String,
    pub user: String,
    pub command: Option<String>,
    pub status: String,
    pub details: Option<String>,
}

impl AuditLog {
    pub fn new(
        action: &str,
        user: &str,
        command: Option<&str>,
        status: &str,
        details: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Local::now(),
            action: action.to_string(),
            user: user.to_string(),
            command: command.map(|s| s.to_string()),
            status: status.to_string(),
            details: details.map(|s| s.to_string()),
        }
    }
}

/// Записывает информацию аудита в журнал (одна JSON-строка на событие)
pub fn log_audit_event(audit_log: &AuditLog, audit_path: &Path) -> SiteResult<()> {
    if let Some(parent) = audit_path.parent() {
        fs::create_dir_all(parent).map_err(|e| SiteError::io(parent, e))?;
    }

    let log_json = serde_json::to_string(audit_log)
        .map_err(|e| SiteError::io(audit_path, std::io::Error::other(e)))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_path)
        .map_err(|e| SiteError::io(audit_path, e))?;

    writeln!(file, "{}", log_json).map_err(|e| SiteError::io(audit_path, e))?;

    debug!("Записан аудит: {} - {}", audit_log.action, audit_log.status);

    Ok(())
}

/// Имя оператора для журнала аудита
pub fn current_operator() -> String {
    env::var("SUDO_USER")
        .or_else(|_| env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Выполняет внешние команды и записывает каждую в журнал аудита
#[derive(Debug, Clone)]
pub struct CommandRunner {
    audit_path: PathBuf,
    operator: String,
    envs: Vec<(String, String)>,
}

impl CommandRunner {
    pub fn new(audit_path: impl Into<PathBuf>) -> Self {
        Self {
            audit_path: audit_path.into(),
            operator: current_operator(),
            envs: Vec::new(),
        }
    }

    /// Переменная окружения для всех запускаемых команд
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    /// Выполняет команду и возвращает её stdout
    ///
    /// Ненулевой код выхода превращается в [`SiteError::ExternalTool`] с stderr программы.
    pub async fn run(&self, command: &str, args: &[&str], action: &str) -> SiteResult<String> {
        self.run_in(command, args, None, action).await
    }

    /// То же, что [`CommandRunner::run`], но в указанной рабочей директории
    pub async fn run_in(
        &self,
        command: &str,
        args: &[&str],
        cwd: Option<&Path>,
        action: &str,
    ) -> SiteResult<String> {
        let full_command = format!("{} {}", command, args.join(" "));

        info!("Выполнение команды: {}", redact(&full_command));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SiteError::Dependency(command.to_string())
            } else {
                SiteError::ExternalTool {
                    tool: command.to_string(),
                    status: -1,
                    stderr: e.to_string(),
                }
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_status = output.status.code().unwrap_or(-1);

        let status = if output.status.success() {
            "success"
        } else {
            "error"
        };
        let details = if stderr.is_empty() {
            None
        } else {
            Some(stderr.as_str())
        };

        let audit_log = AuditLog::new(
            action,
            &self.operator,
            Some(&redact(&full_command)),
            status,
            details,
        );

        // Журнал аудита не должен ломать основную операцию
        if let Err(e) = log_audit_event(&audit_log, &self.audit_path) {
            warn!("Не удалось записать журнал аудита: {}", e);
        }

        if !output.status.success() {
            error!(
                "Команда завершилась с ошибкой (код {}): {}",
                exit_status, stderr
            );
            return Err(SiteError::ExternalTool {
                tool: command.to_string(),
                status: exit_status,
                stderr,
            });
        }

        debug!("Команда успешно выполнена: {}", redact(&full_command));

        Ok(stdout)
    }
}

/// Скрывает пароли в тексте команды перед записью в журналы
fn redact(command: &str) -> String {
    const MARKERS: [&str; 2] = ["IDENTIFIED BY '", "PASSWORD '"];

    let mut out = String::with_capacity(command.len());
    let mut rest = command;
    while let Some((pos, marker)) = MARKERS
        .iter()
        .filter_map(|marker| rest.find(marker).map(|pos| (pos, *marker)))
        .min_by_key(|(pos, _)| *pos)
    {
        let start = pos + marker.len();
        out.push_str(&rest[..start]);
        out.push_str("***");
        rest = &rest[start..];
        rest = rest.find('\'').map_or("", |end| &rest[end..]);
    }
    out.push_str(rest);
    out
}

/// Генерирует пароль из букв и цифр, содержащий все три класса символов
pub fn generate_strong_password(length: usize) -> SiteResult<String> {
    if length < 8 {
        return Err(SiteError::Validation(
            "длина пароля должна быть не менее 8 символов".to_string(),
        ));
    }

    let mut rng = thread_rng();
    loop {
        let password: String = (0..length)
            .map(|_| match rng.gen_range(0..3) {
                0 => rng.gen_range(b'A'..=b'Z') as char,
                1 => rng.gen_range(b'a'..=b'z') as char,
                _ => rng.gen_range(b'0'..=b'9') as char,
            })
            .collect();

        let has_uppercase = password.chars().any(|c| c.is_ascii_uppercase());
        let has_lowercase = password.chars().any(|c| c.is_ascii_lowercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());

        if has_uppercase && has_lowercase && has_digit {
            return Ok(password);
        }
    }
}

/// Генерирует APP_KEY Laravel: `base64:` + 32 случайных байта
pub fn generate_app_key() -> String {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    format!("base64:{}", STANDARD.encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generated_passwords_pass_strength_check() {
        for _ in 0..20 {
            let password = generate_strong_password(16).unwrap();
            assert_eq!(password.len(), 16);
            crate::validation::check_password_strength(&password).unwrap();
        }
        assert!(generate_strong_password(4).is_err());
    }

    #[test]
    fn app_key_is_32_bytes_of_base64() {
        let key = generate_app_key();
        let encoded = key.strip_prefix("base64:").unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap().len(), 32);
        assert_ne!(key, generate_app_key());
    }

    #[test]
    fn redact_hides_sql_passwords() {
        let cmd = "mysql -e CREATE USER 'blog'@'localhost' IDENTIFIED BY 'Secret123'; GRANT";
        let redacted = redact(cmd);
        assert!(!redacted.contains("Secret123"));
        assert!(redacted.contains("IDENTIFIED BY '***'; GRANT"));

        let pg = "psql -c CREATE ROLE blog LOGIN PASSWORD 'Secret123';";
        assert_eq!(redact(pg), "psql -c CREATE ROLE blog LOGIN PASSWORD '***';");
    }

    #[tokio::test]
    async fn runner_returns_stdout_and_writes_audit() {
        let dir = TempDir::new().unwrap();
        let audit = dir.path().join("audit/audit.log");
        let runner = CommandRunner::new(&audit);

        let out = runner.run("echo", &["hello"], "Проверка echo").await.unwrap();
        assert_eq!(out.trim(), "hello");

        let log = fs::read_to_string(&audit).unwrap();
        let entry: AuditLog = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(entry.status, "success");
        assert_eq!(entry.command.as_deref(), Some("echo hello"));
    }

    #[tokio::test]
    async fn runner_wraps_failures_with_stderr() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new(dir.path().join("audit.log"));

        let err = runner
            .run("sh", &["-c", "echo boom >&2; exit 3"], "Падающая команда")
            .await
            .unwrap_err();
        match err {
            SiteError::ExternalTool { tool, status, stderr } => {
                assert_eq!(tool, "sh");
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("неожиданная ошибка: {other:?}"),
        }

        let missing = runner
            .run("definitely-not-a-real-binary", &[], "Отсутствующая программа")
            .await
            .unwrap_err();
        assert!(matches!(missing, SiteError::Dependency(_)));
    }
}
