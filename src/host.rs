//! Внешние участники: пакетный менеджер, systemd, Nginx, СУБД, git и инструменты сборки.
//!
//! [`Host`] описывает всё, что менеджер сайтов делает с системой через внешние
//! программы. [`SystemHost`] выполняет реальные команды через журнал аудита.

use std::{fs, path::Path};

use log::{debug, info};

use crate::{
    error::{SiteError, SiteResult},
    security::CommandRunner,
    site::{DatabaseConfig, DbConnection},
    utils,
};

// Привилегии пользователя приложения: ровно одна база, без администрирования
const MYSQL_APP_PRIVILEGES: &str =
    "SELECT, INSERT, UPDATE, DELETE, CREATE, ALTER, INDEX, DROP, REFERENCES, CREATE TEMPORARY TABLES, LOCK TABLES";

#[allow(async_fn_in_trait)]
pub trait Host {
    // Окружение
    fn is_privileged(&self) -> bool;
    fn command_exists(&self, program: &str) -> bool;
    fn free_disk_mb(&self, path: &Path) -> SiteResult<u64>;
    fn free_memory_mb(&self) -> SiteResult<u64>;

    // Службы и Nginx
    async fn test_web_config(&self) -> SiteResult<()>;
    async fn reload_service(&self, service: &str) -> SiteResult<()>;
    async fn enable_service(&self, service: &str) -> SiteResult<()>;
    async fn is_service_active(&self, service: &str) -> bool;

    // Пакеты
    async fn update_package_index(&self) -> SiteResult<()>;
    async fn is_package_installed(&self, package: &str) -> SiteResult<bool>;
    async fn install_package(&self, package: &str) -> SiteResult<()>;

    // Базы данных
    async fn create_database(&self, db: &DatabaseConfig, password: &str) -> SiteResult<()>;
    async fn drop_database(&self, db: &DatabaseConfig) -> SiteResult<()>;
    async fn database_exists(&self, db: &DatabaseConfig) -> SiteResult<bool>;
    async fn dump_database(&self, db: &DatabaseConfig, target: &Path) -> SiteResult<()>;

    // Код приложения
    /// Клонирует ветку и возвращает хеш коммита
    async fn clone_repository(&self, url: &str, branch: &str, target: &Path)
        -> SiteResult<String>;
    async fn create_skeleton(&self, target: &Path) -> SiteResult<()>;
    async fn install_dependencies(&self, app_dir: &Path) -> SiteResult<()>;
    async fn build_assets(&self, app_dir: &Path) -> SiteResult<()>;
    async fn run_migrations(&self, app_dir: &Path) -> SiteResult<()>;
    async fn assign_owner(&self, path: &Path, user: &str) -> SiteResult<()>;
}

/// Реальная система: команды выполняются через [`CommandRunner`]
pub struct SystemHost {
    runner: CommandRunner,
}

impl SystemHost {
    pub fn new(runner: CommandRunner) -> Self {
        let runner = runner
            .with_env("COMPOSER_ALLOW_SUPERUSER", "1")
            .with_env("COMPOSER_NO_INTERACTION", "1")
            .with_env("DEBIAN_FRONTEND", "noninteractive");
        Self { runner }
    }

    async fn mysql(&self, sql: &str, action: &str) -> SiteResult<String> {
        self.runner.run("mysql", &["-N", "-B", "-e", sql], action).await
    }

    async fn psql(&self, sql: &str, action: &str) -> SiteResult<String> {
        self.runner
            .run(
                "sudo",
                &["-u", "postgres", "psql", "-v", "ON_ERROR_STOP=1", "-tA", "-c", sql],
                action,
            )
            .await
    }

    async fn artisan(&self, app_dir: &Path, args: &[&str], action: &str) -> SiteResult<()> {
        if !app_dir.join("artisan").exists() {
            debug!("В {:?} нет artisan, пропускаем: {}", app_dir, action);
            return Ok(());
        }
        let mut full = vec!["artisan"];
        full.extend_from_slice(args);
        self.runner.run_in("php", &full, Some(app_dir), action).await?;
        Ok(())
    }
}

impl Host for SystemHost {
    fn is_privileged(&self) -> bool {
        utils::is_root()
    }

    fn command_exists(&self, program: &str) -> bool {
        utils::command_exists(program)
    }

    fn free_disk_mb(&self, path: &Path) -> SiteResult<u64> {
        utils::free_disk_mb(path)
    }

    fn free_memory_mb(&self) -> SiteResult<u64> {
        utils::free_memory_mb()
    }

    async fn test_web_config(&self) -> SiteResult<()> {
        match self
            .runner
            .run("nginx", &["-t"], "Проверка конфигурации Nginx")
            .await
        {
            Ok(_) => Ok(()),
            Err(SiteError::ExternalTool { stderr, .. }) => Err(SiteError::Configuration(stderr)),
            Err(e) => Err(e),
        }
    }

    async fn reload_service(&self, service: &str) -> SiteResult<()> {
        self.runner
            .run(
                "systemctl",
                &["reload", service],
                &format!("Перезагрузка службы {}", service),
            )
            .await?;
        Ok(())
    }

    async fn enable_service(&self, service: &str) -> SiteResult<()> {
        self.runner
            .run(
                "systemctl",
                &["enable", "--now", service],
                &format!("Включение службы {}", service),
            )
            .await?;
        Ok(())
    }

    async fn is_service_active(&self, service: &str) -> bool {
        self.runner
            .run(
                "systemctl",
                &["is-active", "--quiet", service],
                &format!("Проверка службы {}", service),
            )
            .await
            .is_ok()
    }

    async fn update_package_index(&self) -> SiteResult<()> {
        info!("Обновление списка пакетов...");
        self.runner
            .run("apt-get", &["update"], "Обновление списка пакетов")
            .await?;
        Ok(())
    }

    async fn is_package_installed(&self, package: &str) -> SiteResult<bool> {
        match self
            .runner
            .run(
                "dpkg",
                &["-s", package],
                &format!("Проверка пакета {}", package),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(SiteError::ExternalTool { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn install_package(&self, package: &str) -> SiteResult<()> {
        self.runner
            .run(
                "apt-get",
                &["install", "-y", package],
                &format!("Установка пакета {}", package),
            )
            .await?;
        Ok(())
    }

    async fn create_database(&self, db: &DatabaseConfig, password: &str) -> SiteResult<()> {
        let action = format!("Создание базы данных {}", db.database);
        match db.connection {
            DbConnection::Mysql => {
                let sql = format!(
                    "CREATE DATABASE IF NOT EXISTS `{db}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci; \
                     CREATE USER IF NOT EXISTS '{user}'@'localhost' IDENTIFIED BY '{password}'; \
                     ALTER USER '{user}'@'localhost' IDENTIFIED BY '{password}'; \
                     GRANT {privileges} ON `{db}`.* TO '{user}'@'localhost'; \
                     FLUSH PRIVILEGES;",
                    db = db.database,
                    user = db.username,
                    password = password,
                    privileges = MYSQL_APP_PRIVILEGES,
                );
                self.mysql(&sql, &action).await?;
            }
            DbConnection::Pgsql => {
                let role_exists = self
                    .psql(
                        &format!("SELECT 1 FROM pg_roles WHERE rolname='{}'", db.username),
                        "Проверка роли PostgreSQL",
                    )
                    .await?;
                if role_exists.trim() != "1" {
                    self.psql(
                        &format!(
                            "CREATE ROLE {} LOGIN PASSWORD '{}';",
                            db.username, password
                        ),
                        &format!("Создание роли {}", db.username),
                    )
                    .await?;
                } else {
                    // Роль осталась от прежнего сайта: пароль должен совпасть с новым .env
                    self.psql(
                        &format!("ALTER ROLE {} WITH LOGIN PASSWORD '{}';", db.username, password),
                        &format!("Смена пароля роли {}", db.username),
                    )
                    .await?;
                }
                if self.database_exists(db).await? {
                    debug!("База данных {} уже существует", db.database);
                } else {
                    self.runner
                        .run(
                            "sudo",
                            &["-u", "postgres", "createdb", "-O", &db.username, &db.database],
                            &action,
                        )
                        .await?;
                }
                self.psql(
                    &format!("REVOKE ALL ON DATABASE {} FROM PUBLIC;", db.database),
                    "Ограничение доступа к базе данных",
                )
                .await?;
            }
            DbConnection::Sqlite => {
                debug!("SQLite не требует сервера БД");
            }
        }
        Ok(())
    }

    async fn drop_database(&self, db: &DatabaseConfig) -> SiteResult<()> {
        let action = format!("Удаление базы данных {}", db.database);
        match db.connection {
            DbConnection::Mysql => {
                let sql = format!(
                    "DROP DATABASE IF EXISTS `{}`; DROP USER IF EXISTS '{}'@'localhost';",
                    db.database, db.username
                );
                self.mysql(&sql, &action).await?;
            }
            DbConnection::Pgsql => {
                self.runner
                    .run(
                        "sudo",
                        &["-u", "postgres", "dropdb", "--if-exists", &db.database],
                        &action,
                    )
                    .await?;
                self.psql(
                    &format!("DROP ROLE IF EXISTS {};", db.username),
                    &format!("Удаление роли {}", db.username),
                )
                .await?;
            }
            DbConnection::Sqlite => {}
        }
        Ok(())
    }

    async fn database_exists(&self, db: &DatabaseConfig) -> SiteResult<bool> {
        let action = format!("Проверка базы данных {}", db.database);
        match db.connection {
            DbConnection::Mysql => {
                let out = self
                    .mysql(&format!("SHOW DATABASES LIKE '{}'", db.database), &action)
                    .await?;
                Ok(out.lines().any(|line| line.trim() == db.database))
            }
            DbConnection::Pgsql => {
                let out = self
                    .psql(
                        &format!("SELECT 1 FROM pg_database WHERE datname='{}'", db.database),
                        &action,
                    )
                    .await?;
                Ok(out.trim() == "1")
            }
            DbConnection::Sqlite => Ok(false),
        }
    }

    async fn dump_database(&self, db: &DatabaseConfig, target: &Path) -> SiteResult<()> {
        let action = format!("Резервная копия базы данных {}", db.database);
        let dump = match db.connection {
            DbConnection::Mysql => {
                self.runner
                    .run("mysqldump", &["--single-transaction", &db.database], &action)
                    .await?
            }
            DbConnection::Pgsql => {
                self.runner
                    .run("sudo", &["-u", "postgres", "pg_dump", &db.database], &action)
                    .await?
            }
            DbConnection::Sqlite => return Ok(()),
        };
        fs::write(target, dump).map_err(|e| SiteError::io(target, e))
    }

    async fn clone_repository(
        &self,
        url: &str,
        branch: &str,
        target: &Path,
    ) -> SiteResult<String> {
        let target_str = target.to_string_lossy();
        self.runner
            .run(
                "git",
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--single-branch",
                    "--branch",
                    branch,
                    url,
                    &target_str,
                ],
                &format!("Клонирование {} ({})", url, branch),
            )
            .await?;

        let commit = self
            .runner
            .run(
                "git",
                &["-C", &target_str, "rev-parse", "HEAD"],
                "Определение коммита",
            )
            .await?;
        Ok(commit.trim().to_string())
    }

    async fn create_skeleton(&self, target: &Path) -> SiteResult<()> {
        let target_str = target.to_string_lossy();
        self.runner
            .run(
                "composer",
                &[
                    "create-project",
                    "--prefer-dist",
                    "--no-interaction",
                    "laravel/laravel",
                    &target_str,
                ],
                "Создание каркаса Laravel",
            )
            .await?;
        Ok(())
    }

    async fn install_dependencies(&self, app_dir: &Path) -> SiteResult<()> {
        self.runner
            .run_in(
                "composer",
                &["install", "--no-dev", "--optimize-autoloader", "--no-interaction"],
                Some(app_dir),
                "Установка зависимостей Composer",
            )
            .await?;
        Ok(())
    }

    async fn build_assets(&self, app_dir: &Path) -> SiteResult<()> {
        if app_dir.join("package.json").exists() {
            let install = if app_dir.join("package-lock.json").exists() {
                "ci"
            } else {
                "install"
            };
            self.runner
                .run_in("npm", &[install], Some(app_dir), "Установка npm-зависимостей")
                .await?;
            self.runner
                .run_in("npm", &["run", "build"], Some(app_dir), "Сборка фронтенда")
                .await?;
        }

        self.artisan(app_dir, &["config:cache"], "Кеширование конфигурации").await?;
        self.artisan(app_dir, &["route:cache"], "Кеширование маршрутов").await?;
        self.artisan(app_dir, &["view:cache"], "Кеширование шаблонов").await
    }

    async fn run_migrations(&self, app_dir: &Path) -> SiteResult<()> {
        self.artisan(app_dir, &["migrate", "--force"], "Миграции базы данных").await
    }

    async fn assign_owner(&self, path: &Path, user: &str) -> SiteResult<()> {
        let owner = format!("{}:{}", user, user);
        self.runner
            .run(
                "chown",
                &["-R", &owner, &path.to_string_lossy()],
                &format!("Изменение владельца на {} для {:?}", owner, path),
            )
            .await?;
        Ok(())
    }
}
