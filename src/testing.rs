//! Подменная система для тестов: всё состояние в памяти, файлы во временной директории.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    config::Settings,
    error::{SiteError, SiteResult},
    host::Host,
    site::{DatabaseConfig, DbConnection},
};

#[derive(Default)]
struct FakeState {
    privileged: bool,
    missing_commands: BTreeSet<String>,
    free_disk_mb: u64,
    free_memory_mb: u64,
    databases: BTreeSet<String>,
    passwords: BTreeMap<String, String>,
    packages: BTreeSet<String>,
    active_services: BTreeSet<String>,
    reloads: BTreeMap<String, usize>,
    failing_reloads: bool,
    failing_builds: bool,
    failing_clones: usize,
    clone_attempts: usize,
    clones: usize,
}

pub struct FakeHost {
    enabled_dir: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new(settings: &Settings) -> Self {
        Self {
            enabled_dir: settings.nginx_enabled_dir.clone(),
            state: Mutex::new(FakeState {
                privileged: true,
                free_disk_mb: 100_000,
                free_memory_mb: 8_192,
                ..FakeState::default()
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.with(|s| s.privileged = privileged);
    }

    pub fn remove_command(&self, program: &str) {
        self.with(|s| s.missing_commands.insert(program.to_string()));
    }

    pub fn set_free_disk_mb(&self, mb: u64) {
        self.with(|s| s.free_disk_mb = mb);
    }

    pub fn fail_builds(&self, fail: bool) {
        self.with(|s| s.failing_builds = fail);
    }

    pub fn fail_reloads(&self, fail: bool) {
        self.with(|s| s.failing_reloads = fail);
    }

    pub fn fail_next_clones(&self, count: usize) {
        self.with(|s| s.failing_clones = count);
    }

    pub fn clone_attempts(&self) -> usize {
        self.with(|s| s.clone_attempts)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.with(|s| s.databases.contains(name))
    }

    pub fn db_password(&self, user: &str) -> Option<String> {
        self.with(|s| s.passwords.get(user).cloned())
    }

    pub fn reloads(&self, service: &str) -> usize {
        self.with(|s| s.reloads.get(service).copied().unwrap_or(0))
    }

    pub fn is_installed(&self, package: &str) -> bool {
        self.with(|s| s.packages.contains(package))
    }

    pub fn mark_installed(&self, package: &str) {
        self.with(|s| s.packages.insert(package.to_string()));
    }

    pub fn start_service(&self, service: &str) {
        self.with(|s| s.active_services.insert(service.to_string()));
    }
}

fn tool_error(tool: &str, stderr: &str) -> SiteError {
    SiteError::ExternalTool {
        tool: tool.to_string(),
        status: 1,
        stderr: stderr.to_string(),
    }
}

fn write_app(target: &Path) -> SiteResult<()> {
    for dir in ["public", "storage/logs", "database"] {
        let path = target.join(dir);
        fs::create_dir_all(&path).map_err(|e| SiteError::io(&path, e))?;
    }
    for (file, contents) in [
        ("artisan", "#!/usr/bin/env php\n"),
        ("composer.json", "{\"name\": \"laravel/laravel\"}\n"),
        ("public/index.php", "<?php\n"),
    ] {
        let path = target.join(file);
        fs::write(&path, contents).map_err(|e| SiteError::io(&path, e))?;
    }
    Ok(())
}

impl Host for FakeHost {
    fn is_privileged(&self) -> bool {
        self.with(|s| s.privileged)
    }

    fn command_exists(&self, program: &str) -> bool {
        self.with(|s| !s.missing_commands.contains(program))
    }

    fn free_disk_mb(&self, _path: &Path) -> SiteResult<u64> {
        Ok(self.with(|s| s.free_disk_mb))
    }

    fn free_memory_mb(&self) -> SiteResult<u64> {
        Ok(self.with(|s| s.free_memory_mb))
    }

    // Как `nginx -t`: проверяются все включённые сайты
    async fn test_web_config(&self) -> SiteResult<()> {
        let Ok(entries) = fs::read_dir(&self.enabled_dir) else {
            return Ok(());
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let contents = fs::read_to_string(entry.path()).unwrap_or_default();
            if contents.contains("syntax error") {
                return Err(SiteError::Configuration(format!(
                    "nginx: [emerg] unexpected \"}}\" in {}",
                    entry.path().display()
                )));
            }
        }
        Ok(())
    }

    async fn reload_service(&self, service: &str) -> SiteResult<()> {
        self.with(|s| {
            if s.failing_reloads {
                return Err(tool_error("systemctl", "Job for reload failed"));
            }
            *s.reloads.entry(service.to_string()).or_default() += 1;
            Ok(())
        })
    }

    async fn enable_service(&self, service: &str) -> SiteResult<()> {
        self.start_service(service);
        Ok(())
    }

    async fn is_service_active(&self, service: &str) -> bool {
        self.with(|s| s.active_services.contains(service))
    }

    async fn update_package_index(&self) -> SiteResult<()> {
        Ok(())
    }

    async fn is_package_installed(&self, package: &str) -> SiteResult<bool> {
        Ok(self.is_installed(package))
    }

    async fn install_package(&self, package: &str) -> SiteResult<()> {
        self.mark_installed(package);
        Ok(())
    }

    // Как `CREATE ... IF NOT EXISTS` + `ALTER USER`: база сохраняется, пароль меняется
    async fn create_database(&self, db: &DatabaseConfig, password: &str) -> SiteResult<()> {
        if db.connection != DbConnection::Sqlite {
            self.with(|s| {
                s.databases.insert(db.database.clone());
                s.passwords.insert(db.username.clone(), password.to_string());
            });
        }
        Ok(())
    }

    async fn drop_database(&self, db: &DatabaseConfig) -> SiteResult<()> {
        self.with(|s| s.databases.remove(&db.database));
        Ok(())
    }

    async fn database_exists(&self, db: &DatabaseConfig) -> SiteResult<bool> {
        Ok(self.has_database(&db.database))
    }

    async fn dump_database(&self, db: &DatabaseConfig, target: &Path) -> SiteResult<()> {
        if db.connection == DbConnection::Sqlite {
            return Ok(());
        }
        fs::write(target, format!("-- dump of {}\n", db.database))
            .map_err(|e| SiteError::io(target, e))
    }

    async fn clone_repository(
        &self,
        _url: &str,
        _branch: &str,
        target: &Path,
    ) -> SiteResult<String> {
        let commit = self.with(|s| {
            s.clone_attempts += 1;
            if s.failing_clones > 0 {
                s.failing_clones -= 1;
                return Err(tool_error("git", "fatal: unable to access repository"));
            }
            s.clones += 1;
            Ok(format!("{:040x}", s.clones))
        })?;
        write_app(target)?;
        Ok(commit)
    }

    async fn create_skeleton(&self, target: &Path) -> SiteResult<()> {
        write_app(target)
    }

    async fn install_dependencies(&self, app_dir: &Path) -> SiteResult<()> {
        let vendor = app_dir.join("vendor");
        fs::create_dir_all(&vendor).map_err(|e| SiteError::io(&vendor, e))
    }

    async fn build_assets(&self, _app_dir: &Path) -> SiteResult<()> {
        if self.with(|s| s.failing_builds) {
            return Err(tool_error("npm", "npm ERR! build failed"));
        }
        Ok(())
    }

    async fn run_migrations(&self, _app_dir: &Path) -> SiteResult<()> {
        Ok(())
    }

    async fn assign_owner(&self, _path: &Path, _user: &str) -> SiteResult<()> {
        Ok(())
    }
}
