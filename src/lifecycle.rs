//! Жизненный цикл сайта: создание, включение, выключение, обновление и удаление.
//!
//! Все команды проходят через [`SiteManager::execute`]: проверка аргументов,
//! проверка прав, проверка внешних программ, блокировка и только затем сама
//! операция. Пропустить какой-либо шаг вызывающий код не может.

use std::{fs, path::PathBuf};

use chrono::Local;
use log::{debug, error, info, warn};

use crate::{
    backup::Backups,
    config::Settings,
    error::{SiteError, SiteResult},
    host::Host,
    lock,
    nginx::NginxSites,
    release::{Release, ReleaseId, ReleaseManager},
    report::{SiteRow, StatusReport},
    retry::RetryPolicy,
    security,
    site::{DbConnection, SiteLayout, SiteRecord, SiteSpec, SiteStatus},
    stack::{self, ProvisionArgs},
    store::StateStore,
    template::{self, Credentials},
    utils, validation,
};

const PASSWORD_LENGTH: usize = 16;

#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub spec: SiteSpec,
    /// Пароль пользователя БД; генерируется, если не задан
    pub db_password: Option<String>,
    pub force: bool,
    /// При `force` сохранить файлы существующего сайта в резервную копию
    pub backup_files: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveArgs {
    pub name: String,
    pub keep_database: bool,
    pub keep_files: bool,
}

/// Команда менеджера сайтов
#[derive(Debug, Clone)]
pub enum Command {
    Create(CreateArgs),
    Enable { name: String },
    Disable { name: String },
    Update { name: String, branch: Option<String> },
    Remove(RemoveArgs),
    Status { name: String },
    List,
    Backup { name: String },
    Rollback { name: String, release: Option<String> },
    Provision(ProvisionArgs),
}

impl Command {
    pub fn validate(&self) -> SiteResult<()> {
        match self {
            Self::Create(args) => {
                args.spec.validate()?;
                if let Some(password) = &args.db_password {
                    validation::check_password_strength(password)?;
                }
                Ok(())
            }
            Self::Enable { name }
            | Self::Disable { name }
            | Self::Status { name }
            | Self::Backup { name } => validation::validate_site_name(name),
            Self::Update { name, branch } => {
                validation::validate_site_name(name)?;
                if let Some(branch) = branch {
                    validation::validate_branch(branch)?;
                }
                Ok(())
            }
            Self::Remove(args) => validation::validate_site_name(&args.name),
            Self::Rollback { name, release } => {
                validation::validate_site_name(name)?;
                if let Some(release) = release {
                    release.parse::<ReleaseId>()?;
                }
                Ok(())
            }
            Self::List => Ok(()),
            Self::Provision(args) => args.validate(),
        }
    }

    /// Изменяет ли команда систему (такие команды требуют прав и блокировки)
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Status { .. } | Self::List)
    }

    fn required_commands(&self) -> Vec<&'static str> {
        match self {
            Self::Create(args) => {
                let mut commands = vec!["nginx", "php", "composer"];
                if args.spec.is_git() {
                    commands.push("git");
                }
                match args.spec.database.connection {
                    DbConnection::Mysql => commands.push("mysql"),
                    DbConnection::Pgsql => commands.extend(["sudo", "psql"]),
                    DbConnection::Sqlite => {}
                }
                commands
            }
            Self::Enable { .. } | Self::Disable { .. } | Self::Remove(_) => {
                vec!["nginx", "systemctl"]
            }
            Self::Update { .. } => vec!["git", "composer", "php", "systemctl"],
            Self::Rollback { .. } => vec!["systemctl"],
            Self::Provision(_) => vec!["apt-get", "dpkg", "systemctl"],
            Self::Backup { .. } | Self::Status { .. } | Self::List => Vec::new(),
        }
    }
}

/// Результат выполнения команды
#[derive(Debug)]
pub enum Outcome {
    Created {
        record: SiteRecord,
        credentials: Credentials,
    },
    Enabled(SiteRecord),
    Disabled(SiteRecord),
    Updated {
        record: SiteRecord,
        release: String,
        pruned: usize,
    },
    Removed {
        name: String,
        backup: Option<PathBuf>,
    },
    Status(Option<StatusReport>),
    Listed(Vec<SiteRecord>),
    BackedUp(PathBuf),
    RolledBack {
        record: SiteRecord,
        release: String,
    },
    Provisioned(Vec<String>),
}

// Что успело появиться при создании сайта и подлежит откату
#[derive(Debug, Default)]
struct CreateProgress {
    database_created: bool,
    config_written: bool,
}

pub struct SiteManager<H: Host> {
    settings: Settings,
    host: H,
    store: StateStore,
    nginx: NginxSites,
    backups: Backups,
}

impl<H: Host> SiteManager<H> {
    pub fn new(settings: Settings, host: H) -> Self {
        Self {
            store: StateStore::new(&settings.state_dir),
            nginx: NginxSites::new(&settings),
            backups: Backups::new(&settings),
            settings,
            host,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Выполняет команду по полному конвейеру проверок
    pub async fn execute(&self, command: Command) -> SiteResult<Outcome> {
        command.validate()?;

        if !command.is_mutating() {
            return self.run(command).await;
        }

        self.check_privileges()?;
        self.check_dependencies(&command)?;
        let _guard = lock::acquire(&self.settings.lock_file, self.settings.lock_timeout()).await?;

        self.run(command).await
    }

    pub(crate) async fn run(&self, command: Command) -> SiteResult<Outcome> {
        match command {
            Command::Create(args) => self.create(args).await,
            Command::Enable { name } => self.enable(&name).await.map(Outcome::Enabled),
            Command::Disable { name } => self.disable(&name).await.map(Outcome::Disabled),
            Command::Update { name, branch } => self.update(&name, branch).await,
            Command::Remove(args) => {
                let name = args.name.clone();
                let backup = self.remove(args).await?;
                Ok(Outcome::Removed { name, backup })
            }
            Command::Status { name } => self.status(&name).await.map(Outcome::Status),
            Command::List => self.store.list().map(Outcome::Listed),
            Command::Backup { name } => self.backup(&name).await.map(Outcome::BackedUp),
            Command::Rollback { name, release } => self.rollback(&name, release).await,
            Command::Provision(args) => stack::provision(&self.host, &args)
                .await
                .map(Outcome::Provisioned),
        }
    }

    fn check_privileges(&self) -> SiteResult<()> {
        if self.settings.require_root && !self.host.is_privileged() {
            return Err(SiteError::Permission(
                "команда должна выполняться от имени root (sudo)".to_string(),
            ));
        }
        Ok(())
    }

    fn check_dependencies(&self, command: &Command) -> SiteResult<()> {
        let missing: Vec<&str> = command
            .required_commands()
            .into_iter()
            .filter(|program| !self.host.command_exists(program))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SiteError::Dependency(missing.join(", ")))
        }
    }

    fn check_resources(&self) -> SiteResult<()> {
        let disk = self.host.free_disk_mb(&self.settings.sites_root)?;
        if disk < self.settings.min_free_disk_mb {
            return Err(SiteError::Resource(format!(
                "свободно {} МБ на диске, требуется не менее {} МБ",
                disk, self.settings.min_free_disk_mb
            )));
        }

        let memory = self.host.free_memory_mb()?;
        if memory < self.settings.min_free_memory_mb {
            return Err(SiteError::Resource(format!(
                "доступно {} МБ памяти, требуется не менее {} МБ",
                memory, self.settings.min_free_memory_mb
            )));
        }
        Ok(())
    }

    fn releases(&self) -> ReleaseManager<'_, H> {
        ReleaseManager::new(&self.host, RetryPolicy::from_settings(&self.settings.retry))
    }

    fn require(&self, name: &str) -> SiteResult<SiteRecord> {
        self.store
            .get(name)?
            .ok_or_else(|| SiteError::SiteNotFound(name.to_string()))
    }

    // Любой след сайта на диске считается существующим сайтом
    fn site_exists(&self, name: &str) -> bool {
        self.store.status_path(name).exists()
            || self.nginx.has_config(name)
            || self.nginx.is_enabled(name)
            || utils::path_present(&self.settings.site_dir(name))
    }

    async fn reload_php_fpm(&self, spec: &SiteSpec) {
        let service = spec.php_fpm_service();
        if let Err(e) = self.host.reload_service(&service).await {
            warn!("Не удалось перезагрузить {}: {}", service, e);
        }
    }

    async fn create(&self, args: CreateArgs) -> SiteResult<Outcome> {
        let CreateArgs {
            spec,
            db_password,
            force,
            backup_files,
        } = args;

        let exists = self.site_exists(&spec.name);
        if exists && !force {
            return Err(SiteError::Conflict(spec.name));
        }
        // Пересоздание начинается с удаления, поэтому ресурсы проверяются до него
        self.check_resources()?;

        if exists {
            warn!("Сайт {} уже существует и будет пересоздан", spec.name);
            self.remove(RemoveArgs {
                name: spec.name.clone(),
                keep_database: false,
                keep_files: backup_files,
            })
            .await?;
        }

        let credentials = Credentials {
            db_password: match db_password {
                Some(password) => password,
                None => security::generate_strong_password(PASSWORD_LENGTH)?,
            },
            app_key: security::generate_app_key(),
        };

        let layout = SiteLayout::resolve(&self.settings, &spec);
        fs::create_dir_all(&layout.site_dir).map_err(|e| SiteError::io(&layout.site_dir, e))?;
        info!("Создание сайта {} в {:?}", spec.name, layout.site_dir);

        let mut progress = CreateProgress::default();
        match self
            .build_site(&spec, &layout, &credentials, &mut progress)
            .await
        {
            Ok(record) => {
                info!("Сайт {} создан (выключен)", spec.name);
                Ok(Outcome::Created {
                    record,
                    credentials,
                })
            }
            Err(e) => {
                error!("Не удалось создать сайт {}: {}", spec.name, e);
                self.undo_create(&spec, &layout, &progress).await;
                Err(e)
            }
        }
    }

    async fn build_site(
        &self,
        spec: &SiteSpec,
        layout: &SiteLayout,
        credentials: &Credentials,
        progress: &mut CreateProgress,
    ) -> SiteResult<SiteRecord> {
        let rendered = template::render(spec, layout, credentials);
        let releases = self.releases();

        if spec.is_git() {
            releases.prepare_shared(layout)?;
        } else {
            self.host.create_skeleton(&layout.site_dir).await?;
        }

        utils::write_atomic(&layout.env_file, &rendered.env_file, Some(0o640))?;

        // Миграциям нужна база, поэтому она создаётся до первого релиза
        if spec.database.connection == DbConnection::Sqlite {
            let path = layout.sqlite_path();
            utils::write_atomic(&path, "", Some(0o660))?;
            debug!("Создан файл SQLite {:?}", path);
        } else {
            // База, оставленная `remove --keep-database`, используется повторно и
            // при откате не удаляется
            let existed = self.host.database_exists(&spec.database).await?;
            if existed {
                info!(
                    "База данных {} уже существует и будет использована",
                    spec.database.database
                );
            }
            self.host
                .create_database(&spec.database, &credentials.db_password)
                .await?;
            progress.database_created = !existed;
        }

        let current_release = match &spec.git_repo {
            Some(repo) => {
                let release = releases
                    .create_release(layout, repo, &spec.git_branch)
                    .await?;
                releases.promote(layout, &release)?;
                releases.prune(layout, self.settings.release_retention)?;
                Some(release.id)
            }
            None => {
                self.host.run_migrations(&layout.app_dir).await?;
                None
            }
        };

        self.host
            .assign_owner(&layout.site_dir, &self.settings.web_user)
            .await?;

        progress.config_written = true;
        self.nginx.write_config(&spec.name, &rendered.server_config)?;

        let now = Local::now();
        let record = SiteRecord {
            spec: spec.clone(),
            status: SiteStatus {
                enabled: false,
                config_valid: None,
                created_at: now,
                document_root: layout.document_root.clone(),
                config_sha256: template::config_digest(&rendered.server_config),
                last_deployed_at: current_release.as_ref().map(|_| now),
                current_release,
            },
        };
        self.store.put(&record)?;
        Ok(record)
    }

    // Откат в обратном порядке; ошибки только логируются
    async fn undo_create(&self, spec: &SiteSpec, layout: &SiteLayout, progress: &CreateProgress) {
        if progress.config_written {
            if let Err(e) = self.store.delete(&spec.name) {
                warn!("Откат: не удалось удалить запись {}: {}", spec.name, e);
            }
            if let Err(e) = self.nginx.remove_config(&spec.name) {
                warn!("Откат: не удалось удалить конфигурацию {}: {}", spec.name, e);
            }
        }
        if progress.database_created {
            if let Err(e) = self.host.drop_database(&spec.database).await {
                warn!("Откат: не удалось удалить базу данных {}: {}", spec.database.database, e);
            }
        }
        if let Err(e) = utils::remove_path(&layout.site_dir) {
            warn!("Откат: не удалось удалить {:?}: {}", layout.site_dir, e);
        }
        info!("Частично созданный сайт {} удалён", spec.name);
    }

    async fn enable(&self, name: &str) -> SiteResult<SiteRecord> {
        let mut record = self.require(name)?;
        if !self.nginx.has_config(name) {
            return Err(SiteError::Configuration(format!(
                "отсутствует файл {:?}",
                self.nginx.available_path(name)
            )));
        }

        let created = self.nginx.link(name)?;
        if let Err(e) = self.host.test_web_config().await {
            if created {
                self.nginx.unlink(name)?;
            }
            record.status.config_valid = Some(false);
            self.store.put(&record)?;
            return Err(e);
        }

        record.status.enabled = true;
        record.status.config_valid = Some(true);
        self.store.put(&record)?;

        self.host.reload_service("nginx").await?;
        info!("Сайт {} включён", name);
        Ok(record)
    }

    async fn disable(&self, name: &str) -> SiteResult<SiteRecord> {
        let mut record = self.require(name)?;

        if self.nginx.unlink(name)? {
            self.host.reload_service("nginx").await?;
            info!("Сайт {} выключен", name);
        } else {
            debug!("Сайт {} уже выключен", name);
        }

        if record.status.enabled {
            record.status.enabled = false;
            self.store.put(&record)?;
        }
        Ok(record)
    }

    async fn update(&self, name: &str, branch: Option<String>) -> SiteResult<Outcome> {
        let mut record = self.require(name)?;
        let repo = record
            .spec
            .git_repo
            .clone()
            .ok_or_else(|| SiteError::NotAGitSite(name.to_string()))?;
        self.check_resources()?;

        let branch = branch.unwrap_or_else(|| record.spec.git_branch.clone());
        let layout = SiteLayout::resolve(&self.settings, &record.spec);
        let releases = self.releases();

        let release = releases.create_release(&layout, &repo, &branch).await?;
        if let Err(e) = self
            .host
            .assign_owner(&release.path, &self.settings.web_user)
            .await
        {
            releases.discard(&release.path);
            return Err(e);
        }

        if let Err(e) = releases.promote(&layout, &release) {
            releases.discard(&release.path);
            return Err(e);
        }
        let pruned = match releases.prune(&layout, self.settings.release_retention) {
            Ok(pruned) => pruned.len(),
            Err(e) => {
                warn!("Не удалось удалить старые релизы {}: {}", name, e);
                0
            }
        };
        self.reload_php_fpm(&record.spec).await;

        record.status.current_release = Some(release.id.clone());
        record.status.last_deployed_at = Some(Local::now());
        self.store.put(&record)?;

        info!("Сайт {} обновлён до релиза {}", name, release.id);
        Ok(Outcome::Updated {
            record,
            release: release.id,
            pruned,
        })
    }

    /// Удаляет сайт; повторный запуск на частично удалённом сайте безопасен
    async fn remove(&self, args: RemoveArgs) -> SiteResult<Option<PathBuf>> {
        let RemoveArgs {
            name,
            keep_database,
            keep_files,
        } = args;

        let record = match self.store.get(&name) {
            Ok(record) => record,
            Err(e @ SiteError::CorruptRecord { .. }) => {
                warn!("{}; удаляем сайт без сведений о базе данных", e);
                None
            }
            Err(e) => return Err(e),
        };

        let site_dir = self.settings.site_dir(&name);
        if record.is_none() && !self.site_exists(&name) {
            return Err(SiteError::SiteNotFound(name));
        }

        info!("Удаление сайта {}", name);
        self.nginx.unlink(&name)?;
        self.nginx.remove_config(&name)?;
        if let Err(e) = self.host.reload_service("nginx").await {
            warn!("Не удалось перезагрузить nginx: {}", e);
        }

        let backup = if !utils::path_present(&site_dir) {
            None
        } else if keep_files {
            Some(self.backups.archive_files(&name, &site_dir)?)
        } else {
            utils::remove_path(&site_dir)?;
            None
        };

        if let Some(record) = &record {
            if keep_database {
                info!("База данных {} сохранена", record.spec.database.database);
            } else {
                self.host.drop_database(&record.spec.database).await?;
            }
        }

        self.store.delete(&name)?;
        info!("Сайт {} удалён", name);
        Ok(backup)
    }

    async fn status(&self, name: &str) -> SiteResult<Option<StatusReport>> {
        let Some(mut record) = self.store.get(name)? else {
            return Ok(None);
        };

        let mut current_commit = None;
        if record.spec.is_git() {
            let layout = SiteLayout::resolve(&self.settings, &record.spec);
            record.status.current_release = self
                .releases()
                .current(&layout)
                .map(|id| id.to_string());
            current_commit = Release::load(&layout.current_link()).map(|release| release.commit);
        }

        let database_active = match record.spec.database.connection.service_name() {
            Some(service) => Some(self.host.is_service_active(service).await),
            None => None,
        };
        let database_present = match record.spec.database.connection {
            DbConnection::Sqlite => Some(
                SiteLayout::resolve(&self.settings, &record.spec)
                    .sqlite_path()
                    .is_file(),
            ),
            _ => match self.host.database_exists(&record.spec.database).await {
                Ok(present) => Some(present),
                Err(e) => {
                    debug!("Не удалось проверить базу данных: {}", e);
                    None
                }
            },
        };

        Ok(Some(StatusReport {
            symlink_present: self.nginx.is_enabled(name),
            nginx_active: self.host.is_service_active("nginx").await,
            php_fpm_active: self
                .host
                .is_service_active(&record.spec.php_fpm_service())
                .await,
            database_active,
            database_present,
            current_commit,
            site: SiteRow::from(&record),
        }))
    }

    async fn backup(&self, name: &str) -> SiteResult<PathBuf> {
        let record = self.require(name)?;
        self.backups
            .backup_site(&self.host, &record, &self.settings.site_dir(name))
            .await
    }

    async fn rollback(&self, name: &str, release: Option<String>) -> SiteResult<Outcome> {
        let mut record = self.require(name)?;
        if !record.spec.is_git() {
            return Err(SiteError::NotAGitSite(name.to_string()));
        }

        let layout = SiteLayout::resolve(&self.settings, &record.spec);
        let releases = self.releases();

        let target = match release {
            Some(id) => id.parse::<ReleaseId>()?,
            None => {
                let ids = releases.list(&layout)?;
                let current = releases.current(&layout);
                ids.iter()
                    .position(|id| Some(id) == current.as_ref())
                    .and_then(|pos| pos.checked_sub(1))
                    .map(|pos| ids[pos].clone())
                    .ok_or_else(|| {
                        SiteError::Validation(format!("у сайта {} нет предыдущего релиза", name))
                    })?
            }
        };

        releases.promote_existing(&layout, &target)?;
        self.reload_php_fpm(&record.spec).await;

        record.status.current_release = Some(target.to_string());
        record.status.last_deployed_at = Some(Local::now());
        self.store.put(&record)?;

        info!("Сайт {} откатен на релиз {}", name, target);
        Ok(Outcome::RolledBack {
            record,
            release: target.to_string(),
        })
    }
}
