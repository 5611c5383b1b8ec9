use std::{path::PathBuf, process, time::Duration};

use anyhow::{Context, Result};
use clap::{error::ErrorKind, Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::ProgressBar;
use log::{debug, info};

mod backup;
mod config;
mod error;
mod host;
mod lifecycle;
mod lock;
mod logger;
mod nginx;
mod release;
mod report;
mod retry;
mod security;
mod site;
mod stack;
mod store;
mod template;
#[cfg(test)]
mod testing;
mod utils;
mod validation;

use config::Settings;
use error::SiteError;
use host::SystemHost;
use lifecycle::{Command, CreateArgs, Outcome, RemoveArgs, SiteManager};
use report::ListFormat;
use security::CommandRunner;
use site::{DbConnection, SiteSpec, SiteState};
use stack::ProvisionArgs;

#[derive(Parser)]
#[command(author, version, about = "Управление сайтами Laravel на сервере LEMP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Путь к файлу конфигурации
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Подробный вывод
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Создание сайта (выключенного)
    Create {
        /// Имя сайта: буквы, цифры и подчёркивание
        #[arg(long)]
        name: String,
        #[arg(long)]
        domain: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        php_version: Option<String>,
        #[arg(long, value_enum)]
        db_connection: Option<DbConnection>,
        /// Имя базы данных (по умолчанию совпадает с именем сайта)
        #[arg(long)]
        db_name: Option<String>,
        #[arg(long)]
        db_user: Option<String>,
        /// Пароль пользователя БД (по умолчанию генерируется)
        #[arg(long)]
        db_password: Option<String>,
        #[arg(long)]
        git_repo: Option<String>,
        #[arg(long)]
        git_branch: Option<String>,
        #[arg(long)]
        auto_update: bool,
        /// Конфигурация с HTTPS (сертификат Let's Encrypt)
        #[arg(long)]
        ssl: bool,
        /// Пересоздать существующий сайт
        #[arg(long)]
        force: bool,
        /// При пересоздании сохранить файлы старого сайта
        #[arg(long)]
        backup: bool,
    },
    /// Включение сайта в Nginx
    Enable {
        #[arg(long)]
        name: String,
    },
    /// Выключение сайта
    Disable {
        #[arg(long)]
        name: String,
    },
    /// Новый релиз из git-репозитория
    Update {
        #[arg(long)]
        name: String,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Удаление сайта
    Remove {
        #[arg(long)]
        name: String,
        #[arg(long)]
        keep_database: bool,
        /// Перенести файлы в резервную копию вместо удаления
        #[arg(long)]
        keep_files: bool,
        /// Не спрашивать подтверждение
        #[arg(long)]
        force: bool,
    },
    /// Состояние сайта и его служб
    Status {
        #[arg(long)]
        name: String,
    },
    /// Список сайтов
    List {
        #[arg(long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },
    /// Резервная копия файлов и базы данных
    Backup {
        #[arg(long)]
        name: String,
    },
    /// Возврат к предыдущему (или указанному) релизу
    Rollback {
        #[arg(long)]
        name: String,
        #[arg(long)]
        release: Option<String>,
    },
    /// Установка стека Nginx, PHP-FPM, БД
    Provision {
        #[arg(long)]
        php_version: Option<String>,
        #[arg(long, value_enum)]
        database: Option<DbConnection>,
        #[arg(long)]
        with_node: bool,
    },
}

impl Commands {
    fn into_command(self, settings: &Settings) -> Command {
        match self {
            Commands::Create {
                name,
                domain,
                port,
                php_version,
                db_connection,
                db_name,
                db_user,
                db_password,
                git_repo,
                git_branch,
                auto_update,
                ssl,
                force,
                backup,
            } => {
                let mut spec = SiteSpec::new(&name, &domain, settings);
                if let Some(port) = port {
                    spec.port = port;
                }
                if let Some(version) = php_version {
                    spec.php_version = version;
                }
                if let Some(connection) = db_connection {
                    spec.database.connection = connection;
                }
                if let Some(db_name) = db_name {
                    spec.database.database = db_name;
                }
                if let Some(db_user) = db_user {
                    spec.database.username = db_user;
                }
                if let Some(branch) = git_branch {
                    spec.git_branch = branch;
                }
                spec.git_repo = git_repo;
                spec.auto_update = auto_update;
                spec.ssl_enabled = ssl;

                Command::Create(CreateArgs {
                    spec,
                    db_password,
                    force,
                    backup_files: backup,
                })
            }
            Commands::Enable { name } => Command::Enable { name },
            Commands::Disable { name } => Command::Disable { name },
            Commands::Update { name, branch } => Command::Update { name, branch },
            Commands::Remove {
                name,
                keep_database,
                keep_files,
                ..
            } => Command::Remove(RemoveArgs {
                name,
                keep_database,
                keep_files,
            }),
            Commands::Status { name } => Command::Status { name },
            Commands::List { .. } => Command::List,
            Commands::Backup { name } => Command::Backup { name },
            Commands::Rollback { name, release } => Command::Rollback { name, release },
            Commands::Provision {
                php_version,
                database,
                with_node,
            } => Command::Provision(ProvisionArgs {
                php_version: php_version.unwrap_or_else(|| settings.default_php_version.clone()),
                database: database.unwrap_or(settings.default_db_connection),
                with_node,
            }),
        }
    }
}

fn confirm_remove(name: &str, keep_files: bool) -> Result<bool> {
    let prompt = if keep_files {
        format!("Удалить сайт {}? Файлы будут перенесены в резервную копию.", name)
    } else {
        format!("Удалить сайт {} вместе с файлами? Это действие необратимо.", name)
    };
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Не удалось получить подтверждение")
}

fn spinner(command: &Command) -> Option<ProgressBar> {
    let message = match command {
        Command::Create(args) => format!("Создание сайта {}...", args.spec.name),
        Command::Update { name, .. } => format!("Обновление сайта {}...", name),
        Command::Provision(_) => "Установка пакетов...".to_string(),
        _ => return None,
    };
    let bar = ProgressBar::new_spinner();
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(120));
    Some(bar)
}

fn print_outcome(outcome: Outcome, format: ListFormat, requested: &str) {
    match outcome {
        Outcome::Created {
            record,
            credentials,
        } => {
            logger::success(&format!(
                "Сайт {} создан: http://{}:{} (выключен, включите командой enable)",
                record.spec.name, record.spec.domain, record.spec.port
            ));
            logger::credentials("База данных", &record.spec.database.database);
            logger::credentials("Пользователь БД", &record.spec.database.username);
            logger::credentials("Пароль БД", &credentials.db_password);
            logger::credentials("APP_KEY", &credentials.app_key);
        }
        Outcome::Enabled(record) => {
            logger::success(&format!("Сайт {} включён", record.spec.name));
        }
        Outcome::Disabled(record) => {
            logger::success(&format!("Сайт {} выключен", record.spec.name));
        }
        Outcome::Updated {
            record,
            release,
            pruned,
        } => {
            logger::success(&format!(
                "Сайт {} обновлён, текущий релиз {} (удалено старых релизов: {})",
                record.spec.name, release, pruned
            ));
        }
        Outcome::Removed { name, backup } => {
            logger::success(&format!("Сайт {} удалён", name));
            if let Some(path) = backup {
                println!("Файлы сохранены в {}", path.display());
            }
        }
        Outcome::Status(Some(report)) => print!("{}", report::render_status(&report)),
        Outcome::Status(None) => {
            println!("Сайт {} не найден (состояние: {})", requested, SiteState::Absent)
        }
        Outcome::Listed(records) => {
            let rendered = report::render_list(&records, format);
            if rendered.ends_with('\n') {
                print!("{}", rendered);
            } else {
                println!("{}", rendered);
            }
        }
        Outcome::BackedUp(path) => {
            logger::success(&format!("Резервная копия создана: {}", path.display()));
        }
        Outcome::RolledBack { record, release } => {
            logger::success(&format!(
                "Сайт {} переключён на релиз {}",
                record.spec.name, release
            ));
        }
        Outcome::Provisioned(installed) => {
            if installed.is_empty() {
                logger::success("Все пакеты уже установлены");
            } else {
                logger::success(&format!("Установлено пакетов: {}", installed.len()));
                for package in installed {
                    println!("  - {}", package);
                }
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    let level = if cli.verbose {
        "debug"
    } else {
        settings.log_level.as_str()
    };
    logger::init(level)?;
    debug!("Настройки: {:?}", settings);

    let (format, requested) = match &cli.command {
        Commands::List { format } => (*format, String::new()),
        Commands::Status { name } => (ListFormat::Table, name.clone()),
        _ => (ListFormat::Table, String::new()),
    };

    if let Commands::Remove {
        name,
        keep_files,
        force: false,
        ..
    } = &cli.command
    {
        if !confirm_remove(name, *keep_files)? {
            info!("Удаление отменено");
            return Ok(());
        }
    }

    let command = cli.command.into_command(&settings);
    if command.is_mutating() {
        lock::release_on_signal(&settings.lock_file);
    }

    let provisioned = match &command {
        Command::Provision(args) => Some((args.php_version.clone(), args.database)),
        _ => None,
    };

    let host = SystemHost::new(CommandRunner::new(&settings.audit_log));
    let manager = SiteManager::new(settings.clone(), host);

    let bar = spinner(&command);
    let outcome = manager.execute(command).await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    print_outcome(outcome?, format, &requested);

    // Установленный стек становится значением по умолчанию для новых сайтов
    if let Some((php_version, database)) = provisioned {
        settings.default_php_version = php_version;
        settings.default_db_connection = database;
        settings.save(Settings::resolve_path(cli.config.as_deref()))?;
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenv::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 4,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            logger::failure(&format!("{:#}", e));
            e.downcast_ref::<SiteError>().map_or(1, SiteError::exit_code)
        }
    };
    process::exit(code);
}
