//! Установка стека LEMP: Nginx, PHP-FPM, сервер БД, Composer, git и (по желанию) Node.js.

use log::{debug, info};

use crate::{error::SiteResult, host::Host, site::DbConnection, validation};

// Расширения PHP, которые нужны Laravel
const PHP_EXTENSIONS: &[&str] = &[
    "fpm", "cli", "common", "mbstring", "xml", "curl", "zip", "bcmath", "intl", "gd",
];

const TOOLS: &[&str] = &["nginx", "composer", "git", "unzip", "curl"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionArgs {
    pub php_version: String,
    pub database: DbConnection,
    pub with_node: bool,
}

impl ProvisionArgs {
    pub fn validate(&self) -> SiteResult<()> {
        validation::validate_php_version(&self.php_version)
    }

    /// Пакеты в порядке установки
    pub fn packages(&self) -> Vec<String> {
        let php = format!("php{}", self.php_version);
        let mut packages: Vec<String> = TOOLS.iter().map(|p| p.to_string()).collect();

        packages.extend(PHP_EXTENSIONS.iter().map(|ext| format!("{}-{}", php, ext)));

        match self.database {
            DbConnection::Mysql => {
                packages.push(format!("{}-mysql", php));
                packages.push("mysql-server".into());
            }
            DbConnection::Pgsql => {
                packages.push(format!("{}-pgsql", php));
                packages.push("postgresql".into());
                packages.push("postgresql-contrib".into());
            }
            DbConnection::Sqlite => {
                packages.push(format!("{}-sqlite3", php));
                packages.push("sqlite3".into());
            }
        }

        if self.with_node {
            packages.push("nodejs".into());
            packages.push("npm".into());
        }
        packages
    }

    /// Службы, которые должны работать после установки
    pub fn services(&self) -> Vec<String> {
        let mut services = vec!["nginx".to_string(), format!("php{}-fpm", self.php_version)];
        if let Some(db) = self.database.service_name() {
            services.push(db.to_string());
        }
        services
    }
}

/// Устанавливает недостающие пакеты и включает службы; возвращает установленные пакеты
pub async fn provision<H: Host>(host: &H, args: &ProvisionArgs) -> SiteResult<Vec<String>> {
    host.update_package_index().await?;

    let mut installed = Vec::new();
    for package in args.packages() {
        if host.is_package_installed(&package).await? {
            debug!("Пакет {} уже установлен", package);
            continue;
        }
        info!("Установка пакета {}...", package);
        host.install_package(&package).await?;
        installed.push(package);
    }

    for service in args.services() {
        host.enable_service(&service).await?;
        info!("Служба {} запущена", service);
    }

    Ok(installed)
}
