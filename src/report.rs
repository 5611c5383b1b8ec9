//! Отображение состояния сайтов: таблица, JSON, CSV и подробный вид.

use std::fmt::Write as _;

use clap::ValueEnum;
use colored::*;
use serde::Serialize;

use crate::site::{SiteRecord, SiteState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ListFormat {
    #[default]
    Table,
    Json,
    Csv,
    Detailed,
}

/// Фактическое состояние сайта и его служб
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub site: SiteRow,
    pub symlink_present: bool,
    pub nginx_active: bool,
    pub php_fpm_active: bool,
    /// `None` для SQLite: отдельной службы нет
    pub database_active: Option<bool>,
    /// `None`, если проверить не удалось
    pub database_present: Option<bool>,
    pub current_commit: Option<String>,
}

/// Плоское представление записи для вывода
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteRow {
    pub name: String,
    pub state: SiteState,
    pub domain: String,
    pub port: u16,
    pub php_version: String,
    pub db_connection: String,
    pub database: String,
    pub db_user: String,
    pub git_repo: Option<String>,
    pub git_branch: Option<String>,
    pub auto_update: bool,
    pub ssl_enabled: bool,
    pub enabled: bool,
    pub config_valid: Option<bool>,
    pub document_root: String,
    pub current_release: Option<String>,
    pub created_at: String,
    pub last_deployed_at: Option<String>,
}

impl From<&SiteRecord> for SiteRow {
    fn from(record: &SiteRecord) -> Self {
        let spec = &record.spec;
        let status = &record.status;
        Self {
            name: spec.name.clone(),
            state: record.state(),
            domain: spec.domain.clone(),
            port: spec.port,
            php_version: spec.php_version.clone(),
            db_connection: spec.database.connection.to_string(),
            database: spec.database.database.clone(),
            db_user: spec.database.username.clone(),
            git_repo: spec.git_repo.clone(),
            git_branch: spec.git_repo.as_ref().map(|_| spec.git_branch.clone()),
            auto_update: spec.auto_update,
            ssl_enabled: spec.ssl_enabled,
            enabled: status.enabled,
            config_valid: status.config_valid,
            document_root: status.document_root.display().to_string(),
            current_release: status.current_release.clone(),
            created_at: status.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            last_deployed_at: status
                .last_deployed_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

fn enabled_label(enabled: bool) -> ColoredString {
    if enabled {
        format!("{:<9}", "enabled").green()
    } else {
        format!("{:<9}", "disabled").yellow()
    }
}

fn validity_label(valid: Option<bool>) -> &'static str {
    match valid {
        Some(true) => "valid",
        Some(false) => "invalid",
        None => "unknown",
    }
}

fn active_label(active: bool) -> ColoredString {
    if active {
        "active".green()
    } else {
        "inactive".red()
    }
}

pub fn render_list(records: &[SiteRecord], format: ListFormat) -> String {
    let rows: Vec<SiteRow> = records.iter().map(SiteRow::from).collect();
    match format {
        ListFormat::Table => table(&rows),
        ListFormat::Json => serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".into()),
        ListFormat::Csv => csv(&rows),
        ListFormat::Detailed => detailed(&rows),
    }
}

fn table(rows: &[SiteRow]) -> String {
    if rows.is_empty() {
        return "Сайты не найдены\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<30} {:<6} {:<5} {:<8} {:<9} {:<8}",
        "NAME", "DOMAIN", "PORT", "PHP", "DB", "STATUS", "CONFIG"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<20} {:<30} {:<6} {:<5} {:<8} {} {:<8}",
            row.name,
            row.domain,
            row.port,
            row.php_version,
            row.db_connection,
            enabled_label(row.enabled),
            validity_label(row.config_valid)
        );
    }
    let _ = writeln!(out, "\nВсего сайтов: {}", rows.len());
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv(rows: &[SiteRow]) -> String {
    let mut out = String::from(
        "name,domain,port,php_version,db_connection,database,git_repo,git_branch,enabled,config_valid,current_release,created_at\n",
    );
    for row in rows {
        let fields = [
            row.name.clone(),
            row.domain.clone(),
            row.port.to_string(),
            row.php_version.clone(),
            row.db_connection.clone(),
            row.database.clone(),
            row.git_repo.clone().unwrap_or_default(),
            row.git_branch.clone().unwrap_or_default(),
            row.enabled.to_string(),
            validity_label(row.config_valid).to_string(),
            row.current_release.clone().unwrap_or_default(),
            row.created_at.clone(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn detailed(rows: &[SiteRow]) -> String {
    if rows.is_empty() {
        return "Сайты не найдены\n".to_string();
    }

    let mut out = String::new();
    for row in rows {
        write_site(&mut out, row);
        out.push('\n');
    }
    out
}

fn write_site(out: &mut String, row: &SiteRow) {
    let _ = writeln!(out, "{}", format!("=== {} ===", row.name).bold());
    let _ = writeln!(out, "  Домен:            {}:{}", row.domain, row.port);
    let _ = writeln!(out, "  Состояние:        {}", enabled_label(row.enabled));
    let _ = writeln!(out, "  Конфигурация:     {}", validity_label(row.config_valid));
    let _ = writeln!(out, "  PHP:              {}", row.php_version);
    let _ = writeln!(
        out,
        "  База данных:      {} ({}, пользователь {})",
        row.database, row.db_connection, row.db_user
    );
    let _ = writeln!(out, "  Корень сайта:     {}", row.document_root);
    let _ = writeln!(out, "  SSL:              {}", if row.ssl_enabled { "да" } else { "нет" });
    if let Some(repo) = &row.git_repo {
        let _ = writeln!(
            out,
            "  Git:              {} ({})",
            repo,
            row.git_branch.as_deref().unwrap_or_default()
        );
        let _ = writeln!(
            out,
            "  Текущий релиз:    {}",
            row.current_release.as_deref().unwrap_or("-")
        );
        let _ = writeln!(
            out,
            "  Последний деплой: {}",
            row.last_deployed_at.as_deref().unwrap_or("-")
        );
        let _ = writeln!(
            out,
            "  Автообновление:   {}",
            if row.auto_update { "да" } else { "нет" }
        );
    }
    let _ = writeln!(out, "  Создан:           {}", row.created_at);
}

pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    write_site(&mut out, &report.site);
    let _ = writeln!(
        out,
        "  Ссылка в sites-enabled: {}",
        if report.symlink_present { "есть" } else { "нет" }
    );
    let _ = writeln!(out, "  nginx:            {}", active_label(report.nginx_active));
    let _ = writeln!(
        out,
        "  php{}-fpm:       {}",
        report.site.php_version,
        active_label(report.php_fpm_active)
    );
    if let Some(commit) = &report.current_commit {
        let _ = writeln!(out, "  Коммит:           {}", commit);
    }
    match report.database_present {
        Some(true) => {
            let _ = writeln!(out, "  База данных есть: да");
        }
        Some(false) => {
            let _ = writeln!(out, "  База данных есть: {}", "нет".red());
        }
        None => {}
    }
    match report.database_active {
        Some(active) => {
            let _ = writeln!(out, "  {}:            {}", report.site.db_connection, active_label(active));
        }
        None => {
            let _ = writeln!(out, "  {}:           не требуется", report.site.db_connection);
        }
    }
    out
}
