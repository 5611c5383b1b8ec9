use anyhow::{Context, Result};
use colored::*;
use env_logger::{Builder, Env};
use log::LevelFilter;

/// Инициализирует логирование
///
/// `RUST_LOG`, если задан, имеет приоритет над уровнем из настроек.
///
/// # Examples
/// ```rust,ignore
/// logger::init("debug")?;
/// ```
pub fn init(level: &str) -> Result<()> {
    let filter: LevelFilter = level
        .parse()
        .with_context(|| format!("Неизвестный уровень логирования: {}", level))?;

    let env = Env::default().write_style_or("RUST_LOG_STYLE", "auto");

    let mut builder = Builder::new();
    builder
        .format_timestamp_secs()
        .format_module_path(true)
        .filter(None, filter)
        .parse_env(env);
    builder.try_init().context("Логирование уже инициализировано")?;

    Ok(())
}

/// Выводит учётные данные, которые показываются один раз
///
/// # Examples
/// ```rust,ignore
/// logger::credentials("Пароль базы данных", "Xy7...");
/// ```
pub fn credentials(label: &str, value: &str) {
    println!(
        "{} {}: {}",
        "[CREDENTIALS]".magenta().bold(),
        label,
        value.cyan().bold()
    );
}

/// Сообщает об успешном выполнении команды
pub fn success(message: &str) {
    println!("{} {}", "[SUCCESS]".green().bold(), message);
}

/// Сообщает об ошибке в stderr
pub fn failure(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message);
}
