use std::sync::OnceLock;

use regex::Regex;

use crate::error::{SiteError, SiteResult};

// Имена, которые нельзя использовать как имя сайта
pub const RESERVED_NAMES: &[&str] = &["default", "status"];

// Ограничение MySQL на длину имени базы данных
const MAX_NAME_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 253;

// Символы, недопустимые в значениях, попадающих в команды и конфиги
const DANGEROUS_CHARS: &[char] = &['`', '$', '|', '&', ';', '(', ')', '{', '}', '<', '>', '\'', '"'];

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("статический шаблон регулярного выражения"))
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^[A-Za-z0-9_]+$")
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^([a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?\.)*[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?$",
    )
}

fn php_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^[78]\.[0-9]$")
}

fn git_url_res() -> &'static [Regex; 5] {
    static RES: OnceLock<[Regex; 5]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"^https?://[^\s/$.?#].[^\s]*\.git$",
            r"^git@[^\s/$.?#].[^\s]*:[^\s]*\.git$",
            r"^https?://github\.com/[^/]+/[^/]+/?$",
            r"^https?://gitlab\.com/[^/]+/[^/]+/?$",
            r"^(file://)?/[^\s]+$",
        ]
        .map(|pattern| Regex::new(pattern).expect("статический шаблон регулярного выражения"))
    })
}

/// Проверяет имя сайта: буквы, цифры и подчёркивание, не зарезервированное имя
pub fn validate_site_name(name: &str) -> SiteResult<()> {
    validate_identifier("имя сайта", name)?;

    if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(SiteError::Validation(format!(
            "имя сайта {} зарезервировано",
            name
        )));
    }

    Ok(())
}

/// Проверяет идентификатор базы данных или пользователя
pub fn validate_identifier(what: &str, value: &str) -> SiteResult<()> {
    if value.is_empty() {
        return Err(SiteError::Validation(format!("{} не может быть пустым", what)));
    }

    if value.len() > MAX_NAME_LEN {
        return Err(SiteError::Validation(format!(
            "{} длиннее {} символов: {}",
            what, MAX_NAME_LEN, value
        )));
    }

    if !identifier_re().is_match(value) {
        return Err(SiteError::Validation(format!(
            "{} может содержать только буквы, цифры и подчёркивание: {}",
            what, value
        )));
    }

    Ok(())
}

pub fn validate_domain(domain: &str) -> SiteResult<()> {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN || !domain_re().is_match(domain) {
        return Err(SiteError::Validation(format!(
            "некорректное доменное имя: {}",
            domain
        )));
    }
    Ok(())
}

/// Проверяет версию PHP вида 8.1, 8.2, 8.3
pub fn validate_php_version(version: &str) -> SiteResult<()> {
    if !php_version_re().is_match(version) {
        return Err(SiteError::Validation(format!(
            "некорректная версия PHP: {} (ожидается, например, 8.1)",
            version
        )));
    }
    Ok(())
}

/// Проверяет порт; системные порты кроме 80 и 443 запрещены
pub fn validate_port(port: u16) -> SiteResult<()> {
    const RESERVED_PORTS: &[u16] = &[22, 25, 53, 110, 143, 993, 995];

    if port == 0 || RESERVED_PORTS.contains(&port) {
        return Err(SiteError::Validation(format!(
            "порт {} недопустим для веб-сайта",
            port
        )));
    }
    Ok(())
}

/// Проверяет URL git-репозитория (HTTPS, SSH или локальный путь)
pub fn validate_git_url(url: &str) -> SiteResult<()> {
    if url.contains(DANGEROUS_CHARS) || !git_url_res().iter().any(|re| re.is_match(url)) {
        return Err(SiteError::Validation(format!(
            "некорректный URL git-репозитория: {}",
            url
        )));
    }
    Ok(())
}

/// Проверяет имя git-ветки
pub fn validate_branch(branch: &str) -> SiteResult<()> {
    let invalid = branch.is_empty()
        || branch.starts_with('-')
        || branch.contains("..")
        || branch.contains(DANGEROUS_CHARS)
        || branch.chars().any(char::is_whitespace);

    if invalid {
        return Err(SiteError::Validation(format!(
            "некорректное имя ветки: {}",
            branch
        )));
    }
    Ok(())
}

/// Проверяет сложность пароля
/// Пароль должен содержать минимум 8 символов, прописные и строчные буквы и цифры
pub fn check_password_strength(password: &str) -> SiteResult<()> {
    if password.len() < 8 {
        return Err(SiteError::Validation(
            "пароль должен содержать не менее 8 символов".to_string(),
        ));
    }

    if password.contains(DANGEROUS_CHARS) || password.contains('\\') {
        return Err(SiteError::Validation(
            "пароль содержит недопустимые символы".to_string(),
        ));
    }

    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(SiteError::Validation(
            "пароль должен содержать прописные буквы".to_string(),
        ));
    }

    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(SiteError::Validation(
            "пароль должен содержать строчные буквы".to_string(),
        ));
    }

    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(SiteError::Validation(
            "пароль должен содержать цифры".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_names_follow_identifier_grammar() {
        assert!(validate_site_name("blog").is_ok());
        assert!(validate_site_name("api_v2").is_ok());
        assert!(validate_site_name("Shop2").is_ok());

        for bad in ["", "my-blog", "blog.local", "bad name", "../etc", "ñame"] {
            assert!(
                matches!(validate_site_name(bad), Err(SiteError::Validation(_))),
                "{bad:?} должно быть отклонено"
            );
        }
        assert!(validate_site_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn reserved_names_are_rejected() {
        assert!(validate_site_name("default").is_err());
        assert!(validate_site_name("status").is_err());
        assert!(validate_site_name("Default").is_err());
    }

    #[test]
    fn domains() {
        assert!(validate_domain("blog.local").is_ok());
        assert!(validate_domain("localhost").is_ok());
        assert!(validate_domain("api.example.com").is_ok());
        assert!(validate_domain("-bad.com").is_err());
        assert!(validate_domain("bad_domain.com").is_err());
        assert!(validate_domain("").is_err());
    }

    #[test]
    fn php_versions() {
        assert!(validate_php_version("8.1").is_ok());
        assert!(validate_php_version("7.4").is_ok());
        assert!(validate_php_version("8.10").is_err());
        assert!(validate_php_version("php8.1").is_err());
    }

    #[test]
    fn ports() {
        assert!(validate_port(80).is_ok());
        assert!(validate_port(443).is_ok());
        assert!(validate_port(8080).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(22).is_err());
    }

    #[test]
    fn git_urls() {
        assert!(validate_git_url("https://github.com/laravel/laravel.git").is_ok());
        assert!(validate_git_url("https://github.com/laravel/laravel").is_ok());
        assert!(validate_git_url("git@github.com:laravel/laravel.git").is_ok());
        assert!(validate_git_url("/srv/repos/app.git").is_ok());
        assert!(validate_git_url("https://example.com/repo.git; rm -rf /").is_err());
        assert!(validate_git_url("ftp://example.com/repo").is_err());
    }

    #[test]
    fn branches() {
        assert!(validate_branch("main").is_ok());
        assert!(validate_branch("release/1.2").is_ok());
        assert!(validate_branch("--upload-pack=evil").is_err());
        assert!(validate_branch("a..b").is_err());
    }

    #[test]
    fn password_strength() {
        assert!(check_password_strength("Secret123").is_ok());
        assert!(check_password_strength("short1A").is_err());
        assert!(check_password_strength("alllowercase1").is_err());
        assert!(check_password_strength("ALLUPPERCASE1").is_err());
        assert!(check_password_strength("NoDigitsHere").is_err());
        assert!(check_password_strength("Quote'd123").is_err());
    }
}
