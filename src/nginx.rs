use std::{
    fs,
    os::unix::fs::symlink,
    path::PathBuf,
};

use log::{debug, info};

use crate::{
    config::Settings,
    error::{SiteError, SiteResult},
    utils,
};

/// Файлы сайта в конфигурации Nginx: sites-available и sites-enabled
#[derive(Debug, Clone)]
pub struct NginxSites {
    available_dir: PathBuf,
    enabled_dir: PathBuf,
}

impl NginxSites {
    pub fn new(settings: &Settings) -> Self {
        Self {
            available_dir: settings.nginx_available_dir.clone(),
            enabled_dir: settings.nginx_enabled_dir.clone(),
        }
    }

    pub fn available_path(&self, name: &str) -> PathBuf {
        self.available_dir.join(name)
    }

    pub fn enabled_path(&self, name: &str) -> PathBuf {
        self.enabled_dir.join(name)
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.available_path(name).is_file()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        utils::path_present(&self.enabled_path(name))
    }

    /// Записывает конфигурацию сайта (не включая её)
    pub fn write_config(&self, name: &str, contents: &str) -> SiteResult<PathBuf> {
        let path = self.available_path(name);
        utils::write_atomic(&path, contents, Some(0o644))?;
        info!("Создан файл конфигурации Nginx: {:?}", path);
        Ok(path)
    }

    pub fn remove_config(&self, name: &str) -> SiteResult<bool> {
        utils::remove_path(&self.available_path(name))
    }

    /// Создаёт ссылку в sites-enabled; `true`, если ссылку создал этот вызов
    pub fn link(&self, name: &str) -> SiteResult<bool> {
        let link = self.enabled_path(name);
        if utils::path_present(&link) {
            debug!("Сайт {} уже включён: {:?}", name, link);
            return Ok(false);
        }

        fs::create_dir_all(&self.enabled_dir).map_err(|e| SiteError::io(&self.enabled_dir, e))?;
        symlink(self.available_path(name), &link).map_err(|e| SiteError::io(&link, e))?;
        debug!("Создана ссылка {:?}", link);
        Ok(true)
    }

    /// Удаляет ссылку в sites-enabled; `true`, если ссылка была
    pub fn unlink(&self, name: &str) -> SiteResult<bool> {
        utils::remove_path(&self.enabled_path(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn link_and_unlink_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let nginx = NginxSites::new(&Settings::rooted_at(dir.path()));
        nginx.write_config("blog", "server {}\n").unwrap();

        assert!(nginx.link("blog").unwrap());
        assert!(!nginx.link("blog").unwrap());
        assert!(nginx.is_enabled("blog"));
        assert_eq!(
            fs::read_link(nginx.enabled_path("blog")).unwrap(),
            nginx.available_path("blog")
        );

        assert!(nginx.unlink("blog").unwrap());
        assert!(!nginx.unlink("blog").unwrap());
        assert!(!nginx.is_enabled("blog"));
        assert!(nginx.has_config("blog"));
    }

    #[test]
    fn config_roundtrip_and_removal() {
        let dir = TempDir::new().unwrap();
        let nginx = NginxSites::new(&Settings::rooted_at(dir.path()));

        nginx.write_config("blog", "server { listen 80; }\n").unwrap();
        assert_eq!(
            fs::read_to_string(nginx.available_path("blog")).unwrap(),
            "server { listen 80; }\n"
        );
        assert!(nginx.remove_config("blog").unwrap());
        assert!(!nginx.has_config("blog"));
    }
}
