use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::site::{DbConnection, SiteLayout, SiteSpec};

/// Секреты, которые попадают в файл окружения
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub db_password: String,
    pub app_key: String,
}

/// Результат рендеринга: конфигурация Nginx и файл окружения Laravel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSite {
    pub server_config: String,
    pub env_file: String,
}

/// Формирует конфигурацию сайта
///
/// Чистая функция: одинаковые входные данные дают побайтно одинаковый результат,
/// значения подставляются как есть и ничего не исполняется.
pub fn render(spec: &SiteSpec, layout: &SiteLayout, credentials: &Credentials) -> RenderedSite {
    RenderedSite {
        server_config: render_server_config(spec, layout),
        env_file: render_env_file(spec, layout, credentials),
    }
}

/// SHA-256 конфигурации для обнаружения изменений
pub fn config_digest(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

fn render_server_config(spec: &SiteSpec, layout: &SiteLayout) -> String {
    let mut conf = format!(
        "# Managed by site_manager: {name}\n# Manual changes will be overwritten.\n\n",
        name = spec.name
    );

    if spec.ssl_enabled {
        // Порт сайта только перенаправляет на HTTPS
        let _ = write!(
            conf,
            r#"server {{
    listen {port};
    listen [::]:{port};
    server_name {domain};

    location /.well-known/acme-challenge/ {{
        root /var/www/certbot;
    }}

    location / {{
        return 301 https://$host$request_uri;
    }}
}}

server {{
    listen 443 ssl http2;
    listen [::]:443 ssl http2;
    server_name {domain};

    ssl_certificate /etc/letsencrypt/live/{domain}/fullchain.pem;
    ssl_certificate_key /etc/letsencrypt/live/{domain}/privkey.pem;

    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_prefer_server_ciphers on;
    ssl_session_timeout 1d;
    ssl_session_cache shared:SSL:10m;
    add_header Strict-Transport-Security "max-age=31536000; includeSubDomains" always;
"#,
            port = spec.port,
            domain = spec.domain,
        );
    } else {
        let _ = write!(
            conf,
            r#"server {{
    listen {port};
    listen [::]:{port};
    server_name {domain};
"#,
            port = spec.port,
            domain = spec.domain,
        );
    }

    let _ = write!(
        conf,
        r#"
    root {root};
    index index.php index.html;
    charset utf-8;

    access_log /var/log/nginx/{name}-access.log;
    error_log /var/log/nginx/{name}-error.log;

    add_header X-Frame-Options "SAMEORIGIN";
    add_header X-Content-Type-Options "nosniff";

    location / {{
        try_files $uri $uri/ /index.php?$query_string;
    }}

    location = /favicon.ico {{ access_log off; log_not_found off; }}
    location = /robots.txt  {{ access_log off; log_not_found off; }}

    error_page 404 /index.php;

    location ~ \.php$ {{
        fastcgi_pass unix:/var/run/php/php{php}-fpm.sock;
        fastcgi_param SCRIPT_FILENAME $realpath_root$fastcgi_script_name;
        include fastcgi_params;
        fastcgi_hide_header X-Powered-By;
    }}

    location ~ /\.(?!well-known).* {{
        deny all;
    }}
}}
"#,
        root = layout.document_root.display(),
        name = spec.name,
        php = spec.php_version,
    );

    conf
}

fn app_url(spec: &SiteSpec) -> String {
    if spec.ssl_enabled {
        format!("https://{}", spec.domain)
    } else if spec.port == 80 {
        format!("http://{}", spec.domain)
    } else {
        format!("http://{}:{}", spec.domain, spec.port)
    }
}

fn render_env_file(spec: &SiteSpec, layout: &SiteLayout, credentials: &Credentials) -> String {
    let mut env = format!(
        "APP_NAME={name}\n\
         APP_ENV=production\n\
         APP_KEY={key}\n\
         APP_DEBUG=false\n\
         APP_URL={url}\n\
         \n\
         LOG_CHANNEL=stack\n\
         LOG_LEVEL=error\n\
         \n",
        name = spec.name,
        key = credentials.app_key,
        url = app_url(spec),
    );

    let db = &spec.database;
    match db.connection {
        DbConnection::Sqlite => {
            let _ = write!(
                env,
                "DB_CONNECTION=sqlite\nDB_DATABASE={}\n",
                layout.sqlite_path().display()
            );
        }
        DbConnection::Mysql | DbConnection::Pgsql => {
            let _ = write!(
                env,
                "DB_CONNECTION={connection}\n\
                 DB_HOST=127.0.0.1\n\
                 DB_PORT={port}\n\
                 DB_DATABASE={database}\n\
                 DB_USERNAME={username}\n\
                 DB_PASSWORD={password}\n",
                connection = db.connection,
                port = db.connection.default_port().unwrap_or_default(),
                database = db.database,
                username = db.username,
                password = credentials.db_password,
            );
        }
    }

    env.push_str(
        "\nCACHE_DRIVER=file\n\
         SESSION_DRIVER=file\n\
         SESSION_LIFETIME=120\n\
         QUEUE_CONNECTION=sync\n",
    );

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn fixture(ssl: bool) -> (SiteSpec, SiteLayout, Credentials) {
        let settings = Settings::default();
        let mut spec = SiteSpec::new("blog", "blog.local", &settings);
        spec.ssl_enabled = ssl;
        let layout = SiteLayout::resolve(&settings, &spec);
        let credentials = Credentials {
            db_password: "Secret123".into(),
            app_key: "base64:AAAA".into(),
        };
        (spec, layout, credentials)
    }

    #[test]
    fn render_is_byte_stable() {
        let (spec, layout, credentials) = fixture(true);
        let first = render(&spec, &layout, &credentials);
        let second = render(&spec, &layout, &credentials);
        assert_eq!(first, second);
        assert_eq!(
            config_digest(&first.server_config),
            config_digest(&second.server_config)
        );
    }

    #[test]
    fn ssl_block_only_when_enabled() {
        let (spec, layout, credentials) = fixture(false);
        let plain = render(&spec, &layout, &credentials).server_config;
        assert!(!plain.contains("ssl_certificate"));
        assert!(!plain.contains("listen 443"));
        assert!(plain.contains("listen 80;"));

        let (spec, layout, credentials) = fixture(true);
        let secure = render(&spec, &layout, &credentials).server_config;
        assert!(secure.contains("ssl_certificate /etc/letsencrypt/live/blog.local/fullchain.pem;"));
        assert!(secure.contains("return 301 https://$host$request_uri;"));
    }

    #[test]
    fn server_config_uses_defaults() {
        let (spec, layout, credentials) = fixture(false);
        let conf = render(&spec, &layout, &credentials).server_config;
        assert!(conf.contains("server_name blog.local;"));
        assert!(conf.contains("root /var/www/blog/public;"));
        assert!(conf.contains("fastcgi_pass unix:/var/run/php/php8.1-fpm.sock;"));
        assert!(conf.contains("try_files $uri $uri/ /index.php?$query_string;"));
    }

    #[test]
    fn values_are_not_interpreted() {
        let (mut spec, layout, credentials) = fixture(false);
        spec.domain = "{domain}".into();
        let conf = render(&spec, &layout, &credentials).server_config;
        assert!(conf.contains("server_name {domain};"));
    }

    #[test]
    fn env_file_for_mysql_and_sqlite() {
        let (mut spec, layout, credentials) = fixture(false);
        let env = render(&spec, &layout, &credentials).env_file;
        assert!(env.contains("APP_KEY=base64:AAAA\n"));
        assert!(env.contains("APP_URL=http://blog.local\n"));
        assert!(env.contains("DB_CONNECTION=mysql\n"));
        assert!(env.contains("DB_PORT=3306\n"));
        assert!(env.contains("DB_PASSWORD=Secret123\n"));

        spec.database.connection = DbConnection::Sqlite;
        let env = render(&spec, &layout, &credentials).env_file;
        assert!(env.contains("DB_DATABASE=/var/www/blog/database/database.sqlite\n"));
        assert!(!env.contains("DB_PASSWORD"));
    }

    #[test]
    fn app_url_carries_custom_port() {
        let (mut spec, layout, credentials) = fixture(false);
        spec.port = 8080;
        let rendered = render(&spec, &layout, &credentials);
        assert!(rendered.env_file.contains("APP_URL=http://blog.local:8080\n"));
        assert!(rendered.server_config.contains("listen 8080;"));
    }
}
