//! Релизы git-сайтов: `releases/<id>`, ссылка `current` и общий `shared`.
//!
//! Новый релиз собирается рядом с текущим и становится `current` только после
//! успешной сборки. Переключение ссылки атомарно (rename), так что `current`
//! не пропадает ни на мгновение.

use std::{
    collections::BTreeSet,
    fmt, fs,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{SiteError, SiteResult},
    host::Host,
    retry::RetryPolicy,
    site::SiteLayout,
    utils,
};

const METADATA_FILE: &str = ".release.json";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

// Каталоги storage Laravel, которые должны пережить смену релиза
const SHARED_STORAGE_DIRS: &[&str] = &[
    "storage/app/public",
    "storage/framework/cache",
    "storage/framework/sessions",
    "storage/framework/views",
    "storage/logs",
    "database",
];

/// Идентификатор релиза: `YYYYMMDD_HHMMSS` и необязательный суффикс `_N`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseId {
    stamp: String,
    seq: u32,
}

impl ReleaseId {
    pub(crate) fn at(time: DateTime<Local>, seq: u32) -> Self {
        Self {
            stamp: time.format(STAMP_FORMAT).to_string(),
            seq,
        }
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            f.write_str(&self.stamp)
        } else {
            write!(f, "{}_{}", self.stamp, self.seq)
        }
    }
}

impl FromStr for ReleaseId {
    type Err = SiteError;

    fn from_str(value: &str) -> SiteResult<Self> {
        let invalid = || SiteError::Validation(format!("некорректный идентификатор релиза: {}", value));

        let (stamp, seq) = match value.get(15..) {
            Some("") => (value, 0),
            Some(rest) => {
                let seq = rest
                    .strip_prefix('_')
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(invalid)?;
                (&value[..15], seq)
            }
            None => return Err(invalid()),
        };

        let well_formed = stamp
            .char_indices()
            .all(|(i, c)| if i == 8 { c == '_' } else { c.is_ascii_digit() });
        if !well_formed {
            return Err(invalid());
        }

        Ok(Self {
            stamp: stamp.to_string(),
            seq,
        })
    }
}

/// Собранный релиз
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    #[serde(skip)]
    pub path: PathBuf,
    pub id: String,
    pub commit: String,
    pub branch: String,
    pub built: bool,
    pub created_at: DateTime<Local>,
}

impl Release {
    /// Читает метаданные релиза, если они есть
    pub fn load(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path.join(METADATA_FILE)).ok()?;
        let mut release: Release = serde_json::from_str(&contents).ok()?;
        release.path = path.to_path_buf();
        Some(release)
    }

    fn save(&self) -> SiteResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SiteError::io(&self.path, std::io::Error::other(e)))?;
        utils::write_atomic(&self.path.join(METADATA_FILE), &json, None)
    }
}

pub struct ReleaseManager<'a, H: Host> {
    host: &'a H,
    retry: RetryPolicy,
}

impl<'a, H: Host> ReleaseManager<'a, H> {
    pub fn new(host: &'a H, retry: RetryPolicy) -> Self {
        Self { host, retry }
    }

    /// Создаёт структуру `shared` (storage, database)
    pub fn prepare_shared(&self, layout: &SiteLayout) -> SiteResult<PathBuf> {
        let shared = shared_dir(layout)?;
        for dir in SHARED_STORAGE_DIRS {
            let path = shared.join(dir);
            fs::create_dir_all(&path).map_err(|e| SiteError::io(&path, e))?;
        }
        fs::create_dir_all(layout.releases_dir())
            .map_err(|e| SiteError::io(layout.releases_dir(), e))?;
        Ok(shared)
    }

    /// Клонирует и собирает новый релиз, не переключая на него `current`
    ///
    /// При ошибке частично созданный релиз удаляется.
    pub async fn create_release(
        &self,
        layout: &SiteLayout,
        repo: &str,
        branch: &str,
    ) -> SiteResult<Release> {
        let shared = self.prepare_shared(layout)?;
        let id = next_id(layout, Local::now());
        let path = layout.releases_dir().join(id.to_string());

        info!("Создание релиза {} из {} ({})", id, repo, branch);

        match self.build(&path, &shared, repo, branch).await {
            Ok(commit) => {
                let release = Release {
                    path,
                    id: id.to_string(),
                    commit,
                    branch: branch.to_string(),
                    built: true,
                    created_at: Local::now(),
                };
                release.save()?;
                info!("Релиз {} собран (коммит {})", release.id, release.commit);
                Ok(release)
            }
            Err(e) => {
                warn!("Сборка релиза {} не удалась, удаляем его: {}", id, e);
                self.discard(&path);
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        path: &Path,
        shared: &Path,
        repo: &str,
        branch: &str,
    ) -> SiteResult<String> {
        let commit = self
            .retry
            .run("git clone", move || async move {
                // Остатки неудачной попытки мешают повторному клонированию
                utils::remove_path(path)?;
                self.host.clone_repository(repo, branch, path).await
            })
            .await?;

        link_shared(path, shared)?;

        self.host.install_dependencies(path).await?;
        self.host.build_assets(path).await?;
        self.host.run_migrations(path).await?;

        Ok(commit)
    }

    /// Удаляет несобранный релиз; ошибки удаления только логируются
    pub fn discard(&self, path: &Path) {
        if let Err(e) = utils::remove_path(path) {
            warn!("Не удалось удалить релиз {:?}: {}", path, e);
        }
    }

    /// Атомарно переключает `current` на релиз
    pub fn promote(&self, layout: &SiteLayout, release: &Release) -> SiteResult<()> {
        promote_id(layout, &release.id)
    }

    /// Переключает `current` на уже существующий релиз
    pub fn promote_existing(&self, layout: &SiteLayout, id: &ReleaseId) -> SiteResult<()> {
        let path = layout.releases_dir().join(id.to_string());
        if !path.is_dir() {
            return Err(SiteError::Validation(format!("релиз {} не найден", id)));
        }
        promote_id(layout, &id.to_string())
    }

    /// Текущий релиз по ссылке `current`
    pub fn current(&self, layout: &SiteLayout) -> Option<ReleaseId> {
        fs::read_link(layout.current_link())
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
            .and_then(|name| name.parse().ok())
    }

    /// Релизы на диске в порядке создания
    pub fn list(&self, layout: &SiteLayout) -> SiteResult<Vec<ReleaseId>> {
        let dir = layout.releases_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SiteError::io(&dir, e)),
        };

        let mut ids: Vec<ReleaseId> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Удаляет все релизы, кроме `retain` последних; текущий релиз сохраняется всегда
    pub fn prune(&self, layout: &SiteLayout, retain: usize) -> SiteResult<Vec<ReleaseId>> {
        let ids = self.list(layout)?;
        let retain = retain.max(1);

        let mut keep: BTreeSet<ReleaseId> = ids.iter().rev().take(retain).cloned().collect();
        if let Some(current) = self.current(layout) {
            keep.insert(current);
        }

        let mut removed = Vec::new();
        for id in ids {
            if keep.contains(&id) {
                continue;
            }
            let path = layout.releases_dir().join(id.to_string());
            utils::remove_path(&path)?;
            debug!("Удалён старый релиз {}", id);
            removed.push(id);
        }

        if !removed.is_empty() {
            info!("Удалено старых релизов: {}", removed.len());
        }
        Ok(removed)
    }
}

fn shared_dir(layout: &SiteLayout) -> SiteResult<PathBuf> {
    layout.shared_dir.clone().ok_or_else(|| {
        SiteError::Validation(format!(
            "сайт в {:?} развёрнут без релизов",
            layout.site_dir
        ))
    })
}

// Суффикс больше любого существующего в ту же секунду: удалённые при очистке
// идентификаторы не переиспользуются
fn next_id(layout: &SiteLayout, now: DateTime<Local>) -> ReleaseId {
    let candidate = ReleaseId::at(now, 0);
    let seq = fs::read_dir(layout.releases_dir())
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<ReleaseId>().ok())
        .filter(|id| id.stamp == candidate.stamp)
        .map(|id| id.seq + 1)
        .max()
        .unwrap_or(0);
    ReleaseId { seq, ..candidate }
}

// storage и .env релиза указывают в shared
fn link_shared(release: &Path, shared: &Path) -> SiteResult<()> {
    for (name, target) in [
        ("storage", shared.join("storage")),
        (".env", shared.join(".env")),
    ] {
        let link = release.join(name);
        utils::remove_path(&link)?;
        symlink(&target, &link).map_err(|e| SiteError::io(&link, e))?;
    }
    Ok(())
}

fn promote_id(layout: &SiteLayout, id: &str) -> SiteResult<()> {
    let current = layout.current_link();
    let tmp = layout.site_dir.join(format!("current.tmp.{}", std::process::id()));
    let target = Path::new("releases").join(id);

    utils::remove_path(&tmp)?;
    symlink(&target, &tmp).map_err(|e| SiteError::io(&tmp, e))?;
    fs::rename(&tmp, &current).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        SiteError::io(&current, e)
    })?;

    info!("current -> {:?}", target);
    Ok(())
}
