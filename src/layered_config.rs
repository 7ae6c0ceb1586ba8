use crate::settings::{ConfigError, SettingItem, SettingOrigin, Settings};
use directories::ProjectDirs;
use notify::{recommended_watcher, Event, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// On-disk shape of one layer: section name -> array of keyed entries.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct SettingsDoc(BTreeMap<String, Vec<SettingItem>>);

#[derive(Debug)]
struct SettingsFile {
    path: PathBuf,
    origin: SettingOrigin,
    doc: SettingsDoc,
    dirty: bool,
}

fn read_doc(path: &Path) -> Result<SettingsDoc, ConfigError> {
    if !path.exists() {
        return Ok(SettingsDoc::default());
    }
    let text = fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_paths(workspace_root: &Path) -> Result<(PathBuf, PathBuf, PathBuf), ConfigError> {
    let proj = ProjectDirs::from("org", "dagent", "dagent").ok_or(ConfigError::NoConfigDir)?;
    let system = if cfg!(target_os = "windows") {
        PathBuf::from(r"C:\ProgramData\Dagent\dagent.toml")
    } else {
        PathBuf::from("/etc/dagent/dagent.toml")
    };
    let user = proj.config_dir().join("dagent.toml");
    let workspace = workspace_root.join(".dagent").join("dagent.toml");
    Ok((system, user, workspace))
}

/// TOML-file settings store over ordered scope layers: a machine-wide system
/// file, the per-user file, and the workspace file closest to the user.
/// Mutations land in writable layers only and stay in memory until
/// [`Settings::save_to_disk`].
#[derive(Clone, Debug)]
pub struct LayeredSettings {
    files: Arc<RwLock<Vec<SettingsFile>>>,
    tx: broadcast::Sender<()>,
    _watcher: Arc<RwLock<Option<notify::RecommendedWatcher>>>,
}

impl LayeredSettings {
    /// The standard three layers for a workspace root.
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let (system, user, workspace) = config_paths(workspace_root.as_ref())?;
        Self::from_paths(vec![
            (system, SettingOrigin { priority: 0, machine_wide: true }),
            (user, SettingOrigin { priority: 10, machine_wide: false }),
            (workspace, SettingOrigin { priority: 20, machine_wide: false }),
        ])
    }

    /// Explicit layers, mainly for tests and embedders with their own
    /// layout. Missing files read as empty.
    pub fn from_paths(layers: Vec<(PathBuf, SettingOrigin)>) -> Result<Self, ConfigError> {
        let files = layers
            .into_iter()
            .map(|(path, origin)| {
                Ok(SettingsFile {
                    doc: read_doc(&path)?,
                    path,
                    origin,
                    dirty: false,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            files: Arc::new(RwLock::new(files)),
            tx: broadcast::channel(16).0,
            _watcher: Arc::new(RwLock::new(None)),
        })
    }

    /// Watch the layer directories and reload on external edits, notifying
    /// subscribers. Reloads are skipped while unsaved mutations are pending.
    pub fn watch(&self) -> Result<(), ConfigError> {
        let files = self.files.clone();
        let tx = self.tx.clone();
        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| {
            if res.is_err() {
                return;
            }
            let mut files = files.write();
            if files.iter().any(|f| f.dirty) {
                return;
            }
            for file in files.iter_mut() {
                match read_doc(&file.path) {
                    Ok(doc) => file.doc = doc,
                    Err(err) => warn!(path = %file.path.display(), %err, "not reloading layer"),
                }
            }
            drop(files);
            let _ = tx.send(());
        })?;
        for file in self.files.read().iter() {
            if let Some(dir) = file.path.parent() {
                if dir.exists() {
                    watcher.watch(dir, RecursiveMode::NonRecursive)?;
                }
            }
        }
        *self._watcher.write() = Some(watcher);
        Ok(())
    }
}

impl Settings for LayeredSettings {
    fn section(&self, name: &str) -> Vec<SettingItem> {
        let files = self.files.read();
        let mut out = Vec::new();
        for file in files.iter() {
            if let Some(items) = file.doc.0.get(name) {
                out.extend(items.iter().cloned().map(|mut it| {
                    it.origin = Some(file.origin);
                    it
                }));
            }
        }
        out
    }

    fn add_or_update(&self, section: &str, item: SettingItem) -> Result<(), ConfigError> {
        let mut files = self.files.write();
        for file in files.iter_mut().filter(|f| !f.origin.machine_wide) {
            if let Some(items) = file.doc.0.get_mut(section) {
                if let Some(existing) = items.iter_mut().find(|it| it.same_entry(&item)) {
                    existing.value = item.value;
                    existing.protocol_version = item.protocol_version;
                    file.dirty = true;
                    return Ok(());
                }
            }
        }
        let target = files
            .iter_mut()
            .filter(|f| !f.origin.machine_wide)
            .max_by_key(|f| f.origin.priority)
            .ok_or_else(|| ConfigError::ReadOnlyLayer(section.to_string()))?;
        target
            .doc
            .0
            .entry(section.to_string())
            .or_default()
            .push(item);
        target.dirty = true;
        Ok(())
    }

    fn remove(&self, section: &str, item: &SettingItem) -> Result<(), ConfigError> {
        let mut files = self.files.write();
        let mut removed = false;
        let mut machine_match = false;
        for file in files.iter_mut() {
            let Some(items) = file.doc.0.get_mut(section) else {
                continue;
            };
            if file.origin.machine_wide {
                machine_match |= items.iter().any(|it| it.same_entry(item));
                continue;
            }
            let before = items.len();
            items.retain(|it| !it.same_entry(item));
            if items.len() != before {
                removed = true;
                file.dirty = true;
            }
        }
        if !removed && machine_match {
            return Err(ConfigError::ReadOnlyLayer(section.to_string()));
        }
        Ok(())
    }

    fn save_to_disk(&self) -> Result<(), ConfigError> {
        let mut files = self.files.write();
        for file in files.iter_mut().filter(|f| f.dirty) {
            if let Some(dir) = file.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let text = toml::to_string_pretty(&file.doc)?;
            fs::write(&file.path, text)?;
            file.dirty = false;
            debug!(path = %file.path.display(), "wrote settings layer");
        }
        drop(files);
        let _ = self.tx.send(());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}
