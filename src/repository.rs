//! On-disk model repository: enumeration, fingerprinting, and config
//! loading.
//!
//! A repository root contains one directory per model; each model directory
//! contains a `config.json` plus one subdirectory per version, named by a
//! positive integer:
//!
//! ```text
//! <repo_root>/<model_name>/config.json
//! <repo_root>/<model_name>/<version>/<model-artifact files>
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// Name of the per-model configuration file.
pub const CONFIG_FILENAME: &str = "config.json";

/// Content fingerprint of a directory subtree, stable under idempotent
/// re-reads: the newest mtime in the subtree plus its recursive size and
/// file count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModificationKey {
    newest_mtime: Option<SystemTime>,
    total_bytes: u64,
    file_count: u64,
}

/// One model directory as found on disk.
#[derive(Debug, Clone)]
pub struct ModelDirectory {
    pub name: String,
    pub path: PathBuf,
    /// Version number to subtree fingerprint.
    pub versions: BTreeMap<i64, ModificationKey>,
    /// Fingerprint of the model's `config.json` (default when absent).
    pub config_key: ModificationKey,
}

/// Enumerates and fingerprints the configured repository roots.
#[derive(Debug)]
pub struct RepositoryStore {
    roots: Vec<PathBuf>,
    strict_model_config: bool,
}

impl RepositoryStore {
    /// An unreadable root is fatal only under strict model configuration;
    /// otherwise it is skipped with a warning on every scan.
    pub fn new(roots: Vec<PathBuf>, strict_model_config: bool) -> Result<Self> {
        if roots.is_empty() {
            return Err(Error::invalid_arg(
                "at least one model repository path is required",
            ));
        }
        if strict_model_config {
            for root in &roots {
                std::fs::read_dir(root).map_err(|e| {
                    Error::internal(format!(
                        "model repository '{}' is not readable: {}",
                        root.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(Self {
            roots,
            strict_model_config,
        })
    }

    pub fn strict_model_config(&self) -> bool {
        self.strict_model_config
    }

    /// Map every model directory under the roots to its versions and their
    /// fingerprints. Duplicate names across roots: the first root wins.
    pub fn scan(&self) -> Result<BTreeMap<String, ModelDirectory>> {
        let mut models = BTreeMap::new();

        for root in &self.roots {
            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "skipping unreadable repository root");
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                if models.contains_key(&name) {
                    warn!(
                        model = %name,
                        root = %root.display(),
                        "model already found in an earlier repository root, skipping"
                    );
                    continue;
                }

                let directory = scan_model_directory(&name, &path);
                debug!(
                    model = %name,
                    versions = directory.versions.len(),
                    "scanned model directory"
                );
                models.insert(name, directory);
            }
        }

        Ok(models)
    }

    /// Locate a model directory by name across the roots.
    pub fn find(&self, name: &str) -> Result<ModelDirectory> {
        for root in &self.roots {
            let path = root.join(name);
            if path.is_dir() {
                return Ok(scan_model_directory(name, &path));
            }
        }
        Err(Error::not_found(format!(
            "model '{}' is not in any model repository",
            name
        )))
    }

    /// Read and validate a model's configuration. The `name` field, when
    /// present, must match the directory name; under strict model
    /// configuration a mismatch is an error.
    pub fn read_config(&self, directory: &ModelDirectory) -> Result<ModelConfig> {
        let path = directory.path.join(CONFIG_FILENAME);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            Error::invalid_arg(format!(
                "failed to read config for model '{}' at '{}': {}",
                directory.name,
                path.display(),
                e
            ))
        })?;

        let mut config: ModelConfig = serde_json::from_str(&contents).map_err(|e| {
            Error::invalid_arg(format!(
                "failed to parse config for model '{}': {}",
                directory.name, e
            ))
        })?;

        if config.name.is_empty() {
            config.name = directory.name.clone();
        } else if config.name != directory.name {
            if self.strict_model_config {
                return Err(Error::invalid_arg(format!(
                    "config name '{}' does not match model directory '{}'",
                    config.name, directory.name
                )));
            }
            warn!(
                config_name = %config.name,
                directory = %directory.name,
                "config name does not match model directory, using directory name"
            );
            config.name = directory.name.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn scan_model_directory(name: &str, path: &Path) -> ModelDirectory {
    let mut versions = BTreeMap::new();

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let child = entry.path();
            if !child.is_dir() {
                continue;
            }
            let Some(dirname) = child.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match dirname.parse::<i64>() {
                Ok(version) if version >= 1 => {
                    versions.insert(version, fingerprint(&child));
                }
                _ => {
                    warn!(
                        model = %name,
                        directory = %dirname,
                        "ignoring non-numeric version directory"
                    );
                }
            }
        }
    }

    ModelDirectory {
        name: name.to_string(),
        path: path.to_path_buf(),
        versions,
        config_key: fingerprint(&path.join(CONFIG_FILENAME)),
    }
}

/// Fingerprint a file or directory subtree.
fn fingerprint(path: &Path) -> ModificationKey {
    let mut key = ModificationKey::default();

    for entry in WalkDir::new(path).into_iter().flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if let Ok(mtime) = metadata.modified() {
            key.newest_mtime = Some(match key.newest_mtime {
                Some(current) => current.max(mtime),
                None => mtime,
            });
        }
        if metadata.is_file() {
            key.total_bytes += metadata.len();
            key.file_count += 1;
        }
    }

    key
}
