//! Model identity resolution
//!
//! An identity is tried, in order, as a local directory, a local file, a
//! built-in name and a snapshot in the local Hugging Face cache. With the
//! `hub` feature, identities that look like `org/name` are downloaded last.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BenchError, Result};
use crate::reference::{Builtin, find_builtin};

/// Where a model identity resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Directory(PathBuf),
    /// A single weights file (conditioning adapters, LoRA)
    File(PathBuf),
    Builtin(&'static Builtin),
}

impl ModelSource {
    pub fn describe(&self) -> String {
        match self {
            ModelSource::Directory(path) | ModelSource::File(path) => path.display().to_string(),
            ModelSource::Builtin(builtin) => builtin.name.to_string(),
        }
    }
}

/// Root of the Hugging Face hub cache
///
/// `HF_HUB_CACHE`, then `HF_HOME/hub`, then `~/.cache/huggingface/hub`.
pub fn cache_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("HF_HUB_CACHE") {
        return Some(PathBuf::from(dir));
    }
    if let Some(home) = std::env::var_os("HF_HOME") {
        return Some(PathBuf::from(home).join("hub"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache").join("huggingface").join("hub"))
}

/// Snapshot directory of `repo_id` inside a hub cache
///
/// Follows `refs/main` when present, otherwise takes the first snapshot.
pub fn cached_snapshot(cache: &Path, repo_id: &str) -> Option<PathBuf> {
    let repo_dir = cache.join(format!("models--{}", repo_id.replace('/', "--")));
    let snapshots = repo_dir.join("snapshots");

    if let Ok(commit) = fs::read_to_string(repo_dir.join("refs").join("main")) {
        let snapshot = snapshots.join(commit.trim());
        if snapshot.is_dir() {
            return Some(snapshot);
        }
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(&snapshots)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    entries.sort();
    entries.into_iter().next()
}

/// Resolve a model identity
///
/// `variant` only matters for downloads, where it picks the weight files to
/// fetch.
pub fn resolve(identity: &str, variant: Option<&str>) -> Result<ModelSource> {
    let path = Path::new(identity);
    if path.is_dir() {
        return Ok(ModelSource::Directory(path.to_path_buf()));
    }
    if path.is_file() {
        return Ok(ModelSource::File(path.to_path_buf()));
    }
    if let Some(builtin) = find_builtin(identity) {
        return Ok(ModelSource::Builtin(builtin));
    }
    if let Some(snapshot) = cache_dir().and_then(|cache| cached_snapshot(&cache, identity)) {
        debug!(identity, snapshot = %snapshot.display(), "found cached snapshot");
        return Ok(ModelSource::Directory(snapshot));
    }

    download(identity, variant)
}

#[cfg(feature = "hub")]
fn download(identity: &str, variant: Option<&str>) -> Result<ModelSource> {
    use hf_hub::Repo;
    use hf_hub::api::sync::Api;

    use crate::repository::{CONFIG, LORA_WEIGHTS, MODEL_INDEX, MODEL_WEIGHTS, SCHEDULER_CONFIG, TEXT_ENCODER_WEIGHTS};

    if identity.split('/').count() != 2 {
        return Err(BenchError::UnresolvableModel(identity.to_string()));
    }

    let weights = |stem: &str| match variant {
        Some(variant) => format!("{stem}.{variant}.safetensors"),
        None => format!("{stem}.safetensors"),
    };
    let hub_err = |e: hf_hub::api::sync::ApiError| BenchError::Hub(format!("{identity}: {e}"));

    tracing::info!(identity, "downloading from the Hugging Face Hub");
    let api = Api::new().map_err(hub_err)?;
    let repo = api.repo(Repo::model(identity.to_string()));

    if let Ok(index) = repo.get(MODEL_INDEX) {
        repo.get(SCHEDULER_CONFIG).map_err(hub_err)?;
        for (component, stem) in [
            ("unet", MODEL_WEIGHTS),
            ("vae", MODEL_WEIGHTS),
            ("text_encoder", TEXT_ENCODER_WEIGHTS),
        ] {
            repo.get(&format!("{component}/{CONFIG}")).map_err(hub_err)?;
            repo.get(&format!("{component}/{}", weights(stem))).map_err(hub_err)?;
        }
        let dir = index.parent().map(Path::to_path_buf).unwrap_or_default();
        return Ok(ModelSource::Directory(dir));
    }

    if let Ok(config) = repo.get(CONFIG) {
        repo.get(&weights(MODEL_WEIGHTS)).map_err(hub_err)?;
        let dir = config.parent().map(Path::to_path_buf).unwrap_or_default();
        return Ok(ModelSource::Directory(dir));
    }

    let lora = repo.get(LORA_WEIGHTS).map_err(hub_err)?;
    Ok(ModelSource::File(lora))
}

#[cfg(not(feature = "hub"))]
fn download(identity: &str, _variant: Option<&str>) -> Result<ModelSource> {
    Err(BenchError::UnresolvableModel(identity.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_and_path_resolution() {
        let resolved = resolve("burn-models/reference-vae", None).unwrap();
        assert_eq!(resolved.describe(), "burn-models/reference-vae");

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve(dir.path().to_str().unwrap(), None).unwrap(),
            ModelSource::Directory(dir.path().to_path_buf())
        );

        let file = dir.path().join("adapter.safetensors");
        fs::write(&file, b"").unwrap();
        assert_eq!(
            resolve(file.to_str().unwrap(), None).unwrap(),
            ModelSource::File(file.clone())
        );
    }

    #[test]
    fn test_cached_snapshot_follows_main_ref() {
        let cache = tempfile::tempdir().unwrap();
        let repo = cache.path().join("models--acme--tiny-diffusion");
        fs::create_dir_all(repo.join("snapshots").join("aaaa")).unwrap();
        fs::create_dir_all(repo.join("snapshots").join("bbbb")).unwrap();
        assert_eq!(
            cached_snapshot(cache.path(), "acme/tiny-diffusion"),
            Some(repo.join("snapshots").join("aaaa"))
        );

        fs::create_dir_all(repo.join("refs")).unwrap();
        fs::write(repo.join("refs").join("main"), "bbbb\n").unwrap();
        assert_eq!(
            cached_snapshot(cache.path(), "acme/tiny-diffusion"),
            Some(repo.join("snapshots").join("bbbb"))
        );
        assert_eq!(cached_snapshot(cache.path(), "acme/other"), None);
    }
}
