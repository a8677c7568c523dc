//! Checkpoint bundle resolution. A bundle is a directory with up to five
//! pretrained sub-model directories; the layout is scanned once into a
//! [`BundleManifest`] and every wiring decision branches on that manifest
//! instead of re-probing the filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use super::utils::LlavaError;

/// Where a sub-model comes from: the bundle itself or an explicit caller
/// path. Exactly one of the two may supply each sub-model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Bundled(PathBuf),
    Explicit(PathBuf),
}

impl ModelSource {
    pub fn path(&self) -> &Path {
        match self {
            ModelSource::Bundled(path) | ModelSource::Explicit(path) => path,
        }
    }
}

/// Snapshot of a bundle directory's layout, computed once at load time.
#[derive(Debug)]
pub struct BundleManifest {
    root: PathBuf,
    llm: Option<PathBuf>,
    visual_encoder: Option<PathBuf>,
    llm_adapter: Option<PathBuf>,
    visual_encoder_adapter: Option<PathBuf>,
    projector: Option<PathBuf>,
}

impl BundleManifest {
    pub fn scan(root: &Path) -> Result<Self, LlavaError> {
        if !root.is_dir() {
            return Err(LlavaError::BundleNotFound(root.to_path_buf()));
        }
        let subdir = |name: &str| {
            let path = root.join(name);
            path.is_dir().then_some(path)
        };
        Ok(Self {
            root: root.to_path_buf(),
            llm: subdir("llm"),
            visual_encoder: subdir("visual_encoder"),
            llm_adapter: subdir("llm_adapter"),
            visual_encoder_adapter: subdir("visual_encoder_adapter"),
            projector: subdir("projector"),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn llm_source(&self, explicit: Option<&Path>) -> Result<ModelSource, LlavaError> {
        match (&self.llm, explicit) {
            (Some(_), Some(_)) => Err(LlavaError::LlmPathConflict),
            (Some(bundled), None) => Ok(ModelSource::Bundled(bundled.clone())),
            (None, Some(path)) => Ok(ModelSource::Explicit(path.to_path_buf())),
            (None, None) => Err(LlavaError::LlmPathMissing),
        }
    }

    pub fn visual_encoder_source(&self, explicit: Option<&Path>) -> Result<ModelSource, LlavaError> {
        match (&self.visual_encoder, explicit) {
            (Some(_), Some(_)) => Err(LlavaError::VisualEncoderPathConflict),
            (Some(bundled), None) => Ok(ModelSource::Bundled(bundled.clone())),
            (None, Some(path)) => Ok(ModelSource::Explicit(path.to_path_buf())),
            (None, None) => Err(LlavaError::VisualEncoderPathMissing),
        }
    }

    /// Optional low-rank adapter for the language model.
    pub fn llm_adapter(&self) -> Option<&Path> {
        self.llm_adapter.as_deref()
    }

    /// Optional low-rank adapter for the vision encoder.
    pub fn visual_encoder_adapter(&self) -> Option<&Path> {
        self.visual_encoder_adapter.as_deref()
    }

    /// The projector is always loaded from the bundle; its absence is a hard
    /// failure.
    pub fn projector(&self) -> Result<&Path, LlavaError> {
        self.projector
            .as_deref()
            .ok_or_else(|| LlavaError::ProjectorMissing(self.root.join("projector")))
    }
}

/// Resolves a checkpoint identifier to a local snapshot directory.
pub trait SnapshotResolver {
    fn resolve(&self, repo_id: &str) -> Result<PathBuf, LlavaError>;
}

/// Default resolver: probe the hub cache for a previous download, otherwise
/// fetch the full repository snapshot into the managed cache.
pub struct HubResolver;

impl SnapshotResolver for HubResolver {
    fn resolve(&self, repo_id: &str) -> Result<PathBuf, LlavaError> {
        let cache = hf_hub::Cache::default();
        if let Some(snapshot) = cached_snapshot(cache.path(), repo_id) {
            return Ok(snapshot);
        }

        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(repo_id.to_string());
        let info = repo.info()?;
        let mut root = None;
        for sibling in &info.siblings {
            let local = repo.get(&sibling.rfilename)?;
            if root.is_none() {
                root = snapshot_root(&local, &sibling.rfilename);
            }
        }
        root.ok_or_else(|| LlavaError::BundleNotFound(PathBuf::from(repo_id)))
    }
}

/// Newest cached snapshot directory for `repo_id`, if any.
fn cached_snapshot(cache_root: &Path, repo_id: &str) -> Option<PathBuf> {
    let snapshots = cache_root
        .join(format!("models--{}", repo_id.replace('/', "--")))
        .join("snapshots");
    let mut revisions: Vec<PathBuf> = fs::read_dir(&snapshots)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    revisions.sort();
    revisions.pop()
}

/// Strip the repo-relative file name off a cached file path to recover the
/// snapshot directory.
fn snapshot_root(local: &Path, rfilename: &str) -> Option<PathBuf> {
    let mut root = local.to_path_buf();
    for _ in rfilename.split('/') {
        if !root.pop() {
            return None;
        }
    }
    Some(root)
}

/// Turn a bundle location (local directory or remote identifier) into an
/// existing local directory.
pub fn resolve_bundle(
    location: &str,
    resolver: &dyn SnapshotResolver,
) -> Result<PathBuf, LlavaError> {
    let direct = Path::new(location);
    let root = if direct.is_dir() {
        direct.to_path_buf()
    } else {
        resolver.resolve(location)?
    };
    if !root.is_dir() {
        return Err(LlavaError::BundleNotFound(root));
    }
    Ok(root)
}
