//! Local staging and results directories.
//!
//! Uploaded originals land in `uploads/`, restored images in `restored/`.
//! Names are made unique with a random prefix instead of locking, and
//! lookups never leave the results directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::AppError;
use crate::restore::RestoreError;

pub const UPLOAD_DIR: &str = "uploads";
pub const RESULT_DIR: &str = "restored";
/// Prefix separating result names from their staged originals.
pub const RESULT_PREFIX: &str = "restored_";

const MAX_NAME_BYTES: usize = 128;
const FALLBACK_NAME: &str = "upload";

/// Raw upload written to the staging area.
#[derive(Debug, Clone)]
pub struct StagedUpload {
    /// Unique job id, also the staged filename.
    pub id: String,
    pub path: PathBuf,
}

/// Restored image written to the results directory.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub name: String,
    pub path: PathBuf,
}

/// Stored bytes plus the media type they are served with.
#[derive(Debug)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
}

/// Owner of the staging and results directories.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    staging_dir: PathBuf,
    results_dir: PathBuf,
}

impl ArtifactStore {
    /// Creates both directories under `root` if needed.
    pub async fn open(root: &Path) -> Result<Self, AppError> {
        let staging_dir = root.join(UPLOAD_DIR);
        let results_dir = root.join(RESULT_DIR);
        for dir in [&staging_dir, &results_dir] {
            fs::create_dir_all(dir).await.map_err(|err| {
                AppError::internal(format!("failed to create directory {:?}: {err}", dir))
            })?;
        }
        let results_dir = fs::canonicalize(&results_dir).await.map_err(|err| {
            AppError::internal(format!(
                "failed to resolve results directory {:?}: {err}",
                results_dir
            ))
        })?;

        Ok(Self {
            staging_dir,
            results_dir,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Writes an upload under a fresh `<hex>_<sanitized filename>` name.
    pub async fn stage(
        &self,
        original_filename: &str,
        bytes: &[u8],
    ) -> Result<StagedUpload, RestoreError> {
        let id = new_job_id(original_filename);
        let path = self.staging_dir.join(&id);
        write_new(&path, bytes).await?;
        Ok(StagedUpload { id, path })
    }

    pub async fn read_staged(&self, path: &Path) -> Result<Vec<u8>, RestoreError> {
        fs::read(path).await.map_err(|err| {
            RestoreError::Internal(format!("failed to read staged upload {:?}: {err}", path))
        })
    }

    /// Persists restored bytes as `restored_<job id>`.
    pub async fn persist_result(
        &self,
        job_id: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact, RestoreError> {
        let name = result_name(job_id);
        let path = self.results_dir.join(&name);
        write_new(&path, bytes).await?;
        Ok(StoredArtifact { name, path })
    }

    /// Reads a stored result by bare filename.
    pub async fn retrieve(&self, filename: &str) -> Result<Artifact, AppError> {
        if !is_plain_name(filename) {
            return Err(image_not_found());
        }
        let path = self.results_dir.join(filename);
        let resolved = match fs::canonicalize(&path).await {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(image_not_found()),
            Err(err) => {
                return Err(AppError::internal(format!(
                    "failed to resolve {:?}: {err}",
                    path
                )))
            }
        };
        if resolved.parent() != Some(self.results_dir.as_path()) {
            return Err(image_not_found());
        }

        match fs::read(&resolved).await {
            Ok(bytes) => Ok(Artifact {
                bytes,
                media_type: media_type_for(filename),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(image_not_found()),
            Err(err) => Err(AppError::internal(format!(
                "failed to read {:?}: {err}",
                resolved
            ))),
        }
    }
}

fn image_not_found() -> AppError {
    AppError::not_found("image not found")
}

/// Allocates a fresh job id; identical filenames never share one.
pub fn new_job_id(original_filename: &str) -> String {
    format!(
        "{}_{}",
        Uuid::new_v4().simple(),
        sanitize_filename(original_filename)
    )
}

pub fn result_name(job_id: &str) -> String {
    format!("{RESULT_PREFIX}{job_id}")
}

/// Reduces a client-supplied filename to a single safe path component.
///
/// Keeps the last component, replaces anything outside `[A-Za-z0-9._-]`
/// with `_`, drops leading dots and caps the length.
pub fn sanitize_filename(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned = cleaned.trim_start_matches('.').to_string();

    if cleaned.len() > MAX_NAME_BYTES {
        // keep the extension when truncating
        let ext = cleaned
            .rfind('.')
            .map(|idx| cleaned[idx..].to_string())
            .filter(|ext| ext.len() <= 16)
            .unwrap_or_default();
        cleaned.truncate(MAX_NAME_BYTES - ext.len());
        cleaned.push_str(&ext);
    }

    if cleaned.trim_matches(['.', '_']).is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Accepts only names that stay inside a single directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && name != ".."
}

/// Media type served for a stored file, by extension.
pub fn media_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

/// Writes `bytes` to a hidden temporary sibling, then links it into place.
///
/// Fails if `path` already exists.
async fn write_new(path: &Path, bytes: &[u8]) -> Result<(), RestoreError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RestoreError::Internal(format!("invalid target path {:?}", path)))?;
    let tmp_path = path.with_file_name(format!(".{file_name}.part"));

    let mut out = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .await
        .map_err(|err| {
            RestoreError::Internal(format!("failed to create {:?}: {err}", tmp_path))
        })?;
    let written = async {
        out.write_all(bytes).await?;
        out.flush().await
    }
    .await;
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(RestoreError::Internal(format!(
            "failed writing {:?}: {err}",
            tmp_path
        )));
    }
    drop(out);

    // hard_link refuses to replace an existing file
    let linked = fs::hard_link(&tmp_path, path).await;
    let _ = fs::remove_file(&tmp_path).await;
    linked.map_err(|err| {
        RestoreError::Internal(format!(
            "failed to move {:?} to {:?}: {err}",
            tmp_path, path
        ))
    })
}
