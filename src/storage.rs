use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const STORAGE_DIR: &str = "storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    FieldProjects,
    CepProofs,
}

impl Bucket {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::FieldProjects => "field-projects",
            Self::CepProofs => "cep-proofs",
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("source file not found: {0}")]
    SourceMissing(String),
    #[error("file is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("file extension '{ext}' is not allowed (expected one of: {allowed})")]
    ExtensionNotAllowed { ext: String, allowed: String },
    #[error("invalid storage owner id")]
    BadOwner,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Original file name as uploaded.
    pub file_name: String,
    /// Workspace-relative path with `/` separators.
    pub storage_path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

pub struct UploadRules<'a> {
    pub max_bytes: u64,
    pub allowed_extensions: &'a [&'a str],
}

pub fn store_file(
    workspace: &Path,
    bucket: Bucket,
    owner_id: &str,
    name_prefix: &str,
    source: &Path,
    rules: &UploadRules<'_>,
) -> Result<StoredFile, StorageError> {
    if owner_id.is_empty()
        || owner_id
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
    {
        return Err(StorageError::BadOwner);
    }
    if !source.is_file() {
        return Err(StorageError::SourceMissing(
            source.to_string_lossy().to_string(),
        ));
    }

    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !rules.allowed_extensions.iter().any(|a| *a == ext) {
        return Err(StorageError::ExtensionNotAllowed {
            ext,
            allowed: rules.allowed_extensions.join(", "),
        });
    }

    let size = std::fs::metadata(source)?.len();
    if size > rules.max_bytes {
        return Err(StorageError::TooLarge {
            size,
            limit: rules.max_bytes,
        });
    }

    let rel_dir = format!("{}/{}/{}", STORAGE_DIR, bucket.dir_name(), owner_id);
    let stored_name = format!("{}-{}.{}", name_prefix, Uuid::new_v4(), ext);
    let abs_dir = workspace.join(&rel_dir);
    std::fs::create_dir_all(&abs_dir)?;
    let dst = abs_dir.join(&stored_name);
    std::fs::copy(source, &dst)?;

    let sha256 = sha256_file(&dst)?;
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| stored_name.clone());

    Ok(StoredFile {
        file_name,
        storage_path: format!("{}/{}", rel_dir, stored_name),
        size_bytes: size,
        sha256,
    })
}

pub fn resolve(workspace: &Path, storage_path: &str) -> PathBuf {
    storage_path
        .split('/')
        .fold(workspace.to_path_buf(), |acc, part| acc.join(part))
}

/// Returns false when the file was already gone.
pub fn remove_file(workspace: &Path, storage_path: &str) -> io::Result<bool> {
    match std::fs::remove_file(resolve(workspace, storage_path)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
