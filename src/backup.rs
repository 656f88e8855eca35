use crate::storage::sha256_file;
use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_FILE: &str = "credilocker.sqlite3";
const DB_ENTRY: &str = "db/credilocker.sqlite3";
const STORAGE_DIR: &str = "storage";
pub const BUNDLE_FORMAT_V1: &str = "credilocker-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub storage_file_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub storage_file_count: usize,
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let db_sha256 = sha256_path(&db_path)?;
    let storage_files = list_storage_files(workspace_path)?;

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "dbSha256": db_sha256,
        "storageFiles": storage_files.len(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    for rel in &storage_files {
        zip.start_file(rel.as_str(), opts)
            .with_context(|| format!("failed to start storage entry {}", rel))?;
        let abs = rel
            .split('/')
            .fold(workspace_path.to_path_buf(), |acc, part| acc.join(part));
        let mut f = File::open(&abs)
            .with_context(|| format!("failed to open stored file {}", abs.to_string_lossy()))?;
        std::io::copy(&mut f, &mut zip)
            .with_context(|| format!("failed to write storage entry {}", rel))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 2 + storage_files.len(),
        storage_file_count: storage_files.len(),
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(DB_FILE);

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected_sha = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    // Every storage entry is checked before anything in the workspace changes.
    let mut storage_entries: Vec<(usize, PathBuf)> = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).context("failed to read zip entry")?;
        let name = entry.name().to_string();
        if !name.starts_with("storage/") || name.ends_with('/') {
            continue;
        }
        let rel = entry
            .enclosed_name()
            .and_then(|p| p.strip_prefix(STORAGE_DIR).ok().map(|r| r.to_path_buf()))
            .filter(|r| r.components().next().is_some())
            .ok_or_else(|| anyhow!("unsafe storage entry path: {}", name))?;
        storage_entries.push((i, rel));
    }

    let tmp_dst = workspace_path.join(format!("{}.importing", DB_FILE));
    let tmp_storage = workspace_path.join(format!("{}.importing", STORAGE_DIR));
    discard_staged(&tmp_dst, &tmp_storage);

    if let Err(e) = stage_import(
        &mut archive,
        &expected_sha,
        &storage_entries,
        &tmp_dst,
        &tmp_storage,
    ) {
        discard_staged(&tmp_dst, &tmp_storage);
        return Err(e);
    }

    // Storage is replaced wholesale so it matches the restored rows.
    let storage_root = workspace_path.join(STORAGE_DIR);
    let prev_storage = workspace_path.join(format!("{}.previous", STORAGE_DIR));
    if prev_storage.exists() {
        std::fs::remove_dir_all(&prev_storage).with_context(|| {
            format!("failed to clear {}", prev_storage.to_string_lossy())
        })?;
    }
    let had_storage = storage_root.exists();
    if had_storage {
        if let Err(e) = std::fs::rename(&storage_root, &prev_storage) {
            discard_staged(&tmp_dst, &tmp_storage);
            return Err(e).with_context(|| {
                format!("failed to set aside storage {}", storage_root.to_string_lossy())
            });
        }
    }
    let swapped = std::fs::rename(&tmp_storage, &storage_root)
        .with_context(|| format!("failed to move restored storage to {}", storage_root.to_string_lossy()))
        .and_then(|_| replace_database(&tmp_dst, &dst));
    if let Err(e) = swapped {
        if storage_root.exists() {
            let _ = std::fs::remove_dir_all(&storage_root);
        }
        if had_storage {
            let _ = std::fs::rename(&prev_storage, &storage_root);
        }
        discard_staged(&tmp_dst, &tmp_storage);
        return Err(e);
    }
    if prev_storage.exists() {
        let _ = std::fs::remove_dir_all(&prev_storage);
    }

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
        storage_file_count: storage_entries.len(),
    })
}

/// Extracts the database to `tmp_db` and checks its digest, then extracts storage into `tmp_storage`.
fn stage_import(
    archive: &mut ZipArchive<File>,
    expected_sha: &str,
    storage_entries: &[(usize, PathBuf)],
    tmp_db: &Path,
    tmp_storage: &Path,
) -> anyhow::Result<()> {
    let mut db_out = File::create(tmp_db).with_context(|| {
        format!("failed to create temp database {}", tmp_db.to_string_lossy())
    })?;
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/credilocker.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
    }
    db_out
        .flush()
        .context("failed to flush extracted database")?;
    drop(db_out);

    let actual_sha = sha256_path(tmp_db)?;
    if actual_sha != expected_sha {
        return Err(anyhow!(
            "database digest mismatch: manifest {}, bundle {}",
            expected_sha,
            actual_sha
        ));
    }

    std::fs::create_dir_all(tmp_storage).with_context(|| {
        format!("failed to create directory {}", tmp_storage.to_string_lossy())
    })?;
    for (i, rel) in storage_entries {
        let mut entry = archive.by_index(*i).context("failed to read zip entry")?;
        let out = tmp_storage.join(rel);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
        let mut f = File::create(&out)
            .with_context(|| format!("failed to create {}", out.to_string_lossy()))?;
        std::io::copy(&mut entry, &mut f)
            .with_context(|| format!("failed to extract {}", entry.name()))?;
    }
    Ok(())
}

fn replace_database(tmp_db: &Path, dst: &Path) -> anyhow::Result<()> {
    if dst.exists() {
        std::fs::remove_file(dst).with_context(|| {
            format!("failed to remove existing database {}", dst.to_string_lossy())
        })?;
    }
    std::fs::rename(tmp_db, dst).with_context(|| {
        format!("failed to move extracted database to {}", dst.to_string_lossy())
    })
}

fn discard_staged(tmp_db: &Path, tmp_storage: &Path) {
    if tmp_db.exists() {
        let _ = std::fs::remove_file(tmp_db);
    }
    if tmp_storage.exists() {
        let _ = std::fs::remove_dir_all(tmp_storage);
    }
}

/// Workspace-relative `/`-separated paths of every file under `storage/`, sorted.
fn list_storage_files(workspace_path: &Path) -> anyhow::Result<Vec<String>> {
    let root = workspace_path.join(STORAGE_DIR);
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    let mut stack: Vec<(PathBuf, String)> = vec![(root, STORAGE_DIR.to_string())];
    while let Some((dir, rel)) = stack.pop() {
        for ent in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.to_string_lossy()))?
        {
            let ent = ent?;
            let name = ent.file_name().to_string_lossy().to_string();
            let child_rel = format!("{}/{}", rel, name);
            let ft = ent.file_type()?;
            if ft.is_dir() {
                stack.push((ent.path(), child_rel));
            } else if ft.is_file() {
                out.push(child_rel);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn sha256_path(path: &Path) -> anyhow::Result<String> {
    sha256_file(path).with_context(|| format!("failed to hash {}", path.to_string_lossy()))
}
