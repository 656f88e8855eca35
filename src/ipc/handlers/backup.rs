use crate::backup;
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{context, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

/// Teacher gate plus the workspace path, checked before any state is touched.
fn teacher_workspace(state: &AppState) -> Result<PathBuf, HandlerErr> {
    let ctx = context(state)?;
    ctx.require_teacher()?;
    Ok(ctx.workspace.to_path_buf())
}

fn export_bundle(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let workspace_path = teacher_workspace(state)?;
    let out_path = PathBuf::from(required_str(params, "outPath")?);

    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(FULL)") {
            warn!(error = %e, "wal checkpoint before export failed");
        }
    }

    let export = backup::export_workspace_bundle(&workspace_path, &out_path).map_err(|e| {
        HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "path": out_path.to_string_lossy() }))
    })?;
    info!(
        path = %out_path.display(),
        files = export.storage_file_count,
        "workspace bundle exported"
    );
    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "storageFileCount": export.storage_file_count,
    }))
}

fn import_bundle(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let workspace_path = teacher_workspace(state)?;
    let in_path = PathBuf::from(required_str(params, "inPath")?);
    if !in_path.is_file() {
        return Err(HandlerErr::not_found("bundle file not found")
            .with_details(json!({ "path": in_path.to_string_lossy() })));
    }

    // Drop the open handle before the database file is replaced.
    state.db = None;
    let imported = backup::import_workspace_bundle(&in_path, &workspace_path);

    let conn = db::open_db(&workspace_path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    state.db = Some(conn);

    let import = imported.map_err(|e| {
        warn!(path = %in_path.display(), error = %e, "workspace bundle import failed");
        HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "path": in_path.to_string_lossy() }))
    })?;
    state.session = None;
    info!(
        path = %in_path.display(),
        files = import.storage_file_count,
        "workspace bundle imported"
    );
    Ok(json!({
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "storageFileCount": import.storage_file_count,
        "signedOut": true,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(respond(&req.id, export_bundle(state, &req.params))),
        "backup.importWorkspaceBundle" => Some(respond(&req.id, import_bundle(state, &req.params))),
        _ => None,
    }
}
