use crate::credits::ReviewStatus;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup::field_project_settings;
use crate::ipc::helpers::{now_ts, optional_str, required_str, with_ctx, Ctx};
use crate::ipc::lookups::{class_students, require_class, require_student};
use crate::ipc::types::{AppState, Request};
use crate::storage::{self, Bucket, StorageError, UploadRules};
use crate::tally::{field_project_status, DocumentKind, FieldProjectStatus};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct DocumentRow {
    id: String,
    student_id: String,
    kind: DocumentKind,
    file_name: String,
    storage_path: String,
    size_bytes: i64,
    sha256: String,
    status: ReviewStatus,
    remark: Option<String>,
    uploaded_at: String,
    reviewed_at: Option<String>,
}

impl DocumentRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "kind": self.kind.as_str(),
            "label": self.kind.label(),
            "fileName": self.file_name,
            "storagePath": self.storage_path,
            "sizeBytes": self.size_bytes,
            "sha256": self.sha256,
            "status": self.status.as_str(),
            "remark": self.remark,
            "uploadedAt": self.uploaded_at,
            "reviewedAt": self.reviewed_at,
        })
    }
}

const DOCUMENT_COLUMNS: &str = "id, student_id, doc_kind, file_name, storage_path, size_bytes, sha256, status, remark, uploaded_at, reviewed_at";

fn document_from_row(r: &Row<'_>) -> rusqlite::Result<DocumentRow> {
    let kind: String = r.get(2)?;
    let status: String = r.get(7)?;
    Ok(DocumentRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        kind: DocumentKind::parse(&kind).unwrap_or(DocumentKind::CompletionLetter),
        file_name: r.get(3)?,
        storage_path: r.get(4)?,
        size_bytes: r.get(5)?,
        sha256: r.get(6)?,
        status: ReviewStatus::parse(&status).unwrap_or(ReviewStatus::Submitted),
        remark: r.get(8)?,
        uploaded_at: r.get(9)?,
        reviewed_at: r.get(10)?,
    })
}

fn student_documents(conn: &Connection, student_id: &str) -> Result<Vec<DocumentRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM field_project_documents WHERE student_id = ?",
            DOCUMENT_COLUMNS
        ))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let mut docs = stmt
        .query_map([student_id], document_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    docs.sort_by_key(|d| DocumentKind::ALL.iter().position(|k| *k == d.kind));
    Ok(docs)
}

fn load_document(conn: &Connection, id: &str) -> Result<DocumentRow, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM field_project_documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ),
        [id],
        document_from_row,
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("document not found"))
}

pub fn student_status(conn: &Connection, student_id: &str) -> Result<FieldProjectStatus, HandlerErr> {
    let docs = student_documents(conn, student_id)?;
    Ok(field_project_status(docs.iter().map(|d| (d.kind, d.status))))
}

pub fn storage_err(e: StorageError) -> HandlerErr {
    match e {
        StorageError::Io(io) => HandlerErr::new("storage_failed", io.to_string()),
        other => HandlerErr::bad_params(other.to_string()),
    }
}

/// Drops an upload whose row was never written. Failures are logged, not returned.
pub fn discard_upload(workspace: &Path, storage_path: &str) -> bool {
    match storage::remove_file(workspace, storage_path) {
        Ok(removed) => removed,
        Err(e) => {
            warn!(path = %storage_path, error = %e, "failed to remove orphaned upload");
            false
        }
    }
}

fn parse_kind(params: &serde_json::Value) -> Result<DocumentKind, HandlerErr> {
    let raw = required_str(params, "kind")?;
    DocumentKind::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params(
            "kind must be one of: completion_letter, outcome_form, feedback_form, video",
        )
    })
}

fn field_project_upload(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    ctx.ensure_student_access(&student_id)?;
    require_student(ctx.conn, &student_id)?;
    let kind = parse_kind(params)?;
    let source = PathBuf::from(required_str(params, "sourcePath")?);
    let settings = field_project_settings(ctx.conn)?;

    let previous: Option<DocumentRow> = student_documents(ctx.conn, &student_id)?
        .into_iter()
        .find(|d| d.kind == kind);
    if let Some(prev) = &previous {
        if prev.status == ReviewStatus::Approved && !settings.allow_resubmit_approved {
            return Err(HandlerErr::conflict("document already approved")
                .with_details(json!({ "documentId": prev.id })));
        }
    }

    let stored = storage::store_file(
        ctx.workspace,
        Bucket::FieldProjects,
        &student_id,
        kind.as_str(),
        &source,
        &UploadRules {
            max_bytes: settings.max_upload_bytes,
            allowed_extensions: kind.allowed_extensions(),
        },
    )
    .map_err(storage_err)?;

    let doc_id = Uuid::new_v4().to_string();
    let write = ctx.conn.execute(
        "INSERT INTO field_project_documents(
            id, student_id, doc_kind, file_name, storage_path, size_bytes, sha256,
            status, remark, uploaded_at, reviewed_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, 'submitted', NULL, ?, NULL)
         ON CONFLICT(student_id, doc_kind) DO UPDATE SET
            id = excluded.id,
            file_name = excluded.file_name,
            storage_path = excluded.storage_path,
            size_bytes = excluded.size_bytes,
            sha256 = excluded.sha256,
            status = 'submitted',
            remark = NULL,
            uploaded_at = excluded.uploaded_at,
            reviewed_at = NULL",
        (
            &doc_id,
            &student_id,
            kind.as_str(),
            &stored.file_name,
            &stored.storage_path,
            stored.size_bytes as i64,
            &stored.sha256,
            now_ts(),
        ),
    );
    if let Err(e) = write {
        discard_upload(ctx.workspace, &stored.storage_path);
        return Err(HandlerErr::db("db_insert_failed", e)
            .with_details(json!({ "table": "field_project_documents" })));
    }

    let replaced = previous.is_some();
    if let Some(prev) = previous {
        if let Err(e) = storage::remove_file(ctx.workspace, &prev.storage_path) {
            warn!(path = %prev.storage_path, error = %e, "failed to remove replaced document");
        }
    }
    info!(student = %student_id, kind = kind.as_str(), bytes = stored.size_bytes, "field project document stored");

    let doc = load_document(ctx.conn, &doc_id)?;
    Ok(json!({ "document": doc.to_json(), "replaced": replaced }))
}

fn field_project_list(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    ctx.ensure_student_access(&student_id)?;
    require_student(ctx.conn, &student_id)?;
    let docs: Vec<serde_json::Value> = student_documents(ctx.conn, &student_id)?
        .iter()
        .map(|d| d.to_json())
        .collect();
    Ok(json!({ "documents": docs }))
}

fn field_project_status_handler(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    ctx.ensure_student_access(&student_id)?;
    require_student(ctx.conn, &student_id)?;
    let status = student_status(ctx.conn, &student_id)?;
    Ok(json!({ "studentId": student_id, "status": status }))
}

fn field_project_review(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let doc_id = required_str(params, "documentId")?;
    let status_raw = required_str(params, "status")?;
    let Some(status) = ReviewStatus::parse_verdict(&status_raw) else {
        return Err(HandlerErr::bad_params("status must be approved or rejected"));
    };
    let remark = optional_str(params, "remark")?;
    load_document(ctx.conn, &doc_id)?;

    ctx.conn
        .execute(
            "UPDATE field_project_documents SET status = ?, remark = ?, reviewed_at = ? WHERE id = ?",
            (status.as_str(), &remark, now_ts(), &doc_id),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e)
                .with_details(json!({ "table": "field_project_documents" }))
        })?;
    let doc = load_document(ctx.conn, &doc_id)?;
    Ok(json!({ "document": doc.to_json() }))
}

fn field_project_delete(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let doc_id = required_str(params, "documentId")?;
    let doc = load_document(ctx.conn, &doc_id)?;
    ctx.ensure_student_access(&doc.student_id)?;

    ctx.conn
        .execute("DELETE FROM field_project_documents WHERE id = ?", [&doc_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e)
                .with_details(json!({ "table": "field_project_documents" }))
        })?;
    let file_removed = match storage::remove_file(ctx.workspace, &doc.storage_path) {
        Ok(removed) => removed,
        Err(e) => {
            warn!(path = %doc.storage_path, error = %e, "failed to remove stored document");
            false
        }
    };
    Ok(json!({ "ok": true, "fileRemoved": file_removed }))
}

fn field_project_class_overview(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let class = require_class(ctx.conn, &class_id)?;
    let students = class_students(ctx.conn, &class_id)?;

    let mut complete_count = 0usize;
    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(students.len());
    for s in &students {
        let status = student_status(ctx.conn, &s.id)?;
        if status.complete {
            complete_count += 1;
        }
        rows.push(json!({
            "student": s.to_json(),
            "status": status,
        }));
    }

    Ok(json!({
        "class": class.to_json(),
        "rows": rows,
        "completeCount": complete_count,
        "incompleteCount": students.len() - complete_count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fieldProject.upload" => Some(with_ctx(state, req, field_project_upload)),
        "fieldProject.list" => Some(with_ctx(state, req, field_project_list)),
        "fieldProject.status" => Some(with_ctx(state, req, field_project_status_handler)),
        "fieldProject.review" => Some(with_ctx(state, req, field_project_review)),
        "fieldProject.delete" => Some(with_ctx(state, req, field_project_delete)),
        "fieldProject.classOverview" => Some(with_ctx(state, req, field_project_class_overview)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn discard_upload_removes_file_and_survives_failures() {
        let ws = temp_dir("credilocker-discard");
        let dir = ws.join("storage").join("field-projects").join("s1");
        std::fs::create_dir_all(&dir).expect("create storage dir");
        std::fs::write(dir.join("doc.pdf"), b"pdf").expect("write doc");

        assert!(discard_upload(&ws, "storage/field-projects/s1/doc.pdf"));
        assert!(!dir.join("doc.pdf").exists());
        assert!(!discard_upload(&ws, "storage/field-projects/s1/doc.pdf"));

        // A directory cannot be removed as a file; the error is swallowed.
        assert!(!discard_upload(&ws, "storage/field-projects/s1"));
        assert!(dir.is_dir());

        let _ = std::fs::remove_dir_all(ws);
    }
}
