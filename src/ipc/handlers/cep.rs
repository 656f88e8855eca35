use crate::credits::{
    cep_progress, normalize_tiers, round_hours, CepProgress, CepRequirement, CreditTier,
    ReviewStatus,
};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::field_projects::{discard_upload, storage_err};
use crate::ipc::handlers::setup::{cep_settings, field_project_settings};
use crate::ipc::helpers::{
    as_of, format_date, now_ts, optional_date, optional_str, parse_date, required_f64,
    required_str, with_ctx, Ctx,
};
use crate::ipc::lookups::{
    class_students, load_profile, require_class, require_student, ProfileRow,
};
use crate::ipc::types::{AppState, Request};
use crate::storage::{self, Bucket, UploadRules};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_ENTRY_HOURS: f64 = 24.0;
const PROOF_EXTENSIONS: &[&str] = &["pdf", "jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
struct EntryRow {
    id: String,
    student_id: String,
    activity_name: String,
    activity_date: String,
    hours: f64,
    description: Option<String>,
    proof_path: Option<String>,
    proof_sha256: Option<String>,
    status: ReviewStatus,
    remark: Option<String>,
    created_at: String,
}

impl EntryRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "activityName": self.activity_name,
            "activityDate": self.activity_date,
            "hours": self.hours,
            "description": self.description,
            "proofPath": self.proof_path,
            "proofSha256": self.proof_sha256,
            "status": self.status.as_str(),
            "remark": self.remark,
            "createdAt": self.created_at,
        })
    }
}

const ENTRY_COLUMNS: &str = "id, student_id, activity_name, activity_date, hours, description, proof_path, proof_sha256, status, remark, created_at";

fn entry_from_row(r: &Row<'_>) -> rusqlite::Result<EntryRow> {
    let status: String = r.get(8)?;
    Ok(EntryRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        activity_name: r.get(2)?,
        activity_date: r.get(3)?,
        hours: r.get(4)?,
        description: r.get(5)?,
        proof_path: r.get(6)?,
        proof_sha256: r.get(7)?,
        status: ReviewStatus::parse(&status).unwrap_or(ReviewStatus::Pending),
        remark: r.get(9)?,
        created_at: r.get(10)?,
    })
}

fn student_entries(conn: &Connection, student_id: &str) -> Result<Vec<EntryRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM cep_entries WHERE student_id = ? ORDER BY activity_date, rowid",
            ENTRY_COLUMNS
        ))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([student_id], entry_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn load_entry(conn: &Connection, id: &str) -> Result<EntryRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM cep_entries WHERE id = ?", ENTRY_COLUMNS),
        [id],
        entry_from_row,
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("entry not found"))
}

/// Stored requirement for the class, else the workspace default with no
/// deadline and no tiers. Second value tells whether a row was stored.
pub fn requirement_for_class(
    conn: &Connection,
    class_id: Option<&str>,
) -> Result<(CepRequirement, bool), HandlerErr> {
    let stored: Option<(f64, Option<String>, String)> = match class_id {
        Some(cid) => conn
            .query_row(
                "SELECT min_hours, deadline, tiers_json FROM cep_requirements WHERE class_id = ?",
                [cid],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?,
        None => None,
    };
    match stored {
        Some((min_hours, deadline, tiers_json)) => {
            let tiers: Vec<CreditTier> = serde_json::from_str(&tiers_json).unwrap_or_else(|e| {
                warn!(error = %e, "stored CEP tiers are unreadable; ignoring");
                Vec::new()
            });
            let deadline = deadline
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
            Ok((
                CepRequirement {
                    min_hours,
                    deadline,
                    tiers,
                },
                true,
            ))
        }
        None => Ok((
            CepRequirement {
                min_hours: cep_settings(conn)?.default_min_hours,
                deadline: None,
                tiers: Vec::new(),
            },
            false,
        )),
    }
}

fn requirement_json(req: &CepRequirement, configured: bool) -> serde_json::Value {
    json!({
        "minHours": req.min_hours,
        "deadline": req.deadline.map(format_date),
        "tiers": req.tiers,
        "configured": configured,
    })
}

pub fn student_progress(
    conn: &Connection,
    student: &ProfileRow,
    as_of: NaiveDate,
) -> Result<CepProgress, HandlerErr> {
    let (requirement, _) = requirement_for_class(conn, student.class_id.as_deref())?;
    let entries = student_entries(conn, &student.id)?;
    Ok(cep_progress(
        entries.iter().map(|e| (e.hours, e.status)),
        &requirement,
        as_of,
    ))
}

#[derive(Debug, Clone)]
pub struct ClassCepSummary {
    pub rows: Vec<(ProfileRow, CepProgress)>,
    pub met_count: usize,
    pub not_met_count: usize,
    pub average_hours: f64,
    pub total_credits: f64,
}

pub fn class_summary(
    conn: &Connection,
    class_id: &str,
    as_of: NaiveDate,
) -> Result<ClassCepSummary, HandlerErr> {
    let students = class_students(conn, class_id)?;
    let mut rows = Vec::with_capacity(students.len());
    for s in students {
        let p = student_progress(conn, &s, as_of)?;
        rows.push((s, p));
    }
    let met_count = rows.iter().filter(|(_, p)| p.requirement_met).count();
    let total_hours: f64 = rows.iter().map(|(_, p)| p.total_hours).sum();
    let average_hours = if rows.is_empty() {
        0.0
    } else {
        round_hours(total_hours / rows.len() as f64)
    };
    let total_credits: f64 = rows.iter().map(|(_, p)| p.credits).sum();
    Ok(ClassCepSummary {
        not_met_count: rows.len() - met_count,
        met_count,
        average_hours,
        total_credits,
        rows,
    })
}

fn cep_requirement_get(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    require_class(ctx.conn, &class_id)?;
    if !ctx.session.is_teacher() {
        let own = load_profile(ctx.conn, &ctx.session.user_id)?.and_then(|p| p.class_id);
        if own.as_deref() != Some(class_id.as_str()) {
            return Err(HandlerErr::forbidden("not a member of this class"));
        }
    }
    let (req, configured) = requirement_for_class(ctx.conn, Some(&class_id))?;
    Ok(json!({ "classId": class_id, "requirement": requirement_json(&req, configured) }))
}

fn cep_requirement_set(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    require_class(ctx.conn, &class_id)?;
    let min_hours = required_f64(params, "minHours")?;
    if min_hours < 0.0 {
        return Err(HandlerErr::bad_params("minHours must not be negative"));
    }
    let deadline = optional_date(params, "deadline")?;
    let tiers: Vec<CreditTier> = match params.get("tiers") {
        None => Vec::new(),
        Some(v) if v.is_null() => Vec::new(),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            HandlerErr::bad_params(format!("tiers must be [{{minHours, credits}}]: {}", e))
        })?,
    };
    let tiers = normalize_tiers(tiers).map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    let tiers_json =
        serde_json::to_string(&tiers).map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    ctx.conn
        .execute(
            "INSERT INTO cep_requirements(class_id, min_hours, deadline, tiers_json, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(class_id) DO UPDATE SET
               min_hours = excluded.min_hours,
               deadline = excluded.deadline,
               tiers_json = excluded.tiers_json,
               updated_at = excluded.updated_at",
            (
                &class_id,
                min_hours,
                deadline.map(format_date),
                &tiers_json,
                now_ts(),
            ),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e)
                .with_details(json!({ "table": "cep_requirements" }))
        })?;
    info!(class = %class_id, min_hours, tiers = tiers.len(), "CEP requirement saved");

    let requirement = CepRequirement {
        min_hours,
        deadline,
        tiers,
    };
    Ok(json!({ "classId": class_id, "requirement": requirement_json(&requirement, true) }))
}

fn cep_entries_add(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    ctx.ensure_student_access(&student_id)?;
    require_student(ctx.conn, &student_id)?;
    let activity_name = required_str(params, "activityName")?;
    let activity_date = parse_date(&required_str(params, "activityDate")?, "activityDate")?;
    let hours = required_f64(params, "hours")?;
    if hours <= 0.0 || hours > MAX_ENTRY_HOURS {
        return Err(HandlerErr::bad_params(format!(
            "hours must be greater than 0 and at most {}",
            MAX_ENTRY_HOURS
        )));
    }
    let description = optional_str(params, "description")?;

    let entry_id = Uuid::new_v4().to_string();
    let max_bytes = field_project_settings(ctx.conn)?.max_upload_bytes;
    let proof = match optional_str(params, "proofPath")? {
        Some(p) => Some(
            storage::store_file(
                ctx.workspace,
                Bucket::CepProofs,
                &student_id,
                "proof",
                &PathBuf::from(p),
                &UploadRules {
                    max_bytes,
                    allowed_extensions: PROOF_EXTENSIONS,
                },
            )
            .map_err(storage_err)?,
        ),
        None => None,
    };

    let write = ctx.conn.execute(
        "INSERT INTO cep_entries(
            id, student_id, activity_name, activity_date, hours, description,
            proof_path, proof_sha256, status, remark, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, ?)",
        (
            &entry_id,
            &student_id,
            &activity_name,
            format_date(activity_date),
            hours,
            &description,
            proof.as_ref().map(|p| p.storage_path.clone()),
            proof.as_ref().map(|p| p.sha256.clone()),
            now_ts(),
        ),
    );
    if let Err(e) = write {
        if let Some(p) = &proof {
            discard_upload(ctx.workspace, &p.storage_path);
        }
        return Err(HandlerErr::db("db_insert_failed", e)
            .with_details(json!({ "table": "cep_entries" })));
    }

    let entry = load_entry(ctx.conn, &entry_id)?;
    Ok(json!({ "entry": entry.to_json() }))
}

fn cep_entries_list(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    ctx.ensure_student_access(&student_id)?;
    require_student(ctx.conn, &student_id)?;
    let entries: Vec<serde_json::Value> = student_entries(ctx.conn, &student_id)?
        .iter()
        .map(|e| e.to_json())
        .collect();
    Ok(json!({ "entries": entries }))
}

fn cep_entries_delete(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let entry_id = required_str(params, "entryId")?;
    let entry = load_entry(ctx.conn, &entry_id)?;
    ctx.ensure_student_access(&entry.student_id)?;
    if !ctx.session.is_teacher() {
        if !cep_settings(ctx.conn)?.allow_student_delete {
            return Err(HandlerErr::forbidden("students may not delete CEP entries"));
        }
        if entry.status == ReviewStatus::Approved {
            return Err(HandlerErr::forbidden("approved entries can only be removed by a teacher"));
        }
    }

    ctx.conn
        .execute("DELETE FROM cep_entries WHERE id = ?", [&entry_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "cep_entries" }))
        })?;
    if let Some(path) = &entry.proof_path {
        if let Err(e) = storage::remove_file(ctx.workspace, path) {
            warn!(path = %path, error = %e, "failed to remove CEP proof");
        }
    }
    Ok(json!({ "ok": true }))
}

fn cep_entries_review(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let entry_id = required_str(params, "entryId")?;
    let status_raw = required_str(params, "status")?;
    let Some(status) = ReviewStatus::parse_verdict(&status_raw) else {
        return Err(HandlerErr::bad_params("status must be approved or rejected"));
    };
    let remark = optional_str(params, "remark")?;
    load_entry(ctx.conn, &entry_id)?;
    ctx.conn
        .execute(
            "UPDATE cep_entries SET status = ?, remark = ? WHERE id = ?",
            (status.as_str(), &remark, &entry_id),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "cep_entries" }))
        })?;
    let entry = load_entry(ctx.conn, &entry_id)?;
    Ok(json!({ "entry": entry.to_json() }))
}

fn cep_progress_handler(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    ctx.ensure_student_access(&student_id)?;
    let student = require_student(ctx.conn, &student_id)?;
    let as_of = as_of(params)?;
    let progress = student_progress(ctx.conn, &student, as_of)?;
    Ok(json!({
        "studentId": student_id,
        "asOf": format_date(as_of),
        "progress": progress
    }))
}

fn cep_class_summary(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let class = require_class(ctx.conn, &class_id)?;
    let as_of = as_of(params)?;
    let (requirement, configured) = requirement_for_class(ctx.conn, Some(&class_id))?;
    let summary = class_summary(ctx.conn, &class_id, as_of)?;
    let rows: Vec<serde_json::Value> = summary
        .rows
        .iter()
        .map(|(s, p)| json!({ "student": s.to_json(), "progress": p }))
        .collect();
    Ok(json!({
        "class": class.to_json(),
        "asOf": format_date(as_of),
        "requirement": requirement_json(&requirement, configured),
        "rows": rows,
        "metCount": summary.met_count,
        "notMetCount": summary.not_met_count,
        "averageHours": summary.average_hours,
        "totalCredits": summary.total_credits,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "cep.requirement.get" => Some(with_ctx(state, req, cep_requirement_get)),
        "cep.requirement.set" => Some(with_ctx(state, req, cep_requirement_set)),
        "cep.entries.add" => Some(with_ctx(state, req, cep_entries_add)),
        "cep.entries.list" => Some(with_ctx(state, req, cep_entries_list)),
        "cep.entries.delete" => Some(with_ctx(state, req, cep_entries_delete)),
        "cep.entries.review" => Some(with_ctx(state, req, cep_entries_review)),
        "cep.progress" => Some(with_ctx(state, req, cep_progress_handler)),
        "cep.classSummary" => Some(with_ctx(state, req, cep_class_summary)),
        _ => None,
    }
}
