use crate::export::{format_number, write_csv, yes_no, ExportError, Sheet};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::activities::{activity_roster, attendance_map, load_activity, student_points};
use crate::ipc::handlers::cep::class_summary;
use crate::ipc::handlers::field_projects::student_status;
use crate::ipc::helpers::{as_of, required_str, with_ctx, Ctx};
use crate::ipc::lookups::{class_students, load_class, require_class};
use crate::ipc::types::{AppState, Request};
use crate::tally::DocumentKind;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

fn export_err(e: ExportError) -> HandlerErr {
    HandlerErr::new("export_failed", e.to_string())
}

fn finish(kind: &str, sheet: &Sheet, out_path: PathBuf) -> Result<serde_json::Value, HandlerErr> {
    let row_count = write_csv(sheet, &out_path).map_err(export_err)?;
    info!(kind, rows = row_count, path = %out_path.display(), "export written");
    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "rowCount": row_count,
    }))
}

fn doc_cell(state: &str) -> String {
    match state {
        "missing" => String::new(),
        "approved" => "Approved".into(),
        "rejected" => "Rejected".into(),
        _ => "Submitted".into(),
    }
}

fn export_field_projects(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let out_path = PathBuf::from(required_str(params, "outPath")?);
    require_class(ctx.conn, &class_id)?;

    let mut headers = vec!["Roll No".to_string(), "Name".to_string()];
    headers.extend(DocumentKind::ALL.iter().map(|k| k.label().to_string()));
    headers.push("Documents Submitted".into());
    headers.push("Complete".into());
    let mut sheet = Sheet::new(headers);

    for s in class_students(ctx.conn, &class_id)? {
        let status = student_status(ctx.conn, &s.id)?;
        let mut row = vec![s.roll_display(), s.full_name.clone()];
        row.extend(DocumentKind::ALL.iter().map(|k| doc_cell(status.state_of(*k))));
        row.push(format!("{}/{}", status.submitted_count, status.required_count));
        row.push(yes_no(status.complete));
        sheet.push_row(row);
    }
    finish("fieldProjects", &sheet, out_path)
}

fn export_cep(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let out_path = PathBuf::from(required_str(params, "outPath")?);
    let as_of = as_of(params)?;
    require_class(ctx.conn, &class_id)?;

    let mut sheet = Sheet::new([
        "Roll No",
        "Name",
        "Total Hours",
        "Required Hours",
        "Remaining Hours",
        "Credits",
        "Status",
    ]);
    for (s, p) in class_summary(ctx.conn, &class_id, as_of)?.rows {
        let status = if p.requirement_met {
            "Met"
        } else if p.overdue {
            "Overdue"
        } else {
            "Not Met"
        };
        sheet.push_row(vec![
            s.roll_display(),
            s.full_name.clone(),
            format_number(p.total_hours),
            format_number(p.min_hours),
            format_number(p.remaining_hours),
            format_number(p.credits),
            status.to_string(),
        ]);
    }
    finish("cep", &sheet, out_path)
}

fn export_activity_attendance(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let activity_id = required_str(params, "activityId")?;
    let out_path = PathBuf::from(required_str(params, "outPath")?);
    let activity = load_activity(ctx.conn, &activity_id)?;
    let marks = attendance_map(ctx.conn, &activity_id)?;

    let mut class_names: HashMap<String, String> = HashMap::new();
    for cid in &activity.class_ids {
        if let Some(c) = load_class(ctx.conn, cid)? {
            class_names.insert(c.id, c.name);
        }
    }

    let mut sheet = Sheet::new(["Roll No", "Name", "Class", "Status"]);
    for s in activity_roster(ctx.conn, &activity)? {
        let class = s
            .class_id
            .as_ref()
            .and_then(|c| class_names.get(c))
            .cloned()
            .unwrap_or_default();
        let status = marks
            .get(&s.id)
            .map(|m| m.label())
            .unwrap_or("Unmarked")
            .to_string();
        sheet.push_row(vec![s.roll_display(), s.full_name.clone(), class, status]);
    }
    finish("activityAttendance", &sheet, out_path)
}

fn export_activity_points(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let out_path = PathBuf::from(required_str(params, "outPath")?);
    require_class(ctx.conn, &class_id)?;

    let mut sheet = Sheet::new(["Roll No", "Name", "Activities Attended", "Points"]);
    for s in class_students(ctx.conn, &class_id)? {
        let points = student_points(ctx.conn, &s.id)?;
        sheet.push_row(vec![
            s.roll_display(),
            s.full_name.clone(),
            points.attended_count.to_string(),
            points.total_points.to_string(),
        ]);
    }
    finish("activityPoints", &sheet, out_path)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "export.fieldProjects" => Some(with_ctx(state, req, export_field_projects)),
        "export.cep" => Some(with_ctx(state, req, export_cep)),
        "export.activityAttendance" => Some(with_ctx(state, req, export_activity_attendance)),
        "export.activityPoints" => Some(with_ctx(state, req, export_activity_points)),
        _ => None,
    }
}
