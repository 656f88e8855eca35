use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::activities::{
    activity_tally, list_activities, student_mark, student_points,
};
use crate::ipc::handlers::cep::{class_summary, requirement_for_class, student_progress};
use crate::ipc::handlers::field_projects::student_status;
use crate::ipc::handlers::setup::activity_settings;
use crate::ipc::helpers::{as_of, format_date, optional_str, required_str, with_ctx, Ctx};
use crate::ipc::lookups::{class_students, require_class, require_student};
use crate::ipc::types::{AppState, Request};
use crate::tally::round_rate;
use serde_json::json;

fn dashboard_teacher(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let as_of = as_of(params)?;
    let class = require_class(ctx.conn, &class_id)?;
    let students = class_students(ctx.conn, &class_id)?;

    let mut complete_count = 0usize;
    for s in &students {
        if student_status(ctx.conn, &s.id)?.complete {
            complete_count += 1;
        }
    }

    let cep = class_summary(ctx.conn, &class_id, as_of)?;
    let (requirement, _) = requirement_for_class(ctx.conn, Some(&class_id))?;

    // Rate average only covers activities with at least one marked student.
    let count_excused = activity_settings(ctx.conn)?.count_excused_as_present;
    let activities = list_activities(ctx.conn, Some(&class_id))?;
    let mut rates: Vec<f64> = Vec::new();
    for a in &activities {
        let t = activity_tally(ctx.conn, a, count_excused)?;
        if t.present + t.absent + t.excused > 0 {
            rates.push(t.attendance_rate);
        }
    }
    let average_rate = if rates.is_empty() {
        0.0
    } else {
        round_rate(rates.iter().sum::<f64>() / rates.len() as f64)
    };
    let today = format_date(as_of);
    let upcoming: Vec<serde_json::Value> = activities
        .iter()
        .filter(|a| a.activity_date >= today)
        .map(|a| a.to_json())
        .collect();

    Ok(json!({
        "class": class.to_json(),
        "studentCount": students.len(),
        "fieldProjects": {
            "completeCount": complete_count,
            "incompleteCount": students.len() - complete_count,
        },
        "cep": {
            "metCount": cep.met_count,
            "notMetCount": cep.not_met_count,
            "averageHours": cep.average_hours,
            "totalCredits": cep.total_credits,
            "minHours": requirement.min_hours,
            "deadline": requirement.deadline.map(format_date),
        },
        "activities": {
            "count": activities.len(),
            "averageAttendanceRate": average_rate,
            "upcoming": upcoming,
        },
    }))
}

fn dashboard_student(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id =
        optional_str(params, "studentId")?.unwrap_or_else(|| ctx.session.user_id.clone());
    ctx.ensure_student_access(&student_id)?;
    let as_of = as_of(params)?;
    let student = require_student(ctx.conn, &student_id)?;

    let field_project = student_status(ctx.conn, &student_id)?;
    let cep = student_progress(ctx.conn, &student, as_of)?;
    let points = student_points(ctx.conn, &student_id)?;

    let mut activities: Vec<serde_json::Value> = Vec::new();
    if let Some(class_id) = student.class_id.as_deref() {
        for a in list_activities(ctx.conn, Some(class_id))? {
            let status = student_mark(ctx.conn, &a.id, &student_id)?;
            let mut v = a.to_json();
            v["myStatus"] = json!(status.map(|m| m.as_str()));
            activities.push(v);
        }
    }

    Ok(json!({
        "profile": student.to_json(),
        "fieldProject": field_project,
        "cep": cep,
        "activities": activities,
        "totalPoints": points.total_points,
        "attendedCount": points.attended_count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.teacher" => Some(with_ctx(state, req, dashboard_teacher)),
        "dashboard.student" => Some(with_ctx(state, req, dashboard_student)),
        _ => None,
    }
}
