use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup::activity_settings;
use crate::ipc::helpers::{
    format_date, now_ts, optional_i64, optional_str, parse_date, required_str, string_array,
    with_ctx, Ctx,
};
use crate::ipc::lookups::{
    activity_class_ids, class_students, load_class, load_profile, require_student, roster_order,
    ProfileRow,
};
use crate::ipc::types::{AppState, Request};
use crate::tally::{tally_attendance, AttendanceStatus, AttendanceTally};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub activity_date: String,
    pub start_time: Option<String>,
    pub venue: Option<String>,
    pub points: i64,
    pub class_ids: Vec<String>,
}

impl ActivityRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "activityDate": self.activity_date,
            "startTime": self.start_time,
            "venue": self.venue,
            "points": self.points,
            "classIds": self.class_ids,
        })
    }
}

const ACTIVITY_COLUMNS: &str =
    "a.id, a.name, a.description, a.activity_date, a.start_time, a.venue, a.points";

fn activity_from_row(r: &Row<'_>) -> rusqlite::Result<ActivityRow> {
    Ok(ActivityRow {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        activity_date: r.get(3)?,
        start_time: r.get(4)?,
        venue: r.get(5)?,
        points: r.get(6)?,
        class_ids: Vec::new(),
    })
}

fn with_class_ids(conn: &Connection, mut rows: Vec<ActivityRow>) -> Result<Vec<ActivityRow>, HandlerErr> {
    for row in rows.iter_mut() {
        row.class_ids = activity_class_ids(conn, &row.id)?;
    }
    Ok(rows)
}

pub fn load_activity(conn: &Connection, id: &str) -> Result<ActivityRow, HandlerErr> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM activities a WHERE a.id = ?", ACTIVITY_COLUMNS),
            [id],
            activity_from_row,
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("activity not found"))?;
    Ok(with_class_ids(conn, vec![row])?.remove(0))
}

/// Activities ordered by date then start time. `class_id` limits to one class.
pub fn list_activities(
    conn: &Connection,
    class_id: Option<&str>,
) -> Result<Vec<ActivityRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM activities a
             WHERE ?1 IS NULL
                OR EXISTS(SELECT 1 FROM activity_classes ac WHERE ac.activity_id = a.id AND ac.class_id = ?1)
             ORDER BY a.activity_date, COALESCE(a.start_time, ''), a.name",
            ACTIVITY_COLUMNS
        ))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([class_id], activity_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    with_class_ids(conn, rows)
}

/// Every student in the activity's assigned classes, in roster order.
pub fn activity_roster(conn: &Connection, activity: &ActivityRow) -> Result<Vec<ProfileRow>, HandlerErr> {
    let mut out: Vec<ProfileRow> = Vec::new();
    for cid in &activity.class_ids {
        out.extend(class_students(conn, cid)?);
    }
    out.sort_by(roster_order);
    Ok(out)
}

pub fn attendance_map(
    conn: &Connection,
    activity_id: &str,
) -> Result<HashMap<String, AttendanceStatus>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT student_id, status FROM activity_attendance WHERE activity_id = ?")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([activity_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(rows
        .into_iter()
        .filter_map(|(sid, s)| AttendanceStatus::parse(&s).map(|st| (sid, st)))
        .collect())
}

/// Tally over the current roster; marks for students no longer assigned are ignored.
pub fn activity_tally(
    conn: &Connection,
    activity: &ActivityRow,
    count_excused_as_present: bool,
) -> Result<AttendanceTally, HandlerErr> {
    let roster = activity_roster(conn, activity)?;
    let marks = attendance_map(conn, &activity.id)?;
    Ok(tally_attendance(
        roster.iter().map(|s| marks.get(&s.id).copied()),
        count_excused_as_present,
    ))
}

pub fn student_mark(
    conn: &Connection,
    activity_id: &str,
    student_id: &str,
) -> Result<Option<AttendanceStatus>, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM activity_attendance WHERE activity_id = ? AND student_id = ?",
            (activity_id, student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(raw.as_deref().and_then(AttendanceStatus::parse))
}

#[derive(Debug, Clone)]
pub struct StudentPoints {
    pub total_points: i64,
    pub attended_count: usize,
    pub rows: Vec<serde_json::Value>,
}

/// Points come only from activities marked present.
pub fn student_points(conn: &Connection, student_id: &str) -> Result<StudentPoints, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.name, a.activity_date, a.points, aa.status
             FROM activity_attendance aa
             JOIN activities a ON a.id = aa.activity_id
             WHERE aa.student_id = ?
             ORDER BY a.activity_date, a.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let marks = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut total_points = 0i64;
    let mut attended_count = 0usize;
    let mut rows = Vec::with_capacity(marks.len());
    for (id, name, date, points, status) in marks {
        let earned = if AttendanceStatus::parse(&status) == Some(AttendanceStatus::Present) {
            attended_count += 1;
            points
        } else {
            0
        };
        total_points += earned;
        rows.push(json!({
            "activityId": id,
            "name": name,
            "activityDate": date,
            "status": status,
            "points": points,
            "earned": earned,
        }));
    }
    Ok(StudentPoints {
        total_points,
        attended_count,
        rows,
    })
}

fn parse_points(params: &serde_json::Value, default: i64) -> Result<i64, HandlerErr> {
    let points = optional_i64(params, "points")?.unwrap_or(default);
    if !(0..=1000).contains(&points) {
        return Err(HandlerErr::bad_params("points must be in 0..=1000"));
    }
    Ok(points)
}

fn parse_start_time(params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    match optional_str(params, "startTime")? {
        Some(t) => {
            let parsed = NaiveTime::parse_from_str(&t, "%H:%M")
                .map_err(|_| HandlerErr::bad_params("startTime must be HH:MM"))?;
            Ok(Some(parsed.format("%H:%M").to_string()))
        }
        None => Ok(None),
    }
}

fn validated_class_ids(conn: &Connection, params: &serde_json::Value) -> Result<Vec<String>, HandlerErr> {
    let class_ids = string_array(params, "classIds")?;
    if class_ids.is_empty() {
        return Err(HandlerErr::bad_params("classIds must name at least one class"));
    }
    for cid in &class_ids {
        if load_class(conn, cid)?.is_none() {
            return Err(HandlerErr::not_found("class not found").with_details(json!({ "classId": cid })));
        }
    }
    Ok(class_ids)
}

fn replace_class_links(
    conn: &Connection,
    activity_id: &str,
    class_ids: &[String],
) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM activity_classes WHERE activity_id = ?",
        [activity_id],
    )
    .map_err(|e| {
        HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "activity_classes" }))
    })?;
    for cid in class_ids {
        conn.execute(
            "INSERT INTO activity_classes(activity_id, class_id) VALUES(?, ?)",
            (activity_id, cid),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e)
                .with_details(json!({ "table": "activity_classes" }))
        })?;
    }
    Ok(())
}

fn activities_create(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let name = required_str(params, "name")?;
    let description = optional_str(params, "description")?;
    let activity_date = parse_date(&required_str(params, "activityDate")?, "activityDate")?;
    let start_time = parse_start_time(params)?;
    let venue = optional_str(params, "venue")?;
    let points = parse_points(params, activity_settings(ctx.conn)?.default_points)?;
    let class_ids = validated_class_ids(ctx.conn, params)?;

    let activity_id = Uuid::new_v4().to_string();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO activities(id, name, description, activity_date, start_time, venue, points, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &activity_id,
            &name,
            &description,
            format_date(activity_date),
            &start_time,
            &venue,
            points,
            &ctx.session.user_id,
            now_ts(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "activities" }))
    })?;
    replace_class_links(&tx, &activity_id, &class_ids)?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    info!(activity = %activity_id, classes = class_ids.len(), "activity scheduled");

    let activity = load_activity(ctx.conn, &activity_id)?;
    Ok(json!({ "activity": activity.to_json() }))
}

fn activities_update(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let activity_id = required_str(params, "activityId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let mut activity = load_activity(ctx.conn, &activity_id)?;
    let mut new_class_ids: Option<Vec<String>> = None;
    for k in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        match k.as_str() {
            "name" => activity.name = required_str(patch, k)?,
            "description" => activity.description = optional_str(patch, k)?,
            "activityDate" => {
                activity.activity_date = format_date(parse_date(&required_str(patch, k)?, k)?)
            }
            "startTime" => activity.start_time = parse_start_time(patch)?,
            "venue" => activity.venue = optional_str(patch, k)?,
            "points" => activity.points = parse_points(patch, activity.points)?,
            "classIds" => new_class_ids = Some(validated_class_ids(ctx.conn, patch)?),
            _ => return Err(HandlerErr::bad_params(format!("unknown activity field: {}", k))),
        }
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "UPDATE activities
         SET name = ?, description = ?, activity_date = ?, start_time = ?, venue = ?, points = ?
         WHERE id = ?",
        (
            &activity.name,
            &activity.description,
            &activity.activity_date,
            &activity.start_time,
            &activity.venue,
            activity.points,
            &activity.id,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "activities" }))
    })?;
    if let Some(ids) = &new_class_ids {
        replace_class_links(&tx, &activity.id, ids)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    let activity = load_activity(ctx.conn, &activity_id)?;
    Ok(json!({ "activity": activity.to_json() }))
}

fn activities_delete(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let activity_id = required_str(params, "activityId")?;
    load_activity(ctx.conn, &activity_id)?;
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for (table, sql) in [
        ("activity_attendance", "DELETE FROM activity_attendance WHERE activity_id = ?"),
        ("activity_classes", "DELETE FROM activity_classes WHERE activity_id = ?"),
        ("activities", "DELETE FROM activities WHERE id = ?"),
    ] {
        tx.execute(sql, [&activity_id]).map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn activities_list(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if ctx.session.is_teacher() {
        let class_id = optional_str(params, "classId")?;
        let count_excused = activity_settings(ctx.conn)?.count_excused_as_present;
        let mut out = Vec::new();
        for a in list_activities(ctx.conn, class_id.as_deref())? {
            let tally = activity_tally(ctx.conn, &a, count_excused)?;
            let mut v = a.to_json();
            v["tally"] = json!(tally);
            out.push(v);
        }
        return Ok(json!({ "activities": out }));
    }

    let me = load_profile(ctx.conn, &ctx.session.user_id)?
        .ok_or_else(|| HandlerErr::not_found("profile not found"))?;
    let Some(class_id) = me.class_id.as_deref() else {
        return Ok(json!({ "activities": [] }));
    };
    let mut out = Vec::new();
    for a in list_activities(ctx.conn, Some(class_id))? {
        let status = student_mark(ctx.conn, &a.id, &me.id)?;
        let mut v = a.to_json();
        v["myStatus"] = json!(status.map(|s| s.as_str()));
        out.push(v);
    }
    Ok(json!({ "activities": out }))
}

fn attendance_get(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let activity_id = required_str(params, "activityId")?;
    let activity = load_activity(ctx.conn, &activity_id)?;
    let roster = activity_roster(ctx.conn, &activity)?;
    let marks = attendance_map(ctx.conn, &activity_id)?;
    let count_excused = activity_settings(ctx.conn)?.count_excused_as_present;

    let rows: Vec<serde_json::Value> = roster
        .iter()
        .map(|s| {
            json!({
                "student": s.to_json(),
                "status": marks.get(&s.id).map(|m| m.as_str()),
            })
        })
        .collect();
    let tally = tally_attendance(
        roster.iter().map(|s| marks.get(&s.id).copied()),
        count_excused,
    );
    Ok(json!({
        "activity": activity.to_json(),
        "rows": rows,
        "tally": tally,
    }))
}

fn parse_optional_status(v: Option<&serde_json::Value>) -> Result<Option<AttendanceStatus>, HandlerErr> {
    match v {
        None => Err(HandlerErr::bad_params("missing status")),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params("status must be string or null"))?;
            AttendanceStatus::parse(s)
                .map(Some)
                .ok_or_else(|| HandlerErr::bad_params("status must be present, absent or excused"))
        }
    }
}

fn write_mark(
    conn: &Connection,
    activity_id: &str,
    student_id: &str,
    status: Option<AttendanceStatus>,
) -> Result<(), HandlerErr> {
    let res = match status {
        Some(s) => conn.execute(
            "INSERT INTO activity_attendance(activity_id, student_id, status, marked_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(activity_id, student_id) DO UPDATE SET
               status = excluded.status,
               marked_at = excluded.marked_at",
            (activity_id, student_id, s.as_str(), now_ts()),
        ),
        None => conn.execute(
            "DELETE FROM activity_attendance WHERE activity_id = ? AND student_id = ?",
            (activity_id, student_id),
        ),
    };
    res.map(|_| ()).map_err(|e| {
        HandlerErr::db("db_update_failed", e)
            .with_details(json!({ "table": "activity_attendance" }))
    })
}

fn attendance_mark(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let activity_id = required_str(params, "activityId")?;
    let student_id = required_str(params, "studentId")?;
    let status = parse_optional_status(params.get("status"))?;
    let activity = load_activity(ctx.conn, &activity_id)?;
    let student = require_student(ctx.conn, &student_id)?;
    let assigned = student
        .class_id
        .as_ref()
        .map(|c| activity.class_ids.contains(c))
        .unwrap_or(false);
    if !assigned {
        return Err(HandlerErr::bad_params("student is not in a class assigned to this activity"));
    }
    write_mark(ctx.conn, &activity_id, &student_id, status)?;
    Ok(json!({ "ok": true, "status": status.map(|s| s.as_str()) }))
}

fn attendance_bulk_mark(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let activity_id = required_str(params, "activityId")?;
    let student_ids = string_array(params, "studentIds")?;
    let status = parse_optional_status(params.get("status"))?;
    let activity = load_activity(ctx.conn, &activity_id)?;
    let roster_ids: Vec<String> = activity_roster(ctx.conn, &activity)?
        .into_iter()
        .map(|s| s.id)
        .collect();

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut updated = 0usize;
    let mut skipped: Vec<String> = Vec::new();
    for sid in student_ids {
        if !roster_ids.contains(&sid) {
            skipped.push(sid);
            continue;
        }
        write_mark(&tx, &activity_id, &sid, status)?;
        updated += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "updated": updated, "skipped": skipped }))
}

fn student_points_handler(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    ctx.ensure_student_access(&student_id)?;
    require_student(ctx.conn, &student_id)?;
    let points = student_points(ctx.conn, &student_id)?;
    Ok(json!({
        "studentId": student_id,
        "totalPoints": points.total_points,
        "attendedCount": points.attended_count,
        "activities": points.rows,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "activities.create" => Some(with_ctx(state, req, activities_create)),
        "activities.update" => Some(with_ctx(state, req, activities_update)),
        "activities.delete" => Some(with_ctx(state, req, activities_delete)),
        "activities.list" => Some(with_ctx(state, req, activities_list)),
        "activities.attendance.get" => Some(with_ctx(state, req, attendance_get)),
        "activities.attendance.mark" => Some(with_ctx(state, req, attendance_mark)),
        "activities.attendance.bulkMark" => Some(with_ctx(state, req, attendance_bulk_mark)),
        "activities.studentPoints" => Some(with_ctx(state, req, student_points_handler)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_time_is_normalized_to_hh_mm() {
        let t = parse_start_time(&json!({ "startTime": "07:05" })).expect("valid");
        assert_eq!(t.as_deref(), Some("07:05"));
        assert_eq!(parse_start_time(&json!({})).expect("absent"), None);
        assert!(parse_start_time(&json!({ "startTime": "7pm" })).is_err());
        assert!(parse_start_time(&json!({ "startTime": "12:60" })).is_err());
    }

    #[test]
    fn status_param_distinguishes_missing_from_null() {
        assert!(parse_optional_status(None).is_err());
        assert_eq!(parse_optional_status(Some(&json!(null))).expect("null"), None);
        assert_eq!(
            parse_optional_status(Some(&json!("Excused"))).expect("excused"),
            Some(AttendanceStatus::Excused)
        );
        assert!(parse_optional_status(Some(&json!("late"))).is_err());
        assert!(parse_optional_status(Some(&json!(1))).is_err());
    }

    #[test]
    fn points_must_stay_in_range() {
        assert_eq!(parse_points(&json!({}), 5).expect("default"), 5);
        assert_eq!(parse_points(&json!({ "points": 12 }), 5).expect("explicit"), 12);
        assert!(parse_points(&json!({ "points": -1 }), 5).is_err());
        assert!(parse_points(&json!({ "points": 1.5 }), 5).is_err());
    }
}
