use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{now_ts, optional_str, required_str, string_array, with_ctx, Ctx};
use crate::ipc::lookups::{class_students, load_profile, require_class, ClassRow};
use crate::ipc::types::{AppState, Request, Role};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn classes_list(ctx: &Ctx<'_>, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    // Students only see the class they belong to.
    let own_class: Option<String> = if ctx.session.is_teacher() {
        None
    } else {
        match load_profile(ctx.conn, &ctx.session.user_id)?.and_then(|p| p.class_id) {
            Some(c) => Some(c),
            None => return Ok(json!({ "classes": [] })),
        }
    };

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.department,
               c.academic_year,
               c.teacher_id,
               (SELECT COUNT(*) FROM profiles p WHERE p.class_id = c.id AND p.role = 'student') AS student_count,
               (SELECT COUNT(*) FROM activity_classes ac WHERE ac.class_id = c.id) AS activity_count
             FROM classes c
             WHERE (?1 IS NULL OR c.id = ?1)
             ORDER BY c.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let classes = stmt
        .query_map([&own_class], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let department: Option<String> = row.get(2)?;
            let academic_year: Option<String> = row.get(3)?;
            let teacher_id: Option<String> = row.get(4)?;
            let student_count: i64 = row.get(5)?;
            let activity_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "department": department,
                "academicYear": academic_year,
                "teacherId": teacher_id,
                "studentCount": student_count,
                "activityCount": activity_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let name = required_str(params, "name")?;
    let department = optional_str(params, "department")?;
    let academic_year = optional_str(params, "academicYear")?;

    let class_id = Uuid::new_v4().to_string();
    ctx.conn
        .execute(
            "INSERT INTO classes(id, name, department, academic_year, teacher_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &class_id,
                &name,
                &department,
                &academic_year,
                &ctx.session.user_id,
                now_ts(),
            ),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "classes" }))
        })?;
    info!(class = %class_id, "class created");

    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_update(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let mut class = require_class(ctx.conn, &class_id)?;
    for k in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        match k.as_str() {
            "name" => class.name = required_str(patch, k)?,
            "department" => class.department = optional_str(patch, k)?,
            "academicYear" => class.academic_year = optional_str(patch, k)?,
            "teacherId" => {
                let tid = optional_str(patch, k)?;
                if let Some(t) = &tid {
                    match load_profile(ctx.conn, t)? {
                        Some(p) if p.role == Role::Teacher => {}
                        _ => return Err(HandlerErr::not_found("teacher not found")),
                    }
                }
                class.teacher_id = tid;
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown class field: {}", k))),
        }
    }
    ctx.conn
        .execute(
            "UPDATE classes SET name = ?, department = ?, academic_year = ?, teacher_id = ? WHERE id = ?",
            (
                &class.name,
                &class.department,
                &class.academic_year,
                &class.teacher_id,
                &class.id,
            ),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "classes" }))
        })?;
    Ok(json!({ "class": class.to_json() }))
}

fn classes_delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    require_class(ctx.conn, &class_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let detached = tx
        .execute(
            "UPDATE profiles SET class_id = NULL, updated_at = ? WHERE class_id = ?",
            (now_ts(), &class_id),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "profiles" }))
        })?;
    for (table, sql) in [
        ("activity_classes", "DELETE FROM activity_classes WHERE class_id = ?"),
        ("cep_requirements", "DELETE FROM cep_requirements WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ] {
        tx.execute(sql, [&class_id]).map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    info!(class = %class_id, detached, "class deleted");

    Ok(json!({ "ok": true, "detachedStudents": detached }))
}

fn class_access(ctx: &Ctx<'_>, class_id: &str) -> Result<ClassRow, HandlerErr> {
    let class = require_class(ctx.conn, class_id)?;
    if !ctx.session.is_teacher() {
        let own = load_profile(ctx.conn, &ctx.session.user_id)?.and_then(|p| p.class_id);
        if own.as_deref() != Some(class_id) {
            return Err(HandlerErr::forbidden("not a member of this class"));
        }
    }
    Ok(class)
}

fn roster_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let class = class_access(ctx, &class_id)?;
    let students: Vec<serde_json::Value> = class_students(ctx.conn, &class_id)?
        .iter()
        .map(|s| s.to_json())
        .collect();
    Ok(json!({ "class": class.to_json(), "students": students }))
}

fn roster_add(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let student_ids = string_array(params, "studentIds")?;
    require_class(ctx.conn, &class_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut added: Vec<String> = Vec::new();
    let mut skipped: Vec<serde_json::Value> = Vec::new();
    for sid in student_ids {
        let profile = load_profile(&tx, &sid)?;
        match profile {
            Some(p) if p.role == Role::Student => {
                tx.execute(
                    "UPDATE profiles SET class_id = ?, updated_at = ? WHERE id = ?",
                    (&class_id, now_ts(), &sid),
                )
                .map_err(|e| {
                    HandlerErr::db("db_update_failed", e)
                        .with_details(json!({ "table": "profiles" }))
                })?;
                added.push(sid);
            }
            Some(_) => skipped.push(json!({ "studentId": sid, "reason": "not_a_student" })),
            None => skipped.push(json!({ "studentId": sid, "reason": "not_found" })),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "added": added, "skipped": skipped }))
}

fn roster_remove(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let class_id = required_str(params, "classId")?;
    let student_id = required_str(params, "studentId")?;
    let changed = ctx
        .conn
        .execute(
            "UPDATE profiles SET class_id = NULL, updated_at = ?
             WHERE id = ? AND class_id = ? AND role = 'student'",
            (now_ts(), &student_id, &class_id),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "profiles" }))
        })?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student not in class"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(with_ctx(state, req, classes_list)),
        "classes.create" => Some(with_ctx(state, req, classes_create)),
        "classes.update" => Some(with_ctx(state, req, classes_update)),
        "classes.delete" => Some(with_ctx(state, req, classes_delete)),
        "roster.list" => Some(with_ctx(state, req, roster_list)),
        "roster.add" => Some(with_ctx(state, req, roster_add)),
        "roster.remove" => Some(with_ctx(state, req, roster_remove)),
        _ => None,
    }
}
