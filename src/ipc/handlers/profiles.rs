use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{now_ts, optional_str, required_str, with_ctx, Ctx};
use crate::ipc::lookups::{
    load_class, load_profile, load_profile_by_email, profile_from_row, roster_order,
    PROFILE_COLUMNS,
};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::Connection;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn profiles_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let role_raw = required_str(params, "role")?;
    let Some(role) = Role::parse(&role_raw) else {
        return Err(HandlerErr::bad_params("role must be teacher or student"));
    };
    let full_name = required_str(params, "fullName")?;
    let email = required_str(params, "email")?.to_ascii_lowercase();
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(HandlerErr::bad_params("email is not valid"));
    }
    let roll_no = optional_str(params, "rollNo")?;
    let class_id = optional_str(params, "classId")?;

    if let Some(cid) = &class_id {
        if load_class(conn, cid)?.is_none() {
            return Err(HandlerErr::not_found("class not found"));
        }
    }
    if load_profile_by_email(conn, &email)?.is_some() {
        return Err(HandlerErr::conflict("email already registered")
            .with_details(json!({ "email": email })));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO profiles(id, role, full_name, email, roll_no, class_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            role.as_str(),
            &full_name,
            &email,
            &roll_no,
            &class_id,
            now_ts(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "profiles" }))
    })?;
    info!(user = %id, role = role.as_str(), "profile created");

    Ok(json!({
        "userId": id,
        "role": role.as_str(),
        "fullName": full_name,
        "email": email,
        "rollNo": roll_no,
        "classId": class_id,
    }))
}

fn handle_profiles_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    respond(&req.id, profiles_create(conn, &req.params))
}

fn profiles_get(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = required_str(params, "userId")?;
    if !ctx.session.is_teacher() && ctx.session.user_id != user_id {
        return Err(HandlerErr::forbidden("students may only view their own profile"));
    }
    let profile =
        load_profile(ctx.conn, &user_id)?.ok_or_else(|| HandlerErr::not_found("profile not found"))?;
    Ok(json!({ "profile": profile.to_json() }))
}

fn profiles_update(
    ctx: &Ctx<'_>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = required_str(params, "userId")?;
    if !ctx.session.is_teacher() && ctx.session.user_id != user_id {
        return Err(HandlerErr::forbidden("students may only edit their own profile"));
    }
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let mut profile =
        load_profile(ctx.conn, &user_id)?.ok_or_else(|| HandlerErr::not_found("profile not found"))?;

    for k in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        match k.as_str() {
            "fullName" => profile.full_name = required_str(patch, k)?,
            "rollNo" => profile.roll_no = optional_str(patch, k)?,
            _ => return Err(HandlerErr::bad_params(format!("unknown profile field: {}", k))),
        }
    }

    ctx.conn
        .execute(
            "UPDATE profiles SET full_name = ?, roll_no = ?, updated_at = ? WHERE id = ?",
            (&profile.full_name, &profile.roll_no, now_ts(), &profile.id),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "profiles" }))
        })?;
    Ok(json!({ "profile": profile.to_json() }))
}

fn profiles_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    ctx.require_teacher()?;
    let role = match optional_str(params, "role")? {
        Some(r) => Some(
            Role::parse(&r).ok_or_else(|| HandlerErr::bad_params("role must be teacher or student"))?,
        ),
        None => None,
    };
    let mut stmt = ctx
        .conn
        .prepare(&format!("SELECT {} FROM profiles", PROFILE_COLUMNS))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let mut rows = stmt
        .query_map([], profile_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(role) = role {
        rows.retain(|p| p.role == role);
    }
    rows.sort_by(roster_order);
    let profiles: Vec<serde_json::Value> = rows.iter().map(|p| p.to_json()).collect();
    Ok(json!({ "profiles": profiles }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "profiles.create" => Some(handle_profiles_create(state, req)),
        "profiles.get" => Some(with_ctx(state, req, profiles_get)),
        "profiles.update" => Some(with_ctx(state, req, profiles_update)),
        "profiles.list" => Some(with_ctx(state, req, profiles_list)),
        _ => None,
    }
}
