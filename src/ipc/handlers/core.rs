use crate::db;
use crate::ipc::error::{err, ok, respond, HandlerErr};
use crate::ipc::helpers::{optional_str, required_str, with_ctx, Ctx};
use crate::ipc::lookups::{load_profile, load_profile_by_email};
use crate::ipc::types::{AppState, Request, Role, Session};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

const TEACHER_PAGES: &[&str] = &[
    "dashboard",
    "classes",
    "roster",
    "fieldProjects",
    "cep",
    "activities",
    "exports",
    "setup",
];
const STUDENT_PAGES: &[&str] = &["dashboard", "fieldProjects", "cep", "activities"];

pub fn pages_for(role: Role) -> &'static [&'static str] {
    match role {
        Role::Teacher => TEACHER_PAGES,
        Role::Student => STUDENT_PAGES,
    }
}

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "signedIn": state.session.is_some()
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            info!(workspace = %path.display(), "workspace opened");
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            state.session = None;
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => {
            warn!(workspace = %path.display(), error = %e, "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

fn session_sign_in(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let profile = if let Some(user_id) = optional_str(params, "userId")? {
        load_profile(conn, &user_id)?
    } else if let Some(email) = optional_str(params, "email")? {
        load_profile_by_email(conn, &email)?
    } else {
        return Err(HandlerErr::bad_params("missing userId or email"));
    };
    let Some(profile) = profile else {
        return Err(HandlerErr::not_found("profile not found"));
    };

    info!(user = %profile.id, role = profile.role.as_str(), "signed in");
    state.session = Some(Session {
        user_id: profile.id.clone(),
        role: profile.role,
    });
    Ok(json!({
        "userId": profile.id,
        "role": profile.role.as_str(),
        "fullName": profile.full_name,
        "classId": profile.class_id,
    }))
}

fn handle_session_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = session_sign_in(state, &req.params);
    respond(&req.id, result)
}

fn handle_session_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    let was = state.session.take();
    if let Some(s) = &was {
        info!(user = %s.user_id, "signed out");
    }
    ok(&req.id, json!({ "signedOut": was.is_some() }))
}

fn handle_session_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(session)) = (state.db.as_ref(), state.session.as_ref()) else {
        return ok(&req.id, json!({ "session": null }));
    };
    match load_profile(conn, &session.user_id) {
        Ok(Some(p)) => ok(&req.id, json!({ "session": p.to_json() })),
        Ok(None) => ok(&req.id, json!({ "session": null })),
        Err(e) => e.response(&req.id),
    }
}

fn access_pages(ctx: &Ctx<'_>, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "role": ctx.session.role.as_str(),
        "pages": pages_for(ctx.session.role)
    }))
}

fn access_check(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let page = required_str(params, "page")?;
    let allowed = pages_for(ctx.session.role).contains(&page.as_str());
    Ok(json!({ "page": page, "allowed": allowed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "session.signIn" => Some(handle_session_sign_in(state, req)),
        "session.signOut" => Some(handle_session_sign_out(state, req)),
        "session.current" => Some(handle_session_current(state, req)),
        "access.pages" => Some(with_ctx(state, req, access_pages)),
        "access.check" => Some(with_ctx(state, req, access_check)),
        _ => None,
    }
}
