use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::types::{AppState, Request, Session};
use chrono::NaiveDate;
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

/// Everything a signed-in handler needs.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub workspace: &'a Path,
    pub session: &'a Session,
}

impl Ctx<'_> {
    pub fn require_teacher(&self) -> Result<(), HandlerErr> {
        if self.session.is_teacher() {
            Ok(())
        } else {
            Err(HandlerErr::forbidden("teacher role required"))
        }
    }

    /// Teachers reach every student; a student reaches only their own rows.
    pub fn ensure_student_access(&self, student_id: &str) -> Result<(), HandlerErr> {
        if self.session.is_teacher() || self.session.user_id == student_id {
            Ok(())
        } else {
            Err(HandlerErr::forbidden("students may only access their own records"))
        }
    }
}

pub fn context(state: &AppState) -> Result<Ctx<'_>, HandlerErr> {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_deref()) else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let Some(session) = state.session.as_ref() else {
        return Err(HandlerErr::new("unauthenticated", "sign in first"));
    };
    Ok(Ctx {
        conn,
        workspace,
        session,
    })
}

pub type CtxHandler = fn(&Ctx<'_>, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;

pub fn with_ctx(state: &AppState, req: &Request, f: CtxHandler) -> serde_json::Value {
    debug!(method = %req.method, id = %req.id, "dispatch");
    let result = context(state).and_then(|ctx| f(&ctx, &req.params));
    respond(&req.id, result)
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

/// Absent, null and blank all read as None.
pub fn optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string", key)))?
                .trim();
            Ok(if s.is_empty() { None } else { Some(s.to_string()) })
        }
    }
}

pub fn required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn string_array(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let arr = params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let s = v
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))?
            .trim();
        if !s.is_empty() && !out.iter().any(|o: &String| o == s) {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn optional_date(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<NaiveDate>, HandlerErr> {
    optional_str(params, key)?
        .map(|s| parse_date(&s, key))
        .transpose()
}

/// `asOf` param, defaulting to today's local date.
pub fn as_of(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    Ok(optional_date(params, "asOf")?.unwrap_or_else(|| chrono::Local::now().date_naive()))
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_str_treats_blank_as_absent() {
        let p = json!({ "a": "  ", "b": null, "c": " x " });
        assert_eq!(optional_str(&p, "a").expect("a"), None);
        assert_eq!(optional_str(&p, "b").expect("b"), None);
        assert_eq!(optional_str(&p, "c").expect("c"), Some("x".to_string()));
        assert_eq!(optional_str(&p, "missing").expect("missing"), None);
        assert!(optional_str(&json!({ "a": 3 }), "a").is_err());
    }

    #[test]
    fn string_array_trims_and_dedupes() {
        let p = json!({ "ids": ["a", " a ", "", "b"] });
        assert_eq!(string_array(&p, "ids").expect("ids"), vec!["a", "b"]);
        assert!(string_array(&json!({ "ids": [1] }), "ids").is_err());
    }

    #[test]
    fn parse_date_requires_iso_day() {
        assert!(parse_date("2026-02-28", "d").is_ok());
        assert!(parse_date("2026-02-30", "d").is_err());
        assert!(parse_date("28/02/2026", "d").is_err());
    }
}
