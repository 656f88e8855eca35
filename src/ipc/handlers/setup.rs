use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{with_ctx, Ctx};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Cep,
    FieldProject,
    Activities,
}

const ALL_SECTIONS: [SetupSection; 3] = [
    SetupSection::Cep,
    SetupSection::FieldProject,
    SetupSection::Activities,
];

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "cep" => Some(Self::Cep),
            "fieldProject" => Some(Self::FieldProject),
            "activities" => Some(Self::Activities),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Cep => "cep",
            Self::FieldProject => "fieldProject",
            Self::Activities => "activities",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Cep => "setup.cep",
            Self::FieldProject => "setup.fieldProject",
            Self::Activities => "setup.activities",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Cep => json!({
            "defaultMinHours": 60,
            "allowStudentDelete": true
        }),
        SetupSection::FieldProject => json!({
            "maxUploadMb": 100,
            "allowResubmitApproved": false
        }),
        SetupSection::Activities => json!({
            "defaultPoints": 5,
            "countExcusedAsPresent": false
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Cep => match k.as_str() {
                "defaultMinHours" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 1000.0)?));
                }
                "allowStudentDelete" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown cep field: {}", k)),
            },
            SetupSection::FieldProject => match k.as_str() {
                "maxUploadMb" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 2048)?));
                }
                "allowResubmitApproved" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown fieldProject field: {}", k)),
            },
            SetupSection::Activities => match k.as_str() {
                "defaultPoints" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                "countExcusedAsPresent" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown activities field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &single);
            }
        }
    }
    Ok(current)
}

fn section_or_default(conn: &Connection, section: SetupSection) -> Result<Value, HandlerErr> {
    load_section(conn, section).map_err(|e| HandlerErr::db("db_query_failed", e))
}

pub struct CepSettings {
    pub default_min_hours: f64,
    pub allow_student_delete: bool,
}

pub struct FieldProjectSettings {
    pub max_upload_bytes: u64,
    pub allow_resubmit_approved: bool,
}

pub struct ActivitySettings {
    pub default_points: i64,
    pub count_excused_as_present: bool,
}

pub fn cep_settings(conn: &Connection) -> Result<CepSettings, HandlerErr> {
    let v = section_or_default(conn, SetupSection::Cep)?;
    Ok(CepSettings {
        default_min_hours: v.get("defaultMinHours").and_then(|x| x.as_f64()).unwrap_or(60.0),
        allow_student_delete: v
            .get("allowStudentDelete")
            .and_then(|x| x.as_bool())
            .unwrap_or(true),
    })
}

pub fn field_project_settings(conn: &Connection) -> Result<FieldProjectSettings, HandlerErr> {
    let v = section_or_default(conn, SetupSection::FieldProject)?;
    let mb = v.get("maxUploadMb").and_then(|x| x.as_u64()).unwrap_or(100);
    Ok(FieldProjectSettings {
        max_upload_bytes: mb * 1024 * 1024,
        allow_resubmit_approved: v
            .get("allowResubmitApproved")
            .and_then(|x| x.as_bool())
            .unwrap_or(false),
    })
}

pub fn activity_settings(conn: &Connection) -> Result<ActivitySettings, HandlerErr> {
    let v = section_or_default(conn, SetupSection::Activities)?;
    Ok(ActivitySettings {
        default_points: v.get("defaultPoints").and_then(|x| x.as_i64()).unwrap_or(5),
        count_excused_as_present: v
            .get("countExcusedAsPresent")
            .and_then(|x| x.as_bool())
            .unwrap_or(false),
    })
}

fn setup_get(ctx: &Ctx<'_>, _params: &Value) -> Result<Value, HandlerErr> {
    let mut out = Map::new();
    for section in ALL_SECTIONS {
        out.insert(
            section.name().to_string(),
            section_or_default(ctx.conn, section)?,
        );
    }
    Ok(Value::Object(out))
}

fn setup_update(ctx: &Ctx<'_>, params: &Value) -> Result<Value, HandlerErr> {
    ctx.require_teacher()?;
    let Some(section_raw) = params.get("section").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(HandlerErr::bad_params("unknown section"));
    };
    let Some(patch_obj) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = section_or_default(ctx.conn, section)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(ctx.conn, section.key(), &current)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    info!(section = section.name(), "setup updated");
    Ok(json!({ "section": section.name(), "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_ctx(state, req, setup_get)),
        "setup.update" => Some(with_ctx(state, req, setup_update)),
        _ => None,
    }
}
