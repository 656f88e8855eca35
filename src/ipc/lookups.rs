use crate::ipc::error::HandlerErr;
use crate::ipc::types::Role;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub id: String,
    pub role: Role,
    pub full_name: String,
    pub email: String,
    pub roll_no: Option<String>,
    pub class_id: Option<String>,
}

impl ProfileRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "role": self.role.as_str(),
            "fullName": self.full_name,
            "email": self.email,
            "rollNo": self.roll_no,
            "classId": self.class_id,
        })
    }

    pub fn roll_display(&self) -> String {
        self.roll_no.clone().unwrap_or_default()
    }
}

pub const PROFILE_COLUMNS: &str = "id, role, full_name, email, roll_no, class_id";

pub fn profile_from_row(r: &Row<'_>) -> rusqlite::Result<ProfileRow> {
    let role: String = r.get(1)?;
    Ok(ProfileRow {
        id: r.get(0)?,
        role: Role::parse(&role).unwrap_or(Role::Student),
        full_name: r.get(2)?,
        email: r.get(3)?,
        roll_no: r.get(4)?,
        class_id: r.get(5)?,
    })
}

pub fn load_profile(conn: &Connection, id: &str) -> Result<Option<ProfileRow>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM profiles WHERE id = ?", PROFILE_COLUMNS),
        [id],
        profile_from_row,
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

pub fn load_profile_by_email(
    conn: &Connection,
    email: &str,
) -> Result<Option<ProfileRow>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM profiles WHERE email = ? COLLATE NOCASE",
            PROFILE_COLUMNS
        ),
        [email],
        profile_from_row,
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

pub fn require_student(conn: &Connection, id: &str) -> Result<ProfileRow, HandlerErr> {
    match load_profile(conn, id)? {
        Some(p) if p.role == Role::Student => Ok(p),
        _ => Err(HandlerErr::not_found("student not found")),
    }
}

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: String,
    pub name: String,
    pub department: Option<String>,
    pub academic_year: Option<String>,
    pub teacher_id: Option<String>,
}

impl ClassRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "department": self.department,
            "academicYear": self.academic_year,
            "teacherId": self.teacher_id,
        })
    }
}

pub fn load_class(conn: &Connection, id: &str) -> Result<Option<ClassRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, name, department, academic_year, teacher_id FROM classes WHERE id = ?",
        [id],
        |r| {
            Ok(ClassRow {
                id: r.get(0)?,
                name: r.get(1)?,
                department: r.get(2)?,
                academic_year: r.get(3)?,
                teacher_id: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

pub fn require_class(conn: &Connection, id: &str) -> Result<ClassRow, HandlerErr> {
    load_class(conn, id)?.ok_or_else(|| HandlerErr::not_found("class not found"))
}

/// Students of a class in roster order.
pub fn class_students(conn: &Connection, class_id: &str) -> Result<Vec<ProfileRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM profiles WHERE class_id = ? AND role = 'student'",
            PROFILE_COLUMNS
        ))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let mut rows = stmt
        .query_map([class_id], profile_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    rows.sort_by(roster_order);
    Ok(rows)
}

/// Numeric roll numbers sort numerically and before free-form ones; ties fall back to name.
pub fn roster_order(a: &ProfileRow, b: &ProfileRow) -> Ordering {
    let key = |p: &ProfileRow| -> (u8, u64, String) {
        match p.roll_no.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => match r.parse::<u64>() {
                Ok(n) => (0, n, String::new()),
                Err(_) => (1, 0, r.to_ascii_lowercase()),
            },
            _ => (2, 0, String::new()),
        }
    };
    key(a)
        .cmp(&key(b))
        .then_with(|| {
            a.full_name
                .to_ascii_lowercase()
                .cmp(&b.full_name.to_ascii_lowercase())
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Class ids assigned to an activity.
pub fn activity_class_ids(conn: &Connection, activity_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT class_id FROM activity_classes WHERE activity_id = ? ORDER BY class_id")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([activity_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: &str, roll: Option<&str>, name: &str) -> ProfileRow {
        ProfileRow {
            id: id.to_string(),
            role: Role::Student,
            full_name: name.to_string(),
            email: format!("{}@example.edu", id),
            roll_no: roll.map(|s| s.to_string()),
            class_id: None,
        }
    }

    #[test]
    fn roster_order_is_numeric_aware() {
        let mut v = vec![
            p("a", Some("10"), "Zed"),
            p("b", None, "Amy"),
            p("c", Some("2"), "Bob"),
            p("d", Some("A7"), "Cat"),
            p("e", Some("2"), "Abe"),
        ];
        v.sort_by(roster_order);
        let ids: Vec<&str> = v.iter().map(|x| x.id.as_str()).collect();
        assert_eq!(ids, vec!["e", "c", "a", "d", "b"]);
    }
}
