#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_credilockerd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn credilockerd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Sends a request expected to fail and returns its error code.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

pub fn create_profile(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    role: &str,
    full_name: &str,
    roll_no: Option<&str>,
) -> String {
    let email = format!(
        "{}@college.example",
        full_name.to_ascii_lowercase().replace(' ', ".")
    );
    let created = request_ok(
        stdin,
        reader,
        id,
        "profiles.create",
        json!({
            "role": role,
            "fullName": full_name,
            "email": email,
            "rollNo": roll_no,
        }),
    );
    str_field(&created, "userId")
}

pub fn sign_in(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    user_id: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "session.signIn",
        json!({ "userId": user_id }),
    );
}

/// A workspace holding one signed-in teacher and a class of three students
/// (roll numbers 1..=3).
pub struct Seeded {
    pub workspace: PathBuf,
    pub teacher_id: String,
    pub class_id: String,
    pub student_ids: Vec<String>,
}

pub fn seed_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> Seeded {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher_id = create_profile(stdin, reader, "seed-t", "teacher", "Meera Kulkarni", None);
    let mut student_ids = Vec::new();
    for (i, name) in ["Aarav Shah", "Diya Patel", "Kabir Rao"].iter().enumerate() {
        let roll = (i + 1).to_string();
        student_ids.push(create_profile(
            stdin,
            reader,
            &format!("seed-s{}", i),
            "student",
            name,
            Some(&roll),
        ));
    }
    sign_in(stdin, reader, "seed-in", &teacher_id);
    let class = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({ "name": "SYBCom A", "department": "Commerce", "academicYear": "2025-26" }),
    );
    let class_id = str_field(&class, "classId");
    let _ = request_ok(
        stdin,
        reader,
        "seed-roster",
        "roster.add",
        json!({ "classId": class_id, "studentIds": student_ids }),
    );
    Seeded {
        workspace,
        teacher_id,
        class_id,
        student_ids,
    }
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    std::fs::create_dir_all(dir).expect("create upload dir");
    let p = dir.join(name);
    std::fs::write(&p, bytes).expect("write upload file");
    p
}
