mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{request, request_err, request_ok, seed_class, spawn_sidecar};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-router-smoke");
    let csv_out = seeded.workspace.join("smoke.csv");
    let bundle_out = seeded.workspace.join("smoke-backup.zip");

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("health", json!({})),
        ("session.current", json!({})),
        ("access.pages", json!({})),
        ("access.check", json!({ "page": "setup" })),
        ("profiles.list", json!({})),
        ("profiles.get", json!({ "userId": seeded.teacher_id })),
        ("classes.list", json!({})),
        ("roster.list", json!({ "classId": seeded.class_id })),
        ("fieldProject.list", json!({ "studentId": seeded.student_ids[0] })),
        ("fieldProject.status", json!({ "studentId": seeded.student_ids[0] })),
        ("fieldProject.classOverview", json!({ "classId": seeded.class_id })),
        ("cep.requirement.get", json!({ "classId": seeded.class_id })),
        ("cep.entries.list", json!({ "studentId": seeded.student_ids[0] })),
        ("cep.progress", json!({ "studentId": seeded.student_ids[0] })),
        ("cep.classSummary", json!({ "classId": seeded.class_id })),
        ("activities.list", json!({})),
        ("activities.studentPoints", json!({ "studentId": seeded.student_ids[0] })),
        ("dashboard.teacher", json!({ "classId": seeded.class_id })),
        ("dashboard.student", json!({ "studentId": seeded.student_ids[0] })),
        ("export.cep", json!({ "classId": seeded.class_id, "outPath": csv_out.to_string_lossy() })),
        ("setup.get", json!({})),
        ("backup.exportWorkspaceBundle", json!({ "outPath": bundle_out.to_string_lossy() })),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let _ = request_ok(&mut stdin, &mut reader, &format!("c{}", i), method, params);
    }

    let unknown = request(&mut stdin, &mut reader, "u1", "marksets.list", json!({}));
    assert_eq!(unknown["ok"], json!(false));
    assert_eq!(unknown["error"]["code"], json!("not_implemented"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "u2",
        "classes.create",
        json!({ "name": "   " }),
    );
    assert_eq!(code, "bad_params");

    let _ = std::fs::remove_dir_all(seeded.workspace);
}

#[test]
fn malformed_lines_get_bad_json_and_loop_continues() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read error line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse error json");
    assert_eq!(value["ok"], json!(false));
    assert_eq!(value["error"]["code"], json!("bad_json"));

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["signedIn"], json!(false));
    assert!(health["workspacePath"].is_null());
}
