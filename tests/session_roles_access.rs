mod test_support;

use serde_json::json;
use test_support::{
    create_profile, request_err, request_ok, seed_class, sign_in, spawn_sidecar, temp_dir,
};

#[test]
fn requests_need_workspace_then_session() {
    let workspace = temp_dir("credilocker-session-gate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let code = request_err(&mut stdin, &mut reader, "1", "classes.list", json!({}));
    assert_eq!(code, "no_workspace");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "profiles.create",
        json!({ "role": "teacher", "fullName": "T", "email": "t@x.edu" }),
    );
    assert_eq!(code, "no_workspace");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let code = request_err(&mut stdin, &mut reader, "4", "classes.list", json!({}));
    assert_eq!(code, "unauthenticated");

    let current = request_ok(&mut stdin, &mut reader, "5", "session.current", json!({}));
    assert!(current["session"].is_null());

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn sign_in_by_email_and_sign_out() {
    let workspace = temp_dir("credilocker-session-email");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "profiles.create",
        json!({ "role": "student", "fullName": "Isha Nair", "email": "Isha.Nair@College.example" }),
    );
    assert_eq!(created["email"], json!("isha.nair@college.example"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "profiles.create",
        json!({ "role": "student", "fullName": "Dup", "email": "ISHA.NAIR@college.example" }),
    );
    assert_eq!(code, "conflict");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "profiles.create",
        json!({ "role": "admin", "fullName": "X", "email": "x@college.example" }),
    );
    assert_eq!(code, "bad_params");

    let signed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "session.signIn",
        json!({ "email": "isha.nair@COLLEGE.example" }),
    );
    assert_eq!(signed["role"], json!("student"));
    let current = request_ok(&mut stdin, &mut reader, "6", "session.current", json!({}));
    assert_eq!(current["session"]["fullName"], json!("Isha Nair"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "session.signIn",
        json!({ "email": "nobody@college.example" }),
    );
    assert_eq!(code, "not_found");

    let out = request_ok(&mut stdin, &mut reader, "8", "session.signOut", json!({}));
    assert_eq!(out["signedOut"], json!(true));
    let code = request_err(&mut stdin, &mut reader, "9", "access.pages", json!({}));
    assert_eq!(code, "unauthenticated");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn role_gate_limits_students_to_their_pages_and_rows() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-role-gate");

    let pages = request_ok(&mut stdin, &mut reader, "1", "access.pages", json!({}));
    assert_eq!(pages["role"], json!("teacher"));
    assert!(pages["pages"]
        .as_array()
        .expect("pages")
        .contains(&json!("setup")));

    sign_in(&mut stdin, &mut reader, "2", &seeded.student_ids[0]);
    let pages = request_ok(&mut stdin, &mut reader, "3", "access.pages", json!({}));
    assert_eq!(
        pages["pages"],
        json!(["dashboard", "fieldProjects", "cep", "activities"])
    );
    let check = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "access.check",
        json!({ "page": "exports" }),
    );
    assert_eq!(check["allowed"], json!(false));

    for (i, (method, params)) in [
        ("classes.create", json!({ "name": "Nope" })),
        ("profiles.list", json!({})),
        ("setup.update", json!({ "section": "cep", "patch": { "defaultMinHours": 1 } })),
        ("cep.classSummary", json!({ "classId": seeded.class_id })),
        ("fieldProject.status", json!({ "studentId": seeded.student_ids[1] })),
        ("profiles.get", json!({ "userId": seeded.student_ids[1] })),
        ("dashboard.teacher", json!({ "classId": seeded.class_id })),
    ]
    .into_iter()
    .enumerate()
    {
        let code = request_err(&mut stdin, &mut reader, &format!("f{}", i), method, params);
        assert_eq!(code, "forbidden", "{} should be forbidden", method);
    }

    let own = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "profiles.update",
        json!({ "userId": seeded.student_ids[0], "patch": { "fullName": "Aarav S. Shah" } }),
    );
    assert_eq!(own["profile"]["fullName"], json!("Aarav S. Shah"));
    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "profiles.update",
        json!({ "userId": seeded.student_ids[0], "patch": { "role": "teacher" } }),
    );
    assert_eq!(code, "bad_params");

    let classes = request_ok(&mut stdin, &mut reader, "7", "classes.list", json!({}));
    let classes = classes["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["id"], json!(seeded.class_id));

    let _ = std::fs::remove_dir_all(seeded.workspace);
}

#[test]
fn selecting_a_workspace_clears_the_session() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-reselect");
    let other = temp_dir("credilocker-reselect-other");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": other.to_string_lossy() }),
    );
    let health = request_ok(&mut stdin, &mut reader, "2", "health", json!({}));
    assert_eq!(health["signedIn"], json!(false));

    let teacher = create_profile(&mut stdin, &mut reader, "3", "teacher", "Rohan Iyer", None);
    sign_in(&mut stdin, &mut reader, "4", &teacher);
    let classes = request_ok(&mut stdin, &mut reader, "5", "classes.list", json!({}));
    assert_eq!(classes["classes"], json!([]));

    let _ = std::fs::remove_dir_all(seeded.workspace);
    let _ = std::fs::remove_dir_all(other);
}
