mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, seed_class, sign_in, spawn_sidecar, write_file};

#[test]
fn requirement_defaults_then_validates_tiers() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-cep-requirement");

    let req = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "cep.requirement.get",
        json!({ "classId": seeded.class_id }),
    );
    assert_eq!(req["requirement"]["configured"], json!(false));
    assert_eq!(req["requirement"]["minHours"], json!(60.0));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "cep.requirement.set",
        json!({
            "classId": seeded.class_id,
            "minHours": 40,
            "tiers": [{ "minHours": 20, "credits": 2 }, { "minHours": 40, "credits": 1 }],
        }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "cep.requirement.set",
        json!({
            "classId": seeded.class_id,
            "minHours": 40,
            "tiers": [{ "minHours": 20, "credits": 1 }, { "minHours": 20, "credits": 2 }],
        }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "cep.requirement.set",
        json!({ "classId": seeded.class_id, "minHours": -1 }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "cep.requirement.set",
        json!({ "classId": seeded.class_id, "minHours": 40, "deadline": "31-03-2026" }),
    );
    assert_eq!(code, "bad_params");

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "cep.requirement.set",
        json!({
            "classId": seeded.class_id,
            "minHours": 40,
            "deadline": "2026-03-31",
            "tiers": [{ "minHours": 40, "credits": 2 }, { "minHours": 20, "credits": 1 }],
        }),
    );
    assert_eq!(saved["requirement"]["configured"], json!(true));
    assert_eq!(
        saved["requirement"]["tiers"],
        json!([{ "minHours": 20.0, "credits": 1.0 }, { "minHours": 40.0, "credits": 2.0 }])
    );

    sign_in(&mut stdin, &mut reader, "7", &seeded.student_ids[0]);
    let seen = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "cep.requirement.get",
        json!({ "classId": seeded.class_id }),
    );
    assert_eq!(seen["requirement"]["deadline"], json!("2026-03-31"));

    let _ = std::fs::remove_dir_all(seeded.workspace);
}

#[test]
fn progress_counts_non_rejected_hours_and_awards_tier_credits() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-cep-progress");
    let student = seeded.student_ids[0].clone();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "cep.requirement.set",
        json!({
            "classId": seeded.class_id,
            "minHours": 30,
            "deadline": "2026-03-31",
            "tiers": [{ "minHours": 15, "credits": 1 }, { "minHours": 30, "credits": 2 }],
        }),
    );

    sign_in(&mut stdin, &mut reader, "2", &student);
    let proof = write_file(&seeded.workspace.join("incoming"), "ngo-letter.pdf", b"proof");
    let mut entry_ids = Vec::new();
    for (i, (name, date, hours)) in [
        ("Beach clean-up", "2025-12-06", 8.0),
        ("Literacy drive", "2026-01-10", 12.5),
        ("Animal shelter", "2026-01-24", 6.0),
    ]
    .iter()
    .enumerate()
    {
        let mut params = json!({
            "studentId": student,
            "activityName": name,
            "activityDate": date,
            "hours": hours,
        });
        if i == 0 {
            params["proofPath"] = json!(proof.to_string_lossy());
        }
        let added = request_ok(&mut stdin, &mut reader, &format!("e{}", i), "cep.entries.add", params);
        assert_eq!(added["entry"]["status"], json!("pending"));
        entry_ids.push(added["entry"]["id"].as_str().expect("entry id").to_string());
    }

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "cep.entries.add",
        json!({ "studentId": student, "activityName": "Marathon", "activityDate": "2026-02-01", "hours": 30 }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "cep.entries.review",
        json!({ "entryId": entry_ids[0], "status": "approved" }),
    );
    assert_eq!(code, "forbidden");

    sign_in(&mut stdin, &mut reader, "5", &seeded.teacher_id);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "cep.entries.review",
        json!({ "entryId": entry_ids[0], "status": "approved" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "cep.entries.review",
        json!({ "entryId": entry_ids[2], "status": "rejected", "remark": "No proof" }),
    );

    let progress = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "cep.progress",
        json!({ "studentId": student, "asOf": "2026-02-01" }),
    );
    let p = &progress["progress"];
    assert_eq!(p["totalHours"], json!(20.5));
    assert_eq!(p["approvedHours"], json!(8.0));
    assert_eq!(p["pendingHours"], json!(12.5));
    assert_eq!(p["remainingHours"], json!(9.5));
    assert_eq!(p["requirementMet"], json!(false));
    assert_eq!(p["credits"], json!(1.0));
    assert_eq!(p["daysUntilDeadline"], json!(58));
    assert_eq!(p["overdue"], json!(false));

    let late = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "cep.progress",
        json!({ "studentId": student, "asOf": "2026-04-01" }),
    );
    assert_eq!(late["progress"]["overdue"], json!(true));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "cep.classSummary",
        json!({ "classId": seeded.class_id, "asOf": "2026-02-01" }),
    );
    assert_eq!(summary["metCount"], json!(0));
    assert_eq!(summary["notMetCount"], json!(3));
    assert_eq!(summary["totalCredits"], json!(1.0));
    assert_eq!(summary["averageHours"], json!(6.83));

    let _ = std::fs::remove_dir_all(seeded.workspace);
}

#[test]
fn student_delete_rules_follow_setup_and_review_state() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-cep-delete");
    let student = seeded.student_ids[1].clone();
    let proof = write_file(&seeded.workspace.join("incoming"), "cert.png", b"png");

    sign_in(&mut stdin, &mut reader, "1", &student);
    let mut ids = Vec::new();
    for i in 0..3 {
        let added = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "cep.entries.add",
            json!({
                "studentId": student,
                "activityName": format!("Session {}", i),
                "activityDate": "2026-01-05",
                "hours": 2,
                "proofPath": proof.to_string_lossy(),
            }),
        );
        ids.push(added["entry"]["id"].as_str().expect("id").to_string());
    }
    let first_proof = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "cep.entries.list",
        json!({ "studentId": student }),
    )["entries"][0]["proofPath"]
        .as_str()
        .expect("proofPath")
        .to_string();
    assert!(first_proof.starts_with("storage/cep-proofs/"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "cep.entries.delete",
        json!({ "entryId": ids[0] }),
    );
    assert!(!seeded.workspace.join(&first_proof).exists());

    sign_in(&mut stdin, &mut reader, "4", &seeded.teacher_id);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "cep.entries.review",
        json!({ "entryId": ids[1], "status": "approved" }),
    );
    sign_in(&mut stdin, &mut reader, "6", &student);
    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "cep.entries.delete",
        json!({ "entryId": ids[1] }),
    );
    assert_eq!(code, "forbidden");

    sign_in(&mut stdin, &mut reader, "8", &seeded.teacher_id);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "setup.update",
        json!({ "section": "cep", "patch": { "allowStudentDelete": false } }),
    );
    sign_in(&mut stdin, &mut reader, "10", &student);
    let code = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "cep.entries.delete",
        json!({ "entryId": ids[2] }),
    );
    assert_eq!(code, "forbidden");

    sign_in(&mut stdin, &mut reader, "12", &seeded.teacher_id);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "cep.entries.delete",
        json!({ "entryId": ids[1] }),
    );
    let left = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "cep.entries.list",
        json!({ "studentId": student }),
    );
    assert_eq!(left["entries"].as_array().expect("entries").len(), 1);

    let _ = std::fs::remove_dir_all(seeded.workspace);
}
