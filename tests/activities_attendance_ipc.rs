mod test_support;

use serde_json::json;
use test_support::{
    create_profile, request_err, request_ok, seed_class, sign_in, spawn_sidecar, str_field,
};

#[test]
fn create_validates_classes_time_and_default_points() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-activity-create");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "activities.create",
        json!({ "name": "Quiz", "activityDate": "2026-02-10", "classIds": [] }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "activities.create",
        json!({ "name": "Quiz", "activityDate": "2026-02-10", "classIds": ["no-such-class"] }),
    );
    assert_eq!(code, "not_found");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "activities.create",
        json!({ "name": "Quiz", "activityDate": "2026-02-10", "startTime": "25:00", "classIds": [seeded.class_id] }),
    );
    assert_eq!(code, "bad_params");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "activities.create",
        json!({
            "name": "Inter-college Quiz",
            "activityDate": "2026-02-10",
            "startTime": "09:30",
            "venue": "Seminar Hall",
            "classIds": [seeded.class_id],
        }),
    );
    let activity = &created["activity"];
    assert_eq!(activity["points"], json!(5));
    assert_eq!(activity["startTime"], json!("09:30"));
    assert_eq!(activity["classIds"], json!([seeded.class_id]));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({ "section": "activities", "patch": { "defaultPoints": 10 } }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "activities.create",
        json!({ "name": "Sports Day", "activityDate": "2026-01-20", "classIds": [seeded.class_id] }),
    );
    assert_eq!(created["activity"]["points"], json!(10));

    let listed = request_ok(&mut stdin, &mut reader, "7", "activities.list", json!({}));
    let names: Vec<&str> = listed["activities"]
        .as_array()
        .expect("activities")
        .iter()
        .map(|a| a["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names, vec!["Sports Day", "Inter-college Quiz"]);

    let _ = std::fs::remove_dir_all(seeded.workspace);
}

#[test]
fn marks_tally_and_points() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-activity-marks");
    let outsider = create_profile(&mut stdin, &mut reader, "0", "student", "Vihaan Menon", Some("4"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "activities.create",
        json!({
            "name": "Tree Plantation",
            "activityDate": "2026-02-14",
            "points": 8,
            "classIds": [seeded.class_id],
        }),
    );
    let activity_id = str_field(&created["activity"], "id");
    let [a, b, c] = [
        seeded.student_ids[0].clone(),
        seeded.student_ids[1].clone(),
        seeded.student_ids[2].clone(),
    ];

    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "activities.attendance.bulkMark",
        json!({ "activityId": activity_id, "studentIds": [a, b, outsider], "status": "present" }),
    );
    assert_eq!(bulk["updated"], json!(2));
    assert_eq!(bulk["skipped"], json!([outsider]));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "activities.attendance.mark",
        json!({ "activityId": activity_id, "studentId": b, "status": "excused" }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "activities.attendance.mark",
        json!({ "activityId": activity_id, "studentId": outsider, "status": "present" }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "activities.attendance.mark",
        json!({ "activityId": activity_id, "studentId": c, "status": "late" }),
    );
    assert_eq!(code, "bad_params");

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "activities.attendance.get",
        json!({ "activityId": activity_id }),
    );
    let tally = &sheet["tally"];
    assert_eq!(tally["present"], json!(1));
    assert_eq!(tally["excused"], json!(1));
    assert_eq!(tally["unmarked"], json!(1));
    assert_eq!(tally["total"], json!(3));
    assert_eq!(tally["attendanceRate"], json!(0.5));
    let statuses: Vec<serde_json::Value> = sheet["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| r["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("present"), json!("excused"), json!(null)]);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "setup.update",
        json!({ "section": "activities", "patch": { "countExcusedAsPresent": true } }),
    );
    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "activities.attendance.get",
        json!({ "activityId": activity_id }),
    );
    assert_eq!(sheet["tally"]["attendanceRate"], json!(1.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "activities.attendance.mark",
        json!({ "activityId": activity_id, "studentId": a, "status": null }),
    );
    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "activities.attendance.get",
        json!({ "activityId": activity_id }),
    );
    assert_eq!(sheet["tally"]["unmarked"], json!(2));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "activities.attendance.mark",
        json!({ "activityId": activity_id, "studentId": a, "status": "present" }),
    );
    let points = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "activities.studentPoints",
        json!({ "studentId": a }),
    );
    assert_eq!(points["totalPoints"], json!(8));
    assert_eq!(points["attendedCount"], json!(1));
    let points = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "activities.studentPoints",
        json!({ "studentId": b }),
    );
    assert_eq!(points["totalPoints"], json!(0));
    assert_eq!(points["activities"][0]["status"], json!("excused"));

    sign_in(&mut stdin, &mut reader, "14", &a);
    let mine = request_ok(&mut stdin, &mut reader, "15", "activities.list", json!({}));
    assert_eq!(mine["activities"][0]["myStatus"], json!("present"));
    let code = request_err(
        &mut stdin,
        &mut reader,
        "16",
        "activities.attendance.get",
        json!({ "activityId": activity_id }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "17",
        "activities.studentPoints",
        json!({ "studentId": b }),
    );
    assert_eq!(code, "forbidden");

    let _ = std::fs::remove_dir_all(seeded.workspace);
}

#[test]
fn update_replaces_classes_and_delete_drops_attendance() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, "credilocker-activity-update");
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "classes.create",
        json!({ "name": "FYBCom C" }),
    );
    let other_id = str_field(&other, "classId");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "activities.create",
        json!({ "name": "Debate", "activityDate": "2026-03-02", "classIds": [seeded.class_id] }),
    );
    let activity_id = str_field(&created["activity"], "id");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "activities.attendance.mark",
        json!({ "activityId": activity_id, "studentId": seeded.student_ids[0], "status": "present" }),
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "activities.update",
        json!({ "activityId": activity_id, "patch": { "classIds": [other_id], "points": 3, "venue": "Auditorium" } }),
    );
    assert_eq!(updated["activity"]["classIds"], json!([other_id]));
    assert_eq!(updated["activity"]["points"], json!(3));

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "activities.attendance.get",
        json!({ "activityId": activity_id }),
    );
    assert_eq!(sheet["tally"]["total"], json!(0));
    let points = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "activities.studentPoints",
        json!({ "studentId": seeded.student_ids[0] }),
    );
    assert_eq!(points["totalPoints"], json!(3));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "activities.update",
        json!({ "activityId": activity_id, "patch": { "organizer": "NSS" } }),
    );
    assert_eq!(code, "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "activities.delete",
        json!({ "activityId": activity_id }),
    );
    let points = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "activities.studentPoints",
        json!({ "studentId": seeded.student_ids[0] }),
    );
    assert_eq!(points["totalPoints"], json!(0));
    let code = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "activities.attendance.get",
        json!({ "activityId": activity_id }),
    );
    assert_eq!(code, "not_found");

    let _ = std::fs::remove_dir_all(seeded.workspace);
}
