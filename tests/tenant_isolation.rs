mod common;

use common::{str_field, Sidecar};
use serde_json::json;

#[test]
fn rows_of_one_academy_are_invisible_to_another() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, first) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");
    let student = sc.add_student("Kim");
    let block = sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "studentId": student, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00" }),
    );
    let block_id = block["blockIds"][0].as_str().expect("block id").to_string();
    sc.request_ok(
        "attendance.set",
        json!({ "studentId": student, "date": "2026-03-02", "status": "present" }),
    );
    let config = str_field(
        &sc.request_ok("feedConfigs.create", json!({ "name": "Spring" })),
        "configId",
    );
    let report = sc.request_ok(
        "reports.save",
        json!({ "studentId": student, "month": "2026-03" }),
    );
    let report_id = str_field(&report, "reportId");

    let second = sc.create_academy("Busan Branch");
    sc.request_ok("academy.use", json!({ "academyId": second }));

    let students = sc.request_ok("students.list", json!({}));
    assert_eq!(students["students"].as_array().map(|s| s.len()), Some(0));
    let teachers = sc.request_ok("teachers.list", json!({}));
    assert_eq!(teachers["teachers"].as_array().map(|t| t.len()), Some(0));
    let blocks = sc.request_ok(
        "timetable.list",
        json!({ "from": "2026-03-01", "to": "2026-03-31" }),
    );
    assert_eq!(blocks["blocks"].as_array().map(|b| b.len()), Some(0));
    let day = sc.request_ok("attendance.dayOpen", json!({ "date": "2026-03-02" }));
    assert_eq!(day["students"].as_array().map(|s| s.len()), Some(0));
    let configs = sc.request_ok("feedConfigs.list", json!({ "includeDeleted": true }));
    assert_eq!(configs["configs"].as_array().map(|c| c.len()), Some(0));
    let reports = sc.request_ok("reports.list", json!({ "month": "2026-03" }));
    assert_eq!(reports["reports"].as_array().map(|r| r.len()), Some(0));
    let dash = sc.request_ok("reports.dashboard", json!({ "date": "2026-03-02" }));
    assert_eq!(dash["activeStudents"], 0);
    assert_eq!(dash["lessonsToday"], 0);

    // Ids from the first academy do not resolve here.
    let foreign = [
        ("students.update", json!({ "studentId": student, "patch": { "name": "X" } })),
        ("students.delete", json!({ "studentId": student })),
        ("teachers.delete", json!({ "teacherId": teacher })),
        ("timetable.move", json!({ "blockId": block_id, "scope": "day", "date": "2026-03-03" })),
        ("timetable.delete", json!({ "blockId": block_id, "scope": "day" })),
        ("attendance.set", json!({ "studentId": student, "date": "2026-03-02", "status": "absent" })),
        ("feedConfigs.activate", json!({ "configId": config })),
        ("feedConfigs.delete", json!({ "configId": config })),
        ("reports.get", json!({ "reportId": report_id })),
        ("reports.finalize", json!({ "reportId": report_id })),
    ];
    for (method, params) in foreign {
        assert_eq!(sc.request_err(method, params), "not_found", "{}", method);
    }

    // A teacher of this academy cannot be booked with a student of the other.
    let local_teacher = sc.add_teacher("Yoon");
    assert_eq!(
        sc.request_err(
            "timetable.create",
            json!({ "teacherId": local_teacher, "studentId": student, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00" }),
        ),
        "not_found"
    );

    // Nothing in the first academy was touched.
    sc.request_ok("academy.use", json!({ "academyId": first }));
    let day = sc.request_ok("attendance.dayOpen", json!({ "date": "2026-03-02" }));
    assert_eq!(day["students"][0]["status"], "present");
    let blocks = sc.request_ok(
        "timetable.list",
        json!({ "from": "2026-03-01", "to": "2026-03-31" }),
    );
    assert_eq!(blocks["blocks"][0]["date"], "2026-03-02");
}

#[test]
fn deleting_an_academy_removes_its_rows_only() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, first) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");
    let student = sc.add_student("Kim");
    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "studentId": student, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00" }),
    );
    sc.request_ok(
        "attendance.set",
        json!({ "studentId": student, "date": "2026-03-02", "status": "present" }),
    );

    let second = sc.create_academy("Busan Branch");
    sc.request_ok("academy.use", json!({ "academyId": second }));
    sc.add_student("Lee");

    sc.request_ok(
        "academies.delete",
        json!({ "academyId": first, "serviceKey": common::SERVICE_KEY }),
    );
    let list = sc.request_ok("academies.list", json!({}));
    let academies = list["academies"].as_array().expect("academies");
    assert_eq!(academies.len(), 1);
    assert_eq!(academies[0]["id"], second);
    assert_eq!(academies[0]["studentCount"], 1);

    // The active academy was the other one, so it stays selected.
    let health = sc.request_ok("health", json!({}));
    assert_eq!(health["academyId"], second);

    sc.request_ok(
        "academies.delete",
        json!({ "academyId": second, "serviceKey": common::SERVICE_KEY }),
    );
    let health = sc.request_ok("health", json!({}));
    assert!(health["academyId"].is_null());
    assert_eq!(sc.request_err("students.list", json!({})), "no_academy");
}
