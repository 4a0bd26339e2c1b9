mod common;

use common::{str_field, Sidecar};
use serde_json::json;

fn names(list: &serde_json::Value, key: &str) -> Vec<String> {
    list[key]
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|r| r["name"].as_str().map(|s| s.to_string()))
        .collect()
}

#[test]
fn students_create_update_reorder_and_search() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let kim = str_field(
        &sc.request_ok(
            "students.create",
            json!({ "name": "Kim Minji", "school": "Hanbit Middle", "grade": "M2" }),
        ),
        "studentId",
    );
    let lee = sc.add_student("Lee Seojun");
    let han = sc.add_student("Han Yuna");

    let list = sc.request_ok("students.list", json!({}));
    assert_eq!(names(&list, "students"), vec!["Kim Minji", "Lee Seojun", "Han Yuna"]);
    assert_eq!(list["students"][0]["school"], "Hanbit Middle");

    sc.request_ok(
        "students.update",
        json!({ "studentId": kim, "patch": { "parentPhone": "010-1234-5678", "school": null } }),
    );
    sc.request_ok(
        "students.reorder",
        json!({ "orderedIds": [han, kim, lee] }),
    );
    let list = sc.request_ok("students.list", json!({ "search": "min" }));
    assert_eq!(names(&list, "students"), vec!["Kim Minji"]);
    assert_eq!(list["students"][0]["parentPhone"], "010-1234-5678");
    assert!(list["students"][0]["school"].is_null());
    assert_eq!(list["students"][0]["sortOrder"], 1);

    sc.request_ok(
        "students.update",
        json!({ "studentId": lee, "patch": { "active": false } }),
    );
    let list = sc.request_ok("students.list", json!({}));
    assert_eq!(names(&list, "students"), vec!["Han Yuna", "Kim Minji"]);
    let list = sc.request_ok("students.list", json!({ "includeInactive": true }));
    assert_eq!(list["students"].as_array().map(|s| s.len()), Some(3));

    assert_eq!(
        sc.request_err("students.reorder", json!({ "orderedIds": [han, kim] })),
        "bad_params"
    );
    assert_eq!(
        sc.request_err("students.update", json!({ "studentId": kim, "patch": { "age": 14 } })),
        "bad_params"
    );
    assert_eq!(sc.request_err("students.create", json!({ "name": "  " })), "bad_params");
}

#[test]
fn deleting_a_student_unassigns_their_blocks() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");
    let kim = sc.add_student("Kim");
    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "studentId": kim, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00" }),
    );
    sc.request_ok(
        "attendance.set",
        json!({ "studentId": kim, "date": "2026-03-02", "status": "present" }),
    );

    sc.request_ok("students.delete", json!({ "studentId": kim }));
    let blocks = sc.request_ok(
        "timetable.list",
        json!({ "from": "2026-03-02", "to": "2026-03-02" }),
    );
    let rows = blocks["blocks"].as_array().expect("blocks");
    assert_eq!(rows.len(), 1);
    assert!(rows[0]["studentId"].is_null());
    let day = sc.request_ok("attendance.dayOpen", json!({ "date": "2026-03-02" }));
    assert_eq!(day["students"].as_array().map(|s| s.len()), Some(0));
}

#[test]
fn teachers_with_history_are_deactivated_not_deleted() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let park = str_field(
        &sc.request_ok("teachers.create", json!({ "name": "Park", "subject": "Math" })),
        "teacherId",
    );
    let yoon = sc.add_teacher("Yoon");
    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": park, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00" }),
    );

    let resp = sc.request("teachers.delete", json!({ "teacherId": park }));
    assert_eq!(resp["error"]["code"], "in_use");
    assert_eq!(resp["error"]["details"]["scheduleBlocks"], true);

    sc.request_ok(
        "teachers.update",
        json!({ "teacherId": park, "patch": { "active": false, "color": "#ff8800" } }),
    );
    let list = sc.request_ok("teachers.list", json!({}));
    assert_eq!(names(&list, "teachers"), vec!["Yoon"]);
    let list = sc.request_ok("teachers.list", json!({ "includeInactive": true }));
    assert_eq!(list["teachers"][0]["subject"], "Math");
    assert_eq!(list["teachers"][0]["color"], "#ff8800");

    sc.request_ok("teachers.delete", json!({ "teacherId": yoon }));
    let list = sc.request_ok("teachers.list", json!({ "includeInactive": true }));
    assert_eq!(names(&list, "teachers"), vec!["Park"]);
}
