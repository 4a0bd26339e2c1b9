mod common;

use common::{str_field, Sidecar};
use serde_json::json;

fn block_ids(res: &serde_json::Value) -> Vec<String> {
    res["blockIds"]
        .as_array()
        .expect("blockIds")
        .iter()
        .map(|v| v.as_str().expect("id").to_string())
        .collect()
}

fn block<'a>(list: &'a serde_json::Value, id: &str) -> &'a serde_json::Value {
    list["blocks"]
        .as_array()
        .expect("blocks")
        .iter()
        .find(|b| b["id"] == id)
        .unwrap_or_else(|| panic!("block {} not listed", id))
}

fn month_blocks(sc: &mut Sidecar) -> serde_json::Value {
    sc.request_ok(
        "timetable.list",
        json!({ "from": "2026-03-01", "to": "2026-04-30" }),
    )
}

#[test]
fn day_move_detaches_only_the_target() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");
    let student = sc.add_student("Choi");

    let created = sc.request_ok(
        "timetable.create",
        json!({
            "teacherId": teacher,
            "studentId": student,
            "date": "2026-03-02",
            "startTime": "16:00",
            "endTime": "17:00",
            "repeatWeeks": 4
        }),
    );
    let ids = block_ids(&created);
    assert_eq!(ids.len(), 4);
    let group_id = str_field(&created, "groupId");

    let moved = sc.request_ok(
        "timetable.move",
        json!({
            "blockId": ids[1],
            "scope": "day",
            "date": "2026-03-10",
            "startTime": "18:00",
            "endTime": "19:00"
        }),
    );
    assert_eq!(moved["scope"], "day");
    assert_eq!(moved["movedCount"], 1);

    let list = month_blocks(&mut sc);
    let target = block(&list, &ids[1]);
    assert_eq!(target["date"], "2026-03-10");
    assert_eq!(target["startTime"], "18:00");
    assert_eq!(target["detached"], true);
    assert_eq!(target["groupId"], group_id);
    for other in [&ids[0], &ids[2], &ids[3]] {
        let b = block(&list, other);
        assert_eq!(b["startTime"], "16:00");
        assert_eq!(b["detached"], false);
    }
    assert_eq!(block(&list, &ids[2])["date"], "2026-03-16");
}

#[test]
fn group_move_shifts_every_member_by_the_same_delta() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");
    let other_teacher = sc.add_teacher("Yoon");
    let student = sc.add_student("Choi");

    let created = sc.request_ok(
        "timetable.create",
        json!({
            "teacherId": teacher,
            "studentId": student,
            "date": "2026-03-02",
            "startTime": "16:00",
            "endTime": "17:00",
            "repeatWeeks": 3
        }),
    );
    let ids = block_ids(&created);

    // Detach the middle one first; a group move pulls it back in.
    sc.request_ok(
        "timetable.move",
        json!({ "blockId": ids[1], "scope": "day", "startTime": "19:00", "endTime": "20:00" }),
    );

    let moved = sc.request_ok(
        "timetable.move",
        json!({
            "blockId": ids[0],
            "scope": "group",
            "date": "2026-03-04",
            "teacherId": other_teacher
        }),
    );
    assert_eq!(moved["scope"], "group");
    assert_eq!(moved["movedCount"], 3);

    let list = month_blocks(&mut sc);
    assert_eq!(block(&list, &ids[0])["date"], "2026-03-04");
    assert_eq!(block(&list, &ids[1])["date"], "2026-03-11");
    assert_eq!(block(&list, &ids[2])["date"], "2026-03-18");
    for id in &ids {
        let b = block(&list, id);
        assert_eq!(b["teacherId"], other_teacher);
        assert_eq!(b["teacherName"], "Yoon");
        assert_eq!(b["detached"], false);
    }
    // Times were not given, so each block keeps its own.
    assert_eq!(block(&list, &ids[1])["startTime"], "19:00");
    assert_eq!(block(&list, &ids[2])["startTime"], "16:00");
}

#[test]
fn group_move_on_a_single_block_reports_day_scope() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");

    let created = sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "2026-03-05", "startTime": "14:00", "endTime": "15:00" }),
    );
    assert!(created["groupId"].is_null());
    let ids = block_ids(&created);

    let moved = sc.request_ok(
        "timetable.move",
        json!({ "blockId": ids[0], "scope": "group", "date": "2026-03-06" }),
    );
    assert_eq!(moved["scope"], "day");
    assert_eq!(moved["movedCount"], 1);
    let list = month_blocks(&mut sc);
    assert_eq!(block(&list, &ids[0])["detached"], false);
}

#[test]
fn student_double_booking_needs_force() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let math = sc.add_teacher("Park");
    let english = sc.add_teacher("Yoon");
    let student = sc.add_student("Choi");

    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": math, "studentId": student, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00" }),
    );
    let later = sc.request_ok(
        "timetable.create",
        json!({ "teacherId": english, "studentId": student, "date": "2026-03-02", "startTime": "17:00", "endTime": "18:00" }),
    );
    let later_id = block_ids(&later).remove(0);

    let resp = sc.request(
        "timetable.move",
        json!({ "blockId": later_id, "scope": "day", "startTime": "16:30", "endTime": "17:30" }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "conflict");
    assert_eq!(resp["error"]["details"]["conflicts"][0]["blockId"], later_id);

    sc.request_ok(
        "timetable.move",
        json!({ "blockId": later_id, "scope": "day", "startTime": "16:30", "endTime": "17:30", "force": true }),
    );

    // Same teacher twice at once is a group lesson, not a conflict.
    let other = sc.add_student("Han");
    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": math, "studentId": other, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00" }),
    );
}

#[test]
fn assign_and_delete_follow_scope() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");
    let student = sc.add_student("Choi");

    let created = sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "2026-03-03", "startTime": "15:00", "repeatWeeks": 2 }),
    );
    let ids = block_ids(&created);

    let assigned = sc.request_ok(
        "timetable.assign",
        json!({ "blockId": ids[0], "studentId": student, "scope": "group" }),
    );
    assert_eq!(assigned["assignedCount"], 2);
    let list = month_blocks(&mut sc);
    assert_eq!(block(&list, &ids[1])["studentName"], "Choi");
    // No endTime given: the default lesson length applies.
    assert_eq!(block(&list, &ids[0])["endTime"], "15:50");

    sc.request_ok(
        "timetable.assign",
        json!({ "blockId": ids[1], "studentId": null, "scope": "day" }),
    );
    let list = month_blocks(&mut sc);
    assert!(block(&list, &ids[1])["studentId"].is_null());
    assert_eq!(block(&list, &ids[0])["studentId"], student);

    let deleted = sc.request_ok(
        "timetable.delete",
        json!({ "blockId": ids[0], "scope": "group" }),
    );
    assert_eq!(deleted["deletedCount"], 2);
    let list = month_blocks(&mut sc);
    assert_eq!(list["blocks"].as_array().map(|b| b.len()), Some(0));
}

#[test]
fn week_view_honors_week_start_setting() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");
    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "2026-03-08", "startTime": "14:00", "endTime": "15:00" }),
    );

    // 2026-03-08 is a Sunday.
    let week = sc.request_ok("timetable.week", json!({ "date": "2026-03-11" }));
    assert_eq!(week["weekStart"], "2026-03-09");
    assert_eq!(week["days"].as_array().map(|d| d.len()), Some(7));

    sc.request_ok(
        "setup.update",
        json!({ "section": "timetable", "patch": { "weekStartsOn": "sunday" } }),
    );
    let week = sc.request_ok("timetable.week", json!({ "date": "2026-03-11" }));
    assert_eq!(week["weekStart"], "2026-03-08");
    assert_eq!(week["days"][0]["blocks"].as_array().map(|b| b.len()), Some(1));
}

#[test]
fn invalid_inputs_are_bad_params() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");

    let code = sc.request_err(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "2026-03-02", "startTime": "17:00", "endTime": "16:00" }),
    );
    assert_eq!(code, "bad_params");
    let code = sc.request_err(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00", "repeatWeeks": 53 }),
    );
    assert_eq!(code, "bad_params");
    let code = sc.request_err(
        "timetable.move",
        json!({ "blockId": "missing", "scope": "week" }),
    );
    assert_eq!(code, "bad_params");
    let code = sc.request_err(
        "timetable.move",
        json!({ "blockId": "missing", "scope": "day" }),
    );
    assert_eq!(code, "not_found");

    let code = sc.request_err(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "+262142-12-25", "startTime": "16:00", "repeatWeeks": 2 }),
    );
    assert_eq!(code, "bad_params");
    let code = sc.request_err(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "9999-12-27", "startTime": "16:00", "repeatWeeks": 2 }),
    );
    assert_eq!(code, "bad_params");
    assert_eq!(
        sc.request_err("timetable.week", json!({ "date": "+10000-01-01" })),
        "bad_params"
    );
    sc.request_ok("health", json!({}));
}

#[test]
fn moves_past_the_last_supported_year_are_refused() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");
    let created = sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "9999-12-20", "startTime": "16:00", "repeatWeeks": 2 }),
    );
    let ids = block_ids(&created);

    let resp = sc.request(
        "timetable.move",
        json!({ "blockId": ids[0], "scope": "group", "date": "9999-12-25" }),
    );
    assert_eq!(resp["error"]["code"], "bad_params");
    let list = sc.request_ok(
        "timetable.list",
        json!({ "from": "9999-12-01", "to": "9999-12-31" }),
    );
    assert_eq!(block(&list, &ids[1])["date"], "9999-12-27");
    sc.request_ok("health", json!({}));
}

#[test]
fn lessons_must_fit_the_academy_day() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let teacher = sc.add_teacher("Park");

    let resp = sc.request(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "2026-03-02", "startTime": "10:00", "endTime": "11:00" }),
    );
    assert_eq!(resp["error"]["code"], "bad_params");
    assert_eq!(resp["error"]["details"]["startTime"], "10:00");
    // The default lesson length would run past closing.
    assert_eq!(
        sc.request_err(
            "timetable.create",
            json!({ "teacherId": teacher, "date": "2026-03-02", "startTime": "21:30" })
        ),
        "bad_params"
    );

    let created = sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "2026-03-02", "startTime": "21:00", "endTime": "22:00" }),
    );
    let ids = block_ids(&created);
    assert_eq!(
        sc.request_err(
            "timetable.move",
            json!({ "blockId": ids[0], "scope": "day", "startTime": "21:30", "endTime": "22:30" })
        ),
        "bad_params"
    );

    sc.request_ok(
        "setup.update",
        json!({ "section": "timetable", "patch": { "dayStartTime": "09:00" } }),
    );
    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "date": "2026-03-02", "startTime": "10:00", "endTime": "11:00" }),
    );
}

#[test]
fn assigning_a_booked_student_needs_force() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let math = sc.add_teacher("Park");
    let english = sc.add_teacher("Yoon");
    let student = sc.add_student("Choi");

    let booked = sc.request_ok(
        "timetable.create",
        json!({ "teacherId": math, "studentId": student, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00" }),
    );
    let booked_id = block_ids(&booked).remove(0);
    let open = sc.request_ok(
        "timetable.create",
        json!({ "teacherId": english, "date": "2026-03-02", "startTime": "16:30", "endTime": "17:30", "repeatWeeks": 2 }),
    );
    let open_ids = block_ids(&open);

    let resp = sc.request(
        "timetable.assign",
        json!({ "blockId": open_ids[0], "studentId": student, "scope": "group" }),
    );
    assert_eq!(resp["error"]["code"], "conflict");
    assert_eq!(resp["error"]["details"]["conflicts"][0]["blockId"], open_ids[0]);
    assert_eq!(resp["error"]["details"]["conflicts"][0]["conflictsWith"], booked_id);
    let list = month_blocks(&mut sc);
    assert!(block(&list, &open_ids[1])["studentId"].is_null());

    let assigned = sc.request_ok(
        "timetable.assign",
        json!({ "blockId": open_ids[0], "studentId": student, "scope": "group", "force": true }),
    );
    assert_eq!(assigned["assignedCount"], 2);
    let list = month_blocks(&mut sc);
    assert_eq!(block(&list, &open_ids[1])["studentId"], student);
}
