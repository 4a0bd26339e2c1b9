mod common;

use common::{str_field, Sidecar};
use serde_json::json;

/// Kim: two lessons in March, attendance P/A/E/L, one scored feed with a memo.
fn seed_month(sc: &mut Sidecar) -> (String, String) {
    let teacher = sc.add_teacher("Park");
    let kim = sc.add_student("Kim");
    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "studentId": kim, "date": "2026-03-02", "startTime": "16:00", "endTime": "17:00", "repeatWeeks": 2 }),
    );
    for (date, status) in [
        ("2026-03-02", "present"),
        ("2026-03-03", "absent"),
        ("2026-03-04", "excused"),
        ("2026-03-05", "late"),
    ] {
        sc.request_ok(
            "attendance.set",
            json!({ "studentId": kim, "date": date, "status": status }),
        );
    }

    let config = str_field(
        &sc.request_ok("feedConfigs.create", json!({ "name": "Spring" })),
        "configId",
    );
    let set = str_field(
        &sc.request_ok(
            "optionSets.create",
            json!({ "configId": config, "name": "Progress", "category": "progress" }),
        ),
        "optionSetId",
    );
    let option = str_field(
        &sc.request_ok(
            "options.create",
            json!({ "optionSetId": set, "label": "Great", "score": 4.0 }),
        ),
        "optionId",
    );
    sc.request_ok("feedConfigs.activate", json!({ "configId": config }));
    sc.request_ok("feedConfigs.apply", json!({ "configId": config }));
    sc.request_ok(
        "feeds.submit",
        json!({
            "studentId": kim,
            "teacherId": teacher,
            "date": "2026-03-02",
            "values": { set: option },
            "memo": "Focused"
        }),
    );
    (teacher, kim)
}

#[test]
fn monthly_summary_matches_stored_rows() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let (_, kim) = seed_month(&mut sc);
    sc.add_student("Lee");

    let monthly = sc.request_ok("reports.monthly", json!({ "month": "2026-03" }));
    assert_eq!(monthly["daysInMonth"], 31);
    let rows = monthly["students"].as_array().expect("students");
    assert_eq!(rows.len(), 2);
    let row = rows.iter().find(|r| r["studentId"] == kim).expect("kim row");
    assert_eq!(row["attendance"]["present"], 1);
    assert_eq!(row["attendance"]["late"], 1);
    // Excused days are left out; late counts as present by default.
    assert_eq!(row["attendanceRate"], 66.7);
    assert_eq!(row["lessonCount"], 2);
    assert_eq!(row["scheduledDays"], 2);
    assert_eq!(row["feedCount"], 1);
    assert_eq!(row["categoryAverages"]["progress"], 4.0);
    assert_eq!(row["memos"][0]["memo"], "Focused");
    assert!(row["reportId"].is_null());

    let lee = rows.iter().find(|r| r["name"] == "Lee").expect("lee row");
    assert!(lee["attendanceRate"].is_null());

    sc.request_ok(
        "setup.update",
        json!({ "section": "attendance", "patch": { "countLateAsPresent": false } }),
    );
    sc.request_ok(
        "setup.update",
        json!({ "section": "reports", "patch": { "includeMemos": false, "rateDecimals": 0 } }),
    );
    let monthly = sc.request_ok(
        "reports.monthly",
        json!({ "month": "2026-03", "studentId": kim }),
    );
    let row = &monthly["students"][0];
    assert_eq!(row["attendanceRate"], 33.0);
    assert!(row.get("memos").is_none());
}

#[test]
fn saved_reports_freeze_on_finalize() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let (_, kim) = seed_month(&mut sc);

    let saved = sc.request_ok(
        "reports.save",
        json!({ "studentId": kim, "month": "2026-03", "comment": "Steady month" }),
    );
    assert_eq!(saved["status"], "draft");
    assert_eq!(saved["summary"]["feedCount"], 1);
    let report_id = str_field(&saved, "reportId");

    // Saving again without a comment keeps the old one.
    let again = sc.request_ok("reports.save", json!({ "studentId": kim, "month": "2026-03" }));
    assert_eq!(again["reportId"], report_id);
    let report = sc.request_ok("reports.get", json!({ "reportId": report_id }));
    assert_eq!(report["comment"], "Steady month");
    assert_eq!(report["summary"]["attendanceRate"], 66.7);

    let list = sc.request_ok("reports.list", json!({ "month": "2026-03" }));
    assert_eq!(list["reports"].as_array().map(|r| r.len()), Some(1));
    assert_eq!(list["reports"][0]["status"], "draft");

    let monthly = sc.request_ok("reports.monthly", json!({ "month": "2026-03" }));
    assert_eq!(monthly["students"][0]["reportId"], report_id);

    let finalized = sc.request_ok("reports.finalize", json!({ "reportId": report_id }));
    assert_eq!(finalized["status"], "final");
    assert_eq!(
        sc.request_err("reports.finalize", json!({ "reportId": report_id })),
        "conflict"
    );
    assert_eq!(
        sc.request_err(
            "reports.save",
            json!({ "studentId": kim, "month": "2026-03", "comment": "edit" })
        ),
        "conflict"
    );
    let report = sc.request_ok("reports.get", json!({ "reportId": report_id }));
    assert_eq!(report["status"], "final");
    assert_eq!(report["comment"], "Steady month");

    assert_eq!(
        sc.request_err(
            "reports.save",
            json!({ "studentId": kim, "month": "2026-04", "comment": "x".repeat(2001) })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.request_err("reports.get", json!({ "reportId": "missing" })),
        "not_found"
    );
}

#[test]
fn dashboard_counts_the_day() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (mut sc, _) = Sidecar::bootstrap(dir.path());
    let (teacher, _) = seed_month(&mut sc);
    let lee = sc.add_student("Lee");
    sc.request_ok(
        "timetable.create",
        json!({ "teacherId": teacher, "studentId": lee, "date": "2026-03-02", "startTime": "17:00", "endTime": "18:00" }),
    );

    let dash = sc.request_ok("reports.dashboard", json!({ "date": "2026-03-02" }));
    assert_eq!(dash["activeStudents"], 2);
    assert_eq!(dash["activeTeachers"], 1);
    assert_eq!(dash["lessonsToday"], 2);
    assert_eq!(dash["scheduledStudentsToday"], 2);
    assert_eq!(dash["attendanceToday"]["present"], 1);
    assert_eq!(dash["uncheckedToday"], 1);
    assert_eq!(dash["feedsToday"], 1);
    assert_eq!(dash["pendingFeedsToday"], 1);
    assert_eq!(dash["month"], "2026-03");
    assert_eq!(dash["monthAttendanceRate"], 66.7);
}
