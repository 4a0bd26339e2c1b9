mod common;

use common::{Sidecar, SERVICE_KEY};
use serde_json::json;

#[test]
fn privileged_methods_need_a_configured_key() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut sc = Sidecar::spawn(dir.path(), None);

    sc.request_ok("health", json!({}));
    let workspace = dir.path().join("ws");
    sc.request_ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let list = sc.request_ok("academies.list", json!({}));
    assert_eq!(list["academies"].as_array().map(|a| a.len()), Some(0));

    let resp = sc.request(
        "academies.create",
        json!({ "name": "Seoul Main", "serviceKey": SERVICE_KEY }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "config_missing_service_key");
    let message = resp["error"]["message"].as_str().unwrap_or("");
    assert!(!message.contains(SERVICE_KEY));

    let bundle = dir.path().join("out.zip");
    for (method, params) in [
        ("academies.delete", json!({ "academyId": "x", "serviceKey": SERVICE_KEY })),
        ("backup.export", json!({ "outPath": bundle.to_string_lossy() })),
        ("backup.import", json!({ "inPath": bundle.to_string_lossy() })),
    ] {
        assert_eq!(
            sc.request_err(method, params),
            "config_missing_service_key",
            "{}",
            method
        );
    }
    assert!(!bundle.exists());
}

#[test]
fn wrong_or_missing_key_is_forbidden() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut sc = Sidecar::spawn(dir.path(), Some(SERVICE_KEY));
    let workspace = dir.path().join("ws");
    sc.request_ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));

    assert_eq!(
        sc.request_err("academies.create", json!({ "name": "Seoul Main" })),
        "forbidden"
    );
    assert_eq!(
        sc.request_err(
            "academies.create",
            json!({ "name": "Seoul Main", "serviceKey": "guess" })
        ),
        "forbidden"
    );
    let list = sc.request_ok("academies.list", json!({}));
    assert_eq!(list["academies"].as_array().map(|a| a.len()), Some(0));

    let created = sc.request_ok(
        "academies.create",
        json!({ "name": "Seoul Main", "serviceKey": SERVICE_KEY }),
    );
    assert!(created["academyId"].as_str().is_some());
}
