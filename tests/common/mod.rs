#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub const SERVICE_KEY: &str = "test-service-key";

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    /// Spawns the daemon inside `dir` so no stray config file is picked up.
    pub fn spawn(dir: &Path, service_key: Option<&str>) -> Self {
        let exe = env!("CARGO_BIN_EXE_academyd");
        let mut cmd = Command::new(exe);
        cmd.current_dir(dir)
            .env_remove("ACADEMYD_CONFIG")
            .env_remove("ACADEMYD_WORKSPACE")
            .env_remove("ACADEMYD_SERVICE_KEY")
            .env("ACADEMYD_LOG__LEVEL", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(key) = service_key {
            cmd.env("ACADEMYD_SERVICE_KEY", key);
        }
        let mut child = cmd.spawn().expect("spawn academyd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    pub fn send_raw(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Error code of a request that must fail.
    pub fn request_err(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn create_academy(&mut self, name: &str) -> String {
        let res = self.request_ok(
            "academies.create",
            json!({ "name": name, "serviceKey": SERVICE_KEY }),
        );
        str_field(&res, "academyId")
    }

    /// Selects `workspace`, creates one academy, and makes it active.
    pub fn bootstrap(dir: &Path) -> (Self, String) {
        let mut sc = Self::spawn(dir, Some(SERVICE_KEY));
        let workspace = dir.join("workspace");
        sc.request_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        let academy_id = sc.create_academy("Seoul Main");
        sc.request_ok("academy.use", json!({ "academyId": academy_id }));
        (sc, academy_id)
    }

    pub fn add_teacher(&mut self, name: &str) -> String {
        let res = self.request_ok("teachers.create", json!({ "name": name }));
        str_field(&res, "teacherId")
    }

    pub fn add_student(&mut self, name: &str) -> String {
        let res = self.request_ok("students.create", json!({ "name": name }));
        str_field(&res, "studentId")
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}
