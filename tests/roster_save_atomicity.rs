use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_classhubd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classhubd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Seed {
    s1: String,
    s2: String,
    session: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Seed {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let instructor = request_ok(
        stdin,
        reader,
        "s2",
        "users.create",
        json!({ "displayName": "Priya Nair", "role": "instructor" }),
    )["userId"]
        .as_str()
        .expect("user id")
        .to_string();
    let s1 = request_ok(
        stdin,
        reader,
        "s3",
        "users.create",
        json!({ "displayName": "Amy Field", "role": "student" }),
    )["userId"]
        .as_str()
        .expect("user id")
        .to_string();
    let s2 = request_ok(
        stdin,
        reader,
        "s4",
        "users.create",
        json!({ "displayName": "Ben Osei", "role": "student" }),
    )["userId"]
        .as_str()
        .expect("user id")
        .to_string();
    let session = request_ok(
        stdin,
        reader,
        "s5",
        "sessions.create",
        json!({
            "courseId": "course-chem",
            "context": "group",
            "startAt": "2026-03-10T10:00:00Z",
            "endAt": "2026-03-10T11:00:00Z",
            "primaryInstructorId": instructor,
            "participantIds": [s1, s2]
        }),
    )["sessionId"]
        .as_str()
        .expect("session id")
        .to_string();
    Seed { s1, s2, session }
}

fn entry_for<'a>(roster: &'a serde_json::Value, user_id: &str) -> &'a serde_json::Value {
    roster["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .find(|e| e["userId"].as_str() == Some(user_id))
        .expect("entry present")
}

#[test]
fn invalid_entry_rejects_whole_save() {
    let workspace = temp_dir("classhub-roster-atomic");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.rosterSave",
        json!({
            "sessionId": seed.session,
            "entries": [
                { "userId": seed.s1, "present": true, "joinTime": "2026-03-10T10:00:00Z" },
                { "userId": seed.s2, "present": false }
            ]
        }),
    );

    // Present without a join time poisons the entire save.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.rosterSave",
        json!({
            "sessionId": seed.session,
            "entries": [
                { "userId": seed.s1, "present": false },
                { "userId": seed.s2, "present": true }
            ]
        }),
    );
    assert_eq!(error_code(&rejected), "bad_params");

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.rosterOpen",
        json!({ "sessionId": seed.session }),
    );
    // Prior state survives untouched: no half-applied rows.
    assert_eq!(entry_for(&roster, &seed.s1)["present"].as_bool(), Some(true));
    assert_eq!(
        entry_for(&roster, &seed.s1)["joinTime"].as_str(),
        Some("2026-03-10T10:00:00Z")
    );
    assert_eq!(entry_for(&roster, &seed.s2)["present"].as_bool(), Some(false));
}

#[test]
fn non_member_entry_is_rejected() {
    let workspace = temp_dir("classhub-roster-member");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed(&mut stdin, &mut reader, &workspace);
    let outsider = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "users.create",
        json!({ "displayName": "Zed Out", "role": "student" }),
    )["userId"]
        .as_str()
        .expect("user id")
        .to_string();

    let rejected = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.rosterSave",
        json!({
            "sessionId": seed.session,
            "entries": [
                { "userId": outsider, "present": true, "joinTime": "2026-03-10T10:00:00Z" }
            ]
        }),
    );
    assert_eq!(error_code(&rejected), "bad_params");
}

#[test]
fn absent_entries_drop_recorded_times() {
    let workspace = temp_dir("classhub-roster-absent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed(&mut stdin, &mut reader, &workspace);

    // Times supplied for an absent entry are ignored on save.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.rosterSave",
        json!({
            "sessionId": seed.session,
            "entries": [
                { "userId": seed.s1, "present": false,
                  "joinTime": "2026-03-10T10:00:00Z", "leaveTime": "2026-03-10T10:30:00Z" }
            ]
        }),
    );
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.rosterOpen",
        json!({ "sessionId": seed.session }),
    );
    let entry = entry_for(&roster, &seed.s1);
    assert_eq!(entry["present"].as_bool(), Some(false));
    assert_eq!(entry["joinTime"], serde_json::Value::Null);
    assert_eq!(entry["leaveTime"], serde_json::Value::Null);
    assert_eq!(entry["lateJoin"].as_bool(), Some(false));
    assert_eq!(entry["earlyLeft"].as_bool(), Some(false));
}
