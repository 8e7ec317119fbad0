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

fn create_user(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    role: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "users.create",
        json!({ "displayName": name, "role": role }),
    )["userId"]
        .as_str()
        .expect("user id")
        .to_string()
}

#[test]
fn roster_orders_by_role_and_annotates_lateness() {
    let workspace = temp_dir("classhub-roster-order");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let primary = create_user(&mut stdin, &mut reader, "2", "Priya Nair", "instructor");
    let secondary = create_user(&mut stdin, &mut reader, "3", "Noel Abt", "instructor");
    let s1 = create_user(&mut stdin, &mut reader, "4", "Amy Field", "student");
    let s2 = create_user(&mut stdin, &mut reader, "5", "Ben Osei", "student");
    let s3 = create_user(&mut stdin, &mut reader, "6", "Cleo Roy", "student");

    let session_id = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sessions.create",
        json!({
            "courseId": "course-chem",
            "context": "group",
            "startAt": "2026-03-10T10:00:00Z",
            "endAt": "2026-03-10T11:00:00Z",
            "primaryInstructorId": primary,
            "secondaryInstructorId": secondary,
            "participantIds": [s1, s2, s3]
        }),
    )["sessionId"]
        .as_str()
        .expect("session id")
        .to_string();

    // Saved in scrambled order; the derived roster ignores it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.rosterSave",
        json!({
            "sessionId": session_id,
            "entries": [
                { "userId": s2, "present": true,
                  "joinTime": "2026-03-10T10:12:00Z", "leaveTime": "2026-03-10T10:45:00Z" },
                { "userId": primary, "present": true, "joinTime": "2026-03-10T09:50:00Z" },
                { "userId": s3, "present": true,
                  "joinTime": "2026-03-10T10:03:00Z", "leaveTime": "2026-03-10T11:00:00Z" },
                { "userId": s1, "present": true, "joinTime": "2026-03-10T09:58:00Z" },
                { "userId": secondary, "present": false }
            ]
        }),
    );

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.rosterOpen",
        json!({ "sessionId": session_id }),
    );
    let entries = roster["entries"].as_array().expect("entries");
    let ids: Vec<&str> = entries
        .iter()
        .map(|e| e["userId"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(ids, vec![&primary, &secondary, &s1, &s2, &s3]);

    assert_eq!(entries[0]["displayRole"].as_str(), Some("Primary Instructor"));
    assert_eq!(
        entries[1]["displayRole"].as_str(),
        Some("Secondary Instructor")
    );
    assert_eq!(entries[2]["displayRole"].as_str(), Some("Student"));
    assert_eq!(entries[0]["displayName"].as_str(), Some("Priya Nair"));

    // Grace is 5 minutes: 10:03 is on time, 10:12 is late.
    assert_eq!(entries[0]["lateJoin"].as_bool(), Some(false));
    assert_eq!(entries[2]["lateJoin"].as_bool(), Some(false));
    assert_eq!(entries[3]["lateJoin"].as_bool(), Some(true));
    assert_eq!(entries[4]["lateJoin"].as_bool(), Some(false));

    // Leaving at 10:45 is early; leaving exactly at end is not.
    assert_eq!(entries[3]["earlyLeft"].as_bool(), Some(true));
    assert_eq!(entries[4]["earlyLeft"].as_bool(), Some(false));
    assert_eq!(entries[2]["earlyLeft"].as_bool(), Some(false));

    // Absent secondary keeps a default row.
    assert_eq!(entries[1]["present"].as_bool(), Some(false));
    assert_eq!(entries[1]["joinTime"], serde_json::Value::Null);

    // Re-reading with no intervening writes yields identical output.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.rosterOpen",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(roster, again);
}
