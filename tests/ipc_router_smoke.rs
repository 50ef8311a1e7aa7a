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
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("gradebook-router-smoke");
    let bundle_out = workspace.join("smoke-backup.gbbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "sections.create",
        json!({
            "name": "Smoke Section",
            "schoolYear": "2025-2026",
            "term": "Q1",
            "schemeType": "ched_simple"
        }),
    );
    let section_id = created
        .get("result")
        .and_then(|v| v.get("sectionId"))
        .and_then(|v| v.as_str())
        .expect("sectionId")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "4", "sections.list", json!({}));
    let created_student = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "sectionId": section_id,
            "lastName": "Smoke",
            "firstName": "Student",
            "active": true
        }),
    );
    let student_id = created_student
        .get("result")
        .and_then(|v| v.get("studentId"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.list",
        json!({ "sectionId": section_id }),
    );
    if !student_id.is_empty() {
        let _ = request(
            &mut stdin,
            &mut reader,
            "6a",
            "students.update",
            json!({
                "studentId": student_id,
                "patch": { "firstName": "Updated" }
            }),
        );
    }

    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "components.create",
        json!({ "sectionId": section_id, "code": "WW", "name": "Written Work" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "components.list",
        json!({ "sectionId": section_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "weightProfiles.create",
        json!({ "sectionId": section_id, "name": "Default" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "weights.list",
        json!({ "weightProfileId": "missing" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "items.list",
        json!({ "sectionId": section_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "scores.list",
        json!({ "sectionId": section_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "scores.record",
        json!({
            "sectionId": section_id,
            "gradedItemId": "missing",
            "studentId": student_id,
            "points": 1.0
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "scores.bulkRecord",
        json!({ "sectionId": section_id, "edits": [] }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "transmutation.tables.list",
        json!({}),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "transmutation.tables.create",
        json!({ "name": "Smoke Table", "rows": [] }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "transmutation.rows.set",
        json!({
            "transmutationTableId": "missing",
            "initialGrade": 75,
            "transmutedGrade": 80.0
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "compute.run",
        json!({ "sectionId": section_id, "weightProfileId": "missing" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "compute.results",
        json!({ "sectionId": section_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
