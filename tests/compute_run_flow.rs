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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Fixture {
    section_id: String,
    profile_id: String,
    student_ids: Vec<String>,
    item_ids: Vec<String>,
}

/// DepEd-style section: WW 50 / PT 30 / QA 20, one graded item per component.
fn setup_deped_section(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    students: &[(&str, &str, bool)],
) -> Fixture {
    let created = request_ok(
        stdin,
        reader,
        "setup-section",
        "sections.create",
        json!({
            "name": "Grade 8 - Mabini",
            "schoolYear": "2025-2026",
            "term": "Q1",
            "schemeType": "deped_k12",
            "weightPolicy": "strict",
            "roundingMode": "floor"
        }),
    );
    let section_id = created
        .get("sectionId")
        .and_then(|v| v.as_str())
        .expect("sectionId")
        .to_string();

    let mut student_ids = Vec::new();
    for (i, (last, first, active)) in students.iter().enumerate() {
        let res = request_ok(
            stdin,
            reader,
            &format!("setup-student-{i}"),
            "students.create",
            json!({
                "sectionId": section_id,
                "lastName": last,
                "firstName": first,
                "active": active
            }),
        );
        student_ids.push(
            res.get("studentId")
                .and_then(|v| v.as_str())
                .expect("studentId")
                .to_string(),
        );
    }

    let profile = request_ok(
        stdin,
        reader,
        "setup-profile",
        "weightProfiles.create",
        json!({ "sectionId": section_id, "name": "DepEd Default" }),
    );
    let profile_id = profile
        .get("weightProfileId")
        .and_then(|v| v.as_str())
        .expect("weightProfileId")
        .to_string();

    let mut item_ids = Vec::new();
    for (code, name, weight) in [
        ("WW", "Written Work", 50.0),
        ("PT", "Performance Task", 30.0),
        ("QA", "Quarterly Assessment", 20.0),
    ] {
        let comp = request_ok(
            stdin,
            reader,
            &format!("setup-comp-{code}"),
            "components.create",
            json!({ "sectionId": section_id, "code": code, "name": name }),
        );
        let component_id = comp
            .get("componentId")
            .and_then(|v| v.as_str())
            .expect("componentId")
            .to_string();
        let _ = request_ok(
            stdin,
            reader,
            &format!("setup-weight-{code}"),
            "weights.set",
            json!({
                "weightProfileId": profile_id,
                "componentId": component_id,
                "weightPercent": weight
            }),
        );
        let item = request_ok(
            stdin,
            reader,
            &format!("setup-item-{code}"),
            "items.create",
            json!({
                "sectionId": section_id,
                "componentId": component_id,
                "title": format!("{name} 1"),
                "maxPoints": 100.0
            }),
        );
        item_ids.push(
            item.get("gradedItemId")
                .and_then(|v| v.as_str())
                .expect("gradedItemId")
                .to_string(),
        );
    }

    Fixture {
        section_id,
        profile_id,
        student_ids,
        item_ids,
    }
}

/// Identity table over 0..=100 except 87 -> 92 (the DepEd worked example).
fn create_table(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> String {
    let rows: Vec<serde_json::Value> = (0..=100)
        .map(|k| {
            let transmuted = if k == 87 { 92.0 } else { k as f64 };
            json!({ "initialGrade": k, "transmutedGrade": transmuted })
        })
        .collect();
    let res = request_ok(
        stdin,
        reader,
        "setup-table",
        "transmutation.tables.create",
        json!({ "name": "DepEd Order 8", "version": 1, "rows": rows }),
    );
    assert_eq!(res.get("rowCount").and_then(|v| v.as_i64()), Some(101));
    res.get("transmutationTableId")
        .and_then(|v| v.as_str())
        .expect("transmutationTableId")
        .to_string()
}

#[test]
fn compute_run_end_to_end_with_transmutation() {
    let workspace = temp_dir("gradebook-compute-flow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let fx = setup_deped_section(
        &mut stdin,
        &mut reader,
        &[
            ("Cruz", "Ana", true),
            ("Reyes", "Ben", true),
            ("Santos", "Celia", false),
        ],
    );
    let table_id = create_table(&mut stdin, &mut reader);

    // Ana: 88 / 85 / 90 across WW / PT / QA.
    for (i, points) in [88.0, 85.0, 90.0].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("score-ana-{i}"),
            "scores.record",
            json!({
                "sectionId": fx.section_id,
                "gradedItemId": fx.item_ids[i],
                "studentId": fx.student_ids[0],
                "points": points,
                "status": "present"
            }),
        );
    }
    // Ben: 70 on WW, never handed in the PT, 80 on QA.
    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "score-ben",
        "scores.bulkRecord",
        json!({
            "sectionId": fx.section_id,
            "edits": [
                { "gradedItemId": fx.item_ids[0], "studentId": fx.student_ids[1], "points": 70.0, "status": "present" },
                { "gradedItemId": fx.item_ids[1], "studentId": fx.student_ids[1], "status": "missing" },
                { "gradedItemId": fx.item_ids[2], "studentId": fx.student_ids[1], "points": 80.0, "status": "present" }
            ]
        }),
    );
    assert_eq!(bulk.get("updated").and_then(|v| v.as_i64()), Some(3));

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "run-1",
        "compute.run",
        json!({
            "sectionId": fx.section_id,
            "weightProfileId": fx.profile_id,
            "transmutationTableId": table_id
        }),
    );

    // Inactive Celia is not part of the batch.
    assert_eq!(run.get("computed").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        run.get("skipped").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    assert_eq!(
        run.get("weightPolicy").and_then(|v| v.as_str()),
        Some("strict")
    );

    let grades = run.get("grades").and_then(|v| v.as_array()).expect("grades");
    let ana = &grades[0];
    assert_eq!(
        ana.get("studentId").and_then(|v| v.as_str()),
        Some(fx.student_ids[0].as_str())
    );
    // 0.5*88 + 0.3*85 + 0.2*90 = 87.5, floors to 87, table maps 87 -> 92.
    assert!((ana.get("initialGrade").and_then(|v| v.as_f64()).expect("initial") - 87.5).abs() < 1e-9);
    assert_eq!(
        ana.get("finalNumericGrade").and_then(|v| v.as_f64()),
        Some(92.0)
    );
    assert_eq!(ana.get("transmutedGrade").and_then(|v| v.as_f64()), Some(92.0));

    let breakdown = ana.get("breakdown").expect("breakdown");
    assert_eq!(
        breakdown.get("weightPolicy").and_then(|v| v.as_str()),
        Some("strict")
    );
    assert_eq!(
        breakdown.get("roundingMode").and_then(|v| v.as_str()),
        Some("floor")
    );
    let components = breakdown
        .get("components")
        .and_then(|v| v.as_array())
        .expect("breakdown components");
    assert_eq!(components.len(), 3);
    assert!((components[0].get("percent").and_then(|v| v.as_f64()).expect("ww percent") - 88.0).abs() < 1e-9);

    // Ben's missing PT counts its full 100 max against him:
    // 0.5*70 + 0.3*0 + 0.2*80 = 51.
    let ben = &grades[1];
    assert!((ben.get("initialGrade").and_then(|v| v.as_f64()).expect("initial") - 51.0).abs() < 1e-9);
    assert_eq!(
        ben.get("finalNumericGrade").and_then(|v| v.as_f64()),
        Some(51.0)
    );
    let ben_pt = ben
        .get("breakdown")
        .and_then(|v| v.get("components"))
        .and_then(|v| v.as_array())
        .expect("ben components")[1]
        .clone();
    assert_eq!(ben_pt.get("rawTotal").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(ben_pt.get("maxTotal").and_then(|v| v.as_f64()), Some(100.0));

    // Persisted results match the run payload.
    let results = request_ok(
        &mut stdin,
        &mut reader,
        "results-1",
        "compute.results",
        json!({ "sectionId": fx.section_id }),
    );
    let persisted = results
        .get("grades")
        .and_then(|v| v.as_array())
        .expect("persisted grades");
    assert_eq!(persisted.len(), 2);
    assert_eq!(
        persisted[0].get("finalNumericGrade").and_then(|v| v.as_f64()),
        Some(92.0)
    );
    let first_run_id = persisted[0]
        .get("runId")
        .and_then(|v| v.as_str())
        .expect("runId")
        .to_string();

    // Re-running supersedes the previous batch: same grades, fresh run id.
    let rerun = request_ok(
        &mut stdin,
        &mut reader,
        "run-2",
        "compute.run",
        json!({
            "sectionId": fx.section_id,
            "weightProfileId": fx.profile_id,
            "transmutationTableId": table_id
        }),
    );
    assert_eq!(rerun.get("computed").and_then(|v| v.as_i64()), Some(2));

    let results2 = request_ok(
        &mut stdin,
        &mut reader,
        "results-2",
        "compute.results",
        json!({ "sectionId": fx.section_id }),
    );
    let persisted2 = results2
        .get("grades")
        .and_then(|v| v.as_array())
        .expect("persisted grades after rerun");
    assert_eq!(persisted2.len(), 2);
    assert_ne!(
        persisted2[0].get("runId").and_then(|v| v.as_str()),
        Some(first_run_id.as_str())
    );
    assert_eq!(
        persisted2[0].get("finalNumericGrade").and_then(|v| v.as_f64()),
        Some(92.0)
    );

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn excused_scores_leave_the_grade_alone() {
    let workspace = temp_dir("gradebook-excused");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let fx = setup_deped_section(&mut stdin, &mut reader, &[("Cruz", "Ana", true)]);
    let table_id = create_table(&mut stdin, &mut reader);

    for (i, points) in [88.0, 85.0, 90.0].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("score-{i}"),
            "scores.record",
            json!({
                "sectionId": fx.section_id,
                "gradedItemId": fx.item_ids[i],
                "studentId": fx.student_ids[0],
                "points": points,
                "status": "present"
            }),
        );
    }

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "run-base",
        "compute.run",
        json!({
            "sectionId": fx.section_id,
            "weightProfileId": fx.profile_id,
            "transmutationTableId": table_id,
            "weightPolicy": "normalize"
        }),
    );
    let base = run.get("grades").and_then(|v| v.as_array()).expect("grades")[0]
        .get("initialGrade")
        .and_then(|v| v.as_f64())
        .expect("initial");
    assert!((base - 87.5).abs() < 1e-9);

    // Excusing the only WW score empties that component; its 50 weight must
    // drop out of the blend instead of dragging the grade toward zero.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "excuse",
        "scores.record",
        json!({
            "sectionId": fx.section_id,
            "gradedItemId": fx.item_ids[0],
            "studentId": fx.student_ids[0],
            "status": "excused"
        }),
    );

    let run2 = request_ok(
        &mut stdin,
        &mut reader,
        "run-excused",
        "compute.run",
        json!({
            "sectionId": fx.section_id,
            "weightProfileId": fx.profile_id,
            "transmutationTableId": table_id,
            "weightPolicy": "normalize"
        }),
    );
    let after = run2.get("grades").and_then(|v| v.as_array()).expect("grades")[0].clone();
    // (85*0.3 + 90*0.2) / 50 * 100 = 87.0 over the remaining PT and QA.
    assert!(
        (after.get("initialGrade").and_then(|v| v.as_f64()).expect("initial") - 87.0).abs() < 1e-9
    );
    let ww = after
        .get("breakdown")
        .and_then(|v| v.get("components"))
        .and_then(|v| v.as_array())
        .expect("components")[0]
        .clone();
    assert_eq!(ww.get("applied").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(ww.get("maxTotal").and_then(|v| v.as_f64()), Some(0.0));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
