use crate::engine::ScoreStatus;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const BULK_RECORD_MAX_EDITS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Validates a (points, status) pair for one score cell.
///
/// Only `present` carries points; missing/absent/excused are recorded with
/// points = 0 and the engine decides what that means at compute time.
fn resolve_score(
    status_raw: Option<&str>,
    points: Option<f64>,
    max_points: f64,
) -> Result<(f64, ScoreStatus), HandlerErr> {
    let status = match status_raw {
        Some(s) => ScoreStatus::parse(s).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "status must be one of: present, missing, absent, excused".to_string(),
            details: Some(json!({ "status": s })),
        })?,
        None => ScoreStatus::Present,
    };

    match status {
        ScoreStatus::Present => {
            let Some(v) = points else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "present status requires numeric points".to_string(),
                    details: None,
                });
            };
            if v < 0.0 {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "negative points are not allowed".to_string(),
                    details: Some(json!({ "points": v })),
                });
            }
            if v > max_points {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "points exceed the item's maxPoints".to_string(),
                    details: Some(json!({ "points": v, "maxPoints": max_points })),
                });
            }
            Ok((v, status))
        }
        _ => Ok((0.0, status)),
    }
}

fn resolve_item(
    conn: &Connection,
    section_id: &str,
    item_id: &str,
) -> Result<f64, HandlerErr> {
    let max_points: Option<f64> = conn
        .query_row(
            "SELECT max_points FROM graded_items WHERE id = ? AND section_id = ?",
            (item_id, section_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    max_points.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "graded item not found".to_string(),
        details: Some(json!({ "gradedItemId": item_id })),
    })
}

fn resolve_student(
    conn: &Connection,
    section_id: &str,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE id = ? AND section_id = ?",
            (student_id, section_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    found.map(|_| ()).ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "student not found".to_string(),
        details: Some(json!({ "studentId": student_id })),
    })
}

fn upsert_score(
    conn: &Connection,
    item_id: &str,
    student_id: &str,
    points: f64,
    status: ScoreStatus,
) -> Result<(), HandlerErr> {
    let score_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO graded_scores(id, graded_item_id, student_id, points, status)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(graded_item_id, student_id) DO UPDATE SET
           points = excluded.points,
           status = excluded.status",
        (&score_id, item_id, student_id, points, status.as_str()),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "graded_scores" })),
    })?;
    Ok(())
}

fn handle_scores_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let item_id = match req.params.get("gradedItemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing gradedItemId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let max_points = match resolve_item(conn, &section_id, &item_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = resolve_student(conn, &section_id, &student_id) {
        return e.response(&req.id);
    }

    let status_raw = req.params.get("status").and_then(|v| v.as_str());
    let points = req.params.get("points").and_then(|v| v.as_f64());
    let (points, status) = match resolve_score(status_raw, points, max_points) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = upsert_score(conn, &item_id, &student_id, points, status) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_scores_bulk_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > BULK_RECORD_MAX_EDITS {
        let rejected = edits_arr.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, BULK_RECORD_MAX_EDITS
                    )
                }]
            }),
        );
    }

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} must be an object", i),
            }));
            continue;
        };

        let Some(item_id) = obj.get("gradedItemId").and_then(|v| v.as_str()) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} missing gradedItemId", i),
            }));
            continue;
        };
        let Some(student_id) = obj.get("studentId").and_then(|v| v.as_str()) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} missing studentId", i),
            }));
            continue;
        };

        let max_points = match resolve_item(conn, &section_id, item_id) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };
        if let Err(e) = resolve_student(conn, &section_id, student_id) {
            errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            }));
            continue;
        }

        let status_raw = obj.get("status").and_then(|v| v.as_str());
        let points = obj.get("points").and_then(|v| v.as_f64());
        let (points, status) = match resolve_score(status_raw, points, max_points) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };

        match upsert_score(conn, item_id, student_id, points, status) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let rejected = errors.len();
    let result = if rejected > 0 {
        json!({
            "ok": true,
            "updated": updated,
            "rejected": rejected,
            "errors": errors,
        })
    } else {
        json!({ "ok": true, "updated": updated })
    };

    ok(&req.id, result)
}

fn handle_scores_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT s.graded_item_id, s.student_id, s.points, s.status, i.max_points
         FROM graded_scores s
         JOIN graded_items i ON i.id = s.graded_item_id
         WHERE i.section_id = ?
         ORDER BY i.idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([&section_id], |r| {
        Ok(json!({
            "gradedItemId": r.get::<_, String>(0)?,
            "studentId": r.get::<_, String>(1)?,
            "points": r.get::<_, f64>(2)?,
            "status": r.get::<_, String>(3)?,
            "maxPoints": r.get::<_, f64>(4)?,
        }))
    });

    match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(scores) => ok(&req.id, json!({ "scores": scores })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.record" => Some(handle_scores_record(state, req)),
        "scores.bulkRecord" => Some(handle_scores_bulk_record(state, req)),
        "scores.list" => Some(handle_scores_list(state, req)),
        _ => None,
    }
}
