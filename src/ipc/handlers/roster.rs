use crate::engine::{RoundingMode, SchemeType, WeightPolicy};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let school_year = req
        .params
        .get("schoolYear")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let term = req
        .params
        .get("term")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let scheme_raw = req
        .params
        .get("schemeType")
        .and_then(|v| v.as_str())
        .unwrap_or("deped_k12");
    let Some(scheme) = SchemeType::parse(scheme_raw) else {
        return err(
            &req.id,
            "bad_params",
            "schemeType must be one of: deped_k12, ched_hei, ched_simple",
            Some(json!({ "schemeType": scheme_raw })),
        );
    };

    let policy_raw = req
        .params
        .get("weightPolicy")
        .and_then(|v| v.as_str())
        .unwrap_or("normalize");
    let Some(policy) = WeightPolicy::parse(policy_raw) else {
        return err(
            &req.id,
            "bad_params",
            "weightPolicy must be one of: strict, normalize",
            Some(json!({ "weightPolicy": policy_raw })),
        );
    };

    let rounding_raw = req
        .params
        .get("roundingMode")
        .and_then(|v| v.as_str())
        .unwrap_or("floor");
    let Some(rounding) = RoundingMode::parse(rounding_raw) else {
        return err(
            &req.id,
            "bad_params",
            "roundingMode must be one of: floor, round, ceil",
            Some(json!({ "roundingMode": rounding_raw })),
        );
    };

    let section_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sections(id, name, school_year, term, scheme_type, weight_policy, rounding_mode)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &section_id,
            &name,
            &school_year,
            &term,
            scheme.as_str(),
            policy.as_str(),
            rounding.as_str(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        );
    }

    ok(&req.id, json!({ "sectionId": section_id }))
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sections": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.school_year,
           s.term,
           s.scheme_type,
           s.weight_policy,
           s.rounding_mode,
           (SELECT COUNT(*) FROM students st WHERE st.section_id = s.id) AS student_count
         FROM sections s
         ORDER BY s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "schoolYear": r.get::<_, String>(2)?,
            "term": r.get::<_, String>(3)?,
            "schemeType": r.get::<_, String>(4)?,
            "weightPolicy": r.get::<_, String>(5)?,
            "roundingMode": r.get::<_, String>(6)?,
            "studentCount": r.get::<_, i64>(7)?,
        }))
    });

    match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(sections) => ok(&req.id, json!({ "sections": sections })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing firstName", None),
    };
    let student_no = req
        .params
        .get("studentNo")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let section_exists: Option<String> = match conn
        .query_row("SELECT id FROM sections WHERE id = ?", [&section_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if section_exists.is_none() {
        return err(
            &req.id,
            "not_found",
            "section not found",
            Some(json!({ "sectionId": section_id })),
        );
    }

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE section_id = ?",
        [&section_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, section_id, last_name, first_name, student_no, active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &section_id,
            &last_name,
            &first_name,
            &student_no,
            active as i64,
            next_sort,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id, "sortOrder": next_sort }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, student_no, active, sort_order
         FROM students
         WHERE section_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([&section_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "lastName": last.clone(),
            "firstName": first.clone(),
            "displayName": format!("{}, {}", last, first),
            "studentNo": r.get::<_, Option<String>>(3)?,
            "active": r.get::<_, i64>(4)? != 0,
            "sortOrder": r.get::<_, i64>(5)?,
        }))
    });

    match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let existing: Option<String> = match conn
        .query_row("SELECT id FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.is_none() {
        return err(
            &req.id,
            "not_found",
            "student not found",
            Some(json!({ "studentId": student_id })),
        );
    }

    if let Some(v) = patch.get("lastName").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE students SET last_name = ? WHERE id = ?",
            (v, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = patch.get("firstName").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE students SET first_name = ? WHERE id = ?",
            (v, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = patch.get("studentNo").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE students SET student_no = ? WHERE id = ?",
            (v, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = patch.get("active").and_then(|v| v.as_bool()) {
        if let Err(e) = conn.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (v as i64, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.list" => Some(handle_sections_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        _ => None,
    }
}
