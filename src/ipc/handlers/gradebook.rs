use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn section_exists(conn: &Connection, section_id: &str) -> Result<bool, rusqlite::Error> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM sections WHERE id = ?", [section_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn handle_components_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let code = match req.params.get("code").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing code", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };

    match section_exists(conn, &section_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_found",
                "section not found",
                Some(json!({ "sectionId": section_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM gradebook_components WHERE section_id = ?",
        [&section_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let component_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO gradebook_components(id, section_id, code, name, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&component_id, &section_id, &code, &name, next_sort),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "gradebook_components" })),
        );
    }

    ok(&req.id, json!({ "componentId": component_id }))
}

fn handle_components_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, code, name, sort_order
         FROM gradebook_components
         WHERE section_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([&section_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "code": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "sortOrder": r.get::<_, i64>(3)?,
        }))
    });

    match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(components) => ok(&req.id, json!({ "components": components })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_weight_profiles_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };

    match section_exists(conn, &section_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_found",
                "section not found",
                Some(json!({ "sectionId": section_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let profile_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO weight_profiles(id, section_id, name) VALUES(?, ?, ?)",
        (&profile_id, &section_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "weight_profiles" })),
        );
    }

    ok(&req.id, json!({ "weightProfileId": profile_id }))
}

fn handle_weights_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let profile_id = match req.params.get("weightProfileId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing weightProfileId", None),
    };
    let component_id = match req.params.get("componentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing componentId", None),
    };
    let weight_percent = match req.params.get("weightPercent").and_then(|v| v.as_f64()) {
        Some(v) if v >= 0.0 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "weightPercent must be >= 0",
                Some(json!({ "weightPercent": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing weightPercent", None),
    };

    let weight_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO component_weights(id, weight_profile_id, component_id, weight_percent)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(weight_profile_id, component_id) DO UPDATE SET
           weight_percent = excluded.weight_percent",
        (&weight_id, &profile_id, &component_id, weight_percent),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "component_weights" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_weights_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let profile_id = match req.params.get("weightProfileId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing weightProfileId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT w.component_id, c.code, c.name, w.weight_percent
         FROM component_weights w
         JOIN gradebook_components c ON c.id = w.component_id
         WHERE w.weight_profile_id = ?
         ORDER BY c.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([&profile_id], |r| {
        Ok(json!({
            "componentId": r.get::<_, String>(0)?,
            "code": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "weightPercent": r.get::<_, f64>(3)?,
        }))
    });

    match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(weights) => {
            let total: f64 = weights
                .iter()
                .filter_map(|w| w.get("weightPercent").and_then(|v| v.as_f64()))
                .sum();
            ok(&req.id, json!({ "weights": weights, "totalWeight": total }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_items_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let component_id = match req.params.get("componentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing componentId", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing title", None),
    };
    let max_points = match req.params.get("maxPoints").and_then(|v| v.as_f64()) {
        Some(v) if v > 0.0 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "maxPoints must be > 0",
                Some(json!({ "maxPoints": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing maxPoints", None),
    };
    let date = req
        .params
        .get("date")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let component_section: Option<String> = match conn
        .query_row(
            "SELECT section_id FROM gradebook_components WHERE id = ?",
            [&component_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match component_section {
        Some(s) if s == section_id => {}
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "component belongs to another section",
                Some(json!({ "componentId": component_id })),
            )
        }
        None => {
            return err(
                &req.id,
                "not_found",
                "component not found",
                Some(json!({ "componentId": component_id })),
            )
        }
    }

    let next_idx: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(idx), -1) + 1 FROM graded_items WHERE section_id = ?",
        [&section_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let item_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO graded_items(id, section_id, component_id, idx, title, date, max_points)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &item_id,
            &section_id,
            &component_id,
            next_idx,
            &title,
            &date,
            max_points,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "graded_items" })),
        );
    }

    ok(&req.id, json!({ "gradedItemId": item_id, "idx": next_idx }))
}

fn handle_items_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT i.id, i.component_id, c.code, i.idx, i.title, i.date, i.max_points
         FROM graded_items i
         JOIN gradebook_components c ON c.id = i.component_id
         WHERE i.section_id = ?
         ORDER BY i.idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([&section_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "componentId": r.get::<_, String>(1)?,
            "componentCode": r.get::<_, String>(2)?,
            "idx": r.get::<_, i64>(3)?,
            "title": r.get::<_, String>(4)?,
            "date": r.get::<_, Option<String>>(5)?,
            "maxPoints": r.get::<_, f64>(6)?,
        }))
    });

    match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(items) => ok(&req.id, json!({ "items": items })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "components.create" => Some(handle_components_create(state, req)),
        "components.list" => Some(handle_components_list(state, req)),
        "weightProfiles.create" => Some(handle_weight_profiles_create(state, req)),
        "weights.set" => Some(handle_weights_set(state, req)),
        "weights.list" => Some(handle_weights_list(state, req)),
        "items.create" => Some(handle_items_create(state, req)),
        "items.list" => Some(handle_items_list(state, req)),
        _ => None,
    }
}
