use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_row(v: &serde_json::Value) -> Option<(i64, f64)> {
    let obj = v.as_object()?;
    let initial = obj.get("initialGrade").and_then(|x| x.as_i64())?;
    let transmuted = obj.get("transmutedGrade").and_then(|x| x.as_f64())?;
    if !(0..=100).contains(&initial) {
        return None;
    }
    Some((initial, transmuted))
}

fn handle_tables_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let version = req
        .params
        .get("version")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);

    let mut rows: Vec<(i64, f64)> = Vec::new();
    if let Some(arr) = req.params.get("rows").and_then(|v| v.as_array()) {
        for (i, v) in arr.iter().enumerate() {
            let Some(row) = parse_row(v) else {
                return err(
                    &req.id,
                    "bad_params",
                    "rows[] entries need integer initialGrade in 0..=100 and numeric transmutedGrade",
                    Some(json!({ "index": i })),
                );
            };
            rows.push(row);
        }
    }

    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let table_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO transmutation_tables(id, name, version) VALUES(?, ?, ?)",
        (&table_id, &name, version),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "transmutation_tables" })),
        );
    }
    for (initial, transmuted) in &rows {
        if let Err(e) = tx.execute(
            "INSERT INTO transmutation_rows(table_id, initial_grade, transmuted_grade)
             VALUES(?, ?, ?)",
            (&table_id, initial, transmuted),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "transmutation_rows", "initialGrade": initial })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "transmutationTableId": table_id, "rowCount": rows.len() }),
    )
}

fn handle_tables_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "tables": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           t.id,
           t.name,
           t.version,
           (SELECT COUNT(*) FROM transmutation_rows r WHERE r.table_id = t.id) AS row_count
         FROM transmutation_tables t
         ORDER BY t.name, t.version",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "version": r.get::<_, i64>(2)?,
            "rowCount": r.get::<_, i64>(3)?,
        }))
    });

    match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(tables) => ok(&req.id, json!({ "tables": tables })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_rows_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let table_id = match req
        .params
        .get("transmutationTableId")
        .and_then(|v| v.as_str())
    {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing transmutationTableId", None),
    };

    let exists: Option<String> = match conn
        .query_row(
            "SELECT id FROM transmutation_tables WHERE id = ?",
            [&table_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(
            &req.id,
            "not_found",
            "transmutation table not found",
            Some(json!({ "transmutationTableId": table_id })),
        );
    }

    let Some(row) = parse_row(&req.params) else {
        return err(
            &req.id,
            "bad_params",
            "need integer initialGrade in 0..=100 and numeric transmutedGrade",
            None,
        );
    };

    if let Err(e) = conn.execute(
        "INSERT INTO transmutation_rows(table_id, initial_grade, transmuted_grade)
         VALUES(?, ?, ?)
         ON CONFLICT(table_id, initial_grade) DO UPDATE SET
           transmuted_grade = excluded.transmuted_grade",
        (&table_id, row.0, row.1),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "transmutation_rows" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "transmutation.tables.create" => Some(handle_tables_create(state, req)),
        "transmutation.tables.list" => Some(handle_tables_list(state, req)),
        "transmutation.rows.set" => Some(handle_rows_set(state, req)),
        _ => None,
    }
}
