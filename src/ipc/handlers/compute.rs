use crate::engine::{
    self, ComponentInput, GradedScore, RoundingMode, SchemeType, ScoreStatus, TransmutationTable,
    WeightPolicy,
};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct SectionConfig {
    scheme: SchemeType,
    policy: WeightPolicy,
    rounding: RoundingMode,
}

struct ComponentDef {
    id: String,
    name: String,
    weight_percent: Option<f64>,
}

fn load_section_config(
    conn: &Connection,
    section_id: &str,
) -> Result<Option<SectionConfig>, String> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT scheme_type, weight_policy, rounding_mode FROM sections WHERE id = ?",
            [section_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| e.to_string())?;

    let Some((scheme_raw, policy_raw, rounding_raw)) = row else {
        return Ok(None);
    };

    let scheme = SchemeType::parse(&scheme_raw)
        .ok_or_else(|| format!("section has unknown scheme_type: {scheme_raw}"))?;
    let policy = WeightPolicy::parse(&policy_raw)
        .ok_or_else(|| format!("section has unknown weight_policy: {policy_raw}"))?;
    let rounding = RoundingMode::parse(&rounding_raw)
        .ok_or_else(|| format!("section has unknown rounding_mode: {rounding_raw}"))?;

    Ok(Some(SectionConfig {
        scheme,
        policy,
        rounding,
    }))
}

fn load_transmutation_table(
    conn: &Connection,
    table_id: &str,
) -> Result<Option<TransmutationTable>, String> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM transmutation_tables WHERE id = ?",
            [table_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    if exists.is_none() {
        return Ok(None);
    }

    let mut stmt = conn
        .prepare(
            "SELECT initial_grade, transmuted_grade FROM transmutation_rows WHERE table_id = ?",
        )
        .map_err(|e| e.to_string())?;
    let rows: Vec<(i64, f64)> = stmt
        .query_map([table_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| e.to_string())?;

    Ok(Some(TransmutationTable::from_rows(rows)))
}

fn handle_compute_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let profile_id = match req.params.get("weightProfileId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing weightProfileId", None),
    };

    let config = match load_section_config(conn, &section_id) {
        Ok(Some(c)) => c,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "section not found",
                Some(json!({ "sectionId": section_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    };

    // Per-run overrides beat the section defaults.
    let policy = match req.params.get("weightPolicy").and_then(|v| v.as_str()) {
        Some(raw) => match WeightPolicy::parse(raw) {
            Some(p) => p,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "weightPolicy must be one of: strict, normalize",
                    Some(json!({ "weightPolicy": raw })),
                )
            }
        },
        None => config.policy,
    };
    let rounding = match req.params.get("roundingMode").and_then(|v| v.as_str()) {
        Some(raw) => match RoundingMode::parse(raw) {
            Some(m) => m,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "roundingMode must be one of: floor, round, ceil",
                    Some(json!({ "roundingMode": raw })),
                )
            }
        },
        None => config.rounding,
    };

    let profile_section: Option<String> = match conn
        .query_row(
            "SELECT section_id FROM weight_profiles WHERE id = ?",
            [&profile_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match profile_section {
        Some(s) if s == section_id => {}
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "weight profile belongs to another section",
                Some(json!({ "weightProfileId": profile_id })),
            )
        }
        None => {
            return err(
                &req.id,
                "not_found",
                "weight profile not found",
                Some(json!({ "weightProfileId": profile_id })),
            )
        }
    }

    // Cheap early validation: a transmuting scheme with no table must fail
    // before any per-student work happens.
    let table_id = req
        .params
        .get("transmutationTableId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let table: Option<TransmutationTable> = match &table_id {
        Some(id) => match load_transmutation_table(conn, id) {
            Ok(Some(t)) => Some(t),
            Ok(None) => {
                return err(
                    &req.id,
                    "not_found",
                    "transmutation table not found",
                    Some(json!({ "transmutationTableId": id })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e, None),
        },
        None => None,
    };
    if config.scheme.requires_transmutation() && table.is_none() {
        return err(
            &req.id,
            "transmutation_table_missing",
            format!(
                "scheme {} requires a transmutation table",
                config.scheme.as_str()
            ),
            Some(json!({ "schemeType": config.scheme.as_str() })),
        );
    }

    let mut weight_by_component: HashMap<String, f64> = HashMap::new();
    {
        let mut stmt = match conn.prepare(
            "SELECT component_id, weight_percent FROM component_weights WHERE weight_profile_id = ?",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&profile_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => {
                for (component_id, weight) in v {
                    weight_by_component.insert(component_id, weight);
                }
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let components: Vec<ComponentDef> = {
        let mut stmt = match conn.prepare(
            "SELECT id, name FROM gradebook_components WHERE section_id = ? ORDER BY sort_order",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&section_id], |r| {
                let id: String = r.get(0)?;
                let name: String = r.get(1)?;
                Ok((id, name))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => v
                .into_iter()
                .map(|(id, name)| {
                    let weight_percent = weight_by_component.get(&id).copied();
                    ComponentDef {
                        id,
                        name,
                        weight_percent,
                    }
                })
                .collect(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let mut component_by_item: HashMap<String, (String, f64)> = HashMap::new();
    {
        let mut stmt = match conn
            .prepare("SELECT id, component_id, max_points FROM graded_items WHERE section_id = ?")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&section_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => {
                for (item_id, component_id, max_points) in v {
                    component_by_item.insert(item_id, (component_id, max_points));
                }
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let students: Vec<(String, String)> = {
        let mut stmt = match conn.prepare(
            "SELECT id, last_name || ', ' || first_name
             FROM students
             WHERE section_id = ? AND active = 1
             ORDER BY sort_order",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&section_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    // student -> component -> scores
    let mut scores_by_student: HashMap<String, HashMap<String, Vec<GradedScore>>> = HashMap::new();
    let mut bad_status_students: HashMap<String, String> = HashMap::new();
    {
        let mut stmt = match conn.prepare(
            "SELECT s.graded_item_id, s.student_id, s.points, s.status
             FROM graded_scores s
             JOIN graded_items i ON i.id = s.graded_item_id
             WHERE i.section_id = ?",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&section_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        let rows = match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        for (item_id, student_id, points, status_raw) in rows {
            let Some((component_id, max_points)) = component_by_item.get(&item_id) else {
                continue;
            };
            let Some(status) = ScoreStatus::parse(&status_raw) else {
                // Caller-level data problem; skip this student, keep the batch.
                bad_status_students
                    .entry(student_id)
                    .or_insert_with(|| format!("score has unknown status: {status_raw}"));
                continue;
            };
            scores_by_student
                .entry(student_id)
                .or_default()
                .entry(component_id.clone())
                .or_default()
                .push(GradedScore {
                    points,
                    max_points: *max_points,
                    status,
                });
        }
    }

    let mut computed: Vec<engine::ComputedGrade> = Vec::with_capacity(students.len());
    let mut skipped: Vec<serde_json::Value> = Vec::new();

    for (student_id, display_name) in &students {
        if let Some(reason) = bad_status_students.get(student_id) {
            skipped.push(json!({
                "studentId": student_id,
                "displayName": display_name,
                "reason": reason,
            }));
            continue;
        }

        let empty: HashMap<String, Vec<GradedScore>> = HashMap::new();
        let per_component = scores_by_student.get(student_id).unwrap_or(&empty);
        let inputs: Vec<ComponentInput> = components
            .iter()
            .map(|c| ComponentInput {
                component_id: c.id.clone(),
                name: c.name.clone(),
                weight_percent: c.weight_percent,
                scores: per_component.get(&c.id).cloned().unwrap_or_default(),
            })
            .collect();

        // Engine failures are configuration gaps that will recur across the
        // batch; abort the whole run and persist nothing.
        match engine::compute_student_grade(
            student_id,
            &inputs,
            config.scheme,
            policy,
            rounding,
            table.as_ref(),
        ) {
            Ok(grade) => computed.push(grade),
            Err(e) => {
                return err(
                    &req.id,
                    e.code(),
                    e.to_string(),
                    Some(json!({
                        "studentId": student_id,
                        "displayName": display_name,
                    })),
                )
            }
        }
    }

    let run_id = Uuid::new_v4().to_string();
    let computed_at = Utc::now().to_rfc3339();

    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM computed_grades WHERE section_id = ?",
        [&section_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    for grade in &computed {
        let breakdown = match serde_json::to_string(&grade.breakdown) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "internal", e.to_string(), None),
        };
        if let Err(e) = tx.execute(
            "INSERT INTO computed_grades(
                id, section_id, student_id, run_id, weight_profile_id,
                initial_grade, final_numeric_grade, transmuted_grade, breakdown, computed_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &section_id,
                &grade.student_id,
                &run_id,
                &profile_id,
                grade.initial_grade,
                grade.final_numeric_grade,
                grade.transmuted_grade,
                &breakdown,
                &computed_at,
            ),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "computed_grades" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    let grades: Vec<serde_json::Value> = computed
        .iter()
        .map(|g| {
            json!({
                "studentId": g.student_id,
                "initialGrade": g.initial_grade,
                "finalNumericGrade": g.final_numeric_grade,
                "transmutedGrade": g.transmuted_grade,
                "breakdown": g.breakdown,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "runId": run_id,
            "computedAt": computed_at,
            "weightPolicy": policy.as_str(),
            "roundingMode": rounding.as_str(),
            "computed": grades.len(),
            "skipped": skipped,
            "grades": grades,
        }),
    )
}

fn handle_compute_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           g.student_id,
           st.last_name || ', ' || st.first_name,
           g.run_id,
           g.initial_grade,
           g.final_numeric_grade,
           g.transmuted_grade,
           g.breakdown,
           g.computed_at
         FROM computed_grades g
         JOIN students st ON st.id = g.student_id
         WHERE g.section_id = ?
         ORDER BY st.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([&section_id], |r| {
        let breakdown_raw: String = r.get(6)?;
        let breakdown: serde_json::Value =
            serde_json::from_str(&breakdown_raw).unwrap_or(serde_json::Value::Null);
        Ok(json!({
            "studentId": r.get::<_, String>(0)?,
            "displayName": r.get::<_, String>(1)?,
            "runId": r.get::<_, String>(2)?,
            "initialGrade": r.get::<_, f64>(3)?,
            "finalNumericGrade": r.get::<_, f64>(4)?,
            "transmutedGrade": r.get::<_, Option<f64>>(5)?,
            "breakdown": breakdown,
            "computedAt": r.get::<_, String>(7)?,
        }))
    });

    match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "compute.run" => Some(handle_compute_run(state, req)),
        "compute.results" => Some(handle_compute_results(state, req)),
        _ => None,
    }
}
