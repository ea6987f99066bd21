use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };
    let nombres = match req.params.get("nombres").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing nombres", None),
    };
    let apellidos = match req.params.get("apellidos").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing apellidos", None),
    };
    if nombres.is_empty() || apellidos.is_empty() {
        return err(&req.id, "bad_params", "nombres/apellidos must not be empty", None);
    }
    let rol = req
        .params
        .get("rol")
        .and_then(|v| v.as_str())
        .unwrap_or("estudiante")
        .to_string();

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM instituciones WHERE id = ?",
            [&institucion_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "institution not found", None);
    }

    let estudiante_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO estudiantes(id, institucion_id, nombres, apellidos, rol, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&estudiante_id, &institucion_id, &nombres, &apellidos, &rol, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "estudiantes" })),
        );
    }

    ok(&req.id, json!({ "estudianteId": estudiante_id }))
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };
    let estudiante_id = match req.params.get("estudianteId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing estudianteId", None),
    };

    let row: Option<(String, String, String, Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT nombres, apellidos, rol, nivel_actual_id, updated_at
             FROM estudiantes WHERE id = ? AND institucion_id = ?",
            (&estudiante_id, &institucion_id),
            |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((nombres, apellidos, rol, nivel_actual_id, updated_at)) = row else {
        return err(&req.id, "not_found", "student not found", None);
    };

    ok(
        &req.id,
        json!({
            "estudiante": {
                "id": estudiante_id,
                "nombres": nombres,
                "apellidos": apellidos,
                "rol": rol,
                "nivelActualId": nivel_actual_id,
                "updatedAt": updated_at
            }
        }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, nombres, apellidos, rol, nivel_actual_id
         FROM estudiantes
         WHERE institucion_id = ?
         ORDER BY apellidos, nombres",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&institucion_id], |row| {
            let id: String = row.get(0)?;
            let nombres: String = row.get(1)?;
            let apellidos: String = row.get(2)?;
            let rol: String = row.get(3)?;
            let nivel_actual_id: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "nombres": nombres,
                "apellidos": apellidos,
                "rol": rol,
                "nivelActualId": nivel_actual_id
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(estudiantes) => ok(&req.id, json!({ "estudiantes": estudiantes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        _ => None,
    }
}
