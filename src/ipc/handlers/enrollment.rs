use crate::enroll::{self, EnrollError};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_bootstrap(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let estudiante_id = match req.params.get("estudianteId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing estudianteId", None),
    };
    let nivel_id = match req.params.get("nivelId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing nivelId", None),
    };
    // In the deployed platform this comes from the tenant resolver, never
    // from ambient state; over IPC it is an explicit param.
    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };

    match enroll::bootstrap_enrollment(conn, &estudiante_id, &nivel_id, &institucion_id) {
        Ok(summary) => match serde_json::to_value(&summary) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(EnrollError::NotFound(m)) => err(&req.id, "not_found", m, None),
        Err(EnrollError::Validation(m)) => err(&req.id, "validation_failed", m, None),
        Err(EnrollError::Conflict(m)) => err(&req.id, "conflict", m, None),
        Err(EnrollError::Storage(e)) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_enrollment_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let estudiante_id = match req.params.get("estudianteId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing estudianteId", None),
    };
    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };

    // Scoped through estudiantes so one tenant cannot read another's rows.
    let mut stmt = match conn.prepare(
        "SELECT i.id, i.clase_id, i.activa, i.fecha_inscripcion
         FROM inscripciones i
         JOIN estudiantes e ON e.id = i.estudiante_id
         WHERE i.estudiante_id = ? AND e.institucion_id = ?
         ORDER BY i.clase_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&estudiante_id, &institucion_id), |row| {
            let id: String = row.get(0)?;
            let clase_id: String = row.get(1)?;
            let activa: i64 = row.get(2)?;
            let fecha: Option<String> = row.get(3)?;
            Ok(json!({
                "id": id,
                "claseId": clase_id,
                "activa": activa != 0,
                "fechaInscripcion": fecha
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(inscripciones) => ok(&req.id, json!({ "inscripciones": inscripciones })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// The skeleton read the report-card layer consumes: per class, the grade
/// row with its competency codes and technical-outcome rows in stored order.
fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let estudiante_id = match req.params.get("estudianteId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing estudianteId", None),
    };
    let ciclo_id = match req.params.get("cicloLectivoId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing cicloLectivoId", None),
    };
    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };

    let base: Result<Vec<(String, String, Option<f64>, Option<String>)>, rusqlite::Error> = conn
        .prepare(
            "SELECT ca.id, ca.clase_id, ca.promedio_final, ca.situacion
             FROM calificaciones ca
             JOIN estudiantes e ON e.id = ca.estudiante_id
             WHERE ca.estudiante_id = ? AND ca.ciclo_lectivo_id = ? AND e.institucion_id = ?
             ORDER BY ca.clase_id",
        )
        .and_then(|mut stmt| {
            stmt.query_map((&estudiante_id, &ciclo_id, &institucion_id), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .and_then(|it| it.collect())
        });
    let base = match base {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut calificaciones = Vec::with_capacity(base.len());
    for (calificacion_id, clase_id, promedio_final, situacion) in base {
        let competencias: Result<Vec<String>, rusqlite::Error> = conn
            .prepare(
                "SELECT competencia FROM calificaciones_competencias
                 WHERE calificacion_id = ? ORDER BY orden",
            )
            .and_then(|mut stmt| {
                stmt.query_map([&calificacion_id], |row| row.get(0))
                    .and_then(|it| it.collect())
            });
        let competencias = match competencias {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let tecnicas: Result<Vec<serde_json::Value>, rusqlite::Error> = conn
            .prepare(
                "SELECT ra_codigo, valor FROM calificaciones_tecnicas
                 WHERE calificacion_id = ? ORDER BY orden",
            )
            .and_then(|mut stmt| {
                stmt.query_map([&calificacion_id], |row| {
                    let ra: String = row.get(0)?;
                    let valor: Option<f64> = row.get(1)?;
                    Ok(json!({ "raCodigo": ra, "valor": valor }))
                })
                .and_then(|it| it.collect())
            });
        let tecnicas = match tecnicas {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        calificaciones.push(json!({
            "id": calificacion_id,
            "claseId": clase_id,
            "promedioFinal": promedio_final,
            "situacion": situacion,
            "competencias": competencias,
            "tecnicas": tecnicas
        }));
    }

    ok(&req.id, json!({ "calificaciones": calificaciones }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollment.bootstrap" => Some(handle_bootstrap(state, req)),
        "enrollment.list" => Some(handle_enrollment_list(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        _ => None,
    }
}
