use crate::enroll::{GradingFormat, SubjectKind};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn institucion_exists(conn: &Connection, institucion_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM instituciones WHERE id = ?",
        [institucion_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

fn handle_institutions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let nombre = match req.params.get("nombre").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing nombre", None),
    };
    if nombre.is_empty() {
        return err(&req.id, "bad_params", "nombre must not be empty", None);
    }
    let formato_raw = match req.params.get("formato").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing formato", None),
    };
    let Some(formato) = GradingFormat::parse(&formato_raw) else {
        return err(
            &req.id,
            "bad_params",
            "formato must be SECUNDARIA_DO or POLITECNICO_DO",
            None,
        );
    };

    let institucion_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO instituciones(id, nombre, formato) VALUES(?, ?, ?)",
        (&institucion_id, &nombre, formato.as_str()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "instituciones" })),
        );
    }

    ok(
        &req.id,
        json!({ "institucionId": institucion_id, "nombre": nombre, "formato": formato.as_str() }),
    )
}

fn handle_institutions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "instituciones": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           i.id,
           i.nombre,
           i.formato,
           (SELECT COUNT(*) FROM niveles n WHERE n.institucion_id = i.id) AS nivel_count,
           (SELECT COUNT(*) FROM estudiantes e WHERE e.institucion_id = i.id) AS estudiante_count
         FROM instituciones i
         ORDER BY i.nombre",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let nombre: String = row.get(1)?;
            let formato: String = row.get(2)?;
            let nivel_count: i64 = row.get(3)?;
            let estudiante_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "nombre": nombre,
                "formato": formato,
                "nivelCount": nivel_count,
                "estudianteCount": estudiante_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(instituciones) => ok(&req.id, json!({ "instituciones": instituciones })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_levels_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };
    let nombre = match req.params.get("nombre").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing nombre", None),
    };
    if nombre.is_empty() {
        return err(&req.id, "bad_params", "nombre must not be empty", None);
    }

    match institucion_exists(conn, &institucion_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "institution not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let orden: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(orden), -1) + 1 FROM niveles WHERE institucion_id = ?",
        [&institucion_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let nivel_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO niveles(id, institucion_id, nombre, orden) VALUES(?, ?, ?, ?)",
        (&nivel_id, &institucion_id, &nombre, orden),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "niveles" })),
        );
    }

    ok(&req.id, json!({ "nivelId": nivel_id }))
}

fn handle_cycles_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };
    let nombre = match req.params.get("nombre").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing nombre", None),
    };
    if nombre.is_empty() {
        return err(&req.id, "bad_params", "nombre must not be empty", None);
    }

    match institucion_exists(conn, &institucion_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "institution not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let ciclo_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO ciclos_lectivos(id, institucion_id, nombre, activo) VALUES(?, ?, ?, 0)",
        (&ciclo_id, &institucion_id, &nombre),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "ciclos_lectivos" })),
        );
    }

    ok(&req.id, json!({ "cicloLectivoId": ciclo_id }))
}

fn handle_cycles_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };
    let ciclo_id = match req.params.get("cicloLectivoId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing cicloLectivoId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM ciclos_lectivos WHERE id = ? AND institucion_id = ?",
            (&ciclo_id, &institucion_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "academic cycle not found", None);
    }

    // Deactivate siblings first; the partial unique index allows only one
    // active cycle per institution.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "UPDATE ciclos_lectivos SET activo = 0 WHERE institucion_id = ?",
        [&institucion_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "ciclos_lectivos" })),
        );
    }
    if let Err(e) = tx.execute(
        "UPDATE ciclos_lectivos SET activo = 1 WHERE id = ?",
        [&ciclo_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "ciclos_lectivos" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };
    let nombre = match req.params.get("nombre").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing nombre", None),
    };
    if nombre.is_empty() {
        return err(&req.id, "bad_params", "nombre must not be empty", None);
    }
    let tipo = req
        .params
        .get("tipo")
        .and_then(|v| v.as_str())
        .unwrap_or("GENERAL")
        .to_string();
    if SubjectKind::parse(&tipo).is_none() {
        return err(&req.id, "bad_params", "tipo must be GENERAL or TECNICA", None);
    }

    match institucion_exists(conn, &institucion_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "institution not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let materia_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO materias(id, institucion_id, nombre, tipo) VALUES(?, ?, ?, ?)",
        (&materia_id, &institucion_id, &nombre, &tipo),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "materias" })),
        );
    }

    ok(&req.id, json!({ "materiaId": materia_id }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };
    let nivel_id = match req.params.get("nivelId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing nivelId", None),
    };
    let ciclo_id = match req.params.get("cicloLectivoId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing cicloLectivoId", None),
    };
    let materia_id = match req.params.get("materiaId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing materiaId", None),
    };

    // Every referenced row must live under the same institution. A match
    // elsewhere reads the same as no match at all.
    let checks: [(&str, &str, &str); 3] = [
        ("niveles", nivel_id.as_str(), "level not found"),
        ("ciclos_lectivos", ciclo_id.as_str(), "academic cycle not found"),
        ("materias", materia_id.as_str(), "subject not found"),
    ];
    for (table, id, msg) in checks {
        let sql = format!("SELECT 1 FROM {} WHERE id = ? AND institucion_id = ?", table);
        let found: Option<i64> = match conn
            .query_row(&sql, (id, &institucion_id), |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(&req.id, "not_found", msg, None);
        }
    }

    let clase_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO clases(id, institucion_id, nivel_id, ciclo_lectivo_id, materia_id)
         VALUES(?, ?, ?, ?, ?)",
        (&clase_id, &institucion_id, &nivel_id, &ciclo_id, &materia_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "clases" })),
        );
    }

    ok(&req.id, json!({ "claseId": clase_id }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institucion_id = match req.params.get("institucionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institucionId", None),
    };
    let nivel_id = req
        .params
        .get("nivelId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let (sql, params): (&str, Vec<&str>) = match nivel_id.as_deref() {
        Some(nid) => (
            "SELECT c.id, c.nivel_id, c.ciclo_lectivo_id, m.nombre, m.tipo
             FROM clases c
             JOIN materias m ON m.id = c.materia_id
             WHERE c.institucion_id = ? AND c.nivel_id = ?
             ORDER BY c.id",
            vec![institucion_id.as_str(), nid],
        ),
        None => (
            "SELECT c.id, c.nivel_id, c.ciclo_lectivo_id, m.nombre, m.tipo
             FROM clases c
             JOIN materias m ON m.id = c.materia_id
             WHERE c.institucion_id = ?
             ORDER BY c.id",
            vec![institucion_id.as_str()],
        ),
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            let id: String = row.get(0)?;
            let nivel: String = row.get(1)?;
            let ciclo: String = row.get(2)?;
            let materia_nombre: String = row.get(3)?;
            let tipo: String = row.get(4)?;
            Ok(json!({
                "id": id,
                "nivelId": nivel,
                "cicloLectivoId": ciclo,
                "materiaNombre": materia_nombre,
                "materiaTipo": tipo
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(clases) => ok(&req.id, json!({ "clases": clases })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "institutions.create" => Some(handle_institutions_create(state, req)),
        "institutions.list" => Some(handle_institutions_list(state, req)),
        "levels.create" => Some(handle_levels_create(state, req)),
        "cycles.create" => Some(handle_cycles_create(state, req)),
        "cycles.activate" => Some(handle_cycles_activate(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        _ => None,
    }
}
