use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("sabana.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates the workspace schema. Idempotent; also applies additive
/// migrations so older workspaces keep opening.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instituciones(
            id TEXT PRIMARY KEY,
            nombre TEXT NOT NULL,
            formato TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS niveles(
            id TEXT PRIMARY KEY,
            institucion_id TEXT NOT NULL,
            nombre TEXT NOT NULL,
            orden INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(institucion_id) REFERENCES instituciones(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_niveles_institucion ON niveles(institucion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ciclos_lectivos(
            id TEXT PRIMARY KEY,
            institucion_id TEXT NOT NULL,
            nombre TEXT NOT NULL,
            activo INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(institucion_id) REFERENCES instituciones(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ciclos_institucion ON ciclos_lectivos(institucion_id)",
        [],
    )?;
    // At most one active cycle per institution.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_ciclos_activo
         ON ciclos_lectivos(institucion_id) WHERE activo = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS materias(
            id TEXT PRIMARY KEY,
            institucion_id TEXT NOT NULL,
            nombre TEXT NOT NULL,
            tipo TEXT NOT NULL DEFAULT 'GENERAL',
            FOREIGN KEY(institucion_id) REFERENCES instituciones(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_materias_institucion ON materias(institucion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS clases(
            id TEXT PRIMARY KEY,
            institucion_id TEXT NOT NULL,
            nivel_id TEXT NOT NULL,
            ciclo_lectivo_id TEXT NOT NULL,
            materia_id TEXT NOT NULL,
            FOREIGN KEY(institucion_id) REFERENCES instituciones(id),
            FOREIGN KEY(nivel_id) REFERENCES niveles(id),
            FOREIGN KEY(ciclo_lectivo_id) REFERENCES ciclos_lectivos(id),
            FOREIGN KEY(materia_id) REFERENCES materias(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clases_nivel_ciclo ON clases(nivel_id, ciclo_lectivo_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clases_institucion ON clases(institucion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS estudiantes(
            id TEXT PRIMARY KEY,
            institucion_id TEXT NOT NULL,
            nombres TEXT NOT NULL,
            apellidos TEXT NOT NULL,
            rol TEXT NOT NULL DEFAULT 'estudiante',
            nivel_actual_id TEXT,
            updated_at TEXT,
            FOREIGN KEY(institucion_id) REFERENCES instituciones(id),
            FOREIGN KEY(nivel_actual_id) REFERENCES niveles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_estudiantes_institucion ON estudiantes(institucion_id)",
        [],
    )?;

    // Existing workspaces may predate the level pointer. Add it if needed.
    ensure_estudiantes_nivel_actual(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS inscripciones(
            id TEXT PRIMARY KEY,
            estudiante_id TEXT NOT NULL,
            clase_id TEXT NOT NULL,
            activa INTEGER NOT NULL DEFAULT 1,
            fecha_inscripcion TEXT,
            FOREIGN KEY(estudiante_id) REFERENCES estudiantes(id),
            FOREIGN KEY(clase_id) REFERENCES clases(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_inscripciones_estudiante ON inscripciones(estudiante_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_inscripciones_clase ON inscripciones(clase_id)",
        [],
    )?;
    // Storage-level guard for the duplicate-enrollment invariant. The engine
    // checks before writing, but two concurrent bootstraps for the same
    // student can both pass that check; the second insert must fail here.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_inscripciones_activa_unica
         ON inscripciones(estudiante_id, clase_id) WHERE activa = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calificaciones(
            id TEXT PRIMARY KEY,
            estudiante_id TEXT NOT NULL,
            clase_id TEXT NOT NULL,
            ciclo_lectivo_id TEXT NOT NULL,
            p1 REAL, p2 REAL, p3 REAL, p4 REAL,
            rp1 REAL, rp2 REAL, rp3 REAL, rp4 REAL,
            promedio_final REAL,
            situacion TEXT,
            FOREIGN KEY(estudiante_id) REFERENCES estudiantes(id),
            FOREIGN KEY(clase_id) REFERENCES clases(id),
            FOREIGN KEY(ciclo_lectivo_id) REFERENCES ciclos_lectivos(id),
            UNIQUE(estudiante_id, clase_id, ciclo_lectivo_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calificaciones_estudiante_ciclo
         ON calificaciones(estudiante_id, ciclo_lectivo_id)",
        [],
    )?;
    ensure_calificaciones_situacion(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calificaciones_competencias(
            id TEXT PRIMARY KEY,
            calificacion_id TEXT NOT NULL,
            competencia TEXT NOT NULL,
            orden INTEGER NOT NULL,
            FOREIGN KEY(calificacion_id) REFERENCES calificaciones(id),
            UNIQUE(calificacion_id, competencia)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_competencias_calificacion
         ON calificaciones_competencias(calificacion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calificaciones_tecnicas(
            id TEXT PRIMARY KEY,
            calificacion_id TEXT NOT NULL,
            ra_codigo TEXT NOT NULL,
            orden INTEGER NOT NULL,
            valor REAL,
            FOREIGN KEY(calificacion_id) REFERENCES calificaciones(id),
            UNIQUE(calificacion_id, ra_codigo)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tecnicas_calificacion
         ON calificaciones_tecnicas(calificacion_id)",
        [],
    )?;

    Ok(())
}

fn ensure_estudiantes_nivel_actual(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "estudiantes", "nivel_actual_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE estudiantes ADD COLUMN nivel_actual_id TEXT", [])?;
    Ok(())
}

fn ensure_calificaciones_situacion(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "calificaciones", "situacion")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE calificaciones ADD COLUMN situacion TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
