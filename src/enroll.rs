use chrono::Utc;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Fundamental competencies tracked per class (CF1..CF5), every format.
pub const COMPETENCIAS_FUNDAMENTALES: usize = 5;
/// Learning outcomes tracked per technical class (RA1..RA10).
pub const RESULTADOS_APRENDIZAJE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradingFormat {
    SecundariaDo,
    PolitecnicoDo,
}

impl GradingFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SECUNDARIA_DO" => Some(GradingFormat::SecundariaDo),
            "POLITECNICO_DO" => Some(GradingFormat::PolitecnicoDo),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GradingFormat::SecundariaDo => "SECUNDARIA_DO",
            GradingFormat::PolitecnicoDo => "POLITECNICO_DO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    General,
    Tecnica,
}

impl SubjectKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GENERAL" => Some(SubjectKind::General),
            "TECNICA" => Some(SubjectKind::Tecnica),
            _ => None,
        }
    }
}

/// Grade-skeleton layout for an institution. A new grading format gets a
/// new variant here, not another boolean in the write loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkeletonStrategy {
    Standard,
    TechnicalTrack,
}

impl SkeletonStrategy {
    pub fn for_format(formato: GradingFormat) -> Self {
        match formato {
            GradingFormat::SecundariaDo => SkeletonStrategy::Standard,
            GradingFormat::PolitecnicoDo => SkeletonStrategy::TechnicalTrack,
        }
    }

    /// RA row count for one class. Only the technical track carries
    /// learning outcomes, and only for technical subjects.
    pub fn resultado_rows(self, materia: SubjectKind) -> usize {
        match (self, materia) {
            (SkeletonStrategy::TechnicalTrack, SubjectKind::Tecnica) => RESULTADOS_APRENDIZAJE,
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub enum EnrollError {
    NotFound(&'static str),
    Validation(&'static str),
    Conflict(&'static str),
    Storage(rusqlite::Error),
}

impl fmt::Display for EnrollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollError::NotFound(m)
            | EnrollError::Validation(m)
            | EnrollError::Conflict(m) => f.write_str(m),
            EnrollError::Storage(e) => write!(f, "storage failure: {}", e),
        }
    }
}

impl std::error::Error for EnrollError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnrollError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for EnrollError {
    fn from(e: rusqlite::Error) -> Self {
        EnrollError::Storage(e)
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSummary {
    pub estudiante_id: String,
    pub nivel_id: String,
    pub clases_inscritas: i64,
    pub calificaciones_creadas: i64,
    pub competencias_creadas: i64,
    pub tecnicas_creadas: i64,
}

struct TargetClass {
    id: String,
    materia: SubjectKind,
}

/// Enrolls a student into every class of a level under the active cycle
/// and creates the full grade-tracking skeleton those enrollments need.
///
/// Everything — validation reads, duplicate check, all inserts, and the
/// student's level-pointer update — runs in one transaction. Any error
/// rolls the whole call back; no record from a failed call persists.
pub fn bootstrap_enrollment(
    conn: &Connection,
    estudiante_id: &str,
    nivel_id: &str,
    institucion_id: &str,
) -> Result<BootstrapSummary, EnrollError> {
    let tx = conn.unchecked_transaction()?;

    let formato_raw: Option<String> = tx
        .query_row(
            "SELECT formato FROM instituciones WHERE id = ?",
            [institucion_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(formato_raw) = formato_raw else {
        return Err(EnrollError::NotFound("Institution not found"));
    };
    let formato = GradingFormat::parse(&formato_raw)
        .ok_or(EnrollError::Validation("Unknown grading format"))?;

    // A level or student owned by another institution reads the same as an
    // absent one; existence never leaks across tenants.
    let nivel_ok: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM niveles WHERE id = ? AND institucion_id = ?",
            (nivel_id, institucion_id),
            |r| r.get(0),
        )
        .optional()?;
    if nivel_ok.is_none() {
        return Err(EnrollError::NotFound("Level not found"));
    }

    let estudiante_ok: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM estudiantes
             WHERE id = ? AND institucion_id = ? AND rol = 'estudiante'",
            (estudiante_id, institucion_id),
            |r| r.get(0),
        )
        .optional()?;
    if estudiante_ok.is_none() {
        return Err(EnrollError::NotFound("Student not found"));
    }

    let ciclo_id: Option<String> = tx
        .query_row(
            "SELECT id FROM ciclos_lectivos WHERE institucion_id = ? AND activo = 1",
            [institucion_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(ciclo_id) = ciclo_id else {
        return Err(EnrollError::Validation("No active academic cycle"));
    };

    let clases = target_classes(&tx, nivel_id, &ciclo_id, institucion_id)?;
    if clases.is_empty() {
        return Err(EnrollError::Validation(
            "No classes assigned to this level for the active cycle",
        ));
    }

    // Any active enrollment in the target set blocks the whole bootstrap;
    // there are no partial/merge semantics.
    if active_duplicates(&tx, estudiante_id, &clases)? > 0 {
        return Err(EnrollError::Conflict("Student already enrolled"));
    }

    let strategy = SkeletonStrategy::for_format(formato);
    let fecha = Utc::now().to_rfc3339();
    let mut competencias_creadas: i64 = 0;
    let mut tecnicas_creadas: i64 = 0;

    for clase in &clases {
        insert_inscripcion(&tx, estudiante_id, &clase.id, &fecha)?;
        let calificacion_id = insert_calificacion(&tx, estudiante_id, &clase.id, &ciclo_id)?;
        competencias_creadas += insert_competencias(&tx, &calificacion_id)? as i64;
        tecnicas_creadas +=
            insert_resultados(&tx, &calificacion_id, strategy.resultado_rows(clase.materia))?
                as i64;
    }

    // Pointer moves once, after every class is in.
    tx.execute(
        "UPDATE estudiantes SET nivel_actual_id = ?, updated_at = ? WHERE id = ?",
        (nivel_id, &fecha, estudiante_id),
    )?;

    tx.commit()?;

    let n = clases.len() as i64;
    Ok(BootstrapSummary {
        estudiante_id: estudiante_id.to_string(),
        nivel_id: nivel_id.to_string(),
        clases_inscritas: n,
        calificaciones_creadas: n,
        competencias_creadas,
        tecnicas_creadas,
    })
}

fn target_classes(
    tx: &Connection,
    nivel_id: &str,
    ciclo_id: &str,
    institucion_id: &str,
) -> Result<Vec<TargetClass>, EnrollError> {
    // The level-ownership gate already ran, but a class row written outside
    // the catalog handlers could still point a foreign institution at this
    // level; filter by tenant here too.
    let mut stmt = tx.prepare(
        "SELECT c.id, m.tipo
         FROM clases c
         JOIN materias m ON m.id = c.materia_id
         WHERE c.nivel_id = ? AND c.ciclo_lectivo_id = ? AND c.institucion_id = ?
         ORDER BY c.id",
    )?;
    let rows = stmt
        .query_map((nivel_id, ciclo_id, institucion_id), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, tipo) in rows {
        let materia =
            SubjectKind::parse(&tipo).ok_or(EnrollError::Validation("Unknown subject type"))?;
        out.push(TargetClass { id, materia });
    }
    Ok(out)
}

fn active_duplicates(
    tx: &Connection,
    estudiante_id: &str,
    clases: &[TargetClass],
) -> Result<i64, EnrollError> {
    let placeholders = vec!["?"; clases.len()].join(", ");
    let sql = format!(
        "SELECT COUNT(*) FROM inscripciones
         WHERE estudiante_id = ? AND activa = 1 AND clase_id IN ({})",
        placeholders
    );
    let mut params: Vec<&str> = Vec::with_capacity(clases.len() + 1);
    params.push(estudiante_id);
    params.extend(clases.iter().map(|c| c.id.as_str()));
    let n: i64 = tx.query_row(&sql, params_from_iter(params), |r| r.get(0))?;
    Ok(n)
}

fn insert_inscripcion(
    tx: &Connection,
    estudiante_id: &str,
    clase_id: &str,
    fecha: &str,
) -> Result<(), EnrollError> {
    let id = Uuid::new_v4().to_string();
    let res = tx.execute(
        "INSERT INTO inscripciones(id, estudiante_id, clase_id, activa, fecha_inscripcion)
         VALUES(?, ?, ?, 1, ?)",
        (&id, estudiante_id, clase_id, fecha),
    );
    match res {
        Ok(_) => Ok(()),
        // The partial unique index on active (estudiante_id, clase_id)
        // catches the race two concurrent bootstraps can produce after both
        // passed the application-level duplicate check.
        Err(e) if is_unique_violation(&e) => {
            Err(EnrollError::Conflict("Student already enrolled"))
        }
        Err(e) => Err(EnrollError::Storage(e)),
    }
}

fn insert_calificacion(
    tx: &Connection,
    estudiante_id: &str,
    clase_id: &str,
    ciclo_id: &str,
) -> Result<String, EnrollError> {
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO calificaciones(id, estudiante_id, clase_id, ciclo_lectivo_id)
         VALUES(?, ?, ?, ?)",
        (&id, estudiante_id, clase_id, ciclo_id),
    )?;
    Ok(id)
}

fn insert_competencias(tx: &Connection, calificacion_id: &str) -> Result<usize, EnrollError> {
    let mut stmt = tx.prepare(
        "INSERT INTO calificaciones_competencias(id, calificacion_id, competencia, orden)
         VALUES(?, ?, ?, ?)",
    )?;
    // Codes are positional; downstream aggregation keys on CF1..CF5.
    for i in 1..=COMPETENCIAS_FUNDAMENTALES {
        stmt.execute((
            Uuid::new_v4().to_string(),
            calificacion_id,
            format!("CF{}", i),
            i as i64,
        ))?;
    }
    Ok(COMPETENCIAS_FUNDAMENTALES)
}

fn insert_resultados(
    tx: &Connection,
    calificacion_id: &str,
    count: usize,
) -> Result<usize, EnrollError> {
    if count == 0 {
        return Ok(0);
    }
    let mut stmt = tx.prepare(
        "INSERT INTO calificaciones_tecnicas(id, calificacion_id, ra_codigo, orden, valor)
         VALUES(?, ?, ?, ?, NULL)",
    )?;
    for i in 1..=count {
        stmt.execute((
            Uuid::new_v4().to_string(),
            calificacion_id,
            format!("RA{}", i),
            i as i64,
        ))?;
    }
    Ok(count)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
