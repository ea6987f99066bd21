use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_sabanad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn sabanad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn dispatched(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("sabana-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = dispatched(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = dispatched(
        &mut stdin,
        &mut reader,
        "3",
        "institutions.create",
        json!({ "nombre": "Centro Smoke", "formato": "SECUNDARIA_DO" }),
    );
    let institucion_id = created
        .get("result")
        .and_then(|v| v.get("institucionId"))
        .and_then(|v| v.as_str())
        .expect("institucionId")
        .to_string();

    let _ = dispatched(&mut stdin, &mut reader, "4", "institutions.list", json!({}));
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "5",
        "levels.create",
        json!({ "institucionId": institucion_id, "nombre": "1ro" }),
    );
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "6",
        "cycles.create",
        json!({ "institucionId": institucion_id, "nombre": "2025-2026" }),
    );
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({ "institucionId": institucion_id, "nombre": "Matemática" }),
    );
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "8",
        "classes.list",
        json!({ "institucionId": institucion_id }),
    );
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({
            "institucionId": institucion_id,
            "nombres": "Smoke",
            "apellidos": "Student"
        }),
    );
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "10",
        "students.list",
        json!({ "institucionId": institucion_id }),
    );
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "11",
        "enrollment.bootstrap",
        json!({
            "estudianteId": "missing",
            "nivelId": "missing",
            "institucionId": institucion_id
        }),
    );
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "12",
        "enrollment.list",
        json!({ "estudianteId": "missing", "institucionId": institucion_id }),
    );
    let _ = dispatched(
        &mut stdin,
        &mut reader,
        "13",
        "grades.list",
        json!({
            "estudianteId": "missing",
            "cicloLectivoId": "missing",
            "institucionId": institucion_id
        }),
    );

    let unknown = request(&mut stdin, &mut reader, "14", "no.such.method", json!({}));
    assert_eq!(unknown.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        unknown
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
