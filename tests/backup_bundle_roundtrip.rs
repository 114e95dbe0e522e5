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
    let exe = env!("CARGO_BIN_EXE_simsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn simsd");
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

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn class_summary(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
) -> serde_json::Value {
    request_ok(stdin, reader, id, "results.class", json!({ "className": "4" }))
        .get("rollup")
        .cloned()
        .expect("rollup")
}

#[test]
fn workspace_bundle_round_trip_preserves_results() {
    let source = temp_dir("simsd-backup-source");
    let bundle = temp_dir("simsd-backup-out").join("sims-backup.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": source.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "grading", "patch": { "preset": "threeBand" } }),
    );
    let exam_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exams.create",
        json!({ "subject": "Geography", "className": "4", "maxMarks": 40, "passingMarks": 16 }),
    )
    .get("examId")
    .and_then(|v| v.as_str())
    .expect("examId")
    .to_string();
    for (i, (name, marks)) in [("Uma", 36), ("Vik", 22), ("Wen", 8)].iter().enumerate() {
        let sid = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "name": name, "className": "4" }),
        )
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.upsert",
            json!({ "studentId": sid, "examId": exam_id, "marks": marks }),
        );
    }
    let before = class_summary(&mut stdin, &mut reader, "4");

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("sims-workspace-v1")
    );
    assert_eq!(
        exported
            .get("dbSha256")
            .and_then(|v| v.as_str())
            .map(|s| s.len()),
        Some(64)
    );
    assert!(bundle.is_file());
    drop(stdin);
    let _ = child.wait();

    let target = temp_dir("simsd-backup-target");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": target.to_string_lossy() }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        imported.get("bundleFormatDetected").and_then(|v| v.as_str()),
        Some("sims-workspace-v1")
    );

    let after = class_summary(&mut stdin, &mut reader, "3");
    assert_eq!(after, before);
    assert_eq!(after.pointer("/counts/Good").and_then(|v| v.as_u64()), Some(1));
    let setup = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert!(setup.pointer("/grading/excellent").map(|v| v.is_null()).unwrap_or(false));

    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "5",
            "backup.importWorkspaceBundle",
            json!({ "inPath": target.join("missing.zip").to_string_lossy() }),
        ),
        "not_found"
    );

    // A file that is neither a bundle nor a database leaves the workspace intact.
    let notes = target.join("notes.txt");
    std::fs::write(&notes, "hello, this is not a database").expect("write notes");
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "6",
            "backup.importWorkspaceBundle",
            json!({ "inPath": notes.to_string_lossy() }),
        ),
        "backup_failed"
    );
    let still = class_summary(&mut stdin, &mut reader, "7");
    assert_eq!(still, before);

    drop(stdin);
    let _ = child.wait();
}
