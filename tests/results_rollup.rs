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

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    class_name: &str,
    section: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "name": name, "className": class_name, "section": section }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string()
}

fn create_exam(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    subject: &str,
    class_name: &str,
    max_marks: f64,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "exams.create",
        json!({
            "subject": subject,
            "className": class_name,
            "maxMarks": max_marks,
            "passingMarks": max_marks * 0.4,
            "status": "completed",
            "examDate": "2026-03-14"
        }),
    )
    .get("examId")
    .and_then(|v| v.as_str())
    .expect("examId")
    .to_string()
}

fn count(rollup: &serde_json::Value, category: &str) -> i64 {
    rollup
        .get("counts")
        .and_then(|c| c.get(category))
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| panic!("missing count for {}: {}", category, rollup))
}

fn f(v: &serde_json::Value, pointer: &str) -> f64 {
    v.pointer(pointer)
        .and_then(|x| x.as_f64())
        .unwrap_or_else(|| panic!("missing number at {} in {}", pointer, v))
}

#[test]
fn class_rollup_counts_and_averages() {
    let workspace = temp_dir("simsd-results-rollup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "grading", "patch": { "preset": "threeBand" } }),
    );

    let a = create_student(&mut stdin, &mut reader, "3", "Asha", "7", "A");
    let b = create_student(&mut stdin, &mut reader, "4", "Ben", "7", "A");
    let c = create_student(&mut stdin, &mut reader, "5", "Chen", "7", "B");
    let _d = create_student(&mut stdin, &mut reader, "6", "Dara", "7", "B");
    let math = create_exam(&mut stdin, &mut reader, "7", "Math", "7", 100.0);

    for (i, (sid, marks)) in [(&a, 90.0), (&b, 60.0), (&c, 30.0)].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.upsert",
            json!({ "studentId": sid, "examId": math, "marks": marks }),
        );
    }

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.class",
        json!({ "className": "7" }),
    );
    let rollup = class.get("rollup").expect("rollup");
    assert_eq!(count(rollup, "Good"), 1);
    assert_eq!(count(rollup, "Average"), 1);
    assert_eq!(count(rollup, "Poor"), 1);
    assert_eq!(count(rollup, "Excellent"), 0);
    assert_eq!(rollup.get("considered").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(rollup.get("noAttempts").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(rollup.get("totalStudents").and_then(|v| v.as_i64()), Some(4));
    assert_eq!(f(rollup, "/groupAverage"), 60.0);
    assert_eq!(
        rollup.pointer("/top/0/studentId").and_then(|v| v.as_str()),
        Some(a.as_str())
    );
    assert_eq!(
        class.get("rows").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(4)
    );
    assert_eq!(
        class.pointer("/scale/categories").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(3)
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.student",
        json!({ "studentId": a }),
    );
    assert_eq!(f(&student, "/result/percentage"), 90.0);
    assert_eq!(
        student.pointer("/result/category").and_then(|v| v.as_str()),
        Some("Good")
    );
    assert_eq!(
        student.pointer("/result/subjects/0/subject").and_then(|v| v.as_str()),
        Some("Math")
    );

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "results.student",
        json!({ "studentId": a, "filters": { "subject": "Science" } }),
    );
    assert_eq!(f(&filtered, "/result/percentage"), 0.0);
    assert_eq!(
        filtered.pointer("/result/attempted").and_then(|v| v.as_i64()),
        Some(0)
    );

    let by_section = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "results.rollup",
        json!({ "groupBy": "section", "className": "7" }),
    );
    let groups = by_section
        .get("groups")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("groups");
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].get("key").and_then(|v| v.as_str()), Some("7 / A"));
    let sec_a = groups[0].get("rollup").expect("rollup A");
    assert_eq!(count(sec_a, "Good"), 1);
    assert_eq!(count(sec_a, "Average"), 1);
    let sec_b = groups[1].get("rollup").expect("rollup B");
    assert_eq!(count(sec_b, "Poor"), 1);
    assert_eq!(sec_b.get("noAttempts").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        by_section.pointer("/categoryTotals/Good").and_then(|v| v.as_i64()),
        Some(1)
    );

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "reports.reportCardModel",
        json!({ "studentId": c }),
    );
    assert_eq!(
        card.get("exams").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(1)
    );
    assert_eq!(card.pointer("/exams/0/passed").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        card.pointer("/overall/category").and_then(|v| v.as_str()),
        Some("Poor")
    );
    assert_eq!(
        card.pointer("/student/section").and_then(|v| v.as_str()),
        Some("B")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn group_average_is_percentage_of_sums_across_exams() {
    let workspace = temp_dir("simsd-results-sums");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let s1 = create_student(&mut stdin, &mut reader, "2", "Ife", "8", "A");
    let s2 = create_student(&mut stdin, &mut reader, "3", "Jon", "8", "A");
    let small = create_exam(&mut stdin, &mut reader, "4", "Quiz", "8", 10.0);
    let big = create_exam(&mut stdin, &mut reader, "5", "Final", "8", 90.0);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.upsert",
        json!({ "studentId": s1, "examId": small, "marks": 10 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.upsert",
        json!({ "studentId": s2, "examId": big, "marks": 0 }),
    );

    let school = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.rollup",
        json!({ "groupBy": "school" }),
    );
    let groups = school
        .get("groups")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].get("key").and_then(|v| v.as_str()), Some("School"));
    // 10 / 100, not mean(100%, 0%).
    assert_eq!(f(&groups[0], "/rollup/groupAverage"), 10.0);
    assert_eq!(f(&groups[0], "/rollup/passRate"), 50.0);

    drop(stdin);
    let _ = child.wait();
}
