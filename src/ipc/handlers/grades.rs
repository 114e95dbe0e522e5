use crate::db;
use crate::gradebook;
use crate::grading::{round_off_1_decimal, ExamInput, StudentInput};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_str, required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const MAX_BULK_ENTRIES: usize = 5000;

fn check_grade(student: &StudentInput, exam: &ExamInput, marks: f64) -> Result<(), HandlerErr> {
    if !student
        .class_name
        .trim()
        .eq_ignore_ascii_case(exam.class_name.trim())
    {
        return Err(HandlerErr::bad_params("student is not in the exam's class").with_details(
            json!({ "studentClass": student.class_name, "examClass": exam.class_name }),
        ));
    }
    if !marks.is_finite() || marks < 0.0 || marks > exam.max_marks {
        return Err(HandlerErr::bad_params("marks must be within 0..=maxMarks")
            .with_details(json!({ "marks": marks, "maxMarks": exam.max_marks })));
    }
    Ok(())
}

fn write_grade(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
    marks: f64,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO grades(student_id, exam_id, marks, updated_at) VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id, exam_id) DO UPDATE SET
           marks = excluded.marks,
           updated_at = excluded.updated_at",
        (student_id, exam_id, marks, db::now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "grades" }))
    })?;
    Ok(())
}

fn handle_grades_list(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let exam_id = optional_str(&req.params, "examId")?;
    let student_id = optional_str(&req.params, "studentId")?;

    let mut stmt = conn
        .prepare(
            "SELECT g.student_id, s.name, g.exam_id, e.subject, e.title,
                    g.marks, e.max_marks, g.updated_at
             FROM grades g
             JOIN students s ON s.id = g.student_id
             JOIN exams e ON e.id = g.exam_id
             WHERE (?1 IS NULL OR g.exam_id = ?1)
               AND (?2 IS NULL OR g.student_id = ?2)
             ORDER BY s.class_name, s.sort_order, e.exam_date IS NULL, e.exam_date, e.subject",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let grades = stmt
        .query_map((exam_id.as_deref(), student_id.as_deref()), |r| {
            let marks: f64 = r.get(5)?;
            let max_marks: f64 = r.get(6)?;
            let percentage = if max_marks > 0.0 {
                round_off_1_decimal(100.0 * marks / max_marks)
            } else {
                0.0
            };
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "studentName": r.get::<_, String>(1)?,
                "examId": r.get::<_, String>(2)?,
                "subject": r.get::<_, String>(3)?,
                "examTitle": r.get::<_, String>(4)?,
                "marks": marks,
                "maxMarks": max_marks,
                "percentage": percentage,
                "updatedAt": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "grades": grades }))
}

fn handle_grades_upsert(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let exam_id = required_str(&req.params, "examId")?;
    let marks = required_f64(&req.params, "marks")?;

    let (student, _) = gradebook::load_student(conn, &student_id)?;
    let exam = gradebook::load_exam(conn, &exam_id)?;
    check_grade(&student, &exam, marks)?;
    write_grade(conn, &student_id, &exam_id, marks)?;
    Ok(json!({ "ok": true }))
}

fn handle_grades_bulk_upsert(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("entries must be an array"));
    };
    if entries.len() > MAX_BULK_ENTRIES {
        return Err(HandlerErr::bad_params(format!(
            "entries exceeds limit of {}",
            MAX_BULK_ENTRIES
        )));
    }
    let exam = gradebook::load_exam(conn, &exam_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut updated = 0_usize;
    let mut cleared = 0_usize;
    let mut rejected: Vec<serde_json::Value> = Vec::new();

    for (idx, entry) in entries.iter().enumerate() {
        let Some(student_id) = entry
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            rejected.push(json!({
                "index": idx,
                "code": "bad_params",
                "message": "missing studentId",
            }));
            continue;
        };
        let student = match gradebook::load_student(&tx, student_id) {
            Ok((s, _)) => s,
            Err(e) => {
                rejected.push(json!({
                    "index": idx,
                    "studentId": student_id,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };

        match entry.get("marks") {
            None => {
                rejected.push(json!({
                    "index": idx,
                    "studentId": student_id,
                    "code": "bad_params",
                    "message": "missing marks",
                }));
            }
            Some(v) if v.is_null() => {
                let n = tx
                    .execute(
                        "DELETE FROM grades WHERE student_id = ? AND exam_id = ?",
                        (student_id, &exam_id),
                    )
                    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
                cleared += n;
            }
            Some(v) => {
                let Some(marks) = v.as_f64() else {
                    rejected.push(json!({
                        "index": idx,
                        "studentId": student_id,
                        "code": "bad_params",
                        "message": "marks must be a number or null",
                    }));
                    continue;
                };
                if let Err(e) = check_grade(&student, &exam, marks) {
                    rejected.push(json!({
                        "index": idx,
                        "studentId": student_id,
                        "code": e.code,
                        "message": e.message,
                    }));
                    continue;
                }
                write_grade(&tx, student_id, &exam_id, marks)?;
                updated += 1;
            }
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    if !rejected.is_empty() {
        tracing::warn!(
            exam_id = %exam_id,
            rejected = rejected.len(),
            "bulk grade entries rejected"
        );
    }
    Ok(json!({
        "updated": updated,
        "cleared": cleared,
        "rejected": rejected,
    }))
}

fn handle_grades_delete(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let exam_id = required_str(&req.params, "examId")?;
    let n = conn
        .execute(
            "DELETE FROM grades WHERE student_id = ? AND exam_id = ?",
            (&student_id, &exam_id),
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if n == 0 {
        return Err(HandlerErr::new("not_found", "grade not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "grades.list" => handle_grades_list(state, req),
        "grades.upsert" => handle_grades_upsert(state, req),
        "grades.bulkUpsert" => handle_grades_bulk_upsert(state, req),
        "grades.delete" => handle_grades_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
