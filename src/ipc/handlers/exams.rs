use crate::db;
use crate::gradebook::{self, GradeOwner};
use crate::grading::same_class;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_f64, optional_str, required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const EXAM_STATUSES: [&str; 4] = ["Scheduled", "Ongoing", "Completed", "Cancelled"];

fn canonical_status(raw: &str) -> Result<&'static str, HandlerErr> {
    EXAM_STATUSES
        .iter()
        .find(|s| s.eq_ignore_ascii_case(raw.trim()))
        .copied()
        .ok_or_else(|| {
            HandlerErr::bad_params(format!("status must be one of {}", EXAM_STATUSES.join(", ")))
        })
}

fn parse_exam_date(raw: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| HandlerErr::bad_params("examDate must be YYYY-MM-DD"))
}

fn check_marks(max_marks: f64, passing_marks: f64) -> Result<(), HandlerErr> {
    if max_marks <= 0.0 {
        return Err(HandlerErr::bad_params("maxMarks must be greater than 0"));
    }
    if passing_marks < 0.0 || passing_marks > max_marks {
        return Err(HandlerErr::bad_params("passingMarks must be within 0..=maxMarks"));
    }
    Ok(())
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_name = optional_str(&req.params, "className")?;
    let subject = optional_str(&req.params, "subject")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               e.id, e.title, e.subject, e.class_name, e.exam_date, e.max_marks,
               e.passing_marks, e.status, e.updated_at,
               (SELECT COUNT(*) FROM grades g WHERE g.exam_id = e.id) AS graded_count
             FROM exams e
             WHERE (?1 IS NULL OR lower(trim(e.class_name)) = lower(trim(?1)))
               AND (?2 IS NULL OR lower(trim(e.subject)) = lower(trim(?2)))
             ORDER BY e.exam_date IS NULL, e.exam_date, e.subject, e.title",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let exams = stmt
        .query_map((class_name.as_deref(), subject.as_deref()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "className": r.get::<_, String>(3)?,
                "examDate": r.get::<_, Option<String>>(4)?,
                "maxMarks": r.get::<_, f64>(5)?,
                "passingMarks": r.get::<_, f64>(6)?,
                "status": r.get::<_, String>(7)?,
                "updatedAt": r.get::<_, Option<String>>(8)?,
                "gradedCount": r.get::<_, i64>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "exams": exams }))
}

fn handle_exams_create(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let subject = required_str(&req.params, "subject")?;
    let class_name = required_str(&req.params, "className")?;
    let title = optional_str(&req.params, "title")?.unwrap_or_else(|| format!("{} exam", subject));
    let max_marks = required_f64(&req.params, "maxMarks")?;
    let passing_marks = optional_f64(&req.params, "passingMarks")?.unwrap_or(0.0);
    check_marks(max_marks, passing_marks)?;
    let status = match optional_str(&req.params, "status")? {
        Some(s) => canonical_status(&s)?,
        None => "Scheduled",
    };
    let exam_date = optional_str(&req.params, "examDate")?
        .map(|s| parse_exam_date(&s))
        .transpose()?;

    let exam_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exams(
           id, title, subject, class_name, exam_date, max_marks, passing_marks, status, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &title,
            &subject,
            &class_name,
            &exam_date,
            max_marks,
            passing_marks,
            status,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "exams" }))
    })?;

    tracing::debug!(exam_id = %exam_id, subject = %subject, class = %class_name, "exam created");
    Ok(json!({ "examId": exam_id }))
}

fn patch_text(v: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = v
        .as_str()
        .map(str::trim)
        .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be a string", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s.to_string())
}

fn patch_number(v: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    v.as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be a number", key)))
}

fn handle_exams_update(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing/invalid patch"));
    };
    let current = gradebook::load_exam(conn, &exam_id)?;

    let mut max_marks = current.max_marks;
    let mut passing_marks = current.passing_marks;
    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (key, v) in patch {
        match key.as_str() {
            "title" => {
                set_parts.push("title = ?");
                bind_values.push(Value::Text(patch_text(v, key)?));
            }
            "subject" => {
                set_parts.push("subject = ?");
                bind_values.push(Value::Text(patch_text(v, key)?));
            }
            "className" => {
                let class_name = patch_text(v, key)?;
                // Grades are only valid within the exam's class.
                if !same_class(&class_name, &current.class_name) {
                    let graded = gradebook::count_grades(conn, GradeOwner::Exam(&exam_id))?;
                    if graded > 0 {
                        return Err(HandlerErr::bad_params(
                            "exam has recorded grades; clear them before changing its class",
                        )
                        .with_details(json!({ "gradedCount": graded })));
                    }
                }
                set_parts.push("class_name = ?");
                bind_values.push(Value::Text(class_name));
            }
            "maxMarks" => {
                max_marks = patch_number(v, key)?;
                set_parts.push("max_marks = ?");
                bind_values.push(Value::Real(max_marks));
            }
            "passingMarks" => {
                passing_marks = patch_number(v, key)?;
                set_parts.push("passing_marks = ?");
                bind_values.push(Value::Real(passing_marks));
            }
            "status" => {
                let s = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("patch.status must be a string"))?;
                set_parts.push("status = ?");
                bind_values.push(Value::Text(canonical_status(s)?.to_string()));
            }
            "examDate" => {
                set_parts.push("exam_date = ?");
                if v.is_null() {
                    bind_values.push(Value::Null);
                } else {
                    let s = v
                        .as_str()
                        .ok_or_else(|| {
                            HandlerErr::bad_params("patch.examDate must be string or null")
                        })?;
                    bind_values.push(Value::Text(parse_exam_date(s)?));
                }
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown exam field: {}", other)));
            }
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must not be empty"));
    }
    check_marks(max_marks, passing_marks)?;

    // Recorded marks must stay within the exam maximum.
    let highest: Option<f64> = conn
        .query_row(
            "SELECT MAX(marks) FROM grades WHERE exam_id = ?",
            [&exam_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .flatten();
    if let Some(h) = highest.filter(|h| *h > max_marks) {
        return Err(HandlerErr::bad_params("maxMarks is below an already recorded grade")
            .with_details(json!({ "highestMarks": h })));
    }

    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(db::now_rfc3339()));
    bind_values.push(Value::Text(exam_id));
    let sql = format!("UPDATE exams SET {} WHERE id = ?", set_parts.join(", "));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn handle_exams_delete(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    gradebook::load_exam(conn, &exam_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed_grades = tx
        .execute("DELETE FROM grades WHERE exam_id = ?", [&exam_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "grades" }))
        })?;
    tx.execute("DELETE FROM exams WHERE id = ?", [&exam_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "exams" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::debug!(exam_id = %exam_id, removed_grades, "exam deleted");
    Ok(json!({ "ok": true, "removedGrades": removed_grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "exams.list" => handle_exams_list(state, req),
        "exams.create" => handle_exams_create(state, req),
        "exams.update" => handle_exams_update(state, req),
        "exams.delete" => handle_exams_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
