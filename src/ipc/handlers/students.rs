use crate::db;
use crate::gradebook::{self, GradeOwner};
use crate::grading::same_class;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_bool, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_name = optional_str(&req.params, "className")?;
    let section = optional_str(&req.params, "section")?;
    let include_inactive = optional_bool(&req.params, "includeInactive")?.unwrap_or(true);

    let mut stmt = conn
        .prepare(
            "SELECT id, name, class_name, section, roll_no, active, sort_order, updated_at
             FROM students
             WHERE (?1 IS NULL OR lower(trim(class_name)) = lower(trim(?1)))
               AND (?2 IS NULL OR lower(trim(section)) = lower(trim(?2)))
               AND (?3 = 1 OR active = 1)
             ORDER BY class_name, sort_order, name",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let students = stmt
        .query_map(
            (class_name.as_deref(), section.as_deref(), include_inactive as i64),
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "className": r.get::<_, String>(2)?,
                    "section": r.get::<_, Option<String>>(3)?,
                    "rollNo": r.get::<_, Option<String>>(4)?,
                    "active": r.get::<_, i64>(5)? != 0,
                    "sortOrder": r.get::<_, i64>(6)?,
                    "updatedAt": r.get::<_, Option<String>>(7)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "students": students }))
}

fn handle_students_create(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let name = required_str(&req.params, "name")?;
    let class_name = required_str(&req.params, "className")?;
    let section = optional_str(&req.params, "section")?;
    let roll_no = optional_str(&req.params, "rollNo")?;
    let active = optional_bool(&req.params, "active")?.unwrap_or(true);

    // New students go to the end of their class.
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0)
             FROM students
             WHERE lower(trim(class_name)) = lower(trim(?))",
            [&class_name],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
           id, name, class_name, section, roll_no, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &name,
            &class_name,
            &section,
            &roll_no,
            active as i64,
            next_sort,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;

    tracing::debug!(student_id = %student_id, class = %class_name, "student created");
    Ok(json!({ "studentId": student_id }))
}

fn text_or_null(
    patch: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Value, HandlerErr> {
    let v = &patch[key];
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = v
        .as_str()
        .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be string or null", key)))?;
    let t = s.trim();
    Ok(if t.is_empty() {
        Value::Null
    } else {
        Value::Text(t.to_string())
    })
}

fn required_text(
    patch: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Value, HandlerErr> {
    let s = patch[key]
        .as_str()
        .map(str::trim)
        .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be a string", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(Value::Text(s.to_string()))
}

fn handle_students_update(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing/invalid patch"));
    };

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for key in patch.keys() {
        match key.as_str() {
            "name" => {
                set_parts.push("name = ?");
                bind_values.push(required_text(patch, key)?);
            }
            "className" => {
                let class_name = required_text(patch, key)?;
                if let Value::Text(ref c) = class_name {
                    let (current, _) = gradebook::load_student(conn, &student_id)?;
                    // Grades are only valid within the student's class.
                    if !same_class(c, &current.class_name) {
                        let graded =
                            gradebook::count_grades(conn, GradeOwner::Student(&student_id))?;
                        if graded > 0 {
                            return Err(HandlerErr::bad_params(
                                "student has recorded grades; clear them before changing class",
                            )
                            .with_details(json!({ "gradedCount": graded })));
                        }
                    }
                }
                set_parts.push("class_name = ?");
                bind_values.push(class_name);
            }
            "section" => {
                set_parts.push("section = ?");
                bind_values.push(text_or_null(patch, key)?);
            }
            "rollNo" => {
                set_parts.push("roll_no = ?");
                bind_values.push(text_or_null(patch, key)?);
            }
            "active" => {
                let b = patch[key]
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("patch.active must be boolean"))?;
                set_parts.push("active = ?");
                bind_values.push(Value::Integer(b as i64));
            }
            "sortOrder" => {
                let n = patch[key]
                    .as_i64()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| {
                        HandlerErr::bad_params("patch.sortOrder must be a non-negative integer")
                    })?;
                set_parts.push("sort_order = ?");
                bind_values.push(Value::Integer(n));
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown student field: {}", other)));
            }
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must not be empty"));
    }

    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(db::now_rfc3339()));
    bind_values.push(Value::Text(student_id));

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    Ok(json!({ "ok": true }))
}

fn handle_students_delete(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Explicit dependency order (no ON DELETE CASCADE).
    let removed_grades = tx
        .execute("DELETE FROM grades WHERE student_id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "grades" }))
        })?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "students" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::debug!(student_id = %student_id, removed_grades, "student deleted");
    Ok(json!({ "ok": true, "removedGrades": removed_grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "students.list" => handle_students_list(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
