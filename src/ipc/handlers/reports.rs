use crate::gradebook::{self, GradebookScope};
use crate::grading::{self, round_off_1_decimal};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::results::{load_config, scale_json};
use crate::ipc::helpers::{db_conn, parse_filters, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_report_card_model(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let (student, active) = gradebook::load_student(conn, &student_id)?;
    let roll_no: Option<String> = conn
        .query_row("SELECT roll_no FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .flatten();
    let (config, _) = load_config(conn)?;
    let filters = parse_filters(conn, &req.params)?;
    let book = gradebook::load_gradebook(
        conn,
        GradebookScope {
            class_name: Some(student.class_name.as_str()),
            include_inactive: true,
        },
    )?;

    let exam_rows: Vec<serde_json::Value> = grading::relevant_exams(&student, &book.exams, &filters)
        .into_iter()
        .map(|exam| {
            let marks = book.grades.get(&student.id, &exam.id);
            json!({
                "examId": exam.id,
                "title": exam.title,
                "subject": exam.subject,
                "examDate": exam.exam_date,
                "status": exam.status,
                "marks": marks,
                "maxMarks": exam.max_marks,
                "passingMarks": exam.passing_marks,
                "percentage": marks.map(|m| round_off_1_decimal(100.0 * m / exam.max_marks)),
                "passed": marks.map(|m| m >= exam.passing_marks),
            })
        })
        .collect();

    let overall = grading::aggregate_student(
        &student,
        &book.exams,
        &book.grades,
        &filters,
        &config,
    )?;

    Ok(json!({
        "student": {
            "id": student.id,
            "name": student.name,
            "className": student.class_name,
            "section": student.section,
            "rollNo": roll_no,
            "active": active,
        },
        "filters": filters,
        "scale": scale_json(&config),
        "exams": exam_rows,
        "subjects": overall.subjects,
        "overall": {
            "attempted": overall.attempted,
            "missing": overall.missing,
            "passed": overall.passed,
            "failed": overall.failed,
            "totalObtained": overall.total_obtained,
            "totalMax": overall.total_max,
            "percentage": overall.percentage,
            "category": overall.category,
        },
        "generatedAt": chrono::Utc::now().to_rfc3339(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.reportCardModel" => Some(respond(&req.id, handle_report_card_model(state, req))),
        _ => None,
    }
}
