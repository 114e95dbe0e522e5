use crate::grading::{ExamInput, GradeIndex, GradingError, StudentInput};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct GradebookError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GradebookError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl From<GradingError> for GradebookError {
    fn from(e: GradingError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// Everything the grading engine needs for one scope, loaded in one pass.
#[derive(Debug, Clone, Default)]
pub struct Gradebook {
    pub students: Vec<StudentInput>,
    pub exams: Vec<ExamInput>,
    pub grades: GradeIndex,
}

#[derive(Debug, Clone, Copy)]
pub struct GradebookScope<'a> {
    /// `None` loads the whole school.
    pub class_name: Option<&'a str>,
    pub include_inactive: bool,
}

const CLASS_MATCH: &str = "(?1 IS NULL OR lower(trim(class_name)) = lower(trim(?1)))";

pub fn load_gradebook(
    conn: &Connection,
    scope: GradebookScope<'_>,
) -> Result<Gradebook, GradebookError> {
    let students_sql = format!(
        "SELECT id, name, class_name, section, sort_order
         FROM students
         WHERE {} AND (?2 = 1 OR active = 1)
         ORDER BY class_name, sort_order, name",
        CLASS_MATCH
    );
    let mut stmt = conn.prepare(&students_sql).map_err(GradebookError::db)?;
    let students: Vec<StudentInput> = stmt
        .query_map((scope.class_name, scope.include_inactive as i64), |r| {
            Ok(StudentInput {
                id: r.get(0)?,
                name: r.get(1)?,
                class_name: r.get(2)?,
                section: r.get(3)?,
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradebookError::db)?;

    let exams_sql = format!(
        "SELECT id, title, subject, class_name, exam_date, max_marks, passing_marks, status
         FROM exams
         WHERE {}
         ORDER BY exam_date IS NULL, exam_date, subject, title",
        CLASS_MATCH
    );
    let mut stmt = conn.prepare(&exams_sql).map_err(GradebookError::db)?;
    let exams: Vec<ExamInput> = stmt
        .query_map([scope.class_name], exam_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradebookError::db)?;

    let mut grades = GradeIndex::default();
    let mut stmt = conn
        .prepare(
            "SELECT g.student_id, g.exam_id, g.marks
             FROM grades g
             JOIN students s ON s.id = g.student_id
             WHERE (?1 IS NULL OR lower(trim(s.class_name)) = lower(trim(?1)))",
        )
        .map_err(GradebookError::db)?;
    let rows = stmt
        .query_map([scope.class_name], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .map_err(GradebookError::db)?;
    for row in rows {
        let (student_id, exam_id, marks) = row.map_err(GradebookError::db)?;
        grades.insert(&student_id, &exam_id, marks);
    }

    tracing::debug!(
        class = scope.class_name.unwrap_or("*"),
        students = students.len(),
        exams = exams.len(),
        grades = grades.len(),
        "gradebook loaded"
    );

    Ok(Gradebook {
        students,
        exams,
        grades,
    })
}

/// Grades recorded against one student or one exam.
pub fn count_grades(conn: &Connection, owner: GradeOwner<'_>) -> Result<i64, GradebookError> {
    let (sql, id) = match owner {
        GradeOwner::Student(id) => ("SELECT COUNT(*) FROM grades WHERE student_id = ?", id),
        GradeOwner::Exam(id) => ("SELECT COUNT(*) FROM grades WHERE exam_id = ?", id),
    };
    conn.query_row(sql, [id], |r| r.get(0))
        .map_err(GradebookError::db)
}

#[derive(Debug, Clone, Copy)]
pub enum GradeOwner<'a> {
    Student(&'a str),
    Exam(&'a str),
}

fn exam_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ExamInput> {
    Ok(ExamInput {
        id: r.get(0)?,
        title: r.get(1)?,
        subject: r.get(2)?,
        class_name: r.get(3)?,
        exam_date: r.get(4)?,
        max_marks: r.get(5)?,
        passing_marks: r.get(6)?,
        status: r.get(7)?,
    })
}

/// Loads a single student regardless of the active flag.
pub fn load_student(
    conn: &Connection,
    student_id: &str,
) -> Result<(StudentInput, bool), GradebookError> {
    let row = conn
        .query_row(
            "SELECT id, name, class_name, section, sort_order, active
             FROM students
             WHERE id = ?",
            [student_id],
            |r| {
                Ok((
                    StudentInput {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        class_name: r.get(2)?,
                        section: r.get(3)?,
                        sort_order: r.get(4)?,
                    },
                    r.get::<_, i64>(5)? != 0,
                ))
            },
        )
        .optional()
        .map_err(GradebookError::db)?;
    row.ok_or_else(|| GradebookError::new("not_found", "student not found"))
}

pub fn load_exam(conn: &Connection, exam_id: &str) -> Result<ExamInput, GradebookError> {
    conn.query_row(
        "SELECT id, title, subject, class_name, exam_date, max_marks, passing_marks, status
         FROM exams
         WHERE id = ?",
        [exam_id],
        exam_from_row,
    )
    .optional()
    .map_err(GradebookError::db)?
    .ok_or_else(|| GradebookError::new("not_found", "exam not found"))
}
