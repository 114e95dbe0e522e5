use crate::grading::GradeCategory;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::results::{class_results, grouped_rollups};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

const RESULTS_HEADER: &str =
    "student_id,name,class,section,attempted,total_obtained,total_max,percentage,category,passed,failed\n";
const ROLLUP_HEADER: &str =
    "group,total_students,considered,no_attempts,excellent,good,average,poor,group_average,pass_rate\n";

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let out = PathBuf::from(path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": path }))
        })?;
    }
    std::fs::write(&out, contents).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": path }))
    })?;
    Ok(())
}

fn handle_export_results_csv(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_name = required_str(&req.params, "className")?;
    let out_path = required_str(&req.params, "outPath")?;
    let res = class_results(conn, &class_name, &req.params)?;

    let mut csv = String::from(RESULTS_HEADER);
    for r in &res.rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            csv_quote(&r.student_id),
            csv_quote(&r.name),
            csv_quote(&r.class_name),
            csv_quote(r.section.as_deref().unwrap_or("")),
            r.attempted,
            r.total_obtained,
            r.total_max,
            r.percentage,
            r.category.as_str(),
            r.passed,
            r.failed
        ));
    }
    write_text_file(&out_path, &csv)?;
    tracing::info!(path = %out_path, rows = res.rows.len(), "results csv exported");
    Ok(json!({
        "ok": true,
        "path": out_path,
        "rowsExported": res.rows.len(),
    }))
}

fn handle_export_rollup_csv(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let out_path = required_str(&req.params, "outPath")?;
    let res = grouped_rollups(conn, &req.params)?;

    let mut csv = String::from(ROLLUP_HEADER);
    for (key, r) in &res.groups {
        let count = |c: GradeCategory| r.counts.get(&c).copied().unwrap_or(0);
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            csv_quote(key),
            r.total_students,
            r.considered,
            r.no_attempts,
            count(GradeCategory::Excellent),
            count(GradeCategory::Good),
            count(GradeCategory::Average),
            count(GradeCategory::Poor),
            r.group_average,
            r.pass_rate
        ));
    }
    write_text_file(&out_path, &csv)?;
    tracing::info!(path = %out_path, groups = res.groups.len(), "rollup csv exported");
    Ok(json!({
        "ok": true,
        "path": out_path,
        "groupBy": res.group_by.as_str(),
        "rowsExported": res.groups.len(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "exports.resultsCsv" => handle_export_results_csv(state, req),
        "exports.rollupCsv" => handle_export_rollup_csv(state, req),
        _ => return None,
    };
    Some(respond(&req.id, res))
}

#[cfg(test)]
mod tests {
    use super::csv_quote;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(csv_quote("Ada"), "Ada");
        assert_eq!(csv_quote("Lovelace, Ada"), "\"Lovelace, Ada\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_quote("two\nlines"), "\"two\nlines\"");
    }
}
