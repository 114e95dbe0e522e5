use crate::gradebook::{self, GradebookScope};
use crate::grading::{
    self, GradeCategory, GradingConfig, GroupBy, GroupRollup, ResultFilters, StudentResult,
};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    db_conn, optional_str, parse_filters, required_f64, required_str, settings_err,
};
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, ResultsSettings};
use rusqlite::Connection;
use serde_json::json;

pub(crate) fn scale_json(cfg: &GradingConfig) -> serde_json::Value {
    json!({
        "excellent": cfg.scale.excellent,
        "good": cfg.scale.good,
        "average": cfg.scale.average,
        "outOfRange": cfg.out_of_range.as_str(),
        "categories": cfg.scale.categories(),
        "topCategory": cfg.scale.top(),
    })
}

pub(crate) fn load_config(
    conn: &Connection,
) -> Result<(GradingConfig, ResultsSettings), HandlerErr> {
    let cfg = settings::grading_config(conn).map_err(settings_err)?;
    let results = settings::results_settings(conn).map_err(settings_err)?;
    Ok((cfg, results))
}

pub(crate) struct ClassResults {
    pub class_name: String,
    pub filters: ResultFilters,
    pub config: GradingConfig,
    pub rows: Vec<StudentResult>,
    pub rollup: GroupRollup,
}

pub(crate) fn class_results(
    conn: &Connection,
    class_name: &str,
    params: &serde_json::Value,
) -> Result<ClassResults, HandlerErr> {
    let (config, results_cfg) = load_config(conn)?;
    let filters = parse_filters(conn, params)?;
    let book = gradebook::load_gradebook(
        conn,
        GradebookScope {
            class_name: Some(class_name),
            include_inactive: results_cfg.include_inactive,
        },
    )?;
    let rows = grading::aggregate_all(
        &book.students,
        &book.exams,
        &book.grades,
        &filters,
        &config,
    )?;
    let rollup = grading::rollup(&rows, results_cfg.top_bottom_count);
    Ok(ClassResults {
        class_name: class_name.to_string(),
        filters,
        config,
        rows,
        rollup,
    })
}

pub(crate) struct GroupedRollups {
    pub group_by: GroupBy,
    pub filters: ResultFilters,
    pub config: GradingConfig,
    pub groups: Vec<(String, GroupRollup)>,
}

pub(crate) fn grouped_rollups(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<GroupedRollups, HandlerErr> {
    let raw_group_by = optional_str(params, "groupBy")?.unwrap_or_else(|| "class".to_string());
    let group_by = GroupBy::parse(&raw_group_by)
        .ok_or_else(|| HandlerErr::bad_params("groupBy must be class, section or school"))?;
    let class_name = optional_str(params, "className")?;
    let (config, results_cfg) = load_config(conn)?;
    let filters = parse_filters(conn, params)?;

    let book = gradebook::load_gradebook(
        conn,
        GradebookScope {
            class_name: class_name.as_deref(),
            include_inactive: results_cfg.include_inactive,
        },
    )?;

    let mut groups = Vec::new();
    for (key, students) in grading::group_students(&book.students, group_by) {
        let rollup = grading::rollup_group(
            &students,
            &book.exams,
            &book.grades,
            &filters,
            &config,
            results_cfg.top_bottom_count,
        )?;
        groups.push((key, rollup));
    }

    Ok(GroupedRollups {
        group_by,
        filters,
        config,
        groups,
    })
}

fn handle_results_categorize(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let percentage = match req.params.get("percentage") {
        // NaN is not representable in JSON; a string "NaN" is the only way to ask.
        Some(v) if v.as_str().map(|s| s.eq_ignore_ascii_case("nan")).unwrap_or(false) => f64::NAN,
        _ => required_f64(&req.params, "percentage")?,
    };
    let (config, _) = load_config(conn)?;
    let category = grading::categorize(percentage, &config)?;
    Ok(json!({
        "percentage": percentage,
        "category": category,
        "scale": scale_json(&config),
    }))
}

fn handle_results_student(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let (student, active) = gradebook::load_student(conn, &student_id)?;
    let (config, _) = load_config(conn)?;
    let filters = parse_filters(conn, &req.params)?;
    // Inactive students still get their own results on request.
    let book = gradebook::load_gradebook(
        conn,
        GradebookScope {
            class_name: Some(student.class_name.as_str()),
            include_inactive: true,
        },
    )?;
    let result = grading::aggregate_student(
        &student,
        &book.exams,
        &book.grades,
        &filters,
        &config,
    )?;
    Ok(json!({
        "active": active,
        "filters": filters,
        "scale": scale_json(&config),
        "result": result,
    }))
}

fn handle_results_class(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_name = required_str(&req.params, "className")?;
    let res = class_results(conn, &class_name, &req.params)?;
    Ok(json!({
        "className": res.class_name,
        "filters": res.filters,
        "scale": scale_json(&res.config),
        "rows": res.rows,
        "rollup": res.rollup,
    }))
}

fn handle_results_rollup(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let res = grouped_rollups(conn, &req.params)?;
    let groups: Vec<serde_json::Value> = res
        .groups
        .iter()
        .map(|(key, rollup)| json!({ "key": key, "rollup": rollup }))
        .collect();
    let mut totals = json!({});
    for cat in GradeCategory::ALL {
        let n: usize = res
            .groups
            .iter()
            .map(|(_, r)| r.counts.get(&cat).copied().unwrap_or(0))
            .sum();
        totals[cat.as_str()] = json!(n);
    }
    Ok(json!({
        "groupBy": res.group_by.as_str(),
        "filters": res.filters,
        "scale": scale_json(&res.config),
        "groups": groups,
        "categoryTotals": totals,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let started = std::time::Instant::now();
    let res = match req.method.as_str() {
        "results.categorize" => handle_results_categorize(state, req),
        "results.student" => handle_results_student(state, req),
        "results.class" => handle_results_class(state, req),
        "results.rollup" => handle_results_rollup(state, req),
        _ => return None,
    };
    tracing::debug!(
        method = %req.method,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = res.is_ok(),
        "results computed"
    );
    Some(respond(&req.id, res))
}
