use crate::db;
use crate::grading::{GradeScale, GradingConfig, OutOfRange};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupSection {
    Grading,
    Results,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [SetupSection::Grading, SetupSection::Results];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "results" => Some(Self::Results),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::Results => "results",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Results => "setup.results",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchError {
    pub code: &'static str,
    pub message: String,
}

impl PatchError {
    fn bad(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
        }
    }
}

pub fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "excellent": 90.0,
            "good": 75.0,
            "average": 50.0,
            "outOfRange": "clamp"
        }),
        SetupSection::Results => json!({
            "defaultExamStatus": "ALL",
            "topBottomCount": 5,
            "includeInactive": false
        }),
    }
}

fn parse_threshold(v: &Value, key: &str) -> Result<Value, PatchError> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let n = v
        .as_f64()
        .ok_or_else(|| PatchError::bad(format!("{} must be a number or null", key)))?;
    Ok(json!(n))
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, PatchError> {
    v.as_bool()
        .ok_or_else(|| PatchError::bad(format!("{} must be boolean", key)))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, PatchError> {
    let n = v
        .as_i64()
        .ok_or_else(|| PatchError::bad(format!("{} must be integer", key)))?;
    if !(min..=max).contains(&n) {
        return Err(PatchError::bad(format!(
            "{} must be in {}..={}",
            key, min, max
        )));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, PatchError> {
    let s = v
        .as_str()
        .ok_or_else(|| PatchError::bad(format!("{} must be string", key)))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(PatchError::bad(format!(
            "{} length must be <= {}",
            key, max_len
        )));
    }
    Ok(s.to_string())
}

fn apply_preset(obj: &mut Map<String, Value>, preset: &str) -> Result<(), PatchError> {
    let scale = match preset {
        "fourBand" => GradeScale::four_band(),
        "threeBand" => GradeScale::three_band(),
        _ => return Err(PatchError::bad("preset must be fourBand or threeBand")),
    };
    obj.insert("excellent".into(), json!(scale.excellent));
    obj.insert("good".into(), json!(scale.good));
    obj.insert("average".into(), json!(scale.average));
    Ok(())
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), PatchError> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| PatchError::bad("internal setup object must be a JSON object"))?;

    match section {
        SetupSection::Grading => {
            // Presets first so explicit thresholds in the same patch win.
            if let Some(p) = patch.get("preset") {
                let p = p
                    .as_str()
                    .ok_or_else(|| PatchError::bad("preset must be string"))?;
                apply_preset(obj, p)?;
            }
            for (k, v) in patch {
                match k.as_str() {
                    "preset" => {}
                    "excellent" | "good" | "average" => {
                        obj.insert(k.clone(), parse_threshold(v, k)?);
                    }
                    "outOfRange" => {
                        let s = v
                            .as_str()
                            .and_then(OutOfRange::parse)
                            .ok_or_else(|| PatchError::bad("outOfRange must be clamp or reject"))?;
                        obj.insert(k.clone(), json!(s.as_str()));
                    }
                    _ => return Err(PatchError::bad(format!("unknown grading field: {}", k))),
                }
            }
            scale_from_section(current)?;
        }
        SetupSection::Results => {
            for (k, v) in patch {
                match k.as_str() {
                    "defaultExamStatus" => {
                        let s = parse_string_max(v, k, 40)?;
                        let s = if s.is_empty() { "ALL".to_string() } else { s };
                        obj.insert(k.clone(), Value::String(s));
                    }
                    "topBottomCount" => {
                        obj.insert(k.clone(), json!(parse_i64_range(v, k, 0, 50)?));
                    }
                    "includeInactive" => {
                        obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                    }
                    _ => return Err(PatchError::bad(format!("unknown results field: {}", k))),
                }
            }
        }
    }
    Ok(())
}

fn scale_from_section(v: &Value) -> Result<GradeScale, PatchError> {
    let read = |key: &str| -> Result<Option<f64>, PatchError> {
        match v.get(key) {
            None => Ok(None),
            Some(x) if x.is_null() => Ok(None),
            Some(x) => x
                .as_f64()
                .map(Some)
                .ok_or_else(|| PatchError::bad(format!("{} must be a number or null", key))),
        }
    };
    GradeScale::new(read("excellent")?, read("good")?, read("average")?).map_err(|e| PatchError {
        code: e.code(),
        message: e.to_string(),
    })
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to the defaults.
            let mut candidate = current.clone();
            if merge_section_patch(section, &mut candidate, saved_obj).is_ok() {
                current = candidate;
            } else {
                tracing::warn!(section = section.key(), "ignoring invalid saved settings");
            }
        }
    }
    Ok(current)
}

pub fn grading_config(conn: &Connection) -> anyhow::Result<GradingConfig> {
    let section = load_section(conn, SetupSection::Grading)?;
    let scale = scale_from_section(&section)
        .map_err(|e| anyhow::anyhow!(e.message))?;
    let out_of_range = section
        .get("outOfRange")
        .and_then(|v| v.as_str())
        .and_then(OutOfRange::parse)
        .unwrap_or_default();
    Ok(GradingConfig {
        scale,
        out_of_range,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultsSettings {
    pub default_exam_status: String,
    pub top_bottom_count: usize,
    pub include_inactive: bool,
}

pub fn results_settings(conn: &Connection) -> anyhow::Result<ResultsSettings> {
    let section = load_section(conn, SetupSection::Results)?;
    Ok(ResultsSettings {
        default_exam_status: section
            .get("defaultExamStatus")
            .and_then(|v| v.as_str())
            .unwrap_or("ALL")
            .to_string(),
        top_bottom_count: section
            .get("topBottomCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(5) as usize,
        include_inactive: section
            .get("includeInactive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("patch object")
    }

    #[test]
    fn preset_then_override() {
        let mut cur = default_section(SetupSection::Grading);
        merge_section_patch(
            SetupSection::Grading,
            &mut cur,
            &patch(json!({ "preset": "threeBand", "good": 80 })),
        )
        .expect("merge");
        assert!(cur["excellent"].is_null());
        assert_eq!(cur["good"], json!(80.0));
        assert_eq!(cur["average"], json!(50.0));
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut cur = default_section(SetupSection::Grading);
        let e = merge_section_patch(
            SetupSection::Grading,
            &mut cur,
            &patch(json!({ "average": 80 })),
        )
        .expect_err("average above good");
        assert_eq!(e.code, "invalid_scale");
    }

    #[test]
    fn rejects_unknown_fields_and_bad_types() {
        let mut cur = default_section(SetupSection::Results);
        assert!(merge_section_patch(
            SetupSection::Results,
            &mut cur,
            &patch(json!({ "colour": "red" }))
        )
        .is_err());
        assert!(merge_section_patch(
            SetupSection::Results,
            &mut cur,
            &patch(json!({ "topBottomCount": 500 }))
        )
        .is_err());
        let mut cur = default_section(SetupSection::Grading);
        assert!(merge_section_patch(
            SetupSection::Grading,
            &mut cur,
            &patch(json!({ "outOfRange": "ignore" }))
        )
        .is_err());
    }
}
