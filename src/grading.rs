use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Qualitative bucket for a percentage. Variant order is the category order,
/// so `Poor < Average < Good < Excellent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GradeCategory {
    Poor,
    Average,
    Good,
    Excellent,
}

impl GradeCategory {
    pub const ALL: [GradeCategory; 4] = [
        GradeCategory::Poor,
        GradeCategory::Average,
        GradeCategory::Good,
        GradeCategory::Excellent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GradeCategory::Poor => "Poor",
            GradeCategory::Average => "Average",
            GradeCategory::Good => "Good",
            GradeCategory::Excellent => "Excellent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GradingError {
    #[error("percentage is not a number")]
    NotANumber,
    #[error("percentage {0} is outside 0..=100")]
    OutOfRange(f64),
    #[error("invalid grade scale: {0}")]
    InvalidScale(String),
    #[error("{0}")]
    BadFilter(String),
}

impl GradingError {
    /// Stable envelope code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GradingError::NotANumber => "not_a_number",
            GradingError::OutOfRange(_) => "out_of_range",
            GradingError::InvalidScale(_) => "invalid_scale",
            GradingError::BadFilter(_) => "bad_params",
        }
    }
}

/// Lower bounds (inclusive) for each category above `Poor`. A `None` band is
/// not part of the scale, e.g. the three-band scale has no `excellent`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeScale {
    pub excellent: Option<f64>,
    pub good: Option<f64>,
    pub average: Option<f64>,
}

impl GradeScale {
    pub fn four_band() -> Self {
        Self {
            excellent: Some(90.0),
            good: Some(75.0),
            average: Some(50.0),
        }
    }

    pub fn three_band() -> Self {
        Self {
            excellent: None,
            good: Some(75.0),
            average: Some(50.0),
        }
    }

    pub fn new(
        excellent: Option<f64>,
        good: Option<f64>,
        average: Option<f64>,
    ) -> Result<Self, GradingError> {
        let scale = Self {
            excellent,
            good,
            average,
        };
        scale.validate()?;
        Ok(scale)
    }

    pub fn validate(&self) -> Result<(), GradingError> {
        let mut prev: Option<(GradeCategory, f64)> = None;
        // Ascending category order; thresholds must strictly increase with it.
        for (cat, t) in self.bands().into_iter().rev() {
            if !t.is_finite() || !(0.0..=100.0).contains(&t) {
                return Err(GradingError::InvalidScale(format!(
                    "{} threshold must be within 0..=100",
                    cat.as_str()
                )));
            }
            if let Some((prev_cat, prev_t)) = prev {
                if t <= prev_t {
                    return Err(GradingError::InvalidScale(format!(
                        "{} threshold ({}) must be greater than {} threshold ({})",
                        cat.as_str(),
                        t,
                        prev_cat.as_str(),
                        prev_t
                    )));
                }
            }
            prev = Some((cat, t));
        }
        Ok(())
    }

    /// Configured bands, highest category first.
    fn bands(&self) -> Vec<(GradeCategory, f64)> {
        [
            (GradeCategory::Excellent, self.excellent),
            (GradeCategory::Good, self.good),
            (GradeCategory::Average, self.average),
        ]
        .into_iter()
        .filter_map(|(cat, t)| t.map(|t| (cat, t)))
        .collect()
    }

    /// Categories this scale can produce, ascending.
    pub fn categories(&self) -> Vec<GradeCategory> {
        let mut out = vec![GradeCategory::Poor];
        out.extend(self.bands().into_iter().rev().map(|(cat, _)| cat));
        out
    }

    pub fn top(&self) -> GradeCategory {
        self.bands()
            .first()
            .map(|(cat, _)| *cat)
            .unwrap_or(GradeCategory::Poor)
    }
}

impl Default for GradeScale {
    fn default() -> Self {
        Self::four_band()
    }
}

/// What to do with a percentage outside `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutOfRange {
    #[default]
    Clamp,
    Reject,
}

impl OutOfRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clamp" => Some(Self::Clamp),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clamp => "clamp",
            Self::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradingConfig {
    pub scale: GradeScale,
    pub out_of_range: OutOfRange,
}

/// Legacy one-decimal rounding used for every reported percentage:
/// `floor(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn categorize(percentage: f64, cfg: &GradingConfig) -> Result<GradeCategory, GradingError> {
    if percentage.is_nan() {
        return Err(GradingError::NotANumber);
    }
    let p = if (0.0..=100.0).contains(&percentage) {
        percentage
    } else {
        match cfg.out_of_range {
            OutOfRange::Clamp => percentage.clamp(0.0, 100.0),
            OutOfRange::Reject => return Err(GradingError::OutOfRange(percentage)),
        }
    };
    for (cat, threshold) in cfg.scale.bands() {
        if p >= threshold {
            return Ok(cat);
        }
    }
    Ok(GradeCategory::Poor)
}

#[derive(Debug, Clone)]
pub struct StudentInput {
    pub id: String,
    pub name: String,
    pub class_name: String,
    pub section: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct ExamInput {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub class_name: String,
    pub exam_date: Option<String>,
    pub max_marks: f64,
    pub passing_marks: f64,
    pub status: String,
}

/// Marks keyed by `(student_id, exam_id)`.
#[derive(Debug, Clone, Default)]
pub struct GradeIndex {
    marks: HashMap<(String, String), f64>,
}

impl GradeIndex {
    pub fn insert(&mut self, student_id: &str, exam_id: &str, marks: f64) {
        self.marks
            .insert((student_id.to_string(), exam_id.to_string()), marks);
    }

    pub fn get(&self, student_id: &str, exam_id: &str) -> Option<f64> {
        self.marks
            .get(&(student_id.to_string(), exam_id.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFilters {
    pub subject: Option<String>,
    pub status: Option<String>,
    pub section: Option<String>,
}

impl ResultFilters {
    pub fn exam_matches(&self, exam: &ExamInput) -> bool {
        let subject_ok = self
            .subject
            .as_ref()
            .map(|s| exam.subject.trim().eq_ignore_ascii_case(s))
            .unwrap_or(true);
        let status_ok = self
            .status
            .as_ref()
            .map(|s| exam.status.trim().eq_ignore_ascii_case(s))
            .unwrap_or(true);
        subject_ok && status_ok
    }

    pub fn student_matches(&self, student: &StudentInput) -> bool {
        self.section
            .as_ref()
            .map(|want| {
                student
                    .section
                    .as_deref()
                    .map(|s| s.trim().eq_ignore_ascii_case(want))
                    .unwrap_or(false)
            })
            .unwrap_or(true)
    }
}

fn parse_filter_str(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<String>, GradingError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(GradingError::BadFilter(format!(
                    "filters.{} must be string or null",
                    key
                )));
            };
            let t = s.trim();
            if t.is_empty() || t.eq_ignore_ascii_case("ALL") {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
    }
}

/// Parses the request `filters` object. `default_status` applies when the
/// caller does not mention `status` at all.
pub fn parse_result_filters(
    raw: Option<&serde_json::Value>,
    default_status: Option<&str>,
) -> Result<ResultFilters, GradingError> {
    let default_status = default_status
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("ALL"))
        .map(str::to_string);
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(ResultFilters {
            status: default_status,
            ..ResultFilters::default()
        });
    };
    let Some(obj) = raw.as_object() else {
        return Err(GradingError::BadFilter(
            "filters must be an object".to_string(),
        ));
    };

    let status = if obj.contains_key("status") {
        parse_filter_str(obj, "status")?
    } else {
        default_status
    };

    Ok(ResultFilters {
        subject: parse_filter_str(obj, "subject")?,
        status,
        section: parse_filter_str(obj, "section")?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject: String,
    pub attempted: usize,
    pub obtained: f64,
    pub max: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResult {
    pub student_id: String,
    pub name: String,
    pub class_name: String,
    pub section: Option<String>,
    pub sort_order: i64,
    pub attempted: usize,
    pub missing: usize,
    pub passed: usize,
    pub failed: usize,
    pub total_obtained: f64,
    pub total_max: f64,
    pub percentage: f64,
    pub category: GradeCategory,
    pub subjects: Vec<SubjectResult>,
}

pub fn same_class(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn percent_of(obtained: f64, max: f64) -> f64 {
    if max > 0.0 {
        100.0 * obtained / max
    } else {
        0.0
    }
}

/// Exams a student sits: same class, passing the exam filters, with a usable
/// maximum.
pub fn relevant_exams<'a>(
    student: &StudentInput,
    exams: &'a [ExamInput],
    filters: &ResultFilters,
) -> Vec<&'a ExamInput> {
    exams
        .iter()
        .filter(|e| same_class(&e.class_name, &student.class_name))
        .filter(|e| filters.exam_matches(e))
        .filter(|e| e.max_marks > 0.0)
        .collect()
}

pub fn aggregate_student(
    student: &StudentInput,
    exams: &[ExamInput],
    grades: &GradeIndex,
    filters: &ResultFilters,
    cfg: &GradingConfig,
) -> Result<StudentResult, GradingError> {
    let mut attempted = 0_usize;
    let mut missing = 0_usize;
    let mut passed = 0_usize;
    let mut failed = 0_usize;
    let mut total_obtained = 0.0_f64;
    let mut total_max = 0.0_f64;

    // subject -> (attempted, obtained, max), BTreeMap keeps output sorted.
    let mut per_subject: BTreeMap<String, (usize, f64, f64)> = BTreeMap::new();

    for exam in relevant_exams(student, exams, filters) {
        let Some(marks) = grades.get(&student.id, &exam.id) else {
            missing += 1;
            continue;
        };
        attempted += 1;
        total_obtained += marks;
        total_max += exam.max_marks;
        if marks >= exam.passing_marks {
            passed += 1;
        } else {
            failed += 1;
        }
        let entry = per_subject
            .entry(exam.subject.trim().to_string())
            .or_insert((0, 0.0, 0.0));
        entry.0 += 1;
        entry.1 += marks;
        entry.2 += exam.max_marks;
    }

    let raw_percentage = if attempted > 0 {
        percent_of(total_obtained, total_max)
    } else {
        0.0
    };
    // Categorize the exact value; rounding is for display only.
    let category = categorize(raw_percentage, cfg)?;
    let percentage = round_off_1_decimal(raw_percentage);

    let subjects = per_subject
        .into_iter()
        .map(|(subject, (attempted, obtained, max))| SubjectResult {
            subject,
            attempted,
            obtained,
            max,
            percentage: round_off_1_decimal(percent_of(obtained, max)),
        })
        .collect();

    Ok(StudentResult {
        student_id: student.id.clone(),
        name: student.name.clone(),
        class_name: student.class_name.clone(),
        section: student.section.clone(),
        sort_order: student.sort_order,
        attempted,
        missing,
        passed,
        failed,
        total_obtained,
        total_max,
        percentage,
        category,
        subjects,
    })
}

pub fn aggregate_all(
    students: &[StudentInput],
    exams: &[ExamInput],
    grades: &GradeIndex,
    filters: &ResultFilters,
    cfg: &GradingConfig,
) -> Result<Vec<StudentResult>, GradingError> {
    students
        .iter()
        .filter(|s| filters.student_matches(s))
        .map(|s| aggregate_student(s, exams, grades, filters, cfg))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub student_id: String,
    pub name: String,
    pub percentage: f64,
    pub category: GradeCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRollup {
    pub total_students: usize,
    pub considered: usize,
    pub no_attempts: usize,
    pub counts: BTreeMap<GradeCategory, usize>,
    pub group_obtained: f64,
    pub group_max: f64,
    pub group_average: f64,
    pub pass_rate: f64,
    pub top: Vec<RankedStudent>,
    pub bottom: Vec<RankedStudent>,
    pub subjects: Vec<SubjectResult>,
}

fn ranked(r: &StudentResult) -> RankedStudent {
    RankedStudent {
        student_id: r.student_id.clone(),
        name: r.name.clone(),
        percentage: r.percentage,
        category: r.category,
    }
}

/// Summarizes already-aggregated rows. Students with no attempted exam are
/// reported in `no_attempts` and excluded from every other figure.
pub fn rollup(results: &[StudentResult], top_n: usize) -> GroupRollup {
    let mut counts: BTreeMap<GradeCategory, usize> =
        GradeCategory::ALL.iter().map(|c| (*c, 0)).collect();
    let mut group_obtained = 0.0_f64;
    let mut group_max = 0.0_f64;
    let mut all_passed = 0_usize;
    let mut per_subject: BTreeMap<String, (usize, f64, f64)> = BTreeMap::new();

    let considered: Vec<&StudentResult> = results.iter().filter(|r| r.attempted > 0).collect();
    for r in &considered {
        *counts.entry(r.category).or_insert(0) += 1;
        group_obtained += r.total_obtained;
        group_max += r.total_max;
        if r.failed == 0 {
            all_passed += 1;
        }
        for s in &r.subjects {
            let entry = per_subject
                .entry(s.subject.clone())
                .or_insert((0, 0.0, 0.0));
            entry.0 += s.attempted;
            entry.1 += s.obtained;
            entry.2 += s.max;
        }
    }

    // Percentage of sums, not the mean of per-student percentages.
    let group_average = round_off_1_decimal(percent_of(group_obtained, group_max));
    let pass_rate = if considered.is_empty() {
        0.0
    } else {
        round_off_1_decimal(100.0 * (all_passed as f64) / (considered.len() as f64))
    };

    // Ties keep sort order in both lists.
    let mut ordered = considered.clone();
    ordered.sort_by(|a, b| {
        b.percentage
            .partial_cmp(&a.percentage)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.sort_order.cmp(&b.sort_order))
    });
    let top = ordered.iter().take(top_n).map(|r| ranked(r)).collect();
    ordered.sort_by(|a, b| {
        a.percentage
            .partial_cmp(&b.percentage)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.sort_order.cmp(&b.sort_order))
    });
    let bottom = ordered.iter().take(top_n).map(|r| ranked(r)).collect();

    let subjects = per_subject
        .into_iter()
        .map(|(subject, (attempted, obtained, max))| SubjectResult {
            subject,
            attempted,
            obtained,
            max,
            percentage: round_off_1_decimal(percent_of(obtained, max)),
        })
        .collect();

    GroupRollup {
        total_students: results.len(),
        considered: considered.len(),
        no_attempts: results.len() - considered.len(),
        counts,
        group_obtained,
        group_max,
        group_average,
        pass_rate,
        top,
        bottom,
        subjects,
    }
}

pub fn rollup_group(
    students: &[StudentInput],
    exams: &[ExamInput],
    grades: &GradeIndex,
    filters: &ResultFilters,
    cfg: &GradingConfig,
    top_n: usize,
) -> Result<GroupRollup, GradingError> {
    let results = aggregate_all(students, exams, grades, filters, cfg)?;
    Ok(rollup(&results, top_n))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Class,
    Section,
    School,
}

impl GroupBy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "class" => Some(Self::Class),
            "section" => Some(Self::Section),
            "school" => Some(Self::School),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Section => "section",
            Self::School => "school",
        }
    }

    pub fn key(self, student: &StudentInput) -> String {
        match self {
            Self::Class => student.class_name.trim().to_string(),
            Self::Section => {
                let section = student
                    .section
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("-");
                format!("{} / {}", student.class_name.trim(), section)
            }
            Self::School => "School".to_string(),
        }
    }
}

/// Splits students into groups keyed by `group_by`, groups sorted by key.
pub fn group_students(
    students: &[StudentInput],
    group_by: GroupBy,
) -> BTreeMap<String, Vec<StudentInput>> {
    let mut groups: BTreeMap<String, Vec<StudentInput>> = BTreeMap::new();
    for s in students {
        groups.entry(group_by.key(s)).or_default().push(s.clone());
    }
    groups
}
