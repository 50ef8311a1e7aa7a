use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Recording status of one graded score cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStatus {
    Present,
    Missing,
    Absent,
    Excused,
}

impl ScoreStatus {
    pub fn parse(s: &str) -> Option<ScoreStatus> {
        match s {
            "present" => Some(ScoreStatus::Present),
            "missing" => Some(ScoreStatus::Missing),
            "absent" => Some(ScoreStatus::Absent),
            "excused" => Some(ScoreStatus::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScoreStatus::Present => "present",
            ScoreStatus::Missing => "missing",
            ScoreStatus::Absent => "absent",
            ScoreStatus::Excused => "excused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradedScore {
    pub points: f64,
    pub max_points: f64,
    pub status: ScoreStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightPolicy {
    Strict,
    Normalize,
}

impl WeightPolicy {
    pub fn parse(s: &str) -> Option<WeightPolicy> {
        match s {
            "strict" => Some(WeightPolicy::Strict),
            "normalize" => Some(WeightPolicy::Normalize),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WeightPolicy::Strict => "strict",
            WeightPolicy::Normalize => "normalize",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    Floor,
    Round,
    Ceil,
}

impl RoundingMode {
    pub fn parse(s: &str) -> Option<RoundingMode> {
        match s {
            "floor" => Some(RoundingMode::Floor),
            "round" => Some(RoundingMode::Round),
            "ceil" => Some(RoundingMode::Ceil),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundingMode::Floor => "floor",
            RoundingMode::Round => "round",
            RoundingMode::Ceil => "ceil",
        }
    }

    fn apply(self, value: f64) -> f64 {
        match self {
            RoundingMode::Floor => value.floor(),
            RoundingMode::Round => value.round(),
            RoundingMode::Ceil => value.ceil(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeType {
    DepedK12,
    ChedHei,
    ChedSimple,
}

impl SchemeType {
    pub fn parse(s: &str) -> Option<SchemeType> {
        match s {
            "deped_k12" => Some(SchemeType::DepedK12),
            "ched_hei" => Some(SchemeType::ChedHei),
            "ched_simple" => Some(SchemeType::ChedSimple),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchemeType::DepedK12 => "deped_k12",
            SchemeType::ChedHei => "ched_hei",
            SchemeType::ChedSimple => "ched_simple",
        }
    }

    pub fn requires_transmutation(self) -> bool {
        matches!(self, SchemeType::DepedK12 | SchemeType::ChedHei)
    }
}

/// One grading component and the student's scores recorded under it.
#[derive(Debug, Clone)]
pub struct ComponentInput {
    pub component_id: String,
    pub name: String,
    /// None when the weight profile has no row for this component; such
    /// components are reported in the breakdown but never enter the blend.
    pub weight_percent: Option<f64>,
    pub scores: Vec<GradedScore>,
}

/// Integer initial grade (0..=100) to official reported grade.
#[derive(Debug, Clone, Default)]
pub struct TransmutationTable {
    rows: HashMap<i64, f64>,
}

impl TransmutationTable {
    pub fn from_rows<I>(rows: I) -> TransmutationTable
    where
        I: IntoIterator<Item = (i64, f64)>,
    {
        TransmutationTable {
            rows: rows.into_iter().collect(),
        }
    }

    pub fn lookup(&self, initial_grade: i64) -> Option<f64> {
        self.rows.get(&initial_grade).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Strict weight policy and the applied weights do not sum to 100.
    WeightValidation { total_weight: f64 },
    /// Transmutation table has no row for the rounded initial grade.
    MissingTransmutationRow { key: i64 },
    /// Scheme requires a transmutation table but none was supplied.
    MissingTransmutationTable { scheme: SchemeType },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::WeightValidation { .. } => "weight_invalid",
            EngineError::MissingTransmutationRow { .. } => "transmutation_row_missing",
            EngineError::MissingTransmutationTable { .. } => "transmutation_table_missing",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::WeightValidation { total_weight } => write!(
                f,
                "component weights must sum to 100, got {total_weight}"
            ),
            EngineError::MissingTransmutationRow { key } => {
                write!(f, "transmutation table has no row for initial grade {key}")
            }
            EngineError::MissingTransmutationTable { scheme } => write!(
                f,
                "scheme {} requires a transmutation table",
                scheme.as_str()
            ),
        }
    }
}

impl std::error::Error for EngineError {}

/// Per-component slice of the audit breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBreakdown {
    pub component_id: String,
    pub name: String,
    pub raw_total: f64,
    pub max_total: f64,
    pub percent: f64,
    pub weight_percent: Option<f64>,
    /// Whether this component's weight entered the blend.
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub components: Vec<ComponentBreakdown>,
    pub total_weight: f64,
    pub weight_policy: WeightPolicy,
    pub rounding_mode: RoundingMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedGrade {
    pub student_id: String,
    pub initial_grade: f64,
    pub final_numeric_grade: f64,
    pub transmuted_grade: Option<f64>,
    pub breakdown: Breakdown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentTally {
    pub raw_total: f64,
    pub max_total: f64,
    pub present_count: usize,
    pub missing_count: usize,
    pub absent_count: usize,
    pub excused_count: usize,
}

impl ComponentTally {
    pub fn percent(&self) -> f64 {
        if self.max_total > 0.0 {
            100.0 * self.raw_total / self.max_total
        } else {
            0.0
        }
    }
}

/// Stage 1: fold one component's scores into raw/max totals.
///
/// Excused scores are skipped entirely. Missing and absent both count the
/// full max_points against the student while contributing zero points.
pub fn tally_component<I>(scores: I) -> ComponentTally
where
    I: IntoIterator<Item = GradedScore>,
{
    let mut tally = ComponentTally {
        raw_total: 0.0,
        max_total: 0.0,
        present_count: 0,
        missing_count: 0,
        absent_count: 0,
        excused_count: 0,
    };

    for s in scores {
        match s.status {
            ScoreStatus::Excused => {
                tally.excused_count += 1;
            }
            ScoreStatus::Present => {
                tally.present_count += 1;
                tally.raw_total += s.points;
                tally.max_total += s.max_points;
            }
            ScoreStatus::Missing => {
                tally.missing_count += 1;
                tally.max_total += s.max_points;
            }
            ScoreStatus::Absent => {
                tally.absent_count += 1;
                tally.max_total += s.max_points;
            }
        }
    }

    tally
}

const STRICT_WEIGHT_TOLERANCE: f64 = 0.01;

/// Stage 2: blend component percents by weight into the initial grade.
///
/// Returns the initial grade together with the per-component breakdown rows.
pub fn blend_components(
    components: &[ComponentInput],
    policy: WeightPolicy,
) -> Result<(f64, f64, Vec<ComponentBreakdown>), EngineError> {
    let mut total_weighted_score = 0.0_f64;
    let mut total_weight = 0.0_f64;
    let mut rows: Vec<ComponentBreakdown> = Vec::with_capacity(components.len());

    for c in components {
        let tally = tally_component(c.scores.iter().copied());
        let percent = tally.percent();
        // A weight is applied only when the component actually has countable
        // work; an all-excused component must not drag the grade down.
        let applied = c.weight_percent.is_some() && tally.max_total > 0.0;
        if applied {
            let weight = c.weight_percent.unwrap_or(0.0);
            total_weighted_score += percent * weight / 100.0;
            total_weight += weight;
        }
        rows.push(ComponentBreakdown {
            component_id: c.component_id.clone(),
            name: c.name.clone(),
            raw_total: tally.raw_total,
            max_total: tally.max_total,
            percent,
            weight_percent: c.weight_percent,
            applied,
        });
    }

    if policy == WeightPolicy::Strict && (total_weight - 100.0).abs() > STRICT_WEIGHT_TOLERANCE {
        return Err(EngineError::WeightValidation { total_weight });
    }

    let initial_grade = if total_weight > 0.0 {
        total_weighted_score / total_weight * 100.0
    } else {
        0.0
    };

    Ok((initial_grade, total_weight, rows))
}

/// Stage 3: exact-match table lookup on the rounded initial grade.
pub fn transmute(
    initial_grade: f64,
    mode: RoundingMode,
    table: &TransmutationTable,
) -> Result<f64, EngineError> {
    let key = mode.apply(initial_grade).clamp(0.0, 100.0) as i64;
    table
        .lookup(key)
        .ok_or(EngineError::MissingTransmutationRow { key })
}

/// Full pipeline for one student. Pure: same inputs, same output.
pub fn compute_student_grade(
    student_id: &str,
    components: &[ComponentInput],
    scheme: SchemeType,
    policy: WeightPolicy,
    rounding: RoundingMode,
    table: Option<&TransmutationTable>,
) -> Result<ComputedGrade, EngineError> {
    if scheme.requires_transmutation() && table.is_none() {
        return Err(EngineError::MissingTransmutationTable { scheme });
    }

    let (initial_grade, total_weight, rows) = blend_components(components, policy)?;

    let (final_numeric_grade, transmuted_grade) = match table {
        Some(t) => {
            let g = transmute(initial_grade, rounding, t)?;
            (g, Some(g))
        }
        None => (initial_grade, None),
    };

    Ok(ComputedGrade {
        student_id: student_id.to_string(),
        initial_grade,
        final_numeric_grade,
        transmuted_grade,
        breakdown: Breakdown {
            components: rows,
            total_weight,
            weight_policy: policy,
            rounding_mode: rounding,
        },
    })
}
