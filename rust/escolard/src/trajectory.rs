use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

/// Final grades strictly below this value are owed.
pub const FAILING_THRESHOLD: f64 = 6.0;
/// Accumulated owed subjects at or above this count mean the level is repeated.
pub const REPEAT_OWED_COUNT: usize = 5;
/// Risk is high when more than this many closing grades fail.
pub const RISK_HIGH_ABOVE: usize = 6;
/// Risk is at least medium from this many failing closing grades.
pub const RISK_MEDIUM_FROM: usize = 2;

/// Evaluation checkpoints of a cycle, declared in ascending authority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Instance {
    #[serde(rename = "INFORME_1")]
    Informe1,
    #[serde(rename = "INFORME_2")]
    Informe2,
    #[serde(rename = "PFA")]
    Pfa,
    #[serde(rename = "CIERRE")]
    Cierre,
    #[serde(rename = "COMPLEMENTARIO_DIC")]
    ComplementarioDic,
    #[serde(rename = "COMPLEMENTARIO_FEB")]
    ComplementarioFeb,
    #[serde(rename = "FINAL")]
    Final,
}

impl Instance {
    pub const ALL: [Instance; 7] = [
        Instance::Informe1,
        Instance::Informe2,
        Instance::Pfa,
        Instance::Cierre,
        Instance::ComplementarioDic,
        Instance::ComplementarioFeb,
        Instance::Final,
    ];

    /// Authority rank, 1 (lowest) through 7 (highest).
    pub fn rank(self) -> u8 {
        match self {
            Instance::Informe1 => 1,
            Instance::Informe2 => 2,
            Instance::Pfa => 3,
            Instance::Cierre => 4,
            Instance::ComplementarioDic => 5,
            Instance::ComplementarioFeb => 6,
            Instance::Final => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Instance::Informe1 => "INFORME_1",
            Instance::Informe2 => "INFORME_2",
            Instance::Pfa => "PFA",
            Instance::Cierre => "CIERRE",
            Instance::ComplementarioDic => "COMPLEMENTARIO_DIC",
            Instance::ComplementarioFeb => "COMPLEMENTARIO_FEB",
            Instance::Final => "FINAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim().to_ascii_uppercase();
        Instance::ALL.iter().copied().find(|i| i.as_str() == t)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub subject_id: String,
    pub instance: Instance,
    pub semester: i64,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: String,
    pub grade_level: String,
    pub cycle_year: i64,
    #[serde(default)]
    pub grades: Vec<GradeRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Pasa de curso")]
    Promotes,
    #[serde(rename = "Repite")]
    Repeats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwedSubject {
    pub subject_id: String,
    pub grade_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedEnrollment {
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub final_grades: BTreeMap<String, f64>,
    pub owed_count: usize,
    pub owed_subjects: Vec<OwedSubject>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionPolicy {
    pub failing_threshold: f64,
    pub repeat_owed_count: usize,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            failing_threshold: FAILING_THRESHOLD,
            repeat_owed_count: REPEAT_OWED_COUNT,
        }
    }
}

impl PromotionPolicy {
    pub fn is_owed(&self, score: f64) -> bool {
        score < self.failing_threshold
    }

    pub fn verdict(&self, owed_count: usize) -> Verdict {
        if owed_count >= self.repeat_owed_count {
            Verdict::Repeats
        } else {
            Verdict::Promotes
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrajectoryError {
    #[error("invalid enrollment {enrollment_id}: {reason}")]
    InvalidInput {
        enrollment_id: String,
        reason: String,
    },
}

/// Subject -> grade level at which the debt was incurred.
#[derive(Debug, Default)]
struct OwedLedger {
    debts: HashMap<String, String>,
}

impl OwedLedger {
    fn forgive_level(&mut self, grade_level: &str) {
        self.debts.retain(|_, level| level != grade_level);
    }

    fn apply(&mut self, subject_id: &str, owed: bool, grade_level: &str) {
        if owed {
            self.debts
                .insert(subject_id.to_string(), grade_level.to_string());
        } else {
            self.debts.remove(subject_id);
        }
    }

    fn len(&self) -> usize {
        self.debts.len()
    }

    fn snapshot(&self) -> Vec<OwedSubject> {
        let mut out: Vec<OwedSubject> = self
            .debts
            .iter()
            .map(|(subject_id, grade_level)| OwedSubject {
                subject_id: subject_id.clone(),
                grade_level: grade_level.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        out
    }
}

/// Picks the highest-authority record per subject. On an authority tie the
/// record seen first is kept.
pub fn resolve_final_grades(grades: &[GradeRecord]) -> BTreeMap<String, &GradeRecord> {
    let mut best: BTreeMap<String, &GradeRecord> = BTreeMap::new();
    for g in grades {
        match best.get(&g.subject_id) {
            Some(existing) if existing.instance.rank() >= g.instance.rank() => {}
            _ => {
                best.insert(g.subject_id.clone(), g);
            }
        }
    }
    best
}

fn validate(enrollments: &[Enrollment]) -> Result<(), TrajectoryError> {
    for e in enrollments {
        let invalid = |reason: String| TrajectoryError::InvalidInput {
            enrollment_id: e.id.clone(),
            reason,
        };
        if e.grade_level.trim().is_empty() {
            return Err(invalid("missing grade level".to_string()));
        }
        for g in &e.grades {
            if g.subject_id.trim().is_empty() {
                return Err(invalid("grade without subject".to_string()));
            }
            if !g.score.is_finite() {
                return Err(invalid(format!(
                    "non-numeric score for subject {}",
                    g.subject_id
                )));
            }
            if !(1..=2).contains(&g.semester) {
                return Err(invalid(format!(
                    "semester must be 1 or 2, got {}",
                    g.semester
                )));
            }
        }
    }
    Ok(())
}

/// Annotates one student's enrollment history with final grades, owed
/// subjects and the promotion verdict.
///
/// The fold runs in ascending cycle-year order (stable, so same-year
/// enrollments keep their input order). The result is returned most recent
/// first; same-year entries stay in computation order.
pub fn resolve_trajectory(
    enrollments: &[Enrollment],
    policy: &PromotionPolicy,
) -> Result<Vec<AnnotatedEnrollment>, TrajectoryError> {
    validate(enrollments)?;

    let mut chronological: Vec<&Enrollment> = enrollments.iter().collect();
    chronological.sort_by_key(|e| e.cycle_year);

    let mut ledger = OwedLedger::default();
    let mut previous_level: Option<&str> = None;
    let mut annotated = Vec::with_capacity(chronological.len());

    for e in chronological {
        if previous_level == Some(e.grade_level.as_str()) {
            ledger.forgive_level(&e.grade_level);
        }

        let finals = resolve_final_grades(&e.grades);
        for (subject_id, g) in &finals {
            ledger.apply(subject_id, policy.is_owed(g.score), &e.grade_level);
        }

        let owed_count = ledger.len();
        annotated.push(AnnotatedEnrollment {
            enrollment: e.clone(),
            final_grades: finals
                .into_iter()
                .map(|(subject_id, g)| (subject_id, g.score))
                .collect(),
            owed_count,
            owed_subjects: ledger.snapshot(),
            verdict: policy.verdict(owed_count),
        });
        previous_level = Some(e.grade_level.as_str());
    }

    annotated.sort_by(|a, b| b.enrollment.cycle_year.cmp(&a.enrollment.cycle_year));
    Ok(annotated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskLevel {
    #[serde(rename = "A")]
    High,
    #[serde(rename = "M")]
    Medium,
    #[serde(rename = "B")]
    Low,
}

impl RiskLevel {
    pub fn code(self) -> &'static str {
        match self {
            RiskLevel::High => "A",
            RiskLevel::Medium => "M",
            RiskLevel::Low => "B",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::High => "Alto",
            RiskLevel::Medium => "Medio",
            RiskLevel::Low => "Bajo",
        }
    }
}

pub fn classify_risk(failing_closing_count: usize) -> RiskLevel {
    if failing_closing_count > RISK_HIGH_ABOVE {
        RiskLevel::High
    } else if failing_closing_count >= RISK_MEDIUM_FROM {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Failing grades recorded at `CIERRE`; other instances are ignored.
pub fn count_failing_closing<'a, I>(grades: I, policy: &PromotionPolicy) -> usize
where
    I: IntoIterator<Item = &'a GradeRecord>,
{
    grades
        .into_iter()
        .filter(|g| g.instance == Instance::Cierre && policy.is_owed(g.score))
        .count()
}
