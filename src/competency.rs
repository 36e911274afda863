use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DataError;

/// CBC performance levels in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetencyLevel {
    Emerging = 1,
    Approaching = 2,
    Proficient = 3,
    Exceeding = 4,
}

impl CompetencyLevel {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_average(average: f64) -> Self {
        if average >= 3.5 {
            CompetencyLevel::Exceeding
        } else if average >= 2.5 {
            CompetencyLevel::Proficient
        } else if average >= 1.5 {
            CompetencyLevel::Approaching
        } else {
            CompetencyLevel::Emerging
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompetencyLevel::Emerging => "emerging",
            CompetencyLevel::Approaching => "approaching",
            CompetencyLevel::Proficient => "proficient",
            CompetencyLevel::Exceeding => "exceeding",
        }
    }
}

impl FromStr for CompetencyLevel {
    type Err = DataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "emerging" | "em" | "1" => Ok(CompetencyLevel::Emerging),
            "approaching" | "ap" | "2" => Ok(CompetencyLevel::Approaching),
            "proficient" | "pr" | "3" => Ok(CompetencyLevel::Proficient),
            "exceeding" | "ex" | "4" => Ok(CompetencyLevel::Exceeding),
            other => Err(DataError::validation(format!(
                "unknown competency level '{other}'"
            ))),
        }
    }
}

impl fmt::Display for CompetencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrandScore {
    pub student_id: Uuid,
    pub learning_area: String,
    pub strand: String,
    pub level: Option<CompetencyLevel>,
    pub term: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningAreaResult {
    pub academic_year: String,
    pub term: String,
    pub learning_area: String,
    pub assessed_strands: usize,
    pub average: Option<f64>,
    pub overall: Option<CompetencyLevel>,
}

/// Averages the ordinal of every scored strand; unscored strands are
/// skipped. Returns `None` when nothing was scored.
pub fn average_level(scores: &[Option<CompetencyLevel>]) -> Option<f64> {
    let levels: Vec<u8> = scores.iter().flatten().map(|level| level.ordinal()).collect();
    if levels.is_empty() {
        return None;
    }
    let total: u32 = levels.iter().map(|value| *value as u32).sum();
    Some(total as f64 / levels.len() as f64)
}

pub fn overall_level(scores: &[Option<CompetencyLevel>]) -> Option<CompetencyLevel> {
    average_level(scores).map(CompetencyLevel::from_average)
}

/// One result per assessment (academic year and term) and learning area,
/// ordered by year, then term, then area.
pub fn summarize_learning_areas(scores: &[StrandScore]) -> Vec<LearningAreaResult> {
    let mut areas: BTreeMap<(&str, &str, &str), Vec<Option<CompetencyLevel>>> = BTreeMap::new();

    for score in scores {
        let key = (
            score.academic_year.as_str(),
            score.term.as_str(),
            score.learning_area.as_str(),
        );
        areas.entry(key).or_default().push(score.level);
    }

    areas
        .into_iter()
        .map(|((academic_year, term, learning_area), levels)| {
            let average = average_level(&levels);
            LearningAreaResult {
                academic_year: academic_year.to_string(),
                term: term.to_string(),
                learning_area: learning_area.to_string(),
                assessed_strands: levels.iter().flatten().count(),
                average,
                overall: average.map(CompetencyLevel::from_average),
            }
        })
        .collect()
}
