//! Deterministic signature-period identities.
//!
//! A period id is `{schoolYearId}_{periodType}`. The same inputs always yield
//! the same id and distinct inputs never collide, which replaces "does this
//! timestamp fall in a date range" matching. Wall-clock matching breaks under
//! clock skew, backfilled data and writers racing near period boundaries.

use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodType {
    Sem1,
    Sem2,
    EndOfYear,
}

impl PeriodType {
    pub fn token(self) -> &'static str {
        match self {
            PeriodType::Sem1 => "sem1",
            PeriodType::Sem2 => "sem2",
            PeriodType::EndOfYear => "end_of_year",
        }
    }

    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "sem1" => Some(PeriodType::Sem1),
            "sem2" => Some(PeriodType::Sem2),
            "end_of_year" => Some(PeriodType::EndOfYear),
            _ => None,
        }
    }

    // Longest token first so `_end_of_year` is never misread through a
    // shorter suffix.
    const LONGEST_FIRST: [PeriodType; 3] = [PeriodType::EndOfYear, PeriodType::Sem1, PeriodType::Sem2];
}

pub fn compute(school_year_id: &str, period: PeriodType) -> Result<String, WorkflowError> {
    if school_year_id.is_empty() {
        return Err(WorkflowError::InvalidArgument(
            "school year id must not be empty".into(),
        ));
    }
    Ok(format!("{}_{}", school_year_id, period.token()))
}

/// Inverse of [`compute`]. A school-year id containing `_` is not escaped;
/// this is sound only because the period tokens are fixed and cannot recur
/// inside a valid id's tail.
pub fn parse(id: &str) -> Option<(String, PeriodType)> {
    for period in PeriodType::LONGEST_FIRST {
        let suffix = format!("_{}", period.token());
        if let Some(prefix) = id.strip_suffix(suffix.as_str()) {
            if !prefix.is_empty() {
                return Some((prefix.to_string(), period));
            }
        }
    }
    None
}
