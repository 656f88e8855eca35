use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// One row of a class's hours-to-credits table: reaching `min_hours`
/// earns `credits`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditTier {
    pub min_hours: f64,
    pub credits: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum TierError {
    #[error("tier {index}: minHours must be a non-negative number")]
    BadThreshold { index: usize },
    #[error("tier {index}: credits must be a non-negative number")]
    BadCredits { index: usize },
    #[error("duplicate tier threshold {min_hours}")]
    DuplicateThreshold { min_hours: f64 },
    #[error("credits must not decrease as minHours rises (at {min_hours} hours)")]
    DecreasingCredits { min_hours: f64 },
}

/// Validates a tier table and returns it sorted by ascending threshold.
pub fn normalize_tiers(mut tiers: Vec<CreditTier>) -> Result<Vec<CreditTier>, TierError> {
    for (index, t) in tiers.iter().enumerate() {
        if !t.min_hours.is_finite() || t.min_hours < 0.0 {
            return Err(TierError::BadThreshold { index });
        }
        if !t.credits.is_finite() || t.credits < 0.0 {
            return Err(TierError::BadCredits { index });
        }
    }
    tiers.sort_by(|a, b| {
        a.min_hours
            .partial_cmp(&b.min_hours)
            .unwrap_or(Ordering::Equal)
    });
    for pair in tiers.windows(2) {
        if pair[0].min_hours == pair[1].min_hours {
            return Err(TierError::DuplicateThreshold {
                min_hours: pair[1].min_hours,
            });
        }
        if pair[1].credits < pair[0].credits {
            return Err(TierError::DecreasingCredits {
                min_hours: pair[1].min_hours,
            });
        }
    }
    Ok(tiers)
}

/// Highest tier whose threshold the hours reach; 0 when none does.
/// Accepts tiers in any order.
pub fn credits_for_hours(tiers: &[CreditTier], hours: f64) -> f64 {
    let mut sorted: Vec<&CreditTier> = tiers.iter().collect();
    sorted.sort_by(|a, b| {
        b.min_hours
            .partial_cmp(&a.min_hours)
            .unwrap_or(Ordering::Equal)
    });
    sorted
        .into_iter()
        .find(|t| hours >= t.min_hours)
        .map(|t| t.credits)
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Submitted,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "submitted" => Some(Self::Submitted),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Only the two verdicts a teacher can hand out.
    pub fn parse_verdict(s: &str) -> Option<Self> {
        match Self::parse(s) {
            Some(v @ (Self::Approved | Self::Rejected)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CepRequirement {
    pub min_hours: f64,
    pub deadline: Option<NaiveDate>,
    pub tiers: Vec<CreditTier>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CepProgress {
    pub total_hours: f64,
    pub approved_hours: f64,
    pub pending_hours: f64,
    pub min_hours: f64,
    pub remaining_hours: f64,
    pub requirement_met: bool,
    pub credits: f64,
    pub deadline: Option<String>,
    pub days_until_deadline: Option<i64>,
    pub overdue: bool,
}

/// Hours count toward the requirement unless the entry was rejected.
pub fn cep_progress<I>(entries: I, req: &CepRequirement, as_of: NaiveDate) -> CepProgress
where
    I: IntoIterator<Item = (f64, ReviewStatus)>,
{
    let mut total = 0.0;
    let mut approved = 0.0;
    let mut pending = 0.0;
    for (hours, status) in entries {
        match status {
            ReviewStatus::Rejected => {}
            ReviewStatus::Approved => {
                total += hours;
                approved += hours;
            }
            ReviewStatus::Pending | ReviewStatus::Submitted => {
                total += hours;
                pending += hours;
            }
        }
    }

    let total = round_hours(total);
    let requirement_met = total >= req.min_hours;
    let days_until_deadline = req.deadline.map(|d| (d - as_of).num_days());
    let overdue = !requirement_met && days_until_deadline.map(|d| d < 0).unwrap_or(false);

    CepProgress {
        total_hours: total,
        approved_hours: round_hours(approved),
        pending_hours: round_hours(pending),
        min_hours: req.min_hours,
        remaining_hours: round_hours((req.min_hours - total).max(0.0)),
        requirement_met,
        credits: credits_for_hours(&req.tiers, total),
        deadline: req.deadline.map(|d| d.format("%Y-%m-%d").to_string()),
        days_until_deadline,
        overdue,
    }
}

/// Two-decimal rounding applied to summed hours before they are reported.
pub fn round_hours(h: f64) -> f64 {
    (h * 100.0).round() / 100.0
}
