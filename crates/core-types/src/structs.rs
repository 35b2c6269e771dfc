use crate::enums::{AlertLevel, DecisionAction, HealthStatus, ProposalStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A raw market or news signal scored by the ingestion stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    /// Where the signal came from (e.g. "news", "social").
    pub source: String,
    pub content: String,
    /// Model scores keyed by dimension (sentiment, relevance, ...).
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub confidences: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

/// A sized trade idea derived from one or more signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub thesis: String,
    pub assets: Vec<String>,
    /// Fraction of the portfolio to allocate (0.05 = 5%).
    pub size_pct: Decimal,
    pub risk_score: Decimal,
    pub expected_return: Decimal,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

/// The verdict on a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub action: DecisionAction,
    pub confidence: Decimal,
    /// Multiplier applied to the proposal size, when the action resizes it.
    #[serde(default)]
    pub size_adjustment: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Realised performance of an executed proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub return_pct: Decimal,
    pub sharpe_ratio: Decimal,
    pub max_drawdown: Decimal,
    pub win_rate: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A portfolio-level risk snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: Decimal,
    /// Value at risk.
    pub var: Decimal,
    /// Conditional value at risk (expected shortfall).
    pub cvar: Decimal,
    pub volatility: Decimal,
    #[serde(default)]
    pub correlation: Option<Decimal>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl RiskAssessment {
    /// Risk scores above this are flagged to operators.
    pub const HIGH_RISK_THRESHOLD: Decimal = Decimal::from_parts(8, 0, 0, false, 1);

    pub fn is_high_risk(&self) -> bool {
        self.risk_score > Self::HIGH_RISK_THRESHOLD
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub level: AlertLevel,
    pub message: String,
}

/// Backend health notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub health: HealthStatus,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub alerts: Vec<SystemAlert>,
}

impl SystemStatus {
    /// The most severe alert, if any.
    pub fn worst_alert(&self) -> Option<&SystemAlert> {
        self.alerts.iter().max_by_key(|a| a.level)
    }
}
