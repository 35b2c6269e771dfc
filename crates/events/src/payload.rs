//! Mapping from domain objects to the `data` section of an envelope.
//!
//! Each topic has a dedicated data struct so the wire shape is pinned down in
//! one place and clients can decode it back with `EventEnvelope::decode_data`.

use crate::topic::Topic;
use chrono::{DateTime, Utc};
use core_types::{
    Decision, DecisionAction, HealthStatus, Outcome, Proposal, ProposalStatus,
    RiskAssessment, Signal, SystemAlert, SystemStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A domain object that can be published on a topic.
pub trait EventPayload {
    const TOPIC: Topic;
    type Data: Serialize;

    /// Maps the object's fields into the envelope payload. `published_at` is
    /// used by topics whose payload is stamped at publish time.
    fn to_data(&self, published_at: DateTime<Utc>) -> Self::Data;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    pub id: Uuid,
    pub source: String,
    pub content: String,
    pub scores: BTreeMap<String, f64>,
    pub confidences: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload for Signal {
    const TOPIC: Topic = Topic::Signal;
    type Data = SignalData;

    fn to_data(&self, _published_at: DateTime<Utc>) -> SignalData {
        SignalData {
            id: self.id,
            source: self.source.clone(),
            content: self.content.clone(),
            scores: self.scores.clone(),
            confidences: self.confidences.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalData {
    pub id: Uuid,
    pub thesis: String,
    pub assets: Vec<String>,
    pub size_pct: Decimal,
    pub risk_score: Decimal,
    pub expected_return: Decimal,
    pub status: ProposalStatus,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload for Proposal {
    const TOPIC: Topic = Topic::Proposal;
    type Data = ProposalData;

    fn to_data(&self, _published_at: DateTime<Utc>) -> ProposalData {
        ProposalData {
            id: self.id,
            thesis: self.thesis.clone(),
            assets: self.assets.clone(),
            size_pct: self.size_pct,
            risk_score: self.risk_score,
            expected_return: self.expected_return,
            status: self.status,
            timestamp: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionData {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub action: DecisionAction,
    pub confidence: Decimal,
    pub size_adjustment: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload for Decision {
    const TOPIC: Topic = Topic::Decision;
    type Data = DecisionData;

    fn to_data(&self, _published_at: DateTime<Utc>) -> DecisionData {
        DecisionData {
            id: self.id,
            proposal_id: self.proposal_id,
            action: self.action,
            confidence: self.confidence,
            size_adjustment: self.size_adjustment,
            timestamp: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeData {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub return_pct: Decimal,
    pub sharpe_ratio: Decimal,
    pub max_drawdown: Decimal,
    pub win_rate: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload for Outcome {
    const TOPIC: Topic = Topic::Outcome;
    type Data = OutcomeData;

    fn to_data(&self, _published_at: DateTime<Utc>) -> OutcomeData {
        OutcomeData {
            id: self.id,
            proposal_id: self.proposal_id,
            return_pct: self.return_pct,
            sharpe_ratio: self.sharpe_ratio,
            max_drawdown: self.max_drawdown,
            win_rate: self.win_rate,
            timestamp: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskData {
    pub risk_score: Decimal,
    pub var: Decimal,
    pub cvar: Decimal,
    pub volatility: Decimal,
    pub correlation: Option<Decimal>,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload for RiskAssessment {
    const TOPIC: Topic = Topic::Risk;
    type Data = RiskData;

    fn to_data(&self, published_at: DateTime<Utc>) -> RiskData {
        RiskData {
            risk_score: self.risk_score,
            var: self.var,
            cvar: self.cvar,
            volatility: self.volatility,
            correlation: self.correlation,
            recommendations: self.recommendations.clone(),
            timestamp: published_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemData {
    pub health: HealthStatus,
    pub metrics: BTreeMap<String, f64>,
    pub alerts: Vec<SystemAlert>,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload for SystemStatus {
    const TOPIC: Topic = Topic::System;
    type Data = SystemData;

    fn to_data(&self, published_at: DateTime<Utc>) -> SystemData {
        SystemData {
            health: self.health,
            metrics: self.metrics.clone(),
            alerts: self.alerts.clone(),
            timestamp: published_at,
        }
    }
}
