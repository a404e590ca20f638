//! Wire-level descriptions consumed and produced by the change service
//!
//! Inbound descriptions are deliberately loose: required fields are
//! options so validation can answer with the proper missing-argument
//! error instead of a decode failure. Everything derives minicbor so the
//! sync channel can move it as bytes.

use chrono::Utc;

use crate::element::{Decision, DecisionPolicy, Operation, Source};
use crate::timestamp::TimeStamp;
use crate::value::WireValue;

/// Inbound description of one proposed change.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct ChangeDescription {
    #[n(0)]
    pub operation: Option<Operation>,
    #[n(1)]
    pub entity_kind: Option<String>,
    /// Identifying map of the target instance, carrying at least `id`.
    /// Required iff operation is not INSERT.
    #[n(2)]
    pub instance_key: Option<WireValue>,
    #[n(3)]
    pub attributes: Vec<AttributeDescription>,
    #[n(4)]
    pub reason: Option<String>,
    #[n(5)]
    pub source: Option<Source>,
    #[n(6)]
    pub verification_ref: Option<String>,
    #[n(7)]
    pub requested_by: Option<String>,
}

impl ChangeDescription {
    fn new(entity_kind: &str, operation: Operation) -> Self {
        Self {
            operation: Some(operation),
            entity_kind: Some(entity_kind.to_string()),
            instance_key: None,
            attributes: Vec::new(),
            reason: None,
            source: None,
            verification_ref: None,
            requested_by: None,
        }
    }

    pub fn insert(entity_kind: &str) -> Self {
        Self::new(entity_kind, Operation::Insert)
    }

    pub fn update(entity_kind: &str, instance_id: &str) -> Self {
        Self::new(entity_kind, Operation::Update).with_instance_id(instance_id)
    }

    pub fn delete(entity_kind: &str, instance_id: &str) -> Self {
        Self::new(entity_kind, Operation::Delete).with_instance_id(instance_id)
    }

    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_key = Some(WireValue::Map(vec![(
            "id".to_string(),
            WireValue::Text(instance_id.to_string()),
        )]));
        self
    }

    pub fn with_attribute(mut self, name: &str, value: WireValue) -> Self {
        self.attributes.push(AttributeDescription {
            name: Some(name.to_string()),
            value,
        });
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_requested_by(mut self, actor: &str) -> Self {
        self.requested_by = Some(actor.to_string());
        self
    }

    /// Extract the instance id from the identifying map, if present.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_key
            .as_ref()
            .and_then(|key| key.entry("id"))
            .and_then(|v| match v {
                WireValue::Text(t) => Some(t.as_str()),
                _ => None,
            })
    }
}

/// Inbound description of one attribute value within a change.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AttributeDescription {
    #[n(0)]
    pub name: Option<String>,
    #[n(1)]
    pub value: WireValue,
}

/// Inbound description of one decision, submitted in batches.
///
/// `decision_ts` and `decided_by` are required only when the targeted
/// element's policy is EXTERNAL_APPROVE; for APPROVE the server assigns
/// both.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct DecisionDescription {
    #[n(0)]
    pub element_id: Option<String>,
    #[n(1)]
    pub decision: Option<Decision>,
    #[n(2)]
    pub decision_ts: Option<TimeStamp<Utc>>,
    #[n(3)]
    pub decided_by: Option<String>,
}

impl DecisionDescription {
    pub fn new(element_id: &str, decision: Decision) -> Self {
        Self {
            element_id: Some(element_id.to_string()),
            decision: Some(decision),
            decision_ts: None,
            decided_by: None,
        }
    }

    pub fn with_external_actor(mut self, decided_by: &str, decision_ts: TimeStamp<Utc>) -> Self {
        self.decided_by = Some(decided_by.to_string());
        self.decision_ts = Some(decision_ts);
        self
    }
}

/// Full outbound projection of a request tree, for display and export.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct ChangeRequestDto {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub policy: Option<DecisionPolicy>,
    #[n(2)]
    pub decision: Option<Decision>,
    #[n(3)]
    pub decision_ts: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub decided_by: Option<String>,
    #[n(5)]
    pub source: Source,
    #[n(6)]
    pub verification_ref: Option<String>,
    #[n(7)]
    pub operation: Operation,
    #[n(8)]
    pub entity_kind: String,
    #[n(9)]
    pub instance_key: Option<WireValue>,
    #[n(10)]
    pub attributes: Vec<AttributeDto>,
    #[n(11)]
    pub reason: Option<String>,
    #[n(12)]
    pub request_ts: TimeStamp<Utc>,
    #[n(13)]
    pub requested_by: Option<String>,
}

/// Outbound projection of one attribute, child requests included.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AttributeDto {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub policy: Option<DecisionPolicy>,
    #[n(2)]
    pub decision: Option<Decision>,
    #[n(3)]
    pub decision_ts: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub decided_by: Option<String>,
    #[n(5)]
    pub name: String,
    #[n(6)]
    pub value: WireValue,
    #[n(7)]
    pub children: Vec<ChangeRequestDto>,
}
