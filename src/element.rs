//! Data model for change requests and their attributes
//!
//! A [`Request`] proposes one insert/update/delete of one domain instance
//! and owns a set of [`Attribute`] records. An attribute whose value is a
//! child-request list owns further requests, forming a tree. Ownership is
//! arena-style: records reference each other by id string and live in the
//! [`crate::store::ChangeStore`], never as cyclic in-memory links.

use chrono::Utc;

use crate::timestamp::TimeStamp;

/// The kind of change a request proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
pub enum Operation {
    #[n(0)]
    Insert,
    #[n(1)]
    Update,
    #[n(2)]
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Source {
    #[n(0)]
    Ui,
    #[n(1)]
    Verification,
}

/// How the decision for a change element is reached.
///
/// `Accept` and `Deny` resolve at creation time. `Approve` waits for an
/// internal actor, `ExternalApprove` for a decision relayed through the
/// sync channel together with its own actor and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum DecisionPolicy {
    #[n(0)]
    Accept,
    #[n(1)]
    Deny,
    #[n(2)]
    Approve,
    #[n(3)]
    ExternalApprove,
}

impl DecisionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionPolicy::Accept => "ACCEPT",
            DecisionPolicy::Deny => "DENY",
            DecisionPolicy::Approve => "APPROVE",
            DecisionPolicy::ExternalApprove => "EXTERNAL_APPROVE",
        }
    }
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "ACCEPT" => Some(DecisionPolicy::Accept),
            "DENY" => Some(DecisionPolicy::Deny),
            "APPROVE" => Some(DecisionPolicy::Approve),
            "EXTERNAL_APPROVE" => Some(DecisionPolicy::ExternalApprove),
            _ => None,
        }
    }
}

/// The recorded outcome for a change element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Decision {
    #[n(0)]
    Accepted,
    #[n(1)]
    Denied,
}

/// The decision-bearing fields shared by requests and attributes.
///
/// Invariant: `decision` is only ever set after `policy`; `apply_ts` is
/// set at most once and the element is immutable for apply purposes from
/// then on.
#[derive(Debug, Clone, Default, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct DecisionState {
    #[n(0)]
    pub policy: Option<DecisionPolicy>,
    #[n(1)]
    pub decision: Option<Decision>,
    #[n(2)]
    pub decision_ts: Option<TimeStamp<Utc>>,
    #[n(3)]
    pub decided_by: Option<String>,
    #[n(4)]
    pub apply_ts: Option<TimeStamp<Utc>>,
}

impl DecisionState {
    /// True when a policy was assigned but no decision recorded yet.
    pub fn is_pending(&self) -> bool {
        self.policy.is_some() && self.decision.is_none()
    }

    /// Resolve the element immediately, as done at creation time for
    /// `Accept` and `Deny` policies.
    pub fn resolve(&mut self, decision: Decision) {
        self.decision = Some(decision);
        self.decision_ts = Some(TimeStamp::now());
    }
}

/// One proposed insert/update/delete of one domain instance.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct Request {
    #[n(0)]
    pub id: String,
    // back-reference to the attribute this request nests under, if any
    #[n(1)]
    pub parent_attribute: Option<String>,
    #[n(2)]
    pub source: Source,
    // required iff source == Verification
    #[n(3)]
    pub verification_ref: Option<String>,
    #[n(4)]
    pub operation: Operation,
    // discriminator, immutable after creation
    #[n(5)]
    pub entity_kind: String,
    // absent before an INSERT has been applied
    #[n(6)]
    pub instance_id: Option<String>,
    // owned attribute ids in creation order
    #[n(7)]
    pub attributes: Vec<String>,
    #[n(8)]
    pub reason: Option<String>,
    #[n(9)]
    pub request_ts: TimeStamp<Utc>,
    #[n(10)]
    pub requested_by: Option<String>,
    // set once handed to the sync channel; only meaningful for roots
    #[n(11)]
    pub export_ts: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub state: DecisionState,
    // set when a claimed apply failed mid-mutation; the claim itself is
    // terminal, so this is what distinguishes applied from stranded
    #[n(13)]
    pub apply_error: Option<String>,
}

impl Request {
    pub fn new(id: String, entity_kind: &str, operation: Operation) -> Self {
        Self {
            id,
            parent_attribute: None,
            source: Source::Ui,
            verification_ref: None,
            operation,
            entity_kind: entity_kind.to_string(),
            instance_id: None,
            attributes: Vec::new(),
            reason: None,
            request_ts: TimeStamp::now(),
            requested_by: None,
            export_ts: None,
            state: DecisionState::default(),
            apply_error: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_attribute.is_none()
    }
}

/// One named field-level value within a request.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct Attribute {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_id: String,
    // unique within the owning request
    #[n(2)]
    pub name: String,
    // durable string form; unused for child-request-list attributes
    #[n(3)]
    pub stored_value: Option<String>,
    // owned child request ids; nonempty only for child-request-list attributes
    #[n(4)]
    pub child_requests: Vec<String>,
    #[n(5)]
    pub state: DecisionState,
}

impl Attribute {
    pub fn new(id: String, request_id: &str, name: &str) -> Self {
        Self {
            id,
            request_id: request_id.to_string(),
            name: name.to_string(),
            stored_value: None,
            child_requests: Vec::new(),
            state: DecisionState::default(),
        }
    }
}
