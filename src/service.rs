//! The orchestrating change service
//!
//! [`ChangeService`] owns the whole lifecycle of a change request tree:
//! building records from inbound descriptions, assigning decision
//! policies, recording decisions, applying complete requests through the
//! per-entity strategies, and moving request trees and decisions over the
//! sync channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::catalog::{self, CatalogStore, ComponentChangeStrategy, WidgetChangeStrategy};
use crate::dto::{AttributeDto, ChangeDescription, ChangeRequestDto, DecisionDescription};
use crate::element::{
    Attribute, Decision, DecisionPolicy, DecisionState, Operation, Request, Source,
};
use crate::error::ChangeError;
use crate::ids;
use crate::policy::{DynamicConfig, MemoryConfig, PolicyResolver};
use crate::store::{ChangeStore, Record};
use crate::strategy::{self, ChangeStrategy};
use crate::sync::{NullSyncChannel, SyncChannel};
use crate::timestamp::TimeStamp;
use crate::value::WireValue;

/// Authorization collaborator consulted at request creation.
pub trait AccessControl: Send + Sync {
    /// Whether the acting user may bypass approval entirely.
    fn has_operator_scope(&self, actor: Option<&str>) -> bool;
}

/// Deny-all default: nobody holds operator scope.
pub struct NoAccessControl;

impl AccessControl for NoAccessControl {
    fn has_operator_scope(&self, _actor: Option<&str>) -> bool {
        false
    }
}

/// Context a nested request inherits from the attribute it nests under.
struct ParentCtx {
    attribute_id: String,
    source: Source,
    verification_ref: Option<String>,
    parent_operation: Operation,
    forced_accept: bool,
}

/// Records accumulated while building one request tree, persisted in a
/// single batch once the whole tree validated.
#[derive(Default)]
struct BuildOut {
    requests: Vec<Request>,
    attributes: Vec<Attribute>,
}

pub struct ChangeService {
    store: ChangeStore,
    catalog: CatalogStore,
    strategies: BTreeMap<&'static str, Arc<dyn ChangeStrategy>>,
    policies: PolicyResolver,
    access: Arc<dyn AccessControl>,
    sync: Arc<dyn SyncChannel>,
}

impl ChangeService {
    pub fn new(
        db: &sled::Db,
        config: Arc<dyn DynamicConfig>,
        sync: Arc<dyn SyncChannel>,
        access: Arc<dyn AccessControl>,
    ) -> anyhow::Result<Self> {
        let store = ChangeStore::open(db)?;
        let catalog = CatalogStore::open(db)?;

        let registered: Vec<Arc<dyn ChangeStrategy>> = vec![
            Arc::new(WidgetChangeStrategy::new(catalog.clone())),
            Arc::new(ComponentChangeStrategy::new(catalog.clone())),
        ];
        let mut strategies: BTreeMap<&'static str, Arc<dyn ChangeStrategy>> = BTreeMap::new();
        for strategy in registered {
            let kind = strategy.entity_kind();
            if strategies.insert(kind, strategy).is_some() {
                anyhow::bail!("duplicate change strategy for entity kind {kind}");
            }
        }
        // fail fast if a declared attribute has no codec mapping
        for strategy in strategies.values() {
            for name in strategy.attribute_names() {
                strategy.resolve_value_codec(name)?;
            }
        }

        Ok(Self {
            store,
            catalog,
            strategies,
            policies: PolicyResolver::new(config),
            access,
            sync,
        })
    }

    /// Open with in-memory configuration, no sync channel and no operator
    /// scopes.
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Self::new(
            db,
            Arc::new(MemoryConfig::new()),
            Arc::new(NullSyncChannel),
            Arc::new(NoAccessControl),
        )
    }

    pub fn policies(&self) -> &PolicyResolver {
        &self.policies
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn store(&self) -> &ChangeStore {
        &self.store
    }

    fn strategy(&self, entity_kind: &str) -> Result<&Arc<dyn ChangeStrategy>, ChangeError> {
        self.strategies
            .get(entity_kind)
            .ok_or_else(|| ChangeError::UnknownEntityKind(entity_kind.to_string()))
    }

    /// Build, persist and (where already complete) apply a request tree
    /// from one inbound description, then hand it to the sync channel.
    pub fn create_request(&self, description: &ChangeDescription) -> anyhow::Result<Request> {
        let mut out = BuildOut::default();
        let root_id = self.build_request(description, None, &mut out)?;
        self.store.save_all(&out.requests, &out.attributes)?;

        self.apply_branch(&root_id, true)?;

        let dto = self.request_dto(&root_id)?;
        match self.sync.export_request(&dto) {
            Ok(()) => {
                let mut request = self.store.require_request(&root_id)?;
                request.export_ts = Some(TimeStamp::now());
                self.store.save_request(&request)?;
            }
            Err(err) => {
                // the request stands either way; a later export can retry
                tracing::error!(request_id = %root_id, error = %err, "export over sync channel failed");
            }
        }

        self.store.require_request(&root_id)
    }

    /// Diff a verification snapshot against the live instance and submit
    /// the resulting description.
    pub fn create_request_from_verification(
        &self,
        verification_id: &str,
    ) -> anyhow::Result<Request> {
        let snapshot = self.catalog.require_verification(verification_id)?;
        let widget = match snapshot.widget_id.as_deref() {
            Some(id) => self.catalog.widget(id)?,
            None => None,
        };
        let components = match &widget {
            Some(widget) => self.catalog.active_components(widget)?,
            None => Vec::new(),
        };
        let description =
            catalog::description_from_verification(&snapshot, widget.as_ref(), &components);
        self.create_request(&description)
    }

    fn build_request(
        &self,
        description: &ChangeDescription,
        parent: Option<ParentCtx>,
        out: &mut BuildOut,
    ) -> anyhow::Result<String> {
        let operation = description
            .operation
            .ok_or_else(|| ChangeError::missing("ChangeDescription.operation"))?;
        let entity_kind = description
            .entity_kind
            .as_deref()
            .ok_or_else(|| ChangeError::missing("ChangeDescription.entity_kind"))?;
        let strategy = self.strategy(entity_kind)?.clone();

        let (source, verification_ref, forced_accept) = match &parent {
            Some(ctx) => {
                if ctx.parent_operation == Operation::Insert && operation != Operation::Insert {
                    return Err(ChangeError::InvalidArgument(
                        "an INSERT request can only nest INSERT children".to_string(),
                    )
                    .into());
                }
                (ctx.source, ctx.verification_ref.clone(), ctx.forced_accept)
            }
            None => {
                let source = description.source.unwrap_or(Source::Ui);
                let verification_ref = if source == Source::Verification {
                    let id = description
                        .verification_ref
                        .clone()
                        .ok_or_else(|| ChangeError::missing("ChangeDescription.verification_ref"))?;
                    self.catalog.require_verification(&id)?;
                    Some(id)
                } else {
                    if description.verification_ref.is_some() {
                        tracing::warn!(
                            entity_kind,
                            "ignoring verification reference on a non-verification change"
                        );
                    }
                    None
                };
                let forced_accept = source == Source::Verification
                    || self.policies.auto_accept_enabled()
                    || self
                        .access
                        .has_operator_scope(description.requested_by.as_deref());
                (source, verification_ref, forced_accept)
            }
        };

        let instance_id = match operation {
            Operation::Insert => {
                if description.instance_key.is_some() {
                    tracing::warn!(entity_kind, "ignoring instance key on an INSERT change");
                }
                None
            }
            Operation::Update | Operation::Delete => Some(
                description
                    .instance_id()
                    .ok_or_else(|| ChangeError::missing("ChangeDescription.instance_key.id"))?,
            ),
        };

        let mut request = strategy.create_request(operation, instance_id)?;
        request.parent_attribute = parent.as_ref().map(|ctx| ctx.attribute_id.clone());
        request.source = source;
        request.verification_ref = verification_ref.clone();
        request.reason = description.reason.clone();
        request.requested_by = description.requested_by.clone();

        // INSERT and DELETE are decided as a whole; UPDATE is decided per
        // attribute and the request record itself never waits
        if operation != Operation::Update {
            let policy = self.policies.policy_for(entity_kind, operation, None)?;
            assign_policy(&mut request.state, policy, forced_accept);
        }

        if operation == Operation::Delete && !description.attributes.is_empty() {
            tracing::warn!(entity_kind, "ignoring attribute values on a DELETE change");
        } else {
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            for attribute_description in &description.attributes {
                let name = attribute_description
                    .name
                    .as_deref()
                    .ok_or_else(|| ChangeError::missing("AttributeDescription.name"))?;
                if !seen.insert(name) {
                    return Err(ChangeError::InvalidArgument(format!(
                        "duplicate attribute in change description: {name}"
                    ))
                    .into());
                }
                let codec = strategy.resolve_value_codec(name)?;

                let mut attribute =
                    Attribute::new(ids::new_id(ids::ATTRIBUTE_HRP)?, &request.id, name);

                if codec.is_children() {
                    match &attribute_description.value {
                        WireValue::Requests(children) => {
                            for child in children {
                                let ctx = ParentCtx {
                                    attribute_id: attribute.id.clone(),
                                    source,
                                    verification_ref: verification_ref.clone(),
                                    parent_operation: operation,
                                    forced_accept,
                                };
                                let child_id = self.build_request(child, Some(ctx), out)?;
                                attribute.child_requests.push(child_id);
                            }
                        }
                        WireValue::Null => {}
                        other => {
                            return Err(ChangeError::InvalidWireFormat(format!(
                                "{entity_kind}.{name} expects nested change descriptions, got {other:?}"
                            ))
                            .into());
                        }
                    }
                } else {
                    let typed = codec.from_wire(&attribute_description.value)?;
                    attribute.stored_value = codec.to_storage(typed.as_ref());

                    if operation == Operation::Update {
                        let policy =
                            self.policies.policy_for(entity_kind, operation, Some(name))?;
                        assign_policy(&mut attribute.state, policy, forced_accept);
                    }
                }

                request.attributes.push(attribute.id.clone());
                out.attributes.push(attribute);
            }
        }

        let id = request.id.clone();
        out.requests.push(request);
        Ok(id)
    }

    /// Record a batch of decisions, then apply every touched request that
    /// became complete. Individual failures are collected; a partially
    /// failed batch records what it can but applies nothing.
    pub fn record_decisions(
        &self,
        decisions: &[DecisionDescription],
        actor: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut failed = 0usize;

        for decision in decisions {
            match self.record_decision(decision, actor) {
                Ok(request_id) => {
                    touched.insert(request_id);
                }
                Err(err) => {
                    failed += 1;
                    tracing::error!(
                        element_id = decision.element_id.as_deref().unwrap_or("<missing>"),
                        error = %err,
                        "failed to record decision"
                    );
                }
            }
        }

        if failed > 0 {
            return Err(ChangeError::DecisionBatch {
                failed,
                total: decisions.len(),
            }
            .into());
        }

        for request_id in touched {
            self.apply_branch(&request_id, true)?;
        }
        Ok(())
    }

    fn record_decision(
        &self,
        description: &DecisionDescription,
        actor: Option<&str>,
    ) -> anyhow::Result<String> {
        let element_id = description
            .element_id
            .as_deref()
            .ok_or_else(|| ChangeError::missing("DecisionDescription.element_id"))?;
        let decision = description
            .decision
            .ok_or_else(|| ChangeError::missing("DecisionDescription.decision"))?;

        let record = self
            .store
            .element(element_id)?
            .ok_or_else(|| ChangeError::MissingInstance(element_id.to_string()))?;

        match record {
            Record::Request(mut request) => {
                record_on_state(&mut request.state, element_id, decision, description, actor)?;
                self.store.save_request(&request)?;
                Ok(request.id)
            }
            Record::Attribute(mut attribute) => {
                record_on_state(&mut attribute.state, element_id, decision, description, actor)?;
                self.store.save_attribute(&attribute)?;
                Ok(attribute.request_id)
            }
        }
    }

    /// Apply one request immediately. Fails when the request still has
    /// undecided elements.
    pub fn apply_request(&self, request_id: &str) -> anyhow::Result<()> {
        if !self.is_all_decisions_made(request_id)? {
            return Err(ChangeError::IncompleteDecision(request_id.to_string()).into());
        }
        self.apply_branch(request_id, true)
    }

    /// True once the request and each of its direct attributes either
    /// carries a decision or never needed one.
    pub fn is_all_decisions_made(&self, request_id: &str) -> anyhow::Result<bool> {
        let request = self.store.require_request(request_id)?;
        let attributes = self.store.attributes_of(&request)?;
        Ok(is_complete(&request, &attributes))
    }

    /// Apply the request if complete, then walk its children. Children
    /// always get their chance regardless of the parent's state; a nested
    /// failure is logged, only the root's failure propagates.
    fn apply_branch(&self, request_id: &str, root: bool) -> anyhow::Result<()> {
        if let Err(err) = self.apply_if_complete(request_id) {
            if root {
                return Err(err);
            }
            tracing::error!(request_id, error = %err, "nested change request apply failed");
        }

        let request = self.store.require_request(request_id)?;
        for attribute in self.store.attributes_of(&request)? {
            for child_id in &attribute.child_requests {
                self.apply_branch(child_id, false)?;
            }
        }
        Ok(())
    }

    fn apply_if_complete(&self, request_id: &str) -> anyhow::Result<()> {
        let mut request = self.store.require_request(request_id)?;
        let mut attributes = self.store.attributes_of(&request)?;
        if !is_complete(&request, &attributes) {
            return Ok(());
        }
        let strategy = self.strategy(&request.entity_kind)?.clone();

        let applied_before = request.state.apply_ts.is_some();
        strategy::apply_decisions(strategy.as_ref(), &self.store, &mut request, &mut attributes)?;

        // persist only a fresh apply; on a no-op our copy may be stale
        if !applied_before && request.state.apply_ts.is_some() {
            self.store.save_all(&[request], &attributes)?;
        }
        Ok(())
    }

    /// Project a request tree into its outbound DTO form.
    pub fn request_dto(&self, request_id: &str) -> anyhow::Result<ChangeRequestDto> {
        let request = self.store.require_request(request_id)?;
        self.map_request(&request)
    }

    fn map_request(&self, request: &Request) -> anyhow::Result<ChangeRequestDto> {
        let strategy = self.strategy(&request.entity_kind)?;

        let mut attributes = Vec::new();
        for attribute in self.store.attributes_of(request)? {
            let codec = strategy.resolve_value_codec(&attribute.name)?;
            let (value, children) = if codec.is_children() {
                let mut children = Vec::new();
                for child_id in &attribute.child_requests {
                    let child = self.store.require_request(child_id)?;
                    children.push(self.map_request(&child)?);
                }
                (WireValue::Null, children)
            } else {
                let typed = codec.from_storage(attribute.stored_value.as_deref())?;
                (codec.to_wire(typed.as_ref()), Vec::new())
            };

            attributes.push(AttributeDto {
                id: attribute.id.clone(),
                policy: attribute.state.policy,
                decision: attribute.state.decision,
                decision_ts: attribute.state.decision_ts.clone(),
                decided_by: attribute.state.decided_by.clone(),
                name: attribute.name.clone(),
                value,
                children,
            });
        }

        Ok(ChangeRequestDto {
            id: request.id.clone(),
            policy: request.state.policy,
            decision: request.state.decision,
            decision_ts: request.state.decision_ts.clone(),
            decided_by: request.state.decided_by.clone(),
            source: request.source,
            verification_ref: request.verification_ref.clone(),
            operation: request.operation,
            entity_kind: request.entity_kind.clone(),
            instance_key: strategy.map_instance_key(request)?,
            attributes,
            reason: request.reason.clone(),
            request_ts: request.request_ts.clone(),
            requested_by: request.requested_by.clone(),
        })
    }

    /// Drain the sync channel and record whatever decisions arrived.
    /// Returns how many were imported.
    pub fn run_import_cycle(&self) -> anyhow::Result<usize> {
        let decisions = self.sync.import_decisions()?;
        let count = decisions.len();
        if !decisions.is_empty() {
            self.record_decisions(&decisions, None)?;
        }
        Ok(count)
    }
}

fn is_complete(request: &Request, attributes: &[Attribute]) -> bool {
    !request.state.is_pending() && attributes.iter().all(|a| !a.state.is_pending())
}

fn assign_policy(state: &mut DecisionState, policy: DecisionPolicy, forced_accept: bool) {
    // forced acceptance overrides whatever is configured, DENY included
    let policy = if forced_accept {
        DecisionPolicy::Accept
    } else {
        policy
    };
    state.policy = Some(policy);
    match policy {
        DecisionPolicy::Accept => state.resolve(Decision::Accepted),
        DecisionPolicy::Deny => state.resolve(Decision::Denied),
        DecisionPolicy::Approve | DecisionPolicy::ExternalApprove => {}
    }
}

fn record_on_state(
    state: &mut DecisionState,
    element_id: &str,
    decision: Decision,
    description: &DecisionDescription,
    actor: Option<&str>,
) -> Result<(), ChangeError> {
    if state.decision.is_some() {
        return Err(ChangeError::DecisionAlreadySet(element_id.to_string()));
    }
    match state.policy {
        Some(DecisionPolicy::Approve) => {
            let actor = actor.ok_or_else(|| ChangeError::missing("deciding actor"))?;
            state.decision = Some(decision);
            state.decision_ts = Some(TimeStamp::now());
            state.decided_by = Some(actor.to_string());
        }
        Some(DecisionPolicy::ExternalApprove) => {
            let decided_by = description
                .decided_by
                .clone()
                .ok_or_else(|| ChangeError::missing("DecisionDescription.decided_by"))?;
            let decision_ts = description
                .decision_ts
                .clone()
                .ok_or_else(|| ChangeError::missing("DecisionDescription.decision_ts"))?;
            state.decision = Some(decision);
            state.decision_ts = Some(decision_ts);
            state.decided_by = Some(decided_by);
        }
        _ => return Err(ChangeError::DecisionNotPermitted(element_id.to_string())),
    }
    Ok(())
}
