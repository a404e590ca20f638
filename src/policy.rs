//! Decision policy configuration and resolution
//!
//! Policies live in a string-keyed dynamic configuration store under the
//! `decision_policy.` namespace:
//!
//! ```text
//! decision_policy.<entity>.operation.<INSERT|UPDATE|DELETE> = <policy>
//! decision_policy.<entity>.attribute.<name>                 = <policy>
//! ```
//!
//! The resolver interprets that configuration through an immutable
//! [`PolicySnapshot`] which is rebuilt as a whole and swapped behind one
//! reference, so lookups never observe a half-reloaded state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::element::{DecisionPolicy, Operation};
use crate::error::ChangeError;

const POLICY_KEY_PREFIX: &str = "decision_policy.";
const AUTO_ACCEPT_KEY: &str = "change_request.auto_accept";

/// String-keyed dynamic configuration collaborator.
pub trait DynamicConfig: Send + Sync {
    fn keys(&self) -> Vec<String>;
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory configuration store.
#[derive(Default)]
pub struct MemoryConfig {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DynamicConfig for MemoryConfig {
    fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }
    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

/// Configured policies for one entity kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPolicies {
    pub operations: BTreeMap<Operation, DecisionPolicy>,
    pub attributes: BTreeMap<String, DecisionPolicy>,
}

/// Immutable view of the whole policy configuration.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub auto_accept: bool,
    pub entities: BTreeMap<String, EntityPolicies>,
}

pub struct PolicyResolver {
    config: Arc<dyn DynamicConfig>,
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyResolver {
    pub fn new(config: Arc<dyn DynamicConfig>) -> Self {
        let resolver = Self {
            config,
            snapshot: RwLock::new(Arc::new(PolicySnapshot::default())),
        };
        resolver.reload();
        resolver
    }

    /// Rebuild the snapshot from the configuration store and swap it in.
    /// Keys that do not parse are skipped.
    pub fn reload(&self) {
        let mut entities: BTreeMap<String, EntityPolicies> = BTreeMap::new();

        for key in self.config.keys() {
            let Some(rest) = key.strip_prefix(POLICY_KEY_PREFIX) else {
                continue;
            };
            let Some(value) = self.config.get(&key) else {
                continue;
            };
            let Some(policy) = DecisionPolicy::parse(&value) else {
                tracing::trace!(%key, %value, "skipping malformed decision policy value");
                continue;
            };

            let mut parts = rest.splitn(3, '.');
            let (Some(entity), Some(scope), Some(name)) =
                (parts.next(), parts.next(), parts.next())
            else {
                tracing::trace!(%key, "skipping malformed decision policy key");
                continue;
            };

            let policies = entities.entry(entity.to_string()).or_default();
            match scope {
                "operation" => {
                    if let Some(operation) = Operation::parse(name) {
                        policies.operations.insert(operation, policy);
                    } else {
                        tracing::trace!(%key, "skipping unknown operation in policy key");
                    }
                }
                "attribute" => {
                    policies.attributes.insert(name.to_string(), policy);
                }
                _ => {
                    tracing::trace!(%key, "skipping unknown scope in policy key");
                }
            }
        }

        let auto_accept = self
            .config
            .get(AUTO_ACCEPT_KEY)
            .map(|v| v == "true")
            .unwrap_or(false);

        let snapshot = Arc::new(PolicySnapshot {
            auto_accept,
            entities,
        });
        *self.snapshot.write().unwrap() = snapshot;
    }

    /// Current configuration view. The returned snapshot is immutable and
    /// stays coherent even if a reload happens concurrently.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Whether every new change element should resolve to ACCEPT
    /// regardless of configured policy.
    pub fn auto_accept_enabled(&self) -> bool {
        self.snapshot().auto_accept
    }

    pub fn set_auto_accept(&self, enabled: bool) {
        if enabled {
            self.config.set(AUTO_ACCEPT_KEY, "true");
        } else {
            self.config.remove(AUTO_ACCEPT_KEY);
        }
        self.reload();
    }

    fn check_scope(operation: Operation, attribute: Option<&str>) -> Result<(), ChangeError> {
        match operation {
            Operation::Insert | Operation::Delete => {
                if attribute.is_some() {
                    return Err(ChangeError::InvalidArgument(format!(
                        "decision policy for {} is request-scoped, not attribute-scoped",
                        operation.as_str()
                    )));
                }
            }
            Operation::Update => {
                if attribute.is_none() {
                    return Err(ChangeError::InvalidArgument(
                        "decision policy for UPDATE is attribute-scoped only".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Resolve the configured policy for a request (INSERT/DELETE) or an
    /// attribute (UPDATE). Unconfigured combinations default to ACCEPT;
    /// an UPDATE attribute without its own override falls back to the
    /// entity's UPDATE operation policy first.
    pub fn policy_for(
        &self,
        entity_kind: &str,
        operation: Operation,
        attribute: Option<&str>,
    ) -> Result<DecisionPolicy, ChangeError> {
        Self::check_scope(operation, attribute)?;

        let snapshot = self.snapshot();
        let Some(policies) = snapshot.entities.get(entity_kind) else {
            return Ok(DecisionPolicy::Accept);
        };

        let policy = match operation {
            Operation::Insert | Operation::Delete => policies.operations.get(&operation).copied(),
            // scope check above guarantees the attribute name is present
            Operation::Update => attribute.and_then(|name| {
                policies
                    .attributes
                    .get(name)
                    .copied()
                    .or_else(|| policies.operations.get(&Operation::Update).copied())
            }),
        };
        Ok(policy.unwrap_or(DecisionPolicy::Accept))
    }

    /// Set or remove one configured policy. Passing `None` removes the
    /// override. Attribute policy always implies UPDATE.
    ///
    /// Unlike lookups, configuration may target the UPDATE operation
    /// without an attribute: that key is the fallback for attributes
    /// carrying no override of their own.
    pub fn set_policy(
        &self,
        entity_kind: &str,
        operation: Operation,
        attribute: Option<&str>,
        policy: Option<DecisionPolicy>,
    ) -> Result<(), ChangeError> {
        if attribute.is_some() && operation != Operation::Update {
            return Err(ChangeError::InvalidArgument(format!(
                "decision policy for {} is request-scoped, not attribute-scoped",
                operation.as_str()
            )));
        }

        let key = match attribute {
            Some(name) => format!("{POLICY_KEY_PREFIX}{entity_kind}.attribute.{name}"),
            None => format!(
                "{POLICY_KEY_PREFIX}{entity_kind}.operation.{}",
                operation.as_str()
            ),
        };
        match policy {
            Some(policy) => self.config.set(&key, policy.as_str()),
            None => self.config.remove(&key),
        }
        self.reload();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PolicyResolver {
        PolicyResolver::new(Arc::new(MemoryConfig::new()))
    }

    #[test]
    fn unconfigured_policy_defaults_to_accept() {
        let resolver = resolver();
        let policy = resolver
            .policy_for("Widget", Operation::Insert, None)
            .unwrap();
        assert_eq!(policy, DecisionPolicy::Accept);
    }

    #[test]
    fn attribute_scope_for_insert_is_rejected() {
        let resolver = resolver();
        let err = resolver
            .policy_for("Widget", Operation::Insert, Some("name"))
            .unwrap_err();
        assert!(matches!(err, ChangeError::InvalidArgument(_)));
    }

    #[test]
    fn request_scope_for_update_is_rejected() {
        let resolver = resolver();
        let err = resolver.policy_for("Widget", Operation::Update, None).unwrap_err();
        assert!(matches!(err, ChangeError::InvalidArgument(_)));
    }

    #[test]
    fn attribute_policy_falls_back_to_update_operation_policy() {
        let resolver = resolver();
        resolver
            .set_policy("Widget", Operation::Update, None, Some(DecisionPolicy::Approve))
            .unwrap();
        resolver
            .set_policy(
                "Widget",
                Operation::Update,
                Some("color"),
                Some(DecisionPolicy::ExternalApprove),
            )
            .unwrap();

        let color = resolver
            .policy_for("Widget", Operation::Update, Some("color"))
            .unwrap();
        let note = resolver
            .policy_for("Widget", Operation::Update, Some("note"))
            .unwrap();

        assert_eq!(color, DecisionPolicy::ExternalApprove);
        assert_eq!(note, DecisionPolicy::Approve);
    }

    #[test]
    fn update_operation_key_is_configurable_but_not_queryable() {
        let resolver = resolver();
        resolver
            .set_policy("Widget", Operation::Update, None, Some(DecisionPolicy::Approve))
            .unwrap();

        // the fallback key feeds attribute lookups only; a request-scoped
        // UPDATE query is still out of scope
        let err = resolver.policy_for("Widget", Operation::Update, None).unwrap_err();
        assert!(matches!(err, ChangeError::InvalidArgument(_)));
        assert_eq!(
            resolver
                .policy_for("Widget", Operation::Update, Some("note"))
                .unwrap(),
            DecisionPolicy::Approve
        );
    }

    #[test]
    fn removing_an_override_restores_the_default() {
        let resolver = resolver();
        resolver
            .set_policy("Widget", Operation::Delete, None, Some(DecisionPolicy::Deny))
            .unwrap();
        assert_eq!(
            resolver.policy_for("Widget", Operation::Delete, None).unwrap(),
            DecisionPolicy::Deny
        );

        resolver
            .set_policy("Widget", Operation::Delete, None, None)
            .unwrap();
        assert_eq!(
            resolver.policy_for("Widget", Operation::Delete, None).unwrap(),
            DecisionPolicy::Accept
        );
    }

    #[test]
    fn snapshot_exposes_all_configured_policies() {
        let resolver = resolver();
        resolver
            .set_policy("Widget", Operation::Insert, None, Some(DecisionPolicy::Approve))
            .unwrap();

        let snapshot = resolver.snapshot();
        let widget = snapshot.entities.get("Widget").unwrap();
        assert_eq!(
            widget.operations.get(&Operation::Insert),
            Some(&DecisionPolicy::Approve)
        );
    }
}
