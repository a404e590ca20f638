//! Per-entity apply strategies and the shared apply algorithm
//!
//! One [`ChangeStrategy`] implementation exists per entity kind. The
//! strategy owns everything entity-specific: materializing a request
//! skeleton, the name-to-codec attribute map, pre-apply validation, and
//! the insert/update/delete writes. [`apply_decisions`] is the shared,
//! entity-agnostic state machine every strategy runs under.

use crate::element::{Attribute, Decision, Operation, Request};
use crate::error::ChangeError;
use crate::store::ChangeStore;
use crate::timestamp::TimeStamp;
use crate::value::{ValueCodec, WireValue};

pub trait ChangeStrategy: Send + Sync {
    /// Discriminator this strategy answers for, e.g. `"Widget"`.
    fn entity_kind(&self) -> &'static str;

    /// The entity's declared attribute set. Checked against
    /// [`Self::resolve_value_codec`] at service startup so a missing codec
    /// mapping fails fast instead of on first use.
    fn attribute_names(&self) -> &'static [&'static str];

    /// Build an empty request skeleton. When `instance_id` is given the
    /// current instance is loaded (or the call fails) and recorded on the
    /// request.
    fn create_request(
        &self,
        operation: Operation,
        instance_id: Option<&str>,
    ) -> anyhow::Result<Request>;

    /// Map a known attribute name to its value codec.
    fn resolve_value_codec(&self, attribute_name: &str) -> Result<ValueCodec, ChangeError>;

    /// Pre-apply validation. A failure aborts the whole apply before any
    /// mutation happens.
    fn before_apply(
        &self,
        store: &ChangeStore,
        request: &Request,
        attributes: &[Attribute],
    ) -> anyhow::Result<()> {
        let _ = (store, request, attributes);
        Ok(())
    }

    fn insert_instance(
        &self,
        store: &ChangeStore,
        request: &mut Request,
        attributes: &mut [Attribute],
    ) -> anyhow::Result<()>;

    fn update_instance(
        &self,
        store: &ChangeStore,
        request: &mut Request,
        attributes: &mut [Attribute],
    ) -> anyhow::Result<()>;

    fn delete_instance(
        &self,
        store: &ChangeStore,
        request: &mut Request,
        attributes: &mut [Attribute],
    ) -> anyhow::Result<()>;

    /// Minimal identifying projection of the instance for exports, not a
    /// full serialization.
    fn map_instance_key(&self, request: &Request) -> anyhow::Result<Option<WireValue>>;
}

/// The shared apply state machine.
///
/// Re-entry is an idempotent no-op: the in-memory `apply_ts` check catches
/// the common case and the store-level compare-and-swap claim is the sole
/// guard against a concurrent double apply, so a lost race degrades to
/// doing nothing rather than mutating twice.
pub fn apply_decisions(
    strategy: &dyn ChangeStrategy,
    store: &ChangeStore,
    request: &mut Request,
    attributes: &mut [Attribute],
) -> anyhow::Result<()> {
    if request.state.apply_ts.is_some() {
        return Ok(());
    }

    strategy.before_apply(store, request, attributes)?;

    let Some(claimed_ts) = store.claim_apply(&request.id)? else {
        // someone else applied this request since we loaded it
        return Ok(());
    };
    request.state.apply_ts = Some(claimed_ts);

    if request.operation == Operation::Update || request.state.decision == Some(Decision::Accepted)
    {
        let outcome = match request.operation {
            Operation::Insert => strategy.insert_instance(store, request, attributes),
            Operation::Update => strategy.update_instance(store, request, attributes),
            Operation::Delete => strategy.delete_instance(store, request, attributes),
        };
        // the claim cannot be released, so a failed mutation would leave
        // the request looking applied; record what went wrong on it
        if let Err(err) = outcome {
            request.apply_error = Some(err.to_string());
            store.save_request(request)?;
            return Err(err);
        }
    }
    Ok(())
}

/// Shared per-attribute apply rule used by every strategy's insert and
/// update paths.
///
/// An attribute's value is written only when the whole change is an INSERT
/// or the attribute itself was accepted; the apply stamp is set either
/// way, exactly once, so denied attributes are marked processed without
/// ever touching the instance.
pub fn apply_attributes<F>(
    operation: Operation,
    attributes: &mut [Attribute],
    mut write: F,
) -> anyhow::Result<()>
where
    F: FnMut(&Attribute) -> anyhow::Result<()>,
{
    for attribute in attributes.iter_mut() {
        if attribute.state.apply_ts.is_none() {
            if operation == Operation::Insert || attribute.state.decision == Some(Decision::Accepted)
            {
                write(attribute)?;
            }
            attribute.state.apply_ts = Some(TimeStamp::now());
        }
    }
    Ok(())
}
