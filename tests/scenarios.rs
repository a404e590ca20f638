use std::sync::Arc;

use anyhow::Context;
use sled::open;
use tempfile::tempdir; // Use for test db cleanup.

use change_approval::dto::{ChangeDescription, DecisionDescription};
use change_approval::element::{Decision, DecisionPolicy, Operation};
use change_approval::error::ChangeError;
use change_approval::policy::MemoryConfig;
use change_approval::service::{ChangeService, NoAccessControl};
use change_approval::sync::MemorySyncChannel;
use change_approval::timestamp::TimeStamp;
use change_approval::value::WireValue;

// Sled uses file-based locking to prevent concurrent access, so only one
// test can hold the lock at a time. As is good practice in testing, create
// a separate database for each test on temp for simplified cleanup.
fn service(dir: &tempfile::TempDir) -> anyhow::Result<(sled::Db, ChangeService)> {
    let db = open(dir.path().join("test.db"))?;
    db.clear()?;
    let service = ChangeService::open(&db)?;
    Ok((db, service))
}

#[test]
fn insert_is_applied_immediately_under_default_accept() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let request = service
        .create_request(
            &ChangeDescription::insert("Widget")
                .with_attribute("name", WireValue::Text("flux capacitor".to_string()))
                .with_requested_by("alice"),
        )
        .context("insert failed: ")?;

    // ACCEPT resolves at creation, so the instance must already exist
    assert_eq!(request.state.policy, Some(DecisionPolicy::Accept));
    assert_eq!(request.state.decision, Some(Decision::Accepted));
    assert!(request.state.apply_ts.is_some());

    let widget_id = request.instance_id.context("no instance id after apply")?;
    let widget = service.catalog().require_widget(&widget_id)?;
    assert_eq!(widget.name.as_deref(), Some("flux capacitor"));
    assert!(widget.components.is_empty());
    Ok(())
}

#[test]
fn update_waits_for_internal_approval() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let inserted = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("gizmo".to_string())),
    )?;
    let widget_id = inserted.instance_id.unwrap();

    service
        .policies()
        .set_policy("Widget", Operation::Update, None, Some(DecisionPolicy::Approve))?;

    let update = service.create_request(
        &ChangeDescription::update("Widget", &widget_id)
            .with_attribute("color", WireValue::Text("BLUE".to_string())),
    )?;

    // nothing may change before the approval lands
    assert!(!service.is_all_decisions_made(&update.id)?);
    let widget = service.catalog().require_widget(&widget_id)?;
    assert_eq!(widget.color, None);

    let err = service.apply_request(&update.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChangeError>(),
        Some(ChangeError::IncompleteDecision(_))
    ));

    let color_attribute = update.attributes[0].clone();
    service.record_decisions(
        &[DecisionDescription::new(&color_attribute, Decision::Accepted)],
        Some("bob"),
    )?;

    let widget = service.catalog().require_widget(&widget_id)?;
    assert!(matches!(widget.color, Some(_)));

    let attribute = service.store().require_attribute(&color_attribute)?;
    assert_eq!(attribute.state.decided_by.as_deref(), Some("bob"));
    assert!(attribute.state.apply_ts.is_some());
    Ok(())
}

#[test]
fn duplicate_decision_fails_the_batch() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let inserted = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("gizmo".to_string())),
    )?;
    let widget_id = inserted.instance_id.unwrap();

    service.policies().set_policy(
        "Widget",
        Operation::Update,
        Some("note"),
        Some(DecisionPolicy::Approve),
    )?;

    let update = service.create_request(
        &ChangeDescription::update("Widget", &widget_id)
            .with_attribute("note", WireValue::Text("fragile".to_string())),
    )?;
    let note_attribute = update.attributes[0].clone();

    service.record_decisions(
        &[DecisionDescription::new(&note_attribute, Decision::Accepted)],
        Some("bob"),
    )?;

    // a second decision on the same attribute must be rejected as a batch
    let err = service
        .record_decisions(
            &[DecisionDescription::new(&note_attribute, Decision::Denied)],
            Some("mallory"),
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChangeError>(),
        Some(ChangeError::DecisionBatch { failed: 1, total: 1 })
    ));

    // the first decision's effect stands
    let widget = service.catalog().require_widget(&widget_id)?;
    assert_eq!(widget.note.as_deref(), Some("fragile"));
    Ok(())
}

#[test]
fn nested_insert_creates_widget_and_components() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let request = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("assembly".to_string()))
            .with_attribute(
                "components",
                WireValue::Requests(vec![
                    ChangeDescription::insert("Component")
                        .with_attribute("kind", WireValue::Text("bolt".to_string()))
                        .with_attribute("amount", WireValue::Int(4)),
                ]),
            ),
    )?;

    let widget_id = request.instance_id.unwrap();
    let widget = service.catalog().require_widget(&widget_id)?;
    assert_eq!(widget.components.len(), 1);

    let component = service.catalog().require_component(&widget.components[0])?;
    assert_eq!(component.widget_id.as_deref(), Some(widget_id.as_str()));
    assert_eq!(component.kind.as_deref(), Some("bolt"));
    assert_eq!(component.amount, Some(4));
    Ok(())
}

#[test]
fn denied_attribute_is_marked_applied_without_writing() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let inserted = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("gizmo".to_string())),
    )?;
    let widget_id = inserted.instance_id.unwrap();

    service.policies().set_policy(
        "Widget",
        Operation::Update,
        Some("note"),
        Some(DecisionPolicy::Deny),
    )?;

    let update = service.create_request(
        &ChangeDescription::update("Widget", &widget_id)
            .with_attribute("note", WireValue::Text("rejected".to_string())),
    )?;

    let attribute = service.store().require_attribute(&update.attributes[0])?;
    assert_eq!(attribute.state.decision, Some(Decision::Denied));
    assert!(attribute.state.apply_ts.is_some());

    let widget = service.catalog().require_widget(&widget_id)?;
    assert_eq!(widget.note, None);
    Ok(())
}

#[test]
fn delete_child_applies_while_parent_update_waits() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let inserted = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("assembly".to_string()))
            .with_attribute(
                "components",
                WireValue::Requests(vec![
                    ChangeDescription::insert("Component")
                        .with_attribute("kind", WireValue::Text("bolt".to_string())),
                ]),
            ),
    )?;
    let widget_id = inserted.instance_id.unwrap();
    let component_id = service
        .catalog()
        .require_widget(&widget_id)?
        .components[0]
        .clone();

    service.policies().set_policy(
        "Widget",
        Operation::Update,
        Some("note"),
        Some(DecisionPolicy::Approve),
    )?;

    // the note change waits for an approver; the nested DELETE does not
    let update = service.create_request(
        &ChangeDescription::update("Widget", &widget_id)
            .with_attribute("note", WireValue::Text("rebuild".to_string()))
            .with_attribute(
                "components",
                WireValue::Requests(vec![ChangeDescription::delete("Component", &component_id)]),
            ),
    )?;

    assert!(!service.is_all_decisions_made(&update.id)?);
    let parent = service.store().require_request(&update.id)?;
    assert!(parent.state.apply_ts.is_none());

    // the child branch applied independently of the pending parent
    let component = service.catalog().require_component(&component_id)?;
    assert!(component.archived);

    let widget = service.catalog().require_widget(&widget_id)?;
    assert_eq!(widget.note, None);
    Ok(())
}

#[test]
fn verification_source_bypasses_every_policy() -> anyhow::Result<()> {
    use change_approval::catalog::{Color, VerificationSnapshot};

    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let inserted = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("gizmo".to_string())),
    )?;
    let widget_id = inserted.instance_id.unwrap();

    // even an outright DENY yields to a verification-sourced change
    service.policies().set_policy(
        "Widget",
        Operation::Update,
        Some("color"),
        Some(DecisionPolicy::Deny),
    )?;

    service.catalog().save_verification(&VerificationSnapshot {
        id: "vrf1seen".to_string(),
        widget_id: Some(widget_id.clone()),
        name: None,
        color: Some(Color::Green),
        weight: None,
        category: None,
        components: Vec::new(),
    })?;

    let request = service.create_request_from_verification("vrf1seen")?;
    assert!(service.is_all_decisions_made(&request.id)?);

    let widget = service.catalog().require_widget(&widget_id)?;
    assert_eq!(widget.color, Some(Color::Green));
    Ok(())
}

#[test]
fn external_decisions_round_trip_over_the_sync_channel() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path().join("test.db"))?;
    db.clear()?;

    let channel = Arc::new(MemorySyncChannel::new());
    let service = ChangeService::new(
        &db,
        Arc::new(MemoryConfig::new()),
        channel.clone(),
        Arc::new(NoAccessControl),
    )?;

    let inserted = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("gizmo".to_string())),
    )?;
    let widget_id = inserted.instance_id.unwrap();
    assert!(inserted.export_ts.is_some());

    service.policies().set_policy(
        "Widget",
        Operation::Update,
        Some("weight"),
        Some(DecisionPolicy::ExternalApprove),
    )?;

    let update = service.create_request(
        &ChangeDescription::update("Widget", &widget_id)
            .with_attribute("weight", WireValue::Double(2.5)),
    )?;

    // the pending tree went out over the channel
    let exported = channel.exported_requests()?;
    let tree = exported.iter().find(|dto| dto.id == update.id).unwrap();
    assert_eq!(tree.attributes[0].policy, Some(DecisionPolicy::ExternalApprove));

    // the external side answers with its own actor and timestamp
    let decided_at = TimeStamp::new_with(2026, 3, 14, 9, 0, 0);
    channel.queue_decision(
        &DecisionDescription::new(&update.attributes[0], Decision::Accepted)
            .with_external_actor("auditor", decided_at.clone()),
    )?;

    assert_eq!(service.run_import_cycle()?, 1);

    let widget = service.catalog().require_widget(&widget_id)?;
    assert_eq!(widget.weight, Some(2.5));

    let attribute = service.store().require_attribute(&update.attributes[0])?;
    assert_eq!(attribute.state.decided_by.as_deref(), Some("auditor"));
    assert_eq!(attribute.state.decision_ts, Some(decided_at));
    Ok(())
}
