//! Validation and projection edge cases, one test per rule.

use sled::open;
use tempfile::tempdir;

use change_approval::catalog::Category;
use change_approval::dto::ChangeDescription;
use change_approval::element::Operation;
use change_approval::error::ChangeError;
use change_approval::service::ChangeService;
use change_approval::value::WireValue;

fn service(dir: &tempfile::TempDir) -> anyhow::Result<(sled::Db, ChangeService)> {
    let db = open(dir.path().join("test.db"))?;
    db.clear()?;
    let service = ChangeService::open(&db)?;
    Ok((db, service))
}

fn insert_widget(service: &ChangeService, name: &str) -> anyhow::Result<String> {
    let request = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text(name.to_string())),
    )?;
    Ok(request.instance_id.unwrap())
}

fn assert_change_error<F>(err: anyhow::Error, check: F)
where
    F: FnOnce(&ChangeError) -> bool,
{
    let change = err
        .downcast_ref::<ChangeError>()
        .unwrap_or_else(|| panic!("not a ChangeError: {err}"));
    assert!(check(change), "unexpected error: {change}");
}

#[test]
fn unknown_entity_kind_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let err = service
        .create_request(&ChangeDescription::insert("Gadget"))
        .unwrap_err();
    assert_change_error(err, |e| matches!(e, ChangeError::UnknownEntityKind(_)));
    Ok(())
}

#[test]
fn update_without_instance_key_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let mut description = ChangeDescription::update("Widget", "wgt1gone");
    description.instance_key = None;
    let err = service.create_request(&description).unwrap_err();
    assert_change_error(err, |e| matches!(e, ChangeError::MissingArgument(_)));
    Ok(())
}

#[test]
fn update_of_a_missing_instance_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let err = service
        .create_request(
            &ChangeDescription::update("Widget", "wgt1gone")
                .with_attribute("note", WireValue::Text("x".to_string())),
        )
        .unwrap_err();
    assert_change_error(err, |e| matches!(e, ChangeError::MissingInstance(_)));
    Ok(())
}

#[test]
fn duplicate_attribute_names_are_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let err = service
        .create_request(
            &ChangeDescription::insert("Widget")
                .with_attribute("name", WireValue::Text("a".to_string()))
                .with_attribute("name", WireValue::Text("b".to_string())),
        )
        .unwrap_err();
    assert_change_error(err, |e| matches!(e, ChangeError::InvalidArgument(_)));
    Ok(())
}

#[test]
fn unknown_attribute_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let err = service
        .create_request(
            &ChangeDescription::insert("Widget")
                .with_attribute("name", WireValue::Text("a".to_string()))
                .with_attribute("wingspan", WireValue::Int(3)),
        )
        .unwrap_err();
    assert_change_error(err, |e| matches!(e, ChangeError::UnknownAttribute(_)));
    Ok(())
}

#[test]
fn insert_cannot_nest_non_insert_children() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let err = service
        .create_request(
            &ChangeDescription::insert("Widget")
                .with_attribute("name", WireValue::Text("a".to_string()))
                .with_attribute(
                    "components",
                    WireValue::Requests(vec![ChangeDescription::delete("Component", "cmp1gone")]),
                ),
        )
        .unwrap_err();
    assert_change_error(err, |e| matches!(e, ChangeError::InvalidArgument(_)));
    Ok(())
}

#[test]
fn insert_without_a_name_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let err = service
        .create_request(
            &ChangeDescription::insert("Widget").with_attribute("rating", WireValue::Int(5)),
        )
        .unwrap_err();
    assert_change_error(err, |e| matches!(e, ChangeError::MissingArgument(_)));
    Ok(())
}

#[test]
fn redundant_instance_key_on_insert_is_ignored() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    let request = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_instance_id("wgt1bogus")
            .with_attribute("name", WireValue::Text("fresh".to_string())),
    )?;

    // a fresh id is minted, the supplied key plays no part
    let widget_id = request.instance_id.unwrap();
    assert_ne!(widget_id, "wgt1bogus");
    Ok(())
}

#[test]
fn applying_twice_is_a_no_op() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;
    let widget_id = insert_widget(&service, "gizmo")?;

    let update = service.create_request(
        &ChangeDescription::update("Widget", &widget_id)
            .with_attribute("rating", WireValue::Int(7)),
    )?;

    let before = service.store().require_request(&update.id)?;
    service.apply_request(&update.id)?;
    let after = service.store().require_request(&update.id)?;

    assert_eq!(before.state.apply_ts, after.state.apply_ts);
    assert_eq!(
        service.catalog().require_widget(&widget_id)?.rating,
        Some(7)
    );
    Ok(())
}

#[test]
fn delete_archives_instead_of_removing() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;
    let widget_id = insert_widget(&service, "obsolete")?;

    service.create_request(
        &ChangeDescription::delete("Widget", &widget_id).with_requested_by("carol"),
    )?;

    let widget = service.catalog().require_widget(&widget_id)?;
    assert!(widget.archived);
    assert!(widget.deleted_ts.is_some());
    assert_eq!(widget.deleted_by.as_deref(), Some("carol"));
    Ok(())
}

#[test]
fn dto_projection_expands_references_and_children() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;

    service.catalog().save_category(&Category {
        id: "cat1tools".to_string(),
        code: "TL".to_string(),
        name: "Tools".to_string(),
    })?;

    let request = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("assembly".to_string()))
            .with_attribute(
                "category",
                WireValue::Map(vec![(
                    "id".to_string(),
                    WireValue::Text("cat1tools".to_string()),
                )]),
            )
            .with_attribute(
                "components",
                WireValue::Requests(vec![
                    ChangeDescription::insert("Component")
                        .with_attribute("kind", WireValue::Text("bolt".to_string())),
                ]),
            ),
    )?;

    let dto = service.request_dto(&request.id)?;
    assert_eq!(dto.entity_kind, "Widget");

    // the instance key carries the applied instance
    let key = dto.instance_key.unwrap();
    assert_eq!(key.entry("id"), request.instance_id.map(WireValue::Text).as_ref());

    let category = dto.attributes.iter().find(|a| a.name == "category").unwrap();
    assert_eq!(
        category.value.entry("code"),
        Some(&WireValue::Text("TL".to_string()))
    );

    let components = dto.attributes.iter().find(|a| a.name == "components").unwrap();
    assert_eq!(components.value, WireValue::Null);
    assert_eq!(components.children.len(), 1);
    assert_eq!(components.children[0].entity_kind, "Component");
    Ok(())
}

#[test]
fn auto_accept_flag_short_circuits_approval() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_db, service) = service(&dir)?;
    let widget_id = insert_widget(&service, "gizmo")?;

    service.policies().set_policy(
        "Widget",
        Operation::Update,
        Some("rating"),
        Some(change_approval::element::DecisionPolicy::Approve),
    )?;
    service.policies().set_auto_accept(true);

    let update = service.create_request(
        &ChangeDescription::update("Widget", &widget_id)
            .with_attribute("rating", WireValue::Int(9)),
    )?;

    assert!(service.is_all_decisions_made(&update.id)?);
    assert_eq!(service.catalog().require_widget(&widget_id)?.rating, Some(9));
    Ok(())
}
