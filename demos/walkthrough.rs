//! End-to-end walkthrough: insert a widget, gate an update behind
//! internal approval, decide it, and print the resulting request tree.

use sled::open;

use change_approval::dto::{ChangeDescription, DecisionDescription};
use change_approval::element::{Decision, DecisionPolicy, Operation};
use change_approval::service::ChangeService;
use change_approval::value::WireValue;

fn main() -> anyhow::Result<()> {
    let db = open("walkthrough.db")?;
    if !db.is_empty() {
        db.clear()?;
    }
    let service = ChangeService::open(&db)?;

    // default policy is ACCEPT, so the insert applies on the spot
    let inserted = service.create_request(
        &ChangeDescription::insert("Widget")
            .with_attribute("name", WireValue::Text("flux capacitor".to_string()))
            .with_attribute(
                "components",
                WireValue::Requests(vec![
                    ChangeDescription::insert("Component")
                        .with_attribute("kind", WireValue::Text("coil".to_string()))
                        .with_attribute("amount", WireValue::Int(3)),
                ]),
            )
            .with_requested_by("alice"),
    )?;
    let widget_id = inserted.instance_id.clone().unwrap();
    println!("inserted widget {widget_id}");

    // color changes now need an internal approver
    service.policies().set_policy(
        "Widget",
        Operation::Update,
        Some("color"),
        Some(DecisionPolicy::Approve),
    )?;

    let update = service.create_request(
        &ChangeDescription::update("Widget", &widget_id)
            .with_attribute("color", WireValue::Text("BLUE".to_string()))
            .with_requested_by("alice"),
    )?;
    println!(
        "update {} complete yet? {}",
        update.id,
        service.is_all_decisions_made(&update.id)?
    );

    service.record_decisions(
        &[DecisionDescription::new(&update.attributes[0], Decision::Accepted)],
        Some("bob"),
    )?;

    let widget = service.catalog().require_widget(&widget_id)?;
    println!("widget color after approval: {:?}", widget.color);

    println!("{:#?}", service.request_dto(&update.id)?);
    Ok(())
}
