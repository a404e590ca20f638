//! The catalog domain: widgets, their components, and category lookups
//!
//! This is the representative entity family the change engine mutates. A
//! `Widget` is a composite aggregate whose `components` attribute is a
//! child-request list; `Component` instances are independently approved
//! nested changes; `Category` is a plain lookup entity referenced by id.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::dto::ChangeDescription;
use crate::element::{Attribute, Operation, Request, Source};
use crate::error::ChangeError;
use crate::ids;
use crate::store::ChangeStore;
use crate::strategy::{apply_attributes, ChangeStrategy};
use crate::timestamp::TimeStamp;
use crate::value::{RefEntry, RefLookup, TypedValue, ValueCodec, WireValue};

pub const WIDGET_KIND: &str = "Widget";
pub const COMPONENT_KIND: &str = "Component";

/// Widget color, stored under its canonical upper-case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Color {
    #[n(0)]
    Red,
    #[n(1)]
    Green,
    #[n(2)]
    Blue,
    #[n(3)]
    Yellow,
}

pub const COLOR_VARIANTS: &[&str] = &["RED", "GREEN", "BLUE", "YELLOW"];

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Red => "RED",
            Color::Green => "GREEN",
            Color::Blue => "BLUE",
            Color::Yellow => "YELLOW",
        }
    }
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "RED" => Some(Color::Red),
            "GREEN" => Some(Color::Green),
            "BLUE" => Some(Color::Blue),
            "YELLOW" => Some(Color::Yellow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Widget {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: Option<String>,
    #[n(2)]
    pub color: Option<Color>,
    #[n(3)]
    pub weight: Option<f64>,
    #[n(4)]
    pub rating: Option<i64>,
    #[n(5)]
    pub active: Option<bool>,
    #[n(6)]
    pub note: Option<String>,
    // category id
    #[n(7)]
    pub category: Option<String>,
    // owned component ids
    #[n(8)]
    pub components: Vec<String>,
    #[n(9)]
    pub archived: bool,
    #[n(10)]
    pub deleted_ts: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub deleted_by: Option<String>,
}

impl Widget {
    pub fn new(id: String) -> Self {
        Self {
            id,
            name: None,
            color: None,
            weight: None,
            rating: None,
            active: None,
            note: None,
            category: None,
            components: Vec::new(),
            archived: false,
            deleted_ts: None,
            deleted_by: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Component {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub widget_id: Option<String>,
    #[n(2)]
    pub kind: Option<String>,
    #[n(3)]
    pub amount: Option<i64>,
    #[n(4)]
    pub archived: bool,
    #[n(5)]
    pub deleted_ts: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub deleted_by: Option<String>,
}

impl Component {
    pub fn new(id: String) -> Self {
        Self {
            id,
            widget_id: None,
            kind: None,
            amount: None,
            archived: false,
            deleted_ts: None,
            deleted_by: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Category {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub code: String,
    #[n(2)]
    pub name: String,
}

/// What an external verification observed about one widget, diffed
/// against the live instance to derive a change description.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct VerificationSnapshot {
    #[n(0)]
    pub id: String,
    // absent when the verification saw a widget we do not have yet
    #[n(1)]
    pub widget_id: Option<String>,
    #[n(2)]
    pub name: Option<String>,
    #[n(3)]
    pub color: Option<Color>,
    #[n(4)]
    pub weight: Option<f64>,
    #[n(5)]
    pub category: Option<String>,
    #[n(6)]
    pub components: Vec<VerificationComponent>,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct VerificationComponent {
    // live component this observation corresponds to, if any
    #[n(0)]
    pub source_component: Option<String>,
    #[n(1)]
    pub kind: Option<String>,
    #[n(2)]
    pub amount: Option<i64>,
}

/// Sled-backed storage for the catalog records.
#[derive(Clone)]
pub struct CatalogStore {
    widgets: sled::Tree,
    components: sled::Tree,
    categories: sled::Tree,
    verifications: sled::Tree,
}

impl CatalogStore {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            widgets: db.open_tree("widgets")?,
            components: db.open_tree("components")?,
            categories: db.open_tree("categories")?,
            verifications: db.open_tree("verifications")?,
        })
    }

    pub fn save_widget(&self, widget: &Widget) -> anyhow::Result<()> {
        self.widgets
            .insert(widget.id.as_bytes(), minicbor::to_vec(widget)?)?;
        Ok(())
    }

    pub fn widget(&self, id: &str) -> anyhow::Result<Option<Widget>> {
        match self.widgets.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require_widget(&self, id: &str) -> anyhow::Result<Widget> {
        self.widget(id)?
            .ok_or_else(|| ChangeError::MissingInstance(id.to_string()).into())
    }

    pub fn save_component(&self, component: &Component) -> anyhow::Result<()> {
        self.components
            .insert(component.id.as_bytes(), minicbor::to_vec(component)?)?;
        Ok(())
    }

    pub fn component(&self, id: &str) -> anyhow::Result<Option<Component>> {
        match self.components.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require_component(&self, id: &str) -> anyhow::Result<Component> {
        self.component(id)?
            .ok_or_else(|| ChangeError::MissingInstance(id.to_string()).into())
    }

    /// The widget's live (non-archived) components.
    pub fn active_components(&self, widget: &Widget) -> anyhow::Result<Vec<Component>> {
        let mut components = Vec::new();
        for id in &widget.components {
            let component = self.require_component(id)?;
            if !component.archived {
                components.push(component);
            }
        }
        Ok(components)
    }

    pub fn save_category(&self, category: &Category) -> anyhow::Result<()> {
        self.categories
            .insert(category.id.as_bytes(), minicbor::to_vec(category)?)?;
        Ok(())
    }

    pub fn category(&self, id: &str) -> anyhow::Result<Option<Category>> {
        match self.categories.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_verification(&self, snapshot: &VerificationSnapshot) -> anyhow::Result<()> {
        self.verifications
            .insert(snapshot.id.as_bytes(), minicbor::to_vec(snapshot)?)?;
        Ok(())
    }

    pub fn require_verification(&self, id: &str) -> anyhow::Result<VerificationSnapshot> {
        match self.verifications.get(id.as_bytes())? {
            Some(bytes) => Ok(minicbor::decode(&bytes)?),
            None => Err(ChangeError::MissingInstance(id.to_string()).into()),
        }
    }
}

/// Entity-reference lookup for widget categories.
pub struct CategoryLookup(pub CatalogStore);

impl RefLookup for CategoryLookup {
    fn find_by_id(&self, id: &str) -> anyhow::Result<Option<RefEntry>> {
        Ok(self.0.category(id)?.map(|category| RefEntry {
            id: category.id,
            code: Some(category.code),
        }))
    }
}

fn as_text(value: Option<TypedValue>) -> Option<String> {
    match value {
        Some(TypedValue::Text(t)) => Some(t),
        _ => None,
    }
}
fn as_bool(value: Option<TypedValue>) -> Option<bool> {
    match value {
        Some(TypedValue::Bool(b)) => Some(b),
        _ => None,
    }
}
fn as_int(value: Option<TypedValue>) -> Option<i64> {
    match value {
        Some(TypedValue::Int(i)) => Some(i),
        _ => None,
    }
}
fn as_double(value: Option<TypedValue>) -> Option<f64> {
    match value {
        Some(TypedValue::Double(d)) => Some(d),
        _ => None,
    }
}
fn as_color(value: Option<TypedValue>) -> Option<Color> {
    match value {
        Some(TypedValue::Enum(name)) => Color::parse(name),
        _ => None,
    }
}
fn as_ref_id(value: Option<TypedValue>) -> Option<String> {
    match value {
        Some(TypedValue::EntityRef(entry)) => Some(entry.id),
        _ => None,
    }
}

/// Apply strategy for the Widget aggregate.
pub struct WidgetChangeStrategy {
    catalog: CatalogStore,
}

impl WidgetChangeStrategy {
    pub fn new(catalog: CatalogStore) -> Self {
        Self { catalog }
    }

    fn set_instance_attribute(
        &self,
        instance: &mut Widget,
        attribute: &Attribute,
    ) -> anyhow::Result<()> {
        let codec = self.resolve_value_codec(&attribute.name)?;
        let value = codec.from_storage(attribute.stored_value.as_deref())?;
        match attribute.name.as_str() {
            "name" => instance.name = as_text(value),
            "color" => instance.color = as_color(value),
            "weight" => instance.weight = as_double(value),
            "rating" => instance.rating = as_int(value),
            "active" => instance.active = as_bool(value),
            "note" => instance.note = as_text(value),
            "category" => instance.category = as_ref_id(value),
            // component children attach themselves during their own apply
            "components" => {}
            other => {
                return Err(ChangeError::UnknownAttribute(format!("Widget.{other}")).into());
            }
        }
        Ok(())
    }
}

impl ChangeStrategy for WidgetChangeStrategy {
    fn entity_kind(&self) -> &'static str {
        WIDGET_KIND
    }

    fn attribute_names(&self) -> &'static [&'static str] {
        &[
            "name",
            "color",
            "weight",
            "rating",
            "active",
            "note",
            "category",
            "components",
        ]
    }

    fn create_request(
        &self,
        operation: Operation,
        instance_id: Option<&str>,
    ) -> anyhow::Result<Request> {
        let mut request = Request::new(ids::new_id(ids::REQUEST_HRP)?, WIDGET_KIND, operation);
        if let Some(instance_id) = instance_id {
            let widget = self.catalog.require_widget(instance_id)?;
            request.instance_id = Some(widget.id);
        }
        Ok(request)
    }

    fn resolve_value_codec(&self, attribute_name: &str) -> Result<ValueCodec, ChangeError> {
        let codec = match attribute_name {
            "name" => ValueCodec::Text,
            "color" => ValueCodec::Enum {
                variants: COLOR_VARIANTS,
            },
            "weight" => ValueCodec::Double,
            "rating" => ValueCodec::Int,
            "active" => ValueCodec::Bool,
            "note" => ValueCodec::Text,
            "category" => ValueCodec::EntityRef {
                lookup: Arc::new(CategoryLookup(self.catalog.clone())),
            },
            "components" => ValueCodec::Children,
            other => {
                return Err(ChangeError::UnknownAttribute(format!("Widget.{other}")));
            }
        };
        Ok(codec)
    }

    fn before_apply(
        &self,
        _store: &ChangeStore,
        request: &Request,
        attributes: &[Attribute],
    ) -> anyhow::Result<()> {
        if request.operation == Operation::Insert
            && !attributes.iter().any(|a| a.name == "name")
        {
            return Err(ChangeError::missing("Widget.name").into());
        }
        // a present name must carry an actual value under any operation
        let blank_name = attributes.iter().any(|a| {
            a.name == "name" && a.stored_value.as_deref().map(str::trim).unwrap_or("").is_empty()
        });
        if blank_name {
            return Err(
                ChangeError::InvalidArgument("Widget.name must not be blank".to_string()).into(),
            );
        }
        Ok(())
    }

    fn insert_instance(
        &self,
        _store: &ChangeStore,
        request: &mut Request,
        attributes: &mut [Attribute],
    ) -> anyhow::Result<()> {
        let mut instance = Widget::new(ids::new_id(ids::WIDGET_HRP)?);

        apply_attributes(request.operation, attributes, |attribute| {
            self.set_instance_attribute(&mut instance, attribute)
        })?;

        self.catalog.save_widget(&instance)?;
        request.instance_id = Some(instance.id);
        Ok(())
    }

    fn update_instance(
        &self,
        _store: &ChangeStore,
        request: &mut Request,
        attributes: &mut [Attribute],
    ) -> anyhow::Result<()> {
        let instance_id = request
            .instance_id
            .clone()
            .ok_or_else(|| ChangeError::missing("ChangeRequest.instance_id"))?;
        let mut instance = self.catalog.require_widget(&instance_id)?;

        apply_attributes(request.operation, attributes, |attribute| {
            self.set_instance_attribute(&mut instance, attribute)
        })?;

        self.catalog.save_widget(&instance)?;
        Ok(())
    }

    fn delete_instance(
        &self,
        _store: &ChangeStore,
        request: &mut Request,
        _attributes: &mut [Attribute],
    ) -> anyhow::Result<()> {
        let instance_id = request
            .instance_id
            .clone()
            .ok_or_else(|| ChangeError::missing("ChangeRequest.instance_id"))?;
        let mut instance = self.catalog.require_widget(&instance_id)?;

        // soft delete: widgets are archived, never removed
        instance.archived = true;
        instance.deleted_ts = Some(TimeStamp::now());
        instance.deleted_by = Some(
            request
                .requested_by
                .clone()
                .unwrap_or_else(|| "system".to_string()),
        );

        self.catalog.save_widget(&instance)?;
        Ok(())
    }

    fn map_instance_key(&self, request: &Request) -> anyhow::Result<Option<WireValue>> {
        let Some(instance_id) = request.instance_id.as_deref() else {
            return Ok(None);
        };
        let widget = self.catalog.require_widget(instance_id)?;
        let mut entries = vec![("id".to_string(), WireValue::Text(widget.id))];
        if let Some(name) = widget.name {
            entries.push(("name".to_string(), WireValue::Text(name)));
        }
        Ok(Some(WireValue::Map(entries)))
    }
}

/// Apply strategy for widget components. Component requests always nest
/// under a widget request's `components` attribute; the parent widget is
/// located through that back-reference at apply time.
pub struct ComponentChangeStrategy {
    catalog: CatalogStore,
}

impl ComponentChangeStrategy {
    pub fn new(catalog: CatalogStore) -> Self {
        Self { catalog }
    }

    fn parent_widget(&self, store: &ChangeStore, request: &Request) -> anyhow::Result<Widget> {
        let attribute_id = request.parent_attribute.as_deref().ok_or_else(|| {
            ChangeError::InvalidArgument(
                "component change requests must nest under a widget request".to_string(),
            )
        })?;
        let attribute = store.require_attribute(attribute_id)?;
        let parent = store.require_request(&attribute.request_id)?;
        let widget_id = parent
            .instance_id
            .as_deref()
            .ok_or_else(|| ChangeError::MissingInstance(parent.id.clone()))?;
        self.catalog.require_widget(widget_id)
    }

    fn set_instance_attribute(
        &self,
        instance: &mut Component,
        attribute: &Attribute,
    ) -> anyhow::Result<()> {
        let codec = self.resolve_value_codec(&attribute.name)?;
        let value = codec.from_storage(attribute.stored_value.as_deref())?;
        match attribute.name.as_str() {
            "kind" => instance.kind = as_text(value),
            "amount" => instance.amount = as_int(value),
            other => {
                return Err(ChangeError::UnknownAttribute(format!("Component.{other}")).into());
            }
        }
        Ok(())
    }
}

impl ChangeStrategy for ComponentChangeStrategy {
    fn entity_kind(&self) -> &'static str {
        COMPONENT_KIND
    }

    fn attribute_names(&self) -> &'static [&'static str] {
        &["kind", "amount"]
    }

    fn create_request(
        &self,
        operation: Operation,
        instance_id: Option<&str>,
    ) -> anyhow::Result<Request> {
        let mut request = Request::new(ids::new_id(ids::REQUEST_HRP)?, COMPONENT_KIND, operation);
        if let Some(instance_id) = instance_id {
            let component = self.catalog.require_component(instance_id)?;
            request.instance_id = Some(component.id);
        }
        Ok(request)
    }

    fn resolve_value_codec(&self, attribute_name: &str) -> Result<ValueCodec, ChangeError> {
        let codec = match attribute_name {
            "kind" => ValueCodec::Text,
            "amount" => ValueCodec::Int,
            other => {
                return Err(ChangeError::UnknownAttribute(format!("Component.{other}")));
            }
        };
        Ok(codec)
    }

    fn insert_instance(
        &self,
        store: &ChangeStore,
        request: &mut Request,
        attributes: &mut [Attribute],
    ) -> anyhow::Result<()> {
        let mut widget = self.parent_widget(store, request)?;
        let mut instance = Component::new(ids::new_id(ids::COMPONENT_HRP)?);
        instance.widget_id = Some(widget.id.clone());

        apply_attributes(request.operation, attributes, |attribute| {
            self.set_instance_attribute(&mut instance, attribute)
        })?;

        self.catalog.save_component(&instance)?;
        widget.components.push(instance.id.clone());
        self.catalog.save_widget(&widget)?;
        request.instance_id = Some(instance.id);
        Ok(())
    }

    fn update_instance(
        &self,
        _store: &ChangeStore,
        request: &mut Request,
        attributes: &mut [Attribute],
    ) -> anyhow::Result<()> {
        let instance_id = request
            .instance_id
            .clone()
            .ok_or_else(|| ChangeError::missing("ChangeRequest.instance_id"))?;
        let mut instance = self.catalog.require_component(&instance_id)?;

        apply_attributes(request.operation, attributes, |attribute| {
            self.set_instance_attribute(&mut instance, attribute)
        })?;

        self.catalog.save_component(&instance)?;
        Ok(())
    }

    fn delete_instance(
        &self,
        _store: &ChangeStore,
        request: &mut Request,
        _attributes: &mut [Attribute],
    ) -> anyhow::Result<()> {
        let instance_id = request
            .instance_id
            .clone()
            .ok_or_else(|| ChangeError::missing("ChangeRequest.instance_id"))?;
        let mut instance = self.catalog.require_component(&instance_id)?;

        instance.archived = true;
        instance.deleted_ts = Some(TimeStamp::now());
        instance.deleted_by = Some(
            request
                .requested_by
                .clone()
                .unwrap_or_else(|| "system".to_string()),
        );

        self.catalog.save_component(&instance)?;
        Ok(())
    }

    fn map_instance_key(&self, request: &Request) -> anyhow::Result<Option<WireValue>> {
        let Some(instance_id) = request.instance_id.as_deref() else {
            return Ok(None);
        };
        let component = self.catalog.require_component(instance_id)?;
        let mut entries = vec![("id".to_string(), WireValue::Text(component.id))];
        if let Some(kind) = component.kind {
            entries.push(("kind".to_string(), WireValue::Text(kind)));
        }
        Ok(Some(WireValue::Map(entries)))
    }
}

/// Derive a change description by diffing a verification snapshot against
/// the live widget: one attribute per changed field, one nested child
/// description per added/changed/removed component.
pub fn description_from_verification(
    snapshot: &VerificationSnapshot,
    widget: Option<&Widget>,
    live_components: &[Component],
) -> ChangeDescription {
    let mut description = match widget {
        None => ChangeDescription::insert(WIDGET_KIND),
        Some(widget) => ChangeDescription::update(WIDGET_KIND, &widget.id),
    };
    description.source = Some(Source::Verification);
    description.verification_ref = Some(snapshot.id.clone());

    if let Some(name) = &snapshot.name {
        if widget.and_then(|w| w.name.as_ref()) != Some(name) {
            description = description.with_attribute("name", WireValue::Text(name.clone()));
        }
    }
    if let Some(color) = snapshot.color {
        if widget.and_then(|w| w.color) != Some(color) {
            description = description
                .with_attribute("color", WireValue::Text(color.as_str().to_string()));
        }
    }
    if let Some(weight) = snapshot.weight {
        if widget.and_then(|w| w.weight) != Some(weight) {
            description = description.with_attribute("weight", WireValue::Double(weight));
        }
    }
    if let Some(category) = &snapshot.category {
        if widget.and_then(|w| w.category.as_ref()) != Some(category) {
            description = description.with_attribute(
                "category",
                WireValue::Map(vec![("id".to_string(), WireValue::Text(category.clone()))]),
            );
        }
    }

    let verified_sources: BTreeSet<&str> = snapshot
        .components
        .iter()
        .filter_map(|c| c.source_component.as_deref())
        .collect();

    // components present on the instance but absent from the verification
    // are proposed for deletion
    let mut children: Vec<ChangeDescription> = live_components
        .iter()
        .filter(|c| !verified_sources.contains(c.id.as_str()))
        .map(|c| ChangeDescription::delete(COMPONENT_KIND, &c.id))
        .collect();

    for observed in &snapshot.components {
        let live = observed
            .source_component
            .as_deref()
            .and_then(|id| live_components.iter().find(|c| c.id == id));

        let mut child = match &observed.source_component {
            None => ChangeDescription::insert(COMPONENT_KIND),
            Some(source) => ChangeDescription::update(COMPONENT_KIND, source),
        };
        if let Some(kind) = &observed.kind {
            if live.and_then(|c| c.kind.as_ref()) != Some(kind) {
                child = child.with_attribute("kind", WireValue::Text(kind.clone()));
            }
        }
        if let Some(amount) = observed.amount {
            if live.and_then(|c| c.amount) != Some(amount) {
                child = child.with_attribute("amount", WireValue::Int(amount));
            }
        }
        children.push(child);
    }

    description.with_attribute("components", WireValue::Requests(children))
}
