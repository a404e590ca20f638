//! Typed attribute values and their conversions
//!
//! Each attribute value exists in up to three forms: the durable string
//! stored on the attribute record, the loose wire form moved through DTOs,
//! and the typed domain form. [`ValueCodec`] converts between them as pure
//! functions; the owning service decides when a representation is
//! re-derived, so there is no implicit back-propagation between forms.

use std::fmt;
use std::sync::Arc;

use crate::dto::ChangeDescription;
use crate::error::ChangeError;

/// Loosely typed wire form of an attribute value.
///
/// Entity references travel as a small map carrying at least an `id`
/// entry; child-request-list values travel as full nested descriptions.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub enum WireValue {
    #[n(0)]
    Null,
    #[n(1)]
    Bool(#[n(0)] bool),
    #[n(2)]
    Int(#[n(0)] i64),
    #[n(3)]
    Double(#[n(0)] f64),
    #[n(4)]
    Text(#[n(0)] String),
    #[n(5)]
    Map(#[n(0)] Vec<(String, WireValue)>),
    #[n(6)]
    Requests(#[n(0)] Vec<ChangeDescription>),
}

impl WireValue {
    pub fn entry(&self, key: &str) -> Option<&WireValue> {
        match self {
            WireValue::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    fn as_scalar_text(&self) -> Option<String> {
        match self {
            WireValue::Bool(b) => Some(b.to_string()),
            WireValue::Int(i) => Some(i.to_string()),
            WireValue::Double(d) => Some(d.to_string()),
            WireValue::Text(t) => Some(t.clone()),
            _ => None,
        }
    }
}

/// Minimal projection of a referenced entity: its id plus a couple of
/// stable display fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub id: String,
    pub code: Option<String>,
}

/// Lookup collaborator for entity-reference values.
pub trait RefLookup: Send + Sync {
    fn find_by_id(&self, id: &str) -> anyhow::Result<Option<RefEntry>>;
}

/// Domain-typed form of an attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    /// Canonical variant name, validated against the codec's variant set.
    Enum(&'static str),
    EntityRef(RefEntry),
    /// Ids of the nested child requests. Built and persisted by the
    /// service, never encoded as text.
    Children(Vec<String>),
}

/// Conversion rules for one attribute's value.
#[derive(Clone)]
pub enum ValueCodec {
    Bool,
    Int,
    Double,
    Text,
    Enum { variants: &'static [&'static str] },
    EntityRef { lookup: Arc<dyn RefLookup> },
    /// The child-request-list variant. Conversion is overridden entirely:
    /// the service constructs nested request trees from the wire form and
    /// the storage form is unused (children are first-class records).
    Children,
}

// hand-written because the lookup trait object has no Debug
impl fmt::Debug for ValueCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueCodec::Bool => f.write_str("Bool"),
            ValueCodec::Int => f.write_str("Int"),
            ValueCodec::Double => f.write_str("Double"),
            ValueCodec::Text => f.write_str("Text"),
            ValueCodec::Enum { variants } => {
                f.debug_struct("Enum").field("variants", variants).finish()
            }
            ValueCodec::EntityRef { .. } => f.write_str("EntityRef"),
            ValueCodec::Children => f.write_str("Children"),
        }
    }
}

impl ValueCodec {
    pub fn is_children(&self) -> bool {
        matches!(self, ValueCodec::Children)
    }

    fn enum_variant(
        variants: &'static [&'static str],
        name: &str,
    ) -> Result<&'static str, ChangeError> {
        variants
            .iter()
            .find(|v| **v == name)
            .copied()
            .ok_or_else(|| ChangeError::Conversion(format!("unknown enum variant: {name}")))
    }

    /// Parse the durable string form back into the domain form.
    pub fn from_storage(&self, text: Option<&str>) -> anyhow::Result<Option<TypedValue>> {
        let Some(text) = text else {
            return Ok(None);
        };
        let value = match self {
            ValueCodec::Bool => TypedValue::Bool(
                text.parse::<bool>()
                    .map_err(|_| ChangeError::Conversion(format!("not a boolean: {text}")))?,
            ),
            ValueCodec::Int => TypedValue::Int(
                text.parse::<i64>()
                    .map_err(|_| ChangeError::Conversion(format!("not an integer: {text}")))?,
            ),
            ValueCodec::Double => TypedValue::Double(
                text.parse::<f64>()
                    .map_err(|_| ChangeError::Conversion(format!("not a double: {text}")))?,
            ),
            ValueCodec::Text => TypedValue::Text(text.to_string()),
            ValueCodec::Enum { variants } => TypedValue::Enum(Self::enum_variant(variants, text)?),
            ValueCodec::EntityRef { lookup } => {
                let entry = lookup
                    .find_by_id(text)?
                    .ok_or_else(|| ChangeError::MissingInstance(text.to_string()))?;
                TypedValue::EntityRef(entry)
            }
            // children are persisted as first-class records, not text
            ValueCodec::Children => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Render the domain form into its durable string form.
    pub fn to_storage(&self, value: Option<&TypedValue>) -> Option<String> {
        let value = value?;
        match value {
            TypedValue::Bool(b) => Some(b.to_string()),
            TypedValue::Int(i) => Some(i.to_string()),
            TypedValue::Double(d) => Some(d.to_string()),
            TypedValue::Text(t) => Some(t.clone()),
            TypedValue::Enum(name) => Some((*name).to_string()),
            TypedValue::EntityRef(entry) => Some(entry.id.clone()),
            TypedValue::Children(_) => None,
        }
    }

    /// Parse an externally supplied wire value into the domain form.
    ///
    /// Scalar codecs are tolerant of stringly-typed input the way the wire
    /// tends to deliver it; entity references must arrive as a map with an
    /// `id` entry.
    pub fn from_wire(&self, wire: &WireValue) -> anyhow::Result<Option<TypedValue>> {
        if matches!(wire, WireValue::Null) {
            return Ok(None);
        }
        let value = match self {
            ValueCodec::Bool => match wire {
                WireValue::Bool(b) => TypedValue::Bool(*b),
                WireValue::Text(t) => TypedValue::Bool(
                    t.parse::<bool>()
                        .map_err(|_| ChangeError::InvalidWireFormat(format!("boolean: {t}")))?,
                ),
                other => {
                    return Err(ChangeError::InvalidWireFormat(format!("boolean: {other:?}")).into());
                }
            },
            ValueCodec::Int => match wire {
                WireValue::Int(i) => TypedValue::Int(*i),
                WireValue::Text(t) => TypedValue::Int(
                    t.parse::<i64>()
                        .map_err(|_| ChangeError::InvalidWireFormat(format!("integer: {t}")))?,
                ),
                other => {
                    return Err(ChangeError::InvalidWireFormat(format!("integer: {other:?}")).into());
                }
            },
            ValueCodec::Double => match wire {
                WireValue::Double(d) => TypedValue::Double(*d),
                WireValue::Int(i) => TypedValue::Double(*i as f64),
                WireValue::Text(t) => TypedValue::Double(
                    t.parse::<f64>()
                        .map_err(|_| ChangeError::InvalidWireFormat(format!("double: {t}")))?,
                ),
                other => {
                    return Err(ChangeError::InvalidWireFormat(format!("double: {other:?}")).into());
                }
            },
            ValueCodec::Text => match wire.as_scalar_text() {
                Some(text) => TypedValue::Text(text),
                None => {
                    return Err(ChangeError::InvalidWireFormat(format!("text: {wire:?}")).into());
                }
            },
            ValueCodec::Enum { variants } => match wire {
                WireValue::Text(t) => TypedValue::Enum(
                    Self::enum_variant(variants, t)
                        .map_err(|_| ChangeError::InvalidWireFormat(format!("enum: {t}")))?,
                ),
                other => {
                    return Err(ChangeError::InvalidWireFormat(format!("enum: {other:?}")).into());
                }
            },
            ValueCodec::EntityRef { lookup } => {
                let id = wire
                    .entry("id")
                    .and_then(|v| match v {
                        WireValue::Text(t) => Some(t.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        ChangeError::InvalidWireFormat("entity reference without id".to_string())
                    })?;
                let entry = lookup
                    .find_by_id(&id)?
                    .ok_or(ChangeError::MissingInstance(id))?;
                TypedValue::EntityRef(entry)
            }
            ValueCodec::Children => {
                // nested requests are built by the orchestrating service
                return Err(ChangeError::InvalidArgument(
                    "child request lists are constructed by the change service".to_string(),
                )
                .into());
            }
        };
        Ok(Some(value))
    }

    /// Render the domain form back into wire form.
    ///
    /// Entity references expand to their stable id-plus-display map; the
    /// child-request-list form is projected by the service, which owns the
    /// nested request records.
    pub fn to_wire(&self, value: Option<&TypedValue>) -> WireValue {
        let Some(value) = value else {
            return WireValue::Null;
        };
        match value {
            TypedValue::Bool(b) => WireValue::Bool(*b),
            TypedValue::Int(i) => WireValue::Int(*i),
            TypedValue::Double(d) => WireValue::Double(*d),
            TypedValue::Text(t) => WireValue::Text(t.clone()),
            TypedValue::Enum(name) => WireValue::Text((*name).to_string()),
            TypedValue::EntityRef(entry) => {
                let mut entries = vec![("id".to_string(), WireValue::Text(entry.id.clone()))];
                if let Some(code) = &entry.code {
                    entries.push(("code".to_string(), WireValue::Text(code.clone())));
                }
                WireValue::Map(entries)
            }
            TypedValue::Children(_) => WireValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLookup;

    impl RefLookup for FixedLookup {
        fn find_by_id(&self, id: &str) -> anyhow::Result<Option<RefEntry>> {
            if id == "cat1known" {
                Ok(Some(RefEntry {
                    id: id.to_string(),
                    code: Some("K-01".to_string()),
                }))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn malformed_storage_text_is_a_conversion_error() {
        let err = ValueCodec::Int.from_storage(Some("nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChangeError>(),
            Some(ChangeError::Conversion(_))
        ));
    }

    #[test]
    fn entity_ref_wire_form_requires_an_id_entry() {
        let codec = ValueCodec::EntityRef {
            lookup: Arc::new(FixedLookup),
        };
        let err = codec
            .from_wire(&WireValue::Text("cat1known".to_string()))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChangeError>(),
            Some(ChangeError::InvalidWireFormat(_))
        ));
    }

    #[test]
    fn unresolved_entity_ref_is_a_missing_instance() {
        let codec = ValueCodec::EntityRef {
            lookup: Arc::new(FixedLookup),
        };
        let wire = WireValue::Map(vec![(
            "id".to_string(),
            WireValue::Text("cat1gone".to_string()),
        )]);
        let err = codec.from_wire(&wire).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChangeError>(),
            Some(ChangeError::MissingInstance(_))
        ));
    }

    #[test]
    fn entity_ref_expands_on_the_wire() {
        let codec = ValueCodec::EntityRef {
            lookup: Arc::new(FixedLookup),
        };
        let value = codec.from_storage(Some("cat1known")).unwrap().unwrap();
        let wire = codec.to_wire(Some(&value));

        assert_eq!(wire.entry("id"), Some(&WireValue::Text("cat1known".to_string())));
        assert_eq!(wire.entry("code"), Some(&WireValue::Text("K-01".to_string())));
    }
}
