//! Declarative UI element queries.
//!
//! A [`Selector`] is an immutable value: a set of property matchers plus an
//! ordered chain of child/sibling sub-selectors. Builder methods consume the
//! selector and return a new one, so a selector already handed to a
//! [`UiObject`](crate::ui_object::UiObject) can never change underneath it.
//! The wire-protocol field mask is derived from the set properties.
//!
//! ```
//! use droidrive_core::selector::Selector;
//!
//! let s = Selector::new()
//!     .class_name("android.widget.ListView")
//!     .child(Selector::new().text("Wi-Fi"));
//! assert_eq!(s.mask(), 0x10);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Errors raised when setting a selector property.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidPropertyError {
    #[error("{0} is not allowed")]
    UnknownKey(String),

    #[error("{key} expects a {expected} value")]
    WrongType { key: String, expected: &'static str },
}

/// The kind of value a property accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Bool,
    Int,
}

impl ValueKind {
    fn name(&self) -> &'static str {
        match self {
            ValueKind::Text => "string",
            ValueKind::Bool => "boolean",
            ValueKind::Int => "integer",
        }
    }
}

macro_rules! properties {
    ($($variant:ident => $name:literal, $mask:literal, $kind:ident;)*) => {
        /// A matchable UI element property.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Property {
            $($variant,)*
        }

        impl Property {
            pub const ALL: &'static [Property] = &[$(Property::$variant,)*];

            /// Wire-protocol key, e.g. `resourceId`.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Property::$variant => $name,)*
                }
            }

            /// Field-presence bit in the wire-protocol mask.
            pub fn mask(&self) -> u32 {
                match self {
                    $(Property::$variant => $mask,)*
                }
            }

            pub fn kind(&self) -> ValueKind {
                match self {
                    $(Property::$variant => ValueKind::$kind,)*
                }
            }
        }

        impl FromStr for Property {
            type Err = InvalidPropertyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Property::$variant),)*
                    other => Err(InvalidPropertyError::UnknownKey(other.to_string())),
                }
            }
        }
    };
}

properties! {
    Text => "text", 0x01, Text;
    TextContains => "textContains", 0x02, Text;
    TextMatches => "textMatches", 0x04, Text;
    TextStartsWith => "textStartsWith", 0x08, Text;
    ClassName => "className", 0x10, Text;
    ClassNameMatches => "classNameMatches", 0x20, Text;
    Description => "description", 0x40, Text;
    DescriptionContains => "descriptionContains", 0x80, Text;
    DescriptionMatches => "descriptionMatches", 0x0100, Text;
    DescriptionStartsWith => "descriptionStartsWith", 0x0200, Text;
    Checkable => "checkable", 0x0400, Bool;
    Checked => "checked", 0x0800, Bool;
    Clickable => "clickable", 0x1000, Bool;
    LongClickable => "longClickable", 0x2000, Bool;
    Scrollable => "scrollable", 0x4000, Bool;
    Enabled => "enabled", 0x8000, Bool;
    Focusable => "focusable", 0x010000, Bool;
    Focused => "focused", 0x020000, Bool;
    Selected => "selected", 0x040000, Bool;
    PackageName => "packageName", 0x080000, Text;
    PackageNameMatches => "packageNameMatches", 0x100000, Text;
    ResourceId => "resourceId", 0x200000, Text;
    ResourceIdMatches => "resourceIdMatches", 0x400000, Text;
    Index => "index", 0x800000, Int;
    Instance => "instance", 0x01000000, Int;
}

/// A property match value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyValue {
    Text(String),
    Bool(bool),
    Int(i64),
}

impl PropertyValue {
    fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::Text(_) => ValueKind::Text,
            PropertyValue::Bool(_) => ValueKind::Bool,
            PropertyValue::Int(_) => ValueKind::Int,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            PropertyValue::Text(s) => json!(s),
            PropertyValue::Bool(b) => json!(b),
            PropertyValue::Int(i) => json!(i),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s) => write!(f, "{s:?}"),
            PropertyValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            PropertyValue::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v.into())
    }
}

impl From<usize> for PropertyValue {
    fn from(v: usize) -> Self {
        PropertyValue::Int(v as i64)
    }
}

/// How a chained sub-selector relates to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Child,
    Sibling,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Child => "child",
            Relation::Sibling => "sibling",
        }
    }
}

/// An immutable UI element query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    fields: BTreeMap<Property, PropertyValue>,
    chain: Vec<(Relation, Selector)>,
}

macro_rules! setters {
    ($($fn:ident => $prop:ident, $variant:ident($ty:ty);)*) => {
        $(
            pub fn $fn(self, value: $ty) -> Self {
                self.put(Property::$prop, PropertyValue::$variant(value.into()))
            }
        )*
    };
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    setters! {
        text => Text, Text(impl Into<String>);
        text_contains => TextContains, Text(impl Into<String>);
        text_matches => TextMatches, Text(impl Into<String>);
        text_starts_with => TextStartsWith, Text(impl Into<String>);
        class_name => ClassName, Text(impl Into<String>);
        class_name_matches => ClassNameMatches, Text(impl Into<String>);
        description => Description, Text(impl Into<String>);
        description_contains => DescriptionContains, Text(impl Into<String>);
        description_matches => DescriptionMatches, Text(impl Into<String>);
        description_starts_with => DescriptionStartsWith, Text(impl Into<String>);
        checkable => Checkable, Bool(bool);
        checked => Checked, Bool(bool);
        clickable => Clickable, Bool(bool);
        long_clickable => LongClickable, Bool(bool);
        scrollable => Scrollable, Bool(bool);
        enabled => Enabled, Bool(bool);
        focusable => Focusable, Bool(bool);
        focused => Focused, Bool(bool);
        selected => Selected, Bool(bool);
        package_name => PackageName, Text(impl Into<String>);
        package_name_matches => PackageNameMatches, Text(impl Into<String>);
        resource_id => ResourceId, Text(impl Into<String>);
        resource_id_matches => ResourceIdMatches, Text(impl Into<String>);
        index => Index, Int(i64);
        instance => Instance, Int(i64);
    }

    fn put(mut self, prop: Property, value: PropertyValue) -> Self {
        self.fields.insert(prop, value);
        self
    }

    /// Sets a property, checking that the value has the right kind.
    pub fn with(
        self,
        prop: Property,
        value: impl Into<PropertyValue>,
    ) -> Result<Self, InvalidPropertyError> {
        let value = value.into();
        if value.kind() != prop.kind() {
            return Err(InvalidPropertyError::WrongType {
                key: prop.name().to_string(),
                expected: prop.kind().name(),
            });
        }
        Ok(self.put(prop, value))
    }

    /// Sets a property by its wire-protocol name.
    ///
    /// Unknown names fail with [`InvalidPropertyError::UnknownKey`].
    pub fn set(
        self,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<Self, InvalidPropertyError> {
        let prop = key.parse()?;
        self.with(prop, value)
    }

    /// Builds a selector from `(name, value)` pairs, failing on the first bad one.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, InvalidPropertyError>
    where
        K: AsRef<str>,
        V: Into<PropertyValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        pairs
            .into_iter()
            .try_fold(Selector::new(), |s, (k, v)| s.set(k.as_ref(), v))
    }

    pub fn without(mut self, prop: Property) -> Self {
        self.fields.remove(&prop);
        self
    }

    pub fn get(&self, prop: Property) -> Option<&PropertyValue> {
        self.fields.get(&prop)
    }

    /// Appends a child relation.
    pub fn child(mut self, sub: Selector) -> Self {
        self.chain.push((Relation::Child, sub));
        self
    }

    /// Appends a sibling relation.
    pub fn sibling(mut self, sub: Selector) -> Self {
        self.chain.push((Relation::Sibling, sub));
        self
    }

    pub fn chain(&self) -> &[(Relation, Selector)] {
        &self.chain
    }

    /// OR of the mask bits of every set property.
    pub fn mask(&self) -> u32 {
        self.fields.keys().fold(0, |m, p| m | p.mask())
    }

    /// Returns a copy with `instance` set on the deepest chained
    /// sub-selector, or on this selector when there is no chain.
    pub fn update_instance(&self, instance: i64) -> Selector {
        let mut updated = self.clone();
        match updated.chain.last_mut() {
            Some((_, last)) => {
                last.fields.insert(Property::Instance, PropertyValue::Int(instance));
            }
            None => {
                updated.fields.insert(Property::Instance, PropertyValue::Int(instance));
            }
        }
        updated
    }

    /// Wire-protocol representation.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (prop, value) in &self.fields {
            map.insert(prop.name().to_string(), value.to_json());
        }
        map.insert("mask".into(), json!(self.mask()));
        map.insert(
            "childOrSibling".into(),
            Value::Array(self.chain.iter().map(|(r, _)| json!(r.as_str())).collect()),
        );
        map.insert(
            "childOrSiblingSelector".into(),
            Value::Array(self.chain.iter().map(|(_, s)| s.to_json()).collect()),
        );
        Value::Object(map)
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|(p, v)| format!("{}={v}", p.name()))
            .collect();
        for (relation, sub) in &self.chain {
            parts.push(format!("{}={sub}", relation.as_str()));
        }
        write!(f, "Selector [{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_derived_from_fields() {
        let s = Selector::new().text("a").class_name("b").instance(2);
        assert_eq!(s.mask(), 0x01 | 0x10 | 0x01000000);
        assert_eq!(s.without(Property::Text).mask(), 0x10 | 0x01000000);
    }

    #[test]
    fn clone_is_independent() {
        let s = Selector::new().text("a").child(Selector::new().text("b"));
        let c = s.clone().child(Selector::new().text("c"));
        assert_eq!(s.chain().len(), 1);
        assert_eq!(c.chain().len(), 2);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let s = Selector::new().text("a");
        let err = s.clone().set("badkey", 1).unwrap_err();
        assert_eq!(err, InvalidPropertyError::UnknownKey("badkey".into()));
        assert_eq!(s.mask(), 0x01);
    }

    #[test]
    fn wrong_value_kind_is_rejected() {
        let err = Selector::new().set("clickable", "yes").unwrap_err();
        assert!(matches!(err, InvalidPropertyError::WrongType { ref key, .. } if key == "clickable"));
        assert!(Selector::new().set("index", 3).is_ok());
    }

    #[test]
    fn from_pairs_builds_selector() {
        let s = Selector::from_pairs([("text", "OK"), ("className", "android.widget.Button")]).unwrap();
        assert_eq!(s.get(Property::Text), Some(&PropertyValue::Text("OK".into())));
        assert_eq!(s.mask(), 0x11);
    }

    #[test]
    fn update_instance_targets_deepest_chain() {
        let s = Selector::new()
            .class_name("List")
            .child(Selector::new().text("a"))
            .sibling(Selector::new().text("b"));
        let u = s.update_instance(3);
        assert_eq!(u.get(Property::Instance), None);
        assert_eq!(u.chain()[1].1.get(Property::Instance), Some(&PropertyValue::Int(3)));
        assert_eq!(u.chain()[0].1.get(Property::Instance), None);
        assert_eq!(s.chain()[1].1.get(Property::Instance), None);
    }

    #[test]
    fn update_instance_without_chain_sets_self() {
        let u = Selector::new().text("a").update_instance(1);
        assert_eq!(u.get(Property::Instance), Some(&PropertyValue::Int(1)));
    }

    #[test]
    fn wire_format() {
        let s = Selector::new()
            .text("a")
            .clickable(true)
            .child(Selector::new().resource_id("id/x"));
        let v = s.to_json();
        assert_eq!(v["text"], "a");
        assert_eq!(v["clickable"], true);
        assert_eq!(v["mask"], 0x01 | 0x1000);
        assert_eq!(v["childOrSibling"], json!(["child"]));
        assert_eq!(v["childOrSiblingSelector"][0]["resourceId"], "id/x");
        assert_eq!(v["childOrSiblingSelector"][0]["mask"], 0x200000);
    }

    #[test]
    fn display_form() {
        let s = Selector::new().text("n1").clickable(true);
        assert_eq!(s.to_string(), r#"Selector [text="n1", clickable=True]"#);
        let c = Selector::new().text("a").child(Selector::new().text("b"));
        assert_eq!(c.to_string(), r#"Selector [text="a", child=Selector [text="b"]]"#);
    }

    #[test]
    fn property_names_roundtrip() {
        for p in Property::ALL {
            assert_eq!(p.name().parse::<Property>().unwrap(), *p);
        }
        assert_eq!(Property::ALL.len(), 25);
    }
}
