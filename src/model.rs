use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Low bytes marking a system-internal placeholder node that is never
/// materialized as a bundle row.
pub const SENTINEL_SUFFIX: [u8; 6] = [0xba, 0xbe, 0xca, 0xfe, 0xba, 0xbe];

/// 128-bit node identifier. Depending on the configured storage model it is
/// bound to the database either as one 16-byte column or as two 64-bit
/// columns (high, low).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn from_halves(hi: u64, lo: u64) -> Self {
        Self(Uuid::from_u64_pair(hi, lo))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn halves(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }

    pub fn is_sentinel(&self) -> bool {
        self.0.as_bytes()[10..] == SENTINEL_SUFFIX
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A qualified name: a (namespace-index, local-name-index) pair into the
/// engine's two string indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    pub namespace: u32,
    pub local: u32,
}

impl Name {
    pub fn new(namespace: u32, local: u32) -> Self {
        Self { namespace, local }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    String,
    Binary,
    Long,
    Double,
    Date,
    Boolean,
    Name,
    Path,
    Reference,
    WeakReference,
    Uri,
    Decimal,
}

impl PropertyType {
    pub fn code(&self) -> u8 {
        match self {
            PropertyType::String => 1,
            PropertyType::Binary => 2,
            PropertyType::Long => 3,
            PropertyType::Double => 4,
            PropertyType::Date => 5,
            PropertyType::Boolean => 6,
            PropertyType::Name => 7,
            PropertyType::Path => 8,
            PropertyType::Reference => 9,
            PropertyType::WeakReference => 10,
            PropertyType::Uri => 11,
            PropertyType::Decimal => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PropertyType::String),
            2 => Some(PropertyType::Binary),
            3 => Some(PropertyType::Long),
            4 => Some(PropertyType::Double),
            5 => Some(PropertyType::Date),
            6 => Some(PropertyType::Boolean),
            7 => Some(PropertyType::Name),
            8 => Some(PropertyType::Path),
            9 => Some(PropertyType::Reference),
            10 => Some(PropertyType::WeakReference),
            11 => Some(PropertyType::Uri),
            12 => Some(PropertyType::Decimal),
            _ => None,
        }
    }
}

/// A binary property value is either carried inline in the bundle payload or
/// externalized into the blob store and referenced by id.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryValue {
    Inline(Vec<u8>),
    External(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Binary(BinaryValue),
    Long(i64),
    Double(f64),
    /// ISO-8601 lexical form, kept verbatim.
    Date(String),
    Boolean(bool),
    Name(String),
    Path(String),
    Reference(NodeId),
    WeakReference(NodeId),
    Uri(String),
    Decimal(String),
}

impl PropertyValue {
    pub fn matches(&self, ty: PropertyType) -> bool {
        matches!(
            (self, ty),
            (PropertyValue::String(_), PropertyType::String)
                | (PropertyValue::Binary(_), PropertyType::Binary)
                | (PropertyValue::Long(_), PropertyType::Long)
                | (PropertyValue::Double(_), PropertyType::Double)
                | (PropertyValue::Date(_), PropertyType::Date)
                | (PropertyValue::Boolean(_), PropertyType::Boolean)
                | (PropertyValue::Name(_), PropertyType::Name)
                | (PropertyValue::Path(_), PropertyType::Path)
                | (PropertyValue::Reference(_), PropertyType::Reference)
                | (PropertyValue::WeakReference(_), PropertyType::WeakReference)
                | (PropertyValue::Uri(_), PropertyType::Uri)
                | (PropertyValue::Decimal(_), PropertyType::Decimal)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEntry {
    pub name: Name,
    pub ty: PropertyType,
    pub multi_valued: bool,
    pub mod_count: u16,
    pub values: Vec<PropertyValue>,
}

impl PropertyEntry {
    pub fn single(name: Name, value: PropertyValue) -> Self {
        let ty = match &value {
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Binary(_) => PropertyType::Binary,
            PropertyValue::Long(_) => PropertyType::Long,
            PropertyValue::Double(_) => PropertyType::Double,
            PropertyValue::Date(_) => PropertyType::Date,
            PropertyValue::Boolean(_) => PropertyType::Boolean,
            PropertyValue::Name(_) => PropertyType::Name,
            PropertyValue::Path(_) => PropertyType::Path,
            PropertyValue::Reference(_) => PropertyType::Reference,
            PropertyValue::WeakReference(_) => PropertyType::WeakReference,
            PropertyValue::Uri(_) => PropertyType::Uri,
            PropertyValue::Decimal(_) => PropertyType::Decimal,
        };
        Self {
            name,
            ty,
            multi_valued: false,
            mod_count: 0,
            values: vec![value],
        }
    }

    pub fn multi(name: Name, ty: PropertyType, values: Vec<PropertyValue>) -> Self {
        Self {
            name,
            ty,
            multi_valued: true,
            mod_count: 0,
            values,
        }
    }
}

/// Identity of a property, used to derive deterministic blob ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyId {
    pub parent: NodeId,
    pub name: Name,
}

/// An entry in a bundle's ordered child list. Names may repeat (same-name
/// siblings); ids may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: Name,
    pub id: NodeId,
}

/// The persisted unit: a node's identity, properties, child ordering and
/// parent pointer, packed into one record.
#[derive(Debug, Clone)]
pub struct NodePropBundle {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub node_type: Name,
    pub mixin_types: Vec<Name>,
    pub properties: Vec<PropertyEntry>,
    pub child_entries: Vec<ChildEntry>,
    pub referenceable: bool,
    pub mod_count: u16,
    /// Selects insert vs update on store; supplied by the change log.
    pub is_new: bool,
    /// Size of the encoded payload the bundle was read from.
    pub size_hint: u64,
}

impl NodePropBundle {
    pub fn new(id: NodeId, node_type: Name) -> Self {
        Self {
            id,
            parent_id: None,
            node_type,
            mixin_types: Vec::new(),
            properties: Vec::new(),
            child_entries: Vec::new(),
            referenceable: false,
            mod_count: 0,
            is_new: true,
            size_hint: 0,
        }
    }

    pub fn mark_old(&mut self) {
        self.is_new = false;
    }

    pub fn property(&self, name: Name) -> Option<&PropertyEntry> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Inserts or replaces a property; insertion order is encoding order.
    pub fn put_property(&mut self, entry: PropertyEntry) {
        match self.properties.iter_mut().find(|p| p.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.properties.push(entry),
        }
    }

    pub fn add_child(&mut self, name: Name, id: NodeId) {
        self.child_entries.push(ChildEntry { name, id });
    }
}

// `is_new` and `size_hint` are transient bookkeeping; structural equality
// covers only what the codec round-trips.
impl PartialEq for NodePropBundle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.parent_id == other.parent_id
            && self.node_type == other.node_type
            && self.mixin_types == other.mixin_types
            && self.properties == other.properties
            && self.child_entries == other.child_entries
            && self.referenceable == other.referenceable
            && self.mod_count == other.mod_count
    }
}

/// Back-references to a target node: the property ids that refer to it.
/// Created on first non-empty write, destroyed when empty.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReferences {
    pub target: NodeId,
    pub references: Vec<String>,
}

impl NodeReferences {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            references: Vec::new(),
        }
    }

    pub fn add(&mut self, property_id: impl Into<String>) {
        let property_id = property_id.into();
        if !self.references.contains(&property_id) {
            self.references.push(property_id);
        }
    }

    pub fn remove(&mut self, property_id: &str) -> bool {
        match self.references.iter().position(|r| r == property_id) {
            Some(pos) => {
                self.references.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

/// A batched set of bundle and reference mutations, applied atomically by
/// the engine. A reference set in `modified_refs` that is empty is
/// destroyed rather than stored.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    pub added: Vec<NodePropBundle>,
    pub modified: Vec<NodePropBundle>,
    pub deleted: Vec<NodePropBundle>,
    pub modified_refs: Vec<NodeReferences>,
}

impl ChangeLog {
    pub fn added(&mut self, bundle: NodePropBundle) -> &mut Self {
        self.added.push(bundle);
        self
    }

    pub fn modified(&mut self, bundle: NodePropBundle) -> &mut Self {
        self.modified.push(bundle);
        self
    }

    pub fn deleted(&mut self, bundle: NodePropBundle) -> &mut Self {
        self.deleted.push(bundle);
        self
    }

    pub fn modified_refs(&mut self, refs: NodeReferences) -> &mut Self {
        self.modified_refs.push(refs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_detection() {
        let id: NodeId = "deadbeef-face-babe-cafe-babecafebabe".parse().unwrap();
        assert!(id.is_sentinel());
        let id: NodeId = "deadbeef-face-babe-cafe-babecafebabf".parse().unwrap();
        assert!(!id.is_sentinel());
    }

    #[test]
    fn halves_round_trip() {
        let id = NodeId::from_halves(0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210);
        let (hi, lo) = id.halves();
        assert_eq!(hi, 0x0123_4567_89ab_cdef);
        assert_eq!(lo, 0xfedc_ba98_7654_3210);
        assert_eq!(NodeId::from_halves(hi, lo), id);
    }

    #[test]
    fn put_property_replaces_in_place() {
        let mut bundle = NodePropBundle::new(NodeId::from_halves(0, 1), Name::new(0, 1));
        bundle.put_property(PropertyEntry::single(
            Name::new(0, 2),
            PropertyValue::String("a".into()),
        ));
        bundle.put_property(PropertyEntry::single(
            Name::new(0, 3),
            PropertyValue::Long(1),
        ));
        bundle.put_property(PropertyEntry::single(
            Name::new(0, 2),
            PropertyValue::String("b".into()),
        ));
        assert_eq!(bundle.properties.len(), 2);
        assert_eq!(
            bundle.properties[0].values,
            vec![PropertyValue::String("b".into())]
        );
    }

    #[test]
    fn structural_equality_ignores_transients() {
        let mut a = NodePropBundle::new(NodeId::from_halves(1, 2), Name::new(0, 1));
        let mut b = a.clone();
        b.is_new = false;
        b.size_hint = 42;
        a.is_new = true;
        assert_eq!(a, b);
    }
}
