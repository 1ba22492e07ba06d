use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::{ErrorHandling, StringIndex};
use crate::blob::BlobStore;
use crate::error::{BundleError, Result};
use crate::model::{
    BinaryValue, ChildEntry, Name, NodeId, NodePropBundle, PropertyEntry, PropertyId,
    PropertyType, PropertyValue,
};

/// Current bundle format version; the first payload byte. Readers refuse
/// anything else.
pub const VERSION_1: u8 = 1;

/// Terminates the property table. The string index never issues integers
/// whose varint encoding leads with this byte.
const PROPERTY_TERMINATOR: u8 = 0xff;

/// Length-framed, self-describing binary codec for node bundles.
///
/// Multi-byte integers are big-endian; counts and name indices are unsigned
/// LEB128 varints. Binary values below `min_blob_size` are carried inline,
/// larger ones are written to the blob store at encode time and referenced
/// by id.
pub struct BundleCodec {
    blobs: Arc<dyn BlobStore>,
    ns_index: Arc<dyn StringIndex>,
    name_index: Arc<dyn StringIndex>,
    min_blob_size: usize,
    errors: ErrorHandling,
}

impl BundleCodec {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        ns_index: Arc<dyn StringIndex>,
        name_index: Arc<dyn StringIndex>,
        min_blob_size: usize,
        errors: ErrorHandling,
    ) -> Self {
        Self {
            blobs,
            ns_index,
            name_index,
            min_blob_size,
            errors,
        }
    }

    pub fn min_blob_size(&self) -> usize {
        self.min_blob_size
    }

    pub(crate) fn error_handling(&self) -> ErrorHandling {
        self.errors
    }

    pub fn encode(&self, bundle: &NodePropBundle) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(256);
        buf.push(VERSION_1);
        write_name(&mut buf, bundle.node_type);
        match bundle.parent_id {
            Some(parent) => {
                buf.push(1);
                buf.extend_from_slice(parent.as_bytes());
            }
            None => buf.push(0),
        }
        // legacy definition id slot
        buf.extend_from_slice(&[0u8; 16]);

        write_varint(&mut buf, bundle.mixin_types.len() as u64);
        for mixin in &bundle.mixin_types {
            write_name(&mut buf, *mixin);
        }

        for entry in &bundle.properties {
            self.write_property(&mut buf, bundle.id, entry)?;
        }
        buf.push(PROPERTY_TERMINATOR);

        write_varint(&mut buf, bundle.child_entries.len() as u64);
        for child in &bundle.child_entries {
            write_name(&mut buf, child.name);
            buf.extend_from_slice(child.id.as_bytes());
        }

        buf.push(bundle.referenceable as u8);
        buf.extend_from_slice(&bundle.mod_count.to_be_bytes());
        Ok(buf)
    }

    fn write_property(
        &self,
        buf: &mut Vec<u8>,
        parent: NodeId,
        entry: &PropertyEntry,
    ) -> Result<()> {
        if !entry.multi_valued && entry.values.len() != 1 {
            return Err(BundleError::Encoding(format!(
                "single-valued property {}:{} carries {} values",
                entry.name.namespace,
                entry.name.local,
                entry.values.len()
            )));
        }
        // an index the string index would never issue; its varint collides
        // with the property table terminator
        if super::names::reserved_index(entry.name.namespace) {
            return Err(BundleError::Encoding(format!(
                "property namespace index {} is reserved",
                entry.name.namespace
            )));
        }
        write_name(buf, entry.name);
        buf.push(entry.ty.code());
        buf.push(entry.multi_valued as u8);
        buf.extend_from_slice(&entry.mod_count.to_be_bytes());
        write_varint(buf, entry.values.len() as u64);
        for (index, value) in entry.values.iter().enumerate() {
            if !value.matches(entry.ty) {
                return Err(BundleError::Encoding(format!(
                    "property {}:{} declares type {:?} but value {} does not match",
                    entry.name.namespace, entry.name.local, entry.ty, index
                )));
            }
            self.write_value(buf, parent, entry.name, index, value)?;
        }
        Ok(())
    }

    fn write_value(
        &self,
        buf: &mut Vec<u8>,
        parent: NodeId,
        name: Name,
        index: usize,
        value: &PropertyValue,
    ) -> Result<()> {
        match value {
            PropertyValue::String(s)
            | PropertyValue::Date(s)
            | PropertyValue::Name(s)
            | PropertyValue::Path(s)
            | PropertyValue::Uri(s)
            | PropertyValue::Decimal(s) => write_string(buf, s),
            PropertyValue::Reference(id) | PropertyValue::WeakReference(id) => {
                write_string(buf, &id.to_string())
            }
            PropertyValue::Long(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PropertyValue::Double(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PropertyValue::Boolean(v) => buf.push(*v as u8),
            PropertyValue::Binary(BinaryValue::External(blob_id)) => {
                write_blob_id(buf, blob_id);
            }
            PropertyValue::Binary(BinaryValue::Inline(data)) => {
                if data.len() >= self.min_blob_size {
                    let property = PropertyId { parent, name };
                    let blob_id = self.blobs.create_id(&property, index);
                    self.blobs.put(&blob_id, data)?;
                    write_blob_id(buf, &blob_id);
                } else {
                    write_signed_varint(buf, data.len() as i64);
                    buf.extend_from_slice(data);
                }
            }
        }
        Ok(())
    }

    pub fn decode(&self, bytes: &[u8], id: NodeId) -> Result<NodePropBundle> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != VERSION_1 {
            return Err(BundleError::Decoding(format!(
                "unsupported bundle format version {version}"
            )));
        }

        let node_type = r.name()?;
        let mut bundle = NodePropBundle::new(id, node_type);
        bundle.mark_old();
        if r.u8()? != 0 {
            bundle.parent_id = Some(r.node_id()?);
        }
        r.bytes(16)?; // legacy definition id

        let mixin_count = r.varint()? as usize;
        for _ in 0..mixin_count {
            let mixin = r.name()?;
            if self.resolves(mixin) {
                bundle.mixin_types.push(mixin);
            } else if self.errors.ignore_missing_names() {
                warn!(
                    namespace = mixin.namespace,
                    local = mixin.local,
                    bundle = %id,
                    "skipping mixin with unresolvable name"
                );
            } else {
                return Err(BundleError::Decoding(format!(
                    "bundle {} references unresolvable mixin ({}, {})",
                    id, mixin.namespace, mixin.local
                )));
            }
        }

        while r.peek_u8()? != PROPERTY_TERMINATOR {
            let entry = self.read_property(&mut r)?;
            if self.resolves(entry.name) {
                bundle.properties.push(entry);
            } else if self.errors.ignore_missing_names() {
                warn!(
                    namespace = entry.name.namespace,
                    local = entry.name.local,
                    bundle = %id,
                    "skipping property with unresolvable name"
                );
            } else {
                return Err(BundleError::Decoding(format!(
                    "bundle {} references unresolvable property name ({}, {})",
                    id, entry.name.namespace, entry.name.local
                )));
            }
        }
        r.u8()?;

        let child_count = r.varint()? as usize;
        for _ in 0..child_count {
            let name = r.name()?;
            let child_id = r.node_id()?;
            bundle.child_entries.push(ChildEntry { name, id: child_id });
        }

        bundle.referenceable = r.u8()? != 0;
        bundle.mod_count = r.u16()?;
        r.ensure_consumed()?;
        Ok(bundle)
    }

    fn read_property(&self, r: &mut Reader<'_>) -> Result<PropertyEntry> {
        let name = r.name()?;
        let code = r.u8()?;
        let ty = PropertyType::from_code(code).ok_or_else(|| {
            BundleError::Decoding(format!(
                "unknown property type code 0x{:02x} at offset {}",
                code,
                r.pos() - 1
            ))
        })?;
        let multi_valued = r.u8()? != 0;
        let mod_count = r.u16()?;
        let count = r.varint()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_value(r, ty)?);
        }
        Ok(PropertyEntry {
            name,
            ty,
            multi_valued,
            mod_count,
            values,
        })
    }

    fn read_value(&self, r: &mut Reader<'_>, ty: PropertyType) -> Result<PropertyValue> {
        Ok(match ty {
            PropertyType::String => PropertyValue::String(r.string()?),
            PropertyType::Date => PropertyValue::Date(r.string()?),
            PropertyType::Name => PropertyValue::Name(r.string()?),
            PropertyType::Path => PropertyValue::Path(r.string()?),
            PropertyType::Uri => PropertyValue::Uri(r.string()?),
            PropertyType::Decimal => PropertyValue::Decimal(r.string()?),
            PropertyType::Reference => PropertyValue::Reference(r.ref_id()?),
            PropertyType::WeakReference => PropertyValue::WeakReference(r.ref_id()?),
            PropertyType::Long => {
                let bytes: [u8; 8] = r.bytes(8)?.try_into().expect("slice has exactly 8 bytes");
                PropertyValue::Long(i64::from_be_bytes(bytes))
            }
            PropertyType::Double => {
                let bytes: [u8; 8] = r.bytes(8)?.try_into().expect("slice has exactly 8 bytes");
                PropertyValue::Double(f64::from_be_bytes(bytes))
            }
            PropertyType::Boolean => PropertyValue::Boolean(r.u8()? != 0),
            PropertyType::Binary => {
                let len = r.signed_varint()?;
                if len < 0 {
                    let raw = r.bytes(len.unsigned_abs() as usize)?;
                    let blob_id = std::str::from_utf8(raw).map_err(|_| {
                        BundleError::Decoding(format!(
                            "blob id is not valid UTF-8 at offset {}",
                            r.pos()
                        ))
                    })?;
                    PropertyValue::Binary(BinaryValue::External(blob_id.to_string()))
                } else {
                    PropertyValue::Binary(BinaryValue::Inline(r.bytes(len as usize)?.to_vec()))
                }
            }
        })
    }

    fn resolves(&self, name: Name) -> bool {
        self.ns_index.lookup(name.namespace).is_ok() && self.name_index.lookup(name.local).is_ok()
    }

    /// Walks the payload structure without materializing values. Used when a
    /// decode fails, to pinpoint the offset of the first malformed element.
    pub fn check(&self, bytes: &[u8]) -> std::result::Result<(), CheckFailure> {
        let mut r = Reader::new(bytes);
        let fail = |r: &Reader<'_>, reason: &str| CheckFailure {
            offset: r.pos(),
            reason: reason.to_string(),
        };

        let version = r.u8().map_err(|_| fail(&r, "missing version byte"))?;
        if version != VERSION_1 {
            return Err(CheckFailure {
                offset: 0,
                reason: format!("unsupported version {version}"),
            });
        }
        r.skip_name().map_err(|_| fail(&r, "node type name"))?;
        let parent = r.u8().map_err(|_| fail(&r, "parent flag"))?;
        if parent != 0 {
            r.bytes(16).map_err(|_| fail(&r, "parent id"))?;
        }
        r.bytes(16).map_err(|_| fail(&r, "definition id"))?;

        let mixins = r.varint().map_err(|_| fail(&r, "mixin count"))?;
        for _ in 0..mixins {
            r.skip_name().map_err(|_| fail(&r, "mixin name"))?;
        }

        loop {
            let lead = r.peek_u8().map_err(|_| fail(&r, "property table"))?;
            if lead == PROPERTY_TERMINATOR {
                r.u8().expect("peeked byte is readable");
                break;
            }
            r.skip_name().map_err(|_| fail(&r, "property name"))?;
            let code = r.u8().map_err(|_| fail(&r, "property type"))?;
            let ty = PropertyType::from_code(code).ok_or_else(|| CheckFailure {
                offset: r.pos() - 1,
                reason: format!("unknown property type code 0x{code:02x}"),
            })?;
            r.u8().map_err(|_| fail(&r, "multi-valued flag"))?;
            r.u16().map_err(|_| fail(&r, "property mod count"))?;
            let count = r.varint().map_err(|_| fail(&r, "value count"))?;
            for _ in 0..count {
                r.skip_value(ty).map_err(|_| fail(&r, "property value"))?;
            }
        }

        let children = r.varint().map_err(|_| fail(&r, "child count"))?;
        for _ in 0..children {
            r.skip_name().map_err(|_| fail(&r, "child name"))?;
            r.bytes(16).map_err(|_| fail(&r, "child id"))?;
        }
        r.u8().map_err(|_| fail(&r, "referenceable flag"))?;
        r.u16().map_err(|_| fail(&r, "mod count"))?;
        r.ensure_consumed().map_err(|_| fail(&r, "trailing bytes"))?;
        Ok(())
    }

    /// Blob ids the given bundle occupies in the blob store: ids already
    /// externalized, plus the ids inline values beyond the threshold would
    /// be (or were) written under. Drives blob removal on destroy.
    pub fn blob_ids(&self, bundle: &NodePropBundle) -> Vec<String> {
        let mut ids = Vec::new();
        for entry in &bundle.properties {
            for (index, value) in entry.values.iter().enumerate() {
                match value {
                    PropertyValue::Binary(BinaryValue::External(blob_id)) => {
                        ids.push(blob_id.clone());
                    }
                    PropertyValue::Binary(BinaryValue::Inline(data))
                        if data.len() >= self.min_blob_size =>
                    {
                        let property = PropertyId {
                            parent: bundle.id,
                            name: entry.name,
                        };
                        ids.push(self.blobs.create_id(&property, index));
                    }
                    _ => {}
                }
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub offset: usize,
    pub reason: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.reason, self.offset)
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_signed_varint(buf: &mut Vec<u8>, value: i64) {
    write_varint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

fn write_name(buf: &mut Vec<u8>, name: Name) {
    write_varint(buf, name.namespace as u64);
    write_varint(buf, name.local as u64);
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn write_blob_id(buf: &mut Vec<u8>, blob_id: &str) {
    write_signed_varint(buf, -(blob_id.len() as i64));
    buf.extend_from_slice(blob_id.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(BundleError::Decoding(format!(
                "unexpected end of payload at offset {}",
                self.pos
            )));
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..self.pos])
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn peek_u8(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or_else(|| {
            BundleError::Decoding(format!("unexpected end of payload at offset {}", self.pos))
        })
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self.bytes(2)?.try_into().expect("slice has exactly 2 bytes");
        Ok(u16::from_be_bytes(bytes))
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift >= 64 {
                return Err(BundleError::Decoding(format!(
                    "varint overflow at offset {}",
                    self.pos
                )));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn signed_varint(&mut self) -> Result<i64> {
        let raw = self.varint()?;
        Ok((raw >> 1) as i64 ^ -((raw & 1) as i64))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.varint()? as usize;
        let start = self.pos;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            BundleError::Decoding(format!("invalid UTF-8 string at offset {start}"))
        })
    }

    fn node_id(&mut self) -> Result<NodeId> {
        let bytes: [u8; 16] = self
            .bytes(16)?
            .try_into()
            .expect("slice has exactly 16 bytes");
        Ok(NodeId::from_bytes(bytes))
    }

    fn ref_id(&mut self) -> Result<NodeId> {
        let start = self.pos;
        let lexical = self.string()?;
        lexical.parse().map_err(|_| {
            BundleError::Decoding(format!("invalid node id reference at offset {start}"))
        })
    }

    fn name(&mut self) -> Result<Name> {
        let namespace = self.index_varint()?;
        let local = self.index_varint()?;
        Ok(Name { namespace, local })
    }

    fn index_varint(&mut self) -> Result<u32> {
        let start = self.pos;
        let value = self.varint()?;
        u32::try_from(value).map_err(|_| {
            BundleError::Decoding(format!("name index out of range at offset {start}"))
        })
    }

    fn skip_name(&mut self) -> Result<()> {
        self.index_varint()?;
        self.index_varint()?;
        Ok(())
    }

    fn skip_string(&mut self) -> Result<()> {
        let len = self.varint()? as usize;
        self.bytes(len)?;
        Ok(())
    }

    fn skip_value(&mut self, ty: PropertyType) -> Result<()> {
        match ty {
            PropertyType::String
            | PropertyType::Date
            | PropertyType::Name
            | PropertyType::Path
            | PropertyType::Uri
            | PropertyType::Decimal
            | PropertyType::Reference
            | PropertyType::WeakReference => self.skip_string(),
            PropertyType::Long | PropertyType::Double => self.bytes(8).map(|_| ()),
            PropertyType::Boolean => self.u8().map(|_| ()),
            PropertyType::Binary => {
                let len = self.signed_varint()?;
                self.bytes(len.unsigned_abs() as usize).map(|_| ())
            }
        }
    }

    fn ensure_consumed(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(BundleError::Decoding(format!(
                "unexpected trailing bytes at offset {}",
                self.pos
            )));
        }
        Ok(())
    }
}
