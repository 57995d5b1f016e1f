//! Field types, schemas and tuples.
//!
//! Every field has a fixed width, so the byte size of a tuple is a function of
//! its [`TupleDesc`] alone. Integers are stored as big-endian `i32`; strings as
//! a big-endian `u32` length followed by [`STRING_LEN`] zero-padded bytes.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::error::{DbError, DbResult};
use crate::RecordId;

/// Maximum number of bytes stored for a string field.
pub const STRING_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Str,
}

impl FieldType {
    /// Width of a serialized field of this type, in bytes.
    pub fn len(self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::Str => STRING_LEN + 4,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int" => Some(FieldType::Int),
            "string" => Some(FieldType::Str),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int => f.write_str("INT"),
            FieldType::Str => f.write_str("STRING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Int(i32),
    Str(String),
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Int(_) => FieldType::Int,
            Field::Str(_) => FieldType::Str,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Field::Int(v) => buf.put_i32(*v),
            Field::Str(s) => {
                let bytes = s.as_bytes();
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(bytes);
                buf.put_bytes(0, STRING_LEN - bytes.len());
            }
        }
    }

    fn decode(field_type: FieldType, buf: &mut impl Buf) -> DbResult<Self> {
        match field_type {
            FieldType::Int => Ok(Field::Int(buf.get_i32())),
            FieldType::Str => {
                let len = buf.get_u32() as usize;
                if len > STRING_LEN {
                    return Err(DbError::Corrupt {
                        detail: format!("string length {len} exceeds {STRING_LEN}"),
                    });
                }
                let mut raw = vec![0u8; STRING_LEN];
                buf.copy_to_slice(&mut raw);
                raw.truncate(len);
                String::from_utf8(raw)
                    .map(Field::Str)
                    .map_err(|e| DbError::Corrupt {
                        detail: format!("string field is not utf-8: {e}"),
                    })
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{v}"),
            Field::Str(s) => f.write_str(s),
        }
    }
}

/// One column of a [`TupleDesc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdItem {
    pub field_type: FieldType,
    pub name: Option<String>,
}

/// The schema of a tuple: an ordered list of typed, optionally named fields.
#[derive(Debug, Clone)]
pub struct TupleDesc {
    items: Vec<TdItem>,
}

impl TupleDesc {
    pub fn new(types: &[FieldType], names: &[&str]) -> Self {
        let items = types
            .iter()
            .enumerate()
            .map(|(i, t)| TdItem {
                field_type: *t,
                name: names.get(i).map(|n| n.to_string()),
            })
            .collect();
        Self { items }
    }

    /// A descriptor with anonymous fields.
    pub fn unnamed(types: &[FieldType]) -> Self {
        Self::new(types, &[])
    }

    pub fn from_items(items: Vec<TdItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[TdItem] {
        &self.items
    }

    pub fn num_fields(&self) -> usize {
        self.items.len()
    }

    pub fn field_name(&self, i: usize) -> Option<&str> {
        self.items.get(i).and_then(|item| item.name.as_deref())
    }

    pub fn field_type(&self, i: usize) -> Option<FieldType> {
        self.items.get(i).map(|item| item.field_type)
    }

    /// Index of the first field called `name`. Either side may carry a table
    /// qualifier (`alias.field`); when only one side does, the bare names are
    /// compared.
    pub fn field_name_to_index(&self, name: &str) -> Option<usize> {
        let (query_alias, query_field) = split_qualified(name);
        self.items.iter().position(|item| {
            let Some(field_name) = item.name.as_deref() else {
                return false;
            };
            let (alias, field) = split_qualified(field_name);
            match (query_alias, alias) {
                (Some(_), Some(_)) => field_name == name,
                _ => field == query_field,
            }
        })
    }

    /// Size in bytes of every tuple with this schema.
    pub fn size(&self) -> usize {
        self.items.iter().map(|item| item.field_type.len()).sum()
    }

    /// Concatenates two schemas, `a`'s fields first.
    pub fn merge(a: &TupleDesc, b: &TupleDesc) -> TupleDesc {
        let mut items = a.items.clone();
        items.extend(b.items.iter().cloned());
        TupleDesc { items }
    }
}

fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((alias, field)) => (Some(alias), field),
        None => (None, name),
    }
}

/// Two descriptors are equal when their field types match position by
/// position; names are ignored.
impl PartialEq for TupleDesc {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(&other.items)
                .all(|(a, b)| a.field_type == b.field_type)
    }
}

impl Eq for TupleDesc {}

impl fmt::Display for TupleDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(
                f,
                "{}({})",
                item.field_type,
                item.name.as_deref().unwrap_or("null")
            )?;
        }
        Ok(())
    }
}

/// A row of field values conforming to a [`TupleDesc`].
#[derive(Debug, Clone)]
pub struct Tuple {
    desc: Arc<TupleDesc>,
    fields: Vec<Field>,
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(desc: Arc<TupleDesc>, fields: Vec<Field>) -> DbResult<Self> {
        if fields.len() != desc.num_fields() {
            return Err(DbError::SchemaMismatch {
                detail: format!(
                    "expected {} fields, got {}",
                    desc.num_fields(),
                    fields.len()
                ),
            });
        }
        for (i, field) in fields.iter().enumerate() {
            let expected = desc.items[i].field_type;
            if field.field_type() != expected {
                return Err(DbError::SchemaMismatch {
                    detail: format!("field {i}: expected {expected}, got {}", field.field_type()),
                });
            }
            if let Field::Str(s) = field {
                if s.len() > STRING_LEN {
                    return Err(DbError::StringTooLong {
                        len: s.len(),
                        max: STRING_LEN,
                    });
                }
            }
        }
        Ok(Self {
            desc,
            fields,
            record_id: None,
        })
    }

    pub fn desc(&self) -> &Arc<TupleDesc> {
        &self.desc
    }

    pub fn field(&self, i: usize) -> Option<&Field> {
        self.fields.get(i)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Replaces field `i`; the value must match the schema.
    pub fn set_field(&mut self, i: usize, field: Field) -> DbResult<()> {
        let expected = self.desc.field_type(i).ok_or_else(|| DbError::SchemaMismatch {
            detail: format!("no field {i}"),
        })?;
        if field.field_type() != expected {
            return Err(DbError::SchemaMismatch {
                detail: format!("field {i}: expected {expected}, got {}", field.field_type()),
            });
        }
        if let Field::Str(s) = &field {
            if s.len() > STRING_LEN {
                return Err(DbError::StringTooLong {
                    len: s.len(),
                    max: STRING_LEN,
                });
            }
        }
        self.fields[i] = field;
        Ok(())
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.record_id = rid;
    }

    /// Serializes into exactly `desc().size()` bytes.
    pub fn encode(&self, mut out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.desc.size());
        for field in &self.fields {
            field.encode(&mut out);
        }
    }

    pub fn decode(desc: Arc<TupleDesc>, mut bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() < desc.size() {
            return Err(DbError::Corrupt {
                detail: format!("tuple needs {} bytes, got {}", desc.size(), bytes.len()),
            });
        }
        let fields = desc
            .items
            .iter()
            .map(|item| Field::decode(item.field_type, &mut bytes))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Self {
            desc,
            fields,
            record_id: None,
        })
    }
}

/// Tuples compare by value; the record id is not part of equality.
impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str("\t")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> Arc<TupleDesc> {
        Arc::new(TupleDesc::new(
            &[FieldType::Int, FieldType::Str],
            &["id", "name"],
        ))
    }

    #[test]
    fn test_size_is_sum_of_widths() {
        assert_eq!(people().size(), 4 + 132);
        assert_eq!(TupleDesc::unnamed(&[FieldType::Int; 3]).size(), 12);
    }

    #[test]
    fn test_field_name_lookup() {
        let td = people();
        assert_eq!(td.field_name_to_index("name"), Some(1));
        assert_eq!(td.field_name_to_index("p.name"), Some(1));
        assert_eq!(td.field_name_to_index("missing"), None);

        let qualified = TupleDesc::new(&[FieldType::Int], &["p.id"]);
        assert_eq!(qualified.field_name_to_index("id"), Some(0));
        assert_eq!(qualified.field_name_to_index("p.id"), Some(0));
        assert_eq!(qualified.field_name_to_index("q.id"), None);

        assert_eq!(
            TupleDesc::unnamed(&[FieldType::Int]).field_name_to_index("id"),
            None
        );
    }

    #[test]
    fn test_merge_and_equality() {
        let td = people();
        let merged = TupleDesc::merge(&td, &TupleDesc::unnamed(&[FieldType::Int]));
        assert_eq!(merged.num_fields(), 3);
        assert_eq!(merged.field_name(1), Some("name"));
        assert_eq!(merged.field_name(2), None);
        assert_eq!(merged.size(), td.size() + 4);

        // names do not matter for equality
        let renamed = TupleDesc::new(&[FieldType::Int, FieldType::Str], &["a", "b"]);
        assert_eq!(*td, renamed);
        assert_ne!(*td, TupleDesc::unnamed(&[FieldType::Str, FieldType::Int]));
    }

    #[test]
    fn test_display() {
        assert_eq!(people().to_string(), "INT(id),STRING(name)");
    }

    #[test]
    fn test_schema_validation() {
        let td = people();
        assert!(matches!(
            Tuple::new(td.clone(), vec![Field::Int(1)]),
            Err(DbError::SchemaMismatch { .. })
        ));
        assert!(matches!(
            Tuple::new(td.clone(), vec![Field::Str("x".into()), Field::Int(1)]),
            Err(DbError::SchemaMismatch { .. })
        ));
        assert!(matches!(
            Tuple::new(td, vec![Field::Int(1), Field::Str("x".repeat(129))]),
            Err(DbError::StringTooLong { len: 129, .. })
        ));
    }

    #[test]
    fn test_encoding_layout() {
        let td = people();
        let tuple = Tuple::new(td.clone(), vec![Field::Int(258), Field::Str("ab".into())]).unwrap();
        let mut buf = vec![0xffu8; td.size()];
        tuple.encode(&mut buf);

        assert_eq!(&buf[0..4], &[0, 0, 1, 2]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 2]);
        assert_eq!(&buf[8..10], b"ab");
        assert!(buf[10..].iter().all(|b| *b == 0));

        let decoded = Tuple::decode(td, &buf).unwrap();
        assert_eq!(decoded, tuple);
    }

    #[test]
    fn test_decode_rejects_bad_string_length() {
        let td = Arc::new(TupleDesc::unnamed(&[FieldType::Str]));
        let mut buf = vec![0u8; td.size()];
        buf[0..4].copy_from_slice(&500u32.to_be_bytes());
        assert!(matches!(
            Tuple::decode(td, &buf),
            Err(DbError::Corrupt { .. })
        ));
    }
}
