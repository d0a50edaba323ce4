//! Typed model of parsed fields.
//!
//! A parse produces a tree of [`ParsedField`]s rooted in an unnamed
//! struct. Scalars and scalar arrays keep their primitive storage, struct
//! arrays hold one child list per element. The tree is immutable once
//! returned.

use crate::compiled::NamedFieldInfo;

/// Value payload of a parsed field.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Value {
    Bit(u8),
    Bool(bool),
    Byte(i8),
    UByte(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    Long(i64),
    BitArray(Vec<u8>),
    BoolArray(Vec<bool>),
    ByteArray(Vec<i8>),
    UByteArray(Vec<u8>),
    ShortArray(Vec<i16>),
    UShortArray(Vec<u16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    Struct(Vec<ParsedField>),
    StructArray(Vec<Vec<ParsedField>>),
}

/// A single parsed field: optional name info plus its value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ParsedField {
    pub name: Option<NamedFieldInfo>,
    pub value: Value,
}

impl Value {
    /// Numeric projection of scalar values, widened to `i64`.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Bit(v) => Some(*v as i64),
            Value::Bool(v) => Some(*v as i64),
            Value::Byte(v) => Some(*v as i64),
            Value::UByte(v) => Some(*v as i64),
            Value::Short(v) => Some(*v as i64),
            Value::UShort(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric projection truncated to `i32`.
    pub fn as_int(&self) -> Option<i32> {
        self.as_long().map(|v| v as i32)
    }

    /// Boolean projection: non-zero numeric scalars are `true`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            other => other.as_long().map(|v| v != 0),
        }
    }

    /// Element count of arrays and child count of structs.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::BitArray(v) => Some(v.len()),
            Value::BoolArray(v) => Some(v.len()),
            Value::ByteArray(v) => Some(v.len()),
            Value::UByteArray(v) => Some(v.len()),
            Value::ShortArray(v) => Some(v.len()),
            Value::UShortArray(v) => Some(v.len()),
            Value::IntArray(v) => Some(v.len()),
            Value::LongArray(v) => Some(v.len()),
            Value::Struct(v) => Some(v.len()),
            Value::StructArray(v) => Some(v.len()),
            _ => None,
        }
    }

    /// Element of a scalar array, widened to `i64`.
    pub fn element_as_long(&self, index: usize) -> Option<i64> {
        match self {
            Value::BitArray(v) => v.get(index).map(|x| *x as i64),
            Value::BoolArray(v) => v.get(index).map(|x| *x as i64),
            Value::ByteArray(v) => v.get(index).map(|x| *x as i64),
            Value::UByteArray(v) => v.get(index).map(|x| *x as i64),
            Value::ShortArray(v) => v.get(index).map(|x| *x as i64),
            Value::UShortArray(v) => v.get(index).map(|x| *x as i64),
            Value::IntArray(v) => v.get(index).map(|x| *x as i64),
            Value::LongArray(v) => v.get(index).copied(),
            _ => None,
        }
    }

    pub fn element_as_int(&self, index: usize) -> Option<i32> {
        self.element_as_long(index).map(|v| v as i32)
    }

    pub fn element_as_bool(&self, index: usize) -> Option<bool> {
        self.element_as_long(index).map(|v| v != 0)
    }

    /// Children of a struct value.
    pub fn fields(&self) -> Option<&[ParsedField]> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Elements of a struct array, one child list per element.
    pub fn struct_elements(&self) -> Option<&[Vec<ParsedField>]> {
        match self {
            Value::StructArray(elements) => Some(elements),
            _ => None,
        }
    }
}

impl ParsedField {
    /// Leaf name of this field, if named.
    pub fn leaf_name(&self) -> Option<&str> {
        self.name.as_ref().map(|n| n.name.as_str())
    }

    /// Resolves a dotted path among the children of this struct field.
    /// Lookup is case-insensitive; intermediate segments must be structs.
    pub fn find(&self, path: &str) -> Option<&ParsedField> {
        let path = path.to_ascii_lowercase();
        let mut fields = self.value.fields()?;

        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let child = fields
                .iter()
                .find(|f| f.leaf_name() == Some(segment))?;
            if segments.peek().is_none() {
                return Some(child);
            }
            fields = child.value.fields()?;
        }
        None
    }

    pub fn find_int(&self, path: &str) -> Option<i32> {
        self.find(path)?.value.as_int()
    }

    pub fn find_long(&self, path: &str) -> Option<i64> {
        self.find(path)?.value.as_long()
    }

    pub fn find_bool(&self, path: &str) -> Option<bool> {
        self.find(path)?.value.as_bool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(path: &str) -> Option<NamedFieldInfo> {
        Some(NamedFieldInfo {
            path: path.to_string(),
            name: path.rsplit('.').next().unwrap().to_string(),
            offset: 0,
        })
    }

    #[test]
    fn test_numeric_projections() {
        assert_eq!(Value::Byte(-1).as_int(), Some(-1));
        assert_eq!(Value::UByte(0xFF).as_int(), Some(255));
        assert_eq!(Value::Short(-2).as_long(), Some(-2));
        assert_eq!(Value::UShort(0xFFFF).as_long(), Some(65535));
        assert_eq!(Value::Long(i64::MAX).as_int(), Some(-1));
        assert_eq!(Value::Bool(true).as_long(), Some(1));
        assert_eq!(Value::Int(0).as_bool(), Some(false));
        assert_eq!(Value::Bit(3).as_bool(), Some(true));
        assert_eq!(Value::UByteArray(vec![1]).as_long(), None);
    }

    #[test]
    fn test_array_projections() {
        let v = Value::ShortArray(vec![-1, 2]);
        assert_eq!(v.len(), Some(2));
        assert_eq!(v.element_as_int(0), Some(-1));
        assert_eq!(v.element_as_long(1), Some(2));
        assert_eq!(v.element_as_int(2), None);
        assert_eq!(v.element_as_bool(1), Some(true));
    }

    #[test]
    fn test_path_lookup() {
        let root = ParsedField {
            name: None,
            value: Value::Struct(vec![
                ParsedField {
                    name: named("hdr"),
                    value: Value::Struct(vec![ParsedField {
                        name: named("hdr.size"),
                        value: Value::Int(42),
                    }]),
                },
                ParsedField {
                    name: named("crc"),
                    value: Value::UShort(7),
                },
            ]),
        };

        assert_eq!(root.find_int("hdr.size"), Some(42));
        assert_eq!(root.find_int("HDR.Size"), Some(42));
        assert_eq!(root.find_int("crc"), Some(7));
        assert!(root.find("hdr.missing").is_none());
        assert!(root.find("crc.size").is_none());
        assert_eq!(root.find("hdr").and_then(|f| f.value.len()), Some(1));
    }
}
