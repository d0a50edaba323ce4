//! Compiled form of a schema: the bytecode and its side tables.
//!
//! Instructions are one or two opcode bytes followed by packed-integer
//! operands. A [`CompiledBlock`] is immutable once built and may be shared
//! freely across concurrent parses.

use crate::bits::ByteOrder;
use crate::errors::{Error, Result};
use crate::expr::Expr;

pub(crate) const CODE_ALIGN: u8 = 0x01;
pub(crate) const CODE_BIT: u8 = 0x02;
pub(crate) const CODE_BOOL: u8 = 0x03;
pub(crate) const CODE_UBYTE: u8 = 0x04;
pub(crate) const CODE_BYTE: u8 = 0x05;
pub(crate) const CODE_USHORT: u8 = 0x06;
pub(crate) const CODE_SHORT: u8 = 0x07;
pub(crate) const CODE_INT: u8 = 0x08;
pub(crate) const CODE_LONG: u8 = 0x09;
pub(crate) const CODE_STRUCT_START: u8 = 0x0A;
pub(crate) const CODE_STRUCT_END: u8 = 0x0B;
pub(crate) const CODE_SKIP: u8 = 0x0C;
pub(crate) const CODE_VAR: u8 = 0x0D;
pub(crate) const CODE_RESET_COUNTER: u8 = 0x0E;
pub(crate) const CODE_CUSTOM_TYPE: u8 = 0x0F;

/// The field has a name; it claims the next named-field table entry.
pub(crate) const FLAG_NAMED: u8 = 0x10;
/// The field is an array with a literal arity operand. Cleared again for
/// whole-stream arrays once compilation finishes.
pub(crate) const FLAG_ARRAY: u8 = 0x20;
/// Multi-byte values decode little-endian instead of big-endian.
pub(crate) const FLAG_LITTLE_ENDIAN: u8 = 0x40;
/// A second opcode byte with extended flags follows.
pub(crate) const FLAG_WIDE: u8 = 0x80;

/// Extended flag: the array length is a compiled expression, or the array
/// is a whole-stream one (no `FLAG_ARRAY` in that case).
pub(crate) const EXT_FLAG_EXPR_OR_WHOLESTREAM: u8 = 0x01;
/// Extended flag: the extra-data slot is a compiled expression instead of
/// a packed literal.
pub(crate) const EXT_FLAG_EXTRA_AS_EXPRESSION: u8 = 0x02;

/// Packs an integer into the 1/3/5-byte variable-length operand encoding.
pub fn pack_int(value: i32) -> Vec<u8> {
    let v = value as u32;
    if v & 0xFFFF_FF80 == 0 {
        vec![v as u8]
    } else if v & 0xFFFF_0000 == 0 {
        vec![0x80, (v >> 8) as u8, v as u8]
    } else {
        vec![
            0x81,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }
}

/// Unpacks a packed integer at `*pos`, advancing the position.
pub fn unpack_int(data: &[u8], pos: &mut usize) -> Result<i32> {
    let start = *pos;
    let prefix = *data.get(*pos).ok_or_else(|| {
        Error::parsing("packed integer outside of compiled block", start, None)
    })?;
    *pos += 1;
    if prefix < 0x80 {
        return Ok(prefix as i32);
    }

    let take = |pos: &mut usize| -> Result<u32> {
        let b = *data.get(*pos).ok_or_else(|| {
            Error::parsing("truncated packed integer", start, None)
        })?;
        *pos += 1;
        Ok(b as u32)
    };

    match prefix {
        0x80 => {
            let hi = take(pos)?;
            let lo = take(pos)?;
            Ok(((hi << 8) | lo) as i32)
        }
        0x81 => {
            let mut v = 0u32;
            for _ in 0..4 {
                v = (v << 8) | take(pos)?;
            }
            Ok(v as i32)
        }
        other => Err(Error::parsing(
            format!("unsupported packed integer prefix 0x{other:02X}"),
            start,
            None,
        )),
    }
}

/// Entry of the named-field side table: the dotted path from the root,
/// the leaf name and the bytecode offset of the defining instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NamedFieldInfo {
    pub path: String,
    pub name: String,
    pub offset: usize,
}

/// Original parameters of a custom-type field, handed back to the
/// custom-type processor at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub type_name: String,
    pub byte_order: ByteOrder,
    pub extra: Option<String>,
}

/// Bytecode plus side tables produced by schema compilation.
#[derive(Debug)]
pub struct CompiledBlock {
    /// Byte-addressed instruction stream.
    pub code: Vec<u8>,
    /// Named fields in definition order, claimed positionally at parse time.
    pub named_fields: Vec<NamedFieldInfo>,
    /// Compiled array-length and extra-data expressions in claim order.
    pub length_expressions: Vec<Expr>,
    /// Custom-type descriptors referenced by index from the bytecode.
    pub custom_types: Vec<TypeDescriptor>,
}

impl CompiledBlock {
    /// Looks up a named field by its full dotted path.
    pub fn find_named_field(&self, path: &str) -> Option<&NamedFieldInfo> {
        let path = path.to_ascii_lowercase();
        self.named_fields.iter().find(|f| f.path == path)
    }
}
