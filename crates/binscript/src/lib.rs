//! # binscript
//!
//! A library for parsing binary data with concise textual schemas.
//!
//! A schema describes the layout of a binary blob: primitive fields,
//! bit fields, arrays of fixed, computed or whole-stream length, nested
//! structures, alignment and skip directives, endianness qualifiers and
//! user-defined types. Compiling a schema yields a reusable parser that
//! turns input bytes into a tree of typed fields addressable by dotted
//! path.
//!
//! ## Example
//!
//! ```
//! use binscript::schema::Schema;
//!
//! let schema = Schema::compile("ubyte len; byte[len] data; ushort crc;").unwrap();
//! let root = schema.parse(&[0x02, 0x0A, 0x0B, 0x30, 0x39]).unwrap();
//!
//! assert_eq!(root.find_int("len"), Some(2));
//! assert_eq!(root.find("data").unwrap().value.len(), Some(2));
//! assert_eq!(root.find_int("crc"), Some(0x3039));
//! ```

pub mod bits;
pub mod compiled;
pub mod errors;
pub mod expr;
pub mod field;
mod parser;
pub mod schema;
pub mod tokenizer;

pub use bits::{BitOrder, BitReader, ByteOrder};
pub use errors::{Error, Result};
pub use field::{ParsedField, Value};
pub use schema::{ArrayLen, CustomTypeProcessor, Schema, VarFieldHandler};
