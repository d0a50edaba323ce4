//! Public schema API and the single-pass compiler.
//!
//! [`Schema::compile`] turns schema text into bytecode plus side tables,
//! [`Schema::parse`] runs that bytecode against input bytes. A compiled
//! schema is immutable and can be shared across threads; all per-parse
//! state lives inside the parse call.

use crate::bits::{BitOrder, BitReader, ByteOrder};
use crate::compiled::{
    pack_int, CompiledBlock, NamedFieldInfo, TypeDescriptor, CODE_ALIGN, CODE_BIT, CODE_BOOL,
    CODE_BYTE, CODE_CUSTOM_TYPE, CODE_INT, CODE_LONG, CODE_RESET_COUNTER, CODE_SHORT, CODE_SKIP,
    CODE_STRUCT_END, CODE_STRUCT_START, CODE_UBYTE, CODE_USHORT, CODE_VAR,
    EXT_FLAG_EXPR_OR_WHOLESTREAM, EXT_FLAG_EXTRA_AS_EXPRESSION, FLAG_ARRAY, FLAG_LITTLE_ENDIAN,
    FLAG_NAMED, FLAG_WIDE,
};
use crate::errors::{Error, Result};
use crate::expr::{Expr, ExternalValueProvider};
use crate::field::{ParsedField, Value};
use crate::parser::Runtime;
use crate::tokenizer::{ArraySize, AtomToken, Extra, Token, TokenKind, Tokenizer};

/// Arity of a field read, as handed to var and custom-type handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen {
    /// A single value, no array clause.
    Scalar,
    /// A fixed or computed number of elements.
    Fixed(usize),
    /// Read elements until the stream ends.
    WholeStream,
}

/// Reads the payload of `var` fields from the stream.
pub trait VarFieldHandler {
    fn read(
        &self,
        reader: &mut BitReader<'_>,
        byte_order: ByteOrder,
        extra: i32,
        name: Option<&NamedFieldInfo>,
        len: ArrayLen,
    ) -> Result<Value>;
}

/// Recognises and reads user-defined field types.
///
/// The processor takes part in compilation (type recognition and parameter
/// validation) and in parsing (reading values), so it is owned by the
/// [`Schema`] and must be shareable across parses.
pub trait CustomTypeProcessor: Send + Sync {
    /// Type names this processor recognises, lowercased.
    fn type_names(&self) -> &[&str];

    /// Validates the parameters of a declaration using one of the
    /// recognised types. `extra` is `None` when the extra data is an
    /// expression only known at parse time.
    fn allows(
        &self,
        descriptor: &TypeDescriptor,
        name: Option<&str>,
        extra: Option<i32>,
        is_array: bool,
    ) -> bool {
        let _ = (descriptor, name, extra, is_array);
        true
    }

    fn read(
        &self,
        reader: &mut BitReader<'_>,
        descriptor: &TypeDescriptor,
        extra: i32,
        name: Option<&NamedFieldInfo>,
        len: ArrayLen,
    ) -> Result<Value>;
}

/// A compiled, reusable parser for one schema.
pub struct Schema {
    block: CompiledBlock,
    bit_order: BitOrder,
    custom: Option<Box<dyn CustomTypeProcessor>>,
}

impl Schema {
    /// Compiles a schema with the default LSB0 bit order.
    pub fn compile(script: &str) -> Result<Self> {
        Self::compile_with(script, BitOrder::Lsb0, None)
    }

    pub fn compile_with_bit_order(script: &str, bit_order: BitOrder) -> Result<Self> {
        Self::compile_with(script, bit_order, None)
    }

    /// Compiles a schema with an explicit bit order and an optional
    /// custom-type processor.
    pub fn compile_with(
        script: &str,
        bit_order: BitOrder,
        custom: Option<Box<dyn CustomTypeProcessor>>,
    ) -> Result<Self> {
        let block = compile_block(script, custom.as_deref())?;
        Ok(Self {
            block,
            bit_order,
            custom,
        })
    }

    pub fn bit_order(&self) -> BitOrder {
        self.bit_order
    }

    pub fn block(&self) -> &CompiledBlock {
        &self.block
    }

    /// Parses `data`, returning the unnamed root struct field.
    pub fn parse(&self, data: &[u8]) -> Result<ParsedField> {
        self.parse_with(data, None, None)
    }

    /// Parses `data` with an external value provider for `$name`
    /// references and a handler for `var` fields.
    pub fn parse_with(
        &self,
        data: &[u8],
        external: Option<&dyn ExternalValueProvider>,
        var_handler: Option<&dyn VarFieldHandler>,
    ) -> Result<ParsedField> {
        let reader = BitReader::with_bit_order(data, self.bit_order);
        Runtime::new(
            &self.block,
            reader,
            self.custom.as_deref(),
            external,
            var_handler,
        )
        .run()
    }
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// An open structure on the compiler stack.
struct OpenStruct {
    /// Index into the named-field table where this structure's scope
    /// begins; duplicate-name checks stop here.
    named_border: usize,
    start_offset: usize,
    /// Normalized structure name, used to rewrite inner paths on close.
    name: Option<String>,
}

/// What the extra-data slot of the current instruction needs.
enum ExtraAction {
    None,
    Literal(i32),
    Expression(String),
}

pub(crate) fn compile_block(
    script: &str,
    custom: Option<&dyn CustomTypeProcessor>,
) -> Result<CompiledBlock> {
    let mut code: Vec<u8> = Vec::new();
    let mut named_fields: Vec<NamedFieldInfo> = Vec::new();
    let mut length_expressions: Vec<Expr> = Vec::new();
    let mut custom_types: Vec<TypeDescriptor> = Vec::new();
    let mut stack: Vec<OpenStruct> = Vec::new();
    let mut whole_stream_offset: Option<usize> = None;

    for token in Tokenizer::new(script) {
        let token = token?;

        let (opcode, flags, ext) = match &token.kind {
            TokenKind::Comment(_) => continue,
            TokenKind::Atom(atom) => {
                let opcode = opcode_for_type(&normalize_name(&atom.type_name), custom, &token)?;
                let mut flags = 0u8;
                let mut ext = 0u8;
                if atom.byte_order == ByteOrder::LittleEndian {
                    flags |= FLAG_LITTLE_ENDIAN;
                }
                if atom.name.is_some() {
                    flags |= FLAG_NAMED;
                }
                match &atom.array_size {
                    Some(ArraySize::Literal(_)) => flags |= FLAG_ARRAY,
                    Some(ArraySize::Expression(_)) | Some(ArraySize::WholeStream) => {
                        flags |= FLAG_ARRAY;
                        ext |= EXT_FLAG_EXPR_OR_WHOLESTREAM;
                    }
                    None => {}
                }
                if matches!(atom.extra, Some(Extra::Expression(_))) {
                    ext |= EXT_FLAG_EXTRA_AS_EXPRESSION;
                }
                (opcode, flags, ext)
            }
            TokenKind::StructStart(s) => {
                let mut flags = 0u8;
                let mut ext = 0u8;
                if s.name.is_some() {
                    flags |= FLAG_NAMED;
                }
                match &s.array_size {
                    Some(ArraySize::Literal(_)) => flags |= FLAG_ARRAY,
                    Some(ArraySize::Expression(_)) | Some(ArraySize::WholeStream) => {
                        flags |= FLAG_ARRAY;
                        ext |= EXT_FLAG_EXPR_OR_WHOLESTREAM;
                    }
                    None => {}
                }
                (CODE_STRUCT_START, flags, ext)
            }
            TokenKind::StructEnd => (CODE_STRUCT_END, 0u8, 0u8),
        };

        let start_offset = code.len();
        let wide = if ext != 0 { FLAG_WIDE } else { 0 };
        code.push(opcode | flags | wide);
        if ext != 0 {
            code.push(ext);
        }

        // Nothing may follow a whole-stream array except the closes of the
        // structure that contains it.
        if opcode != CODE_STRUCT_END {
            if let Some(ws_offset) = whole_stream_offset {
                let inside_container = stack
                    .last()
                    .is_some_and(|frame| frame.start_offset == ws_offset);
                if !inside_container {
                    return Err(Error::compilation(
                        "attempt to read after a 'till-the-end' field",
                        Some(&token),
                    ));
                }
            }
        }

        let scope_border = stack.last().map(|f| f.named_border).unwrap_or(0);
        let mut closed_struct: Option<OpenStruct> = None;
        let mut extra_action = ExtraAction::None;
        let mut custom_descriptor: Option<TypeDescriptor> = None;

        match &token.kind {
            TokenKind::Atom(atom) => {
                let named = atom.name.is_some();
                let is_array = atom.array_size.is_some();
                match opcode {
                    CODE_SKIP | CODE_ALIGN | CODE_RESET_COUNTER => {
                        if is_array {
                            return Err(Error::compilation(
                                format!("'{}' can't be an array", atom.type_name),
                                Some(&token),
                            ));
                        }
                        if named {
                            return Err(Error::compilation(
                                format!("'{}' must not be named", atom.type_name),
                                Some(&token),
                            ));
                        }
                        if opcode == CODE_RESET_COUNTER {
                            if atom.extra.is_some() {
                                return Err(Error::compilation(
                                    "'reset$$' doesn't take extra data",
                                    Some(&token),
                                ));
                            }
                        } else {
                            extra_action = extra_for(atom, 1)?;
                            if let ExtraAction::Literal(v) = &extra_action {
                                let v = *v;
                                if opcode == CODE_ALIGN && v <= 0 {
                                    return Err(Error::compilation(
                                        format!("'align' size must be greater than zero [{v}]"),
                                        Some(&token),
                                    ));
                                }
                                if opcode == CODE_SKIP && v < 0 {
                                    return Err(Error::compilation(
                                        format!("'skip' size must not be negative [{v}]"),
                                        Some(&token),
                                    ));
                                }
                            }
                        }
                    }
                    CODE_BIT => {
                        extra_action = extra_for(atom, 1)?;
                        if let ExtraAction::Literal(v) = &extra_action {
                            if !(1..=8).contains(v) {
                                return Err(Error::compilation(
                                    format!("bit width must be in 1..8 [{v}]"),
                                    Some(&token),
                                ));
                            }
                        }
                    }
                    CODE_VAR => {
                        extra_action = extra_for(atom, 0)?;
                    }
                    CODE_CUSTOM_TYPE => {
                        extra_action = extra_for(atom, 0)?;
                        let descriptor = TypeDescriptor {
                            type_name: normalize_name(&atom.type_name),
                            byte_order: atom.byte_order,
                            extra: match &atom.extra {
                                Some(Extra::Literal(v)) => Some(v.to_string()),
                                Some(Extra::Expression(src)) => Some(src.clone()),
                                None => None,
                            },
                        };
                        let literal_extra = match &extra_action {
                            ExtraAction::Literal(v) => Some(*v),
                            _ => None,
                        };
                        let processor = custom.ok_or_else(|| Error::Internal {
                            message: "custom opcode without a processor".to_string(),
                        })?;
                        let normalized_field_name = atom.name.as_deref().map(normalize_name);
                        if !processor.allows(
                            &descriptor,
                            normalized_field_name.as_deref(),
                            literal_extra,
                            is_array,
                        ) {
                            return Err(Error::compilation(
                                "illegal parameters for custom type field",
                                Some(&token),
                            ));
                        }
                        custom_descriptor = Some(descriptor);
                    }
                    _ => {
                        // Plain scalar types take no extra data.
                        if atom.extra.is_some() {
                            return Err(Error::compilation(
                                format!("'{}' doesn't take extra data", atom.type_name),
                                Some(&token),
                            ));
                        }
                    }
                }
            }
            TokenKind::StructStart(s) => {
                stack.push(OpenStruct {
                    named_border: named_fields.len() + usize::from(s.name.is_some()),
                    start_offset,
                    name: s.name.as_deref().map(normalize_name),
                });
            }
            TokenKind::StructEnd => {
                let frame = stack.pop().ok_or_else(|| {
                    Error::compilation("structure close without an opening one", Some(&token))
                })?;
                code.extend(pack_int(frame.start_offset as i32));
                closed_struct = Some(frame);
            }
            TokenKind::Comment(_) => unreachable!(),
        }

        // Array-size operand. Expressions are registered before the extra
        // slot so the runtime claims them in the same order.
        if let Some(size) = array_size_of(&token) {
            match size {
                ArraySize::Literal(n) => {
                    if *n <= 0 {
                        return Err(Error::compilation(
                            "array with negative or zero fixed length",
                            Some(&token),
                        ));
                    }
                    code.extend(pack_int(*n));
                }
                ArraySize::Expression(src) => {
                    length_expressions.push(Expr::compile(src, &named_fields)?);
                }
                ArraySize::WholeStream => {
                    if whole_stream_offset.is_some() {
                        return Err(Error::compilation(
                            "detected two or more unlimited arrays",
                            Some(&token),
                        ));
                    }
                    whole_stream_offset = Some(start_offset);
                }
            }
        }

        match extra_action {
            ExtraAction::None => {}
            ExtraAction::Literal(v) => code.extend(pack_int(v)),
            ExtraAction::Expression(src) => {
                length_expressions.push(Expr::compile(&src, &named_fields)?);
            }
        }

        if let Some(descriptor) = custom_descriptor {
            code.extend(pack_int(custom_types.len() as i32));
            custom_types.push(descriptor);
        }

        if let Some(raw_name) = token_name(&token) {
            let normalized = normalize_name(raw_name);
            if normalized.contains('.') {
                return Err(Error::compilation(
                    format!("disallowed char '.' in name [{normalized}]"),
                    Some(&token),
                ));
            }
            for info in named_fields[scope_border..].iter().rev() {
                if info.path == normalized {
                    return Err(Error::compilation(
                        format!("duplicated field name [{normalized}]"),
                        Some(&token),
                    ));
                }
            }
            named_fields.push(NamedFieldInfo {
                path: normalized.clone(),
                name: normalized,
                offset: start_offset,
            });
        }

        // Closing a named structure prepends its name to the paths of
        // every field registered inside it.
        if let Some(frame) = closed_struct {
            if let Some(struct_name) = frame.name {
                for info in named_fields.iter_mut().rev() {
                    if info.offset <= frame.start_offset {
                        break;
                    }
                    info.path = format!("{}.{}", struct_name, info.path);
                }
            }
        }
    }

    if !stack.is_empty() {
        return Err(Error::compilation(
            format!("detected {} non-closed structure(s)", stack.len()),
            None,
        ));
    }

    // The runtime recognises whole-stream arrays by the extended flag
    // alone; drop the array flag so no length operand is expected.
    if let Some(offset) = whole_stream_offset {
        code[offset] &= !FLAG_ARRAY;
    }

    Ok(CompiledBlock {
        code,
        named_fields,
        length_expressions,
        custom_types,
    })
}

fn token_name(token: &Token) -> Option<&str> {
    match &token.kind {
        TokenKind::Atom(atom) => atom.name.as_deref(),
        TokenKind::StructStart(s) => s.name.as_deref(),
        _ => None,
    }
}

fn array_size_of(token: &Token) -> Option<&ArraySize> {
    match &token.kind {
        TokenKind::Atom(atom) => atom.array_size.as_ref(),
        TokenKind::StructStart(s) => s.array_size.as_ref(),
        _ => None,
    }
}

fn extra_for(atom: &AtomToken, default: i32) -> Result<ExtraAction> {
    Ok(match &atom.extra {
        None => ExtraAction::Literal(default),
        Some(Extra::Literal(v)) => ExtraAction::Literal(*v),
        Some(Extra::Expression(src)) => ExtraAction::Expression(src.clone()),
    })
}

fn opcode_for_type(
    type_name: &str,
    custom: Option<&dyn CustomTypeProcessor>,
    token: &Token,
) -> Result<u8> {
    Ok(match type_name {
        "align" => CODE_ALIGN,
        "bit" => CODE_BIT,
        "bool" => CODE_BOOL,
        "ubyte" => CODE_UBYTE,
        "byte" => CODE_BYTE,
        "ushort" => CODE_USHORT,
        "short" => CODE_SHORT,
        "int" => CODE_INT,
        "long" => CODE_LONG,
        "skip" => CODE_SKIP,
        "var" => CODE_VAR,
        "reset$$" => CODE_RESET_COUNTER,
        other => {
            let recognised = custom.is_some_and(|p| {
                p.type_names()
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(other))
            });
            if !recognised {
                return Err(Error::compilation(
                    format!("unsupported type [{other}]"),
                    Some(token),
                ));
            }
            CODE_CUSTOM_TYPE
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_simple_schema() {
        let schema = Schema::compile("ubyte len; byte[len] data;").unwrap();
        let block = schema.block();
        assert_eq!(block.named_fields.len(), 2);
        assert_eq!(block.named_fields[0].path, "len");
        assert_eq!(block.named_fields[1].path, "data");
        assert_eq!(block.length_expressions.len(), 1);
        assert_eq!(block.length_expressions[0].source(), "len");
    }

    #[test]
    fn test_struct_paths_are_rewritten() {
        let schema = Schema::compile("a { b { ubyte v; } short w; }").unwrap();
        let paths: Vec<&str> = schema
            .block()
            .named_fields
            .iter()
            .map(|f| f.path.as_str())
            .collect();
        assert_eq!(paths, vec!["a", "a.b", "a.b.v", "a.w"]);
    }

    #[test]
    fn test_names_are_normalized() {
        let schema = Schema::compile("UByte LEN; Byte[len] Data;").unwrap();
        assert_eq!(schema.block().named_fields[0].path, "len");
        assert_eq!(schema.block().named_fields[1].path, "data");
    }

    #[test]
    fn test_unbalanced_structs_rejected() {
        assert!(matches!(
            Schema::compile("{ byte;"),
            Err(Error::Compilation { .. })
        ));
        assert!(matches!(
            Schema::compile("byte; }"),
            Err(Error::Compilation { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        assert!(Schema::compile("byte a; int a;").is_err());
        // Same leaf name in different scopes is fine.
        assert!(Schema::compile("byte a; s { byte a; }").is_ok());
        // A field may shadow the name of its containing structure.
        assert!(Schema::compile("s { byte s; }").is_ok());
        // Sibling structures must have distinct names.
        assert!(Schema::compile("s { byte; } s { byte; }").is_err());
    }

    #[test]
    fn test_dot_in_name_rejected() {
        assert!(matches!(
            Schema::compile("byte a.b;"),
            Err(Error::Compilation { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(matches!(
            Schema::compile("quux x;"),
            Err(Error::Compilation { .. })
        ));
    }

    #[test]
    fn test_whole_stream_rules() {
        // Only closes of the containing structure may follow.
        assert!(Schema::compile("byte[_] a; byte b;").is_err());
        assert!(Schema::compile("byte[_] a; byte[_] b;").is_err());
        assert!(Schema::compile("s { byte[_] a; } byte b;").is_err());
        assert!(Schema::compile("chunk [_] { int a; int b; }").is_ok());
        // A whole-stream array after a completed structure is legal.
        assert!(Schema::compile("ubyte n; {ubyte[n];} ubyte[_] rest;").is_ok());
    }

    #[test]
    fn test_whole_stream_clears_array_flag() {
        let schema = Schema::compile("byte[_] rest;").unwrap();
        let first = schema.block().code[0];
        assert_eq!(first & FLAG_ARRAY, 0);
        assert_ne!(first & FLAG_WIDE, 0);
        assert_eq!(schema.block().code[1], EXT_FLAG_EXPR_OR_WHOLESTREAM);
    }

    #[test]
    fn test_fixed_array_validation() {
        assert!(Schema::compile("byte[0] a;").is_err());
        assert!(Schema::compile("byte[-3] a;").is_err());
        assert!(Schema::compile("byte[3] a;").is_ok());
    }

    #[test]
    fn test_bit_width_validation() {
        assert!(Schema::compile("bit:0 a;").is_err());
        assert!(Schema::compile("bit:9 a;").is_err());
        assert!(Schema::compile("bit:8 a;").is_ok());
        assert!(Schema::compile("bit a;").is_ok());
    }

    #[test]
    fn test_align_skip_reset_validation() {
        assert!(Schema::compile("align:0;").is_err());
        assert!(Schema::compile("align:-1;").is_err());
        assert!(Schema::compile("align:4;").is_ok());
        assert!(Schema::compile("skip:-1;").is_err());
        assert!(Schema::compile("skip:0;").is_ok());
        assert!(Schema::compile("align x;").is_err());
        assert!(Schema::compile("skip[2];").is_err());
        assert!(Schema::compile("reset$$;").is_ok());
        assert!(Schema::compile("reset$$:2;").is_err());
        assert!(Schema::compile("reset$$ x;").is_err());
        assert!(Schema::compile("reset$$[2];").is_err());
    }

    #[test]
    fn test_extra_on_plain_types_rejected() {
        assert!(Schema::compile("byte:4 a;").is_err());
        assert!(Schema::compile("int:(x) a;").is_err());
    }

    #[test]
    fn test_expression_resolution_is_lexical() {
        // `len` is not defined yet at the point of the array expression.
        assert!(matches!(
            Schema::compile("byte[len] data; ubyte len;"),
            Err(Error::Expression { .. })
        ));
    }

    #[test]
    fn test_schema_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Schema>();
    }
}
