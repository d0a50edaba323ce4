//! Bytecode interpreter producing the parsed field tree.
//!
//! `parse_struct` walks the instruction stream recursively with three
//! cursors: the bytecode position, the named-field table position and the
//! expression table position. Struct arrays rewind the bytecode cursor to
//! the body start between iterations and restore the side-table cursors,
//! so inner length expressions see the current iteration's values.
//!
//! The skipping path (`nonskip = false`) walks the bytecode and consumes
//! every operand and cursor entry without touching the input stream or
//! allocating fields; it keeps the cursors consistent across zero-length
//! struct-array bodies.

use crate::bits::{BitReader, ByteOrder};
use crate::compiled::{
    unpack_int, CompiledBlock, NamedFieldInfo, CODE_ALIGN, CODE_BIT, CODE_BOOL, CODE_BYTE,
    CODE_CUSTOM_TYPE, CODE_INT, CODE_LONG, CODE_RESET_COUNTER, CODE_SHORT, CODE_SKIP,
    CODE_STRUCT_END, CODE_STRUCT_START, CODE_UBYTE, CODE_USHORT, CODE_VAR,
    EXT_FLAG_EXPR_OR_WHOLESTREAM, EXT_FLAG_EXTRA_AS_EXPRESSION, FLAG_ARRAY, FLAG_LITTLE_ENDIAN,
    FLAG_NAMED, FLAG_WIDE,
};
use crate::errors::{Error, Result};
use crate::expr::{EvalEnv, ExternalValueProvider, NumericMap};
use crate::field::{ParsedField, Value};
use crate::schema::{ArrayLen, CustomTypeProcessor, VarFieldHandler};

pub(crate) struct Runtime<'a, 'd> {
    block: &'a CompiledBlock,
    reader: BitReader<'d>,
    numeric: NumericMap,
    custom: Option<&'a dyn CustomTypeProcessor>,
    external: Option<&'a dyn ExternalValueProvider>,
    var_handler: Option<&'a dyn VarFieldHandler>,
    code_pos: usize,
    named_pos: usize,
    expr_pos: usize,
}

fn path_of(name: Option<&NamedFieldInfo>) -> &str {
    name.map(|n| n.path.as_str()).unwrap_or("<unnamed>")
}

/// Rewrites end-of-stream errors with the field being read.
fn field_context(err: Error, what: &str, name: Option<&NamedFieldInfo>) -> Error {
    match err {
        Error::EndOfStream { .. } => Error::eos(format!(
            "can't read {what} for field '{}'",
            path_of(name)
        )),
        other => other,
    }
}

impl<'a, 'd> Runtime<'a, 'd> {
    pub(crate) fn new(
        block: &'a CompiledBlock,
        reader: BitReader<'d>,
        custom: Option<&'a dyn CustomTypeProcessor>,
        external: Option<&'a dyn ExternalValueProvider>,
        var_handler: Option<&'a dyn VarFieldHandler>,
    ) -> Self {
        Self {
            block,
            reader,
            numeric: NumericMap::new(),
            custom,
            external,
            var_handler,
            code_pos: 0,
            named_pos: 0,
            expr_pos: 0,
        }
    }

    pub(crate) fn run(mut self) -> Result<ParsedField> {
        let fields = self.parse_struct(true)?;
        Ok(ParsedField {
            name: None,
            value: Value::Struct(fields),
        })
    }

    fn eval_expr(&self, index: usize) -> Result<i32> {
        let expr = self
            .block
            .length_expressions
            .get(index)
            .ok_or_else(|| Error::Internal {
                message: "expression table exhausted".to_string(),
            })?;
        expr.eval(&EvalEnv {
            named_fields: &self.block.named_fields,
            numeric: &self.numeric,
            external: self.external,
            counter: self.reader.counter(),
        })
    }

    /// Extra-data slot: packed literal in the bytecode or the next entry
    /// of the expression table. Skip mode claims without evaluating.
    fn read_extra(&mut self, ext: u8, nonskip: bool) -> Result<i32> {
        if ext & EXT_FLAG_EXTRA_AS_EXPRESSION != 0 {
            let index = self.expr_pos;
            self.expr_pos += 1;
            if nonskip {
                self.eval_expr(index)
            } else {
                Ok(0)
            }
        } else {
            unpack_int(&self.block.code, &mut self.code_pos)
        }
    }

    fn decode_len(
        &mut self,
        code: u8,
        ext: u8,
        offset: usize,
        name: Option<&NamedFieldInfo>,
        nonskip: bool,
    ) -> Result<ArrayLen> {
        let length = match (
            code & FLAG_ARRAY != 0,
            ext & EXT_FLAG_EXPR_OR_WHOLESTREAM != 0,
        ) {
            (false, false) => return Ok(ArrayLen::Scalar),
            (false, true) => return Ok(ArrayLen::WholeStream),
            (true, false) => unpack_int(&self.block.code, &mut self.code_pos)?,
            (true, true) => {
                let index = self.expr_pos;
                self.expr_pos += 1;
                if !nonskip {
                    return Ok(ArrayLen::Fixed(0));
                }
                self.eval_expr(index)?
            }
        };
        if length < 0 {
            return Err(Error::parsing(
                format!(
                    "negative calculated array length {length} for field '{}'",
                    path_of(name)
                ),
                offset,
                name.map(|n| n.path.as_str()),
            ));
        }
        Ok(ArrayLen::Fixed(length as usize))
    }

    fn read_array(&mut self, opcode: u8, order: ByteOrder, n: Option<usize>) -> Result<Value> {
        Ok(match opcode {
            CODE_BOOL => Value::BoolArray(
                self.reader
                    .read_byte_array(n)?
                    .into_iter()
                    .map(|b| b != 0)
                    .collect(),
            ),
            CODE_BYTE => Value::ByteArray(
                self.reader
                    .read_byte_array(n)?
                    .into_iter()
                    .map(|b| b as i8)
                    .collect(),
            ),
            CODE_UBYTE => Value::UByteArray(self.reader.read_byte_array(n)?),
            CODE_SHORT => Value::ShortArray(self.reader.read_short_array(n, order)?),
            CODE_USHORT => Value::UShortArray(
                self.reader
                    .read_short_array(n, order)?
                    .into_iter()
                    .map(|v| v as u16)
                    .collect(),
            ),
            CODE_INT => Value::IntArray(self.reader.read_int_array(n, order)?),
            CODE_LONG => Value::LongArray(self.reader.read_long_array(n, order)?),
            other => {
                return Err(Error::Internal {
                    message: format!("unexpected array opcode 0x{other:02X}"),
                })
            }
        })
    }

    /// Reads a scalar or array value for the simple numeric opcodes.
    /// Zero-length arrays produce no field node at all.
    fn read_value(&mut self, opcode: u8, order: ByteOrder, len: ArrayLen) -> Result<Option<Value>> {
        Ok(match len {
            ArrayLen::Scalar => Some(match opcode {
                CODE_BOOL => Value::Bool(self.reader.read_byte()? != 0),
                CODE_BYTE => Value::Byte(self.reader.read_byte()? as i8),
                CODE_UBYTE => Value::UByte(self.reader.read_byte()?),
                CODE_SHORT => Value::Short(self.reader.read_unsigned_short(order)? as i16),
                CODE_USHORT => Value::UShort(self.reader.read_unsigned_short(order)?),
                CODE_INT => Value::Int(self.reader.read_int(order)?),
                CODE_LONG => Value::Long(self.reader.read_long(order)?),
                other => {
                    return Err(Error::Internal {
                        message: format!("unexpected scalar opcode 0x{other:02X}"),
                    })
                }
            }),
            ArrayLen::Fixed(0) => None,
            ArrayLen::Fixed(n) => Some(self.read_array(opcode, order, Some(n))?),
            ArrayLen::WholeStream => Some(self.read_array(opcode, order, None)?),
        })
    }

    /// Appends a field, registering named numeric scalars in the map used
    /// by length expressions.
    fn push_field(
        &mut self,
        fields: &mut Vec<ParsedField>,
        name: Option<NamedFieldInfo>,
        value: Value,
    ) {
        if let (Some(info), Some(numeric)) = (name.as_ref(), value.as_long()) {
            self.numeric.put(&info.path, numeric);
        }
        fields.push(ParsedField { name, value });
    }

    fn consume_back_pointer(&mut self) -> Result<()> {
        unpack_int(&self.block.code, &mut self.code_pos)?;
        Ok(())
    }

    fn parse_struct(&mut self, nonskip: bool) -> Result<Vec<ParsedField>> {
        let mut fields: Vec<ParsedField> = Vec::new();
        let code_len = self.block.code.len();

        while self.code_pos < code_len {
            let instr_offset = self.code_pos;
            let code = self.block.code[self.code_pos];
            self.code_pos += 1;

            let ext = if code & FLAG_WIDE != 0 {
                let b = *self.block.code.get(self.code_pos).ok_or_else(|| {
                    Error::parsing("truncated wide instruction", instr_offset, None)
                })?;
                self.code_pos += 1;
                b
            } else {
                0
            };

            let name: Option<NamedFieldInfo> = if code & FLAG_NAMED != 0 {
                let info = self
                    .block
                    .named_fields
                    .get(self.named_pos)
                    .ok_or_else(|| Error::Internal {
                        message: "named-field table exhausted".to_string(),
                    })?
                    .clone();
                self.named_pos += 1;
                Some(info)
            } else {
                None
            };

            let len = self.decode_len(code, ext, instr_offset, name.as_ref(), nonskip)?;
            let order = if code & FLAG_LITTLE_ENDIAN != 0 {
                ByteOrder::LittleEndian
            } else {
                ByteOrder::BigEndian
            };

            let opcode = code & 0x0F;
            match opcode {
                CODE_STRUCT_END => return Ok(fields),

                CODE_BOOL | CODE_BYTE | CODE_UBYTE | CODE_SHORT | CODE_USHORT | CODE_INT
                | CODE_LONG => {
                    if nonskip {
                        let value = self
                            .read_value(opcode, order, len)
                            .map_err(|e| field_context(e, "value", name.as_ref()))?;
                        if let Some(value) = value {
                            self.push_field(&mut fields, name, value);
                        }
                    }
                }

                CODE_BIT => {
                    let width = self.read_extra(ext, nonskip)?;
                    if nonskip {
                        if !(1..=8).contains(&width) {
                            return Err(Error::parsing(
                                format!("bit width must evaluate to 1..8, got {width}"),
                                instr_offset,
                                name.as_ref().map(|n| n.path.as_str()),
                            ));
                        }
                        let value = match len {
                            ArrayLen::Scalar => {
                                Some(Value::Bit(self.reader.read_bits(width as u8)?.ok_or_else(
                                    || {
                                        Error::eos(format!(
                                            "can't read bits for field '{}'",
                                            path_of(name.as_ref())
                                        ))
                                    },
                                )?))
                            }
                            ArrayLen::Fixed(0) => None,
                            ArrayLen::Fixed(n) => Some(Value::BitArray(
                                self.reader
                                    .read_bits_array(Some(n), width as u8)
                                    .map_err(|e| field_context(e, "bit array", name.as_ref()))?,
                            )),
                            ArrayLen::WholeStream => Some(Value::BitArray(
                                self.reader.read_bits_array(None, width as u8)?,
                            )),
                        };
                        if let Some(value) = value {
                            self.push_field(&mut fields, name, value);
                        }
                    }
                }

                CODE_ALIGN => {
                    let modulus = self.read_extra(ext, nonskip)?;
                    if nonskip {
                        if modulus <= 0 {
                            return Err(Error::parsing(
                                format!("align modulus must be positive, got {modulus}"),
                                instr_offset,
                                None,
                            ));
                        }
                        self.reader.align_to_byte();
                        while self.reader.counter() % modulus as usize != 0 {
                            self.reader.read_byte().map_err(|_| {
                                Error::eos(format!("can't align to {modulus} byte(s)"))
                            })?;
                        }
                    }
                }

                CODE_SKIP => {
                    let count = self.read_extra(ext, nonskip)?;
                    if nonskip {
                        if count < 0 {
                            return Err(Error::parsing(
                                format!("skip count must not be negative, got {count}"),
                                instr_offset,
                                None,
                            ));
                        }
                        if count > 0 {
                            self.reader.skip_bytes(count as usize)?;
                        }
                    }
                }

                CODE_RESET_COUNTER => {
                    if nonskip {
                        self.reader.reset_counter();
                    }
                }

                CODE_VAR => {
                    let extra = self.read_extra(ext, nonskip)?;
                    if nonskip {
                        let handler = self.var_handler.ok_or_else(|| {
                            Error::parsing(
                                "schema contains a var field but no var handler was given",
                                instr_offset,
                                name.as_ref().map(|n| n.path.as_str()),
                            )
                        })?;
                        let value =
                            handler.read(&mut self.reader, order, extra, name.as_ref(), len)?;
                        self.push_field(&mut fields, name, value);
                    }
                }

                CODE_CUSTOM_TYPE => {
                    let extra = self.read_extra(ext, nonskip)?;
                    let index = unpack_int(&self.block.code, &mut self.code_pos)? as usize;
                    if nonskip {
                        let descriptor =
                            self.block.custom_types.get(index).ok_or_else(|| {
                                Error::Internal {
                                    message: format!("custom type index {index} out of range"),
                                }
                            })?;
                        let processor = self.custom.ok_or_else(|| {
                            Error::parsing(
                                "schema contains a custom type but no processor was given",
                                instr_offset,
                                name.as_ref().map(|n| n.path.as_str()),
                            )
                        })?;
                        let value = processor.read(
                            &mut self.reader,
                            descriptor,
                            extra,
                            name.as_ref(),
                            len,
                        )?;
                        self.push_field(&mut fields, name, value);
                    }
                }

                CODE_STRUCT_START => {
                    self.parse_struct_field(&mut fields, name, len, nonskip)?;
                }

                other => {
                    return Err(Error::Internal {
                        message: format!("unexpected opcode 0x{other:02X} in compiled block"),
                    })
                }
            }
        }

        Ok(fields)
    }

    fn parse_struct_field(
        &mut self,
        fields: &mut Vec<ParsedField>,
        name: Option<NamedFieldInfo>,
        len: ArrayLen,
        nonskip: bool,
    ) -> Result<()> {
        match len {
            ArrayLen::Scalar => {
                let children = self.parse_struct(nonskip)?;
                self.consume_back_pointer()?;
                if nonskip {
                    fields.push(ParsedField {
                        name,
                        value: Value::Struct(children),
                    });
                }
            }

            ArrayLen::Fixed(n) => {
                let named_mark = self.named_pos;
                let expr_mark = self.expr_pos;
                let body_start = self.code_pos;

                if !nonskip || n == 0 {
                    // Walk the body once so the cursors end up past it.
                    // A zero-length struct array yields no field node.
                    self.parse_struct(false)?;
                    self.consume_back_pointer()?;
                } else {
                    let mut elements = Vec::with_capacity(n);
                    for i in 0..n {
                        self.named_pos = named_mark;
                        self.expr_pos = expr_mark;
                        if i > 0 {
                            self.code_pos = body_start;
                        }
                        let children = self.parse_struct(true)?;
                        self.consume_back_pointer()?;
                        elements.push(children);
                    }
                    fields.push(ParsedField {
                        name,
                        value: Value::StructArray(elements),
                    });
                }
            }

            ArrayLen::WholeStream => {
                let named_mark = self.named_pos;
                let expr_mark = self.expr_pos;
                let body_start = self.code_pos;

                if !nonskip {
                    self.parse_struct(false)?;
                    self.consume_back_pointer()?;
                } else {
                    let mut elements: Vec<Vec<ParsedField>> = Vec::new();
                    while self.reader.has_available_data() {
                        self.named_pos = named_mark;
                        self.expr_pos = expr_mark;
                        if !elements.is_empty() {
                            self.code_pos = body_start;
                        }
                        let children = self.parse_struct(true)?;
                        self.consume_back_pointer()?;
                        elements.push(children);
                    }
                    if elements.is_empty() {
                        // Never entered the body; advance the cursors past it.
                        self.parse_struct(false)?;
                        self.consume_back_pointer()?;
                    }
                    fields.push(ParsedField {
                        name,
                        value: Value::StructArray(elements),
                    });
                }
            }
        }
        Ok(())
    }
}
