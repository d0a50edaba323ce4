//! Bit-granularity reading over byte slices.
//!
//! [`BitReader`] consumes a byte slice bit by bit under a configurable
//! [`BitOrder`], tracks a counter of fully consumed bytes, and offers the
//! multi-byte reads used by the parser runtime. Aligned whole-byte reads
//! are identical under both bit orders; the order matters only for
//! sub-byte and unaligned reads.

use crate::errors::{Error, Result};

/// Order in which bits are consumed from each source byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BitOrder {
    /// Least-significant bit first. The first consumed bit becomes the
    /// least significant bit of the assembled value.
    #[default]
    Lsb0,
    /// Most-significant bit first. The first consumed bit becomes the
    /// most significant bit of the assembled value.
    Msb0,
}

/// Byte order for multi-byte field decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// Streaming bit reader over a byte slice.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Remaining bits of the latched byte, in source order.
    buffer: u8,
    /// Number of valid bits left in `buffer` (0..=7 between calls).
    buffered: u8,
    counter: usize,
    bit_order: BitOrder,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_bit_order(data, BitOrder::Lsb0)
    }

    pub fn with_bit_order(data: &'a [u8], bit_order: BitOrder) -> Self {
        Self {
            data,
            pos: 0,
            buffer: 0,
            buffered: 0,
            counter: 0,
            bit_order,
        }
    }

    pub fn bit_order(&self) -> BitOrder {
        self.bit_order
    }

    /// Number of fully consumed bytes. A byte on which only some bits have
    /// been read is not counted until its last bit is consumed or
    /// [`BitReader::align_to_byte`] discards the remainder.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Drops any partially read byte and zeroes the byte counter.
    pub fn reset_counter(&mut self) {
        self.buffer = 0;
        self.buffered = 0;
        self.counter = 0;
    }

    /// Non-destructive end-of-stream probe.
    pub fn has_available_data(&self) -> bool {
        self.buffered > 0 || self.pos < self.data.len()
    }

    /// Discards the bits still latched from a partially read byte. The byte
    /// then counts as consumed. No effect on a byte boundary.
    pub fn align_to_byte(&mut self) {
        if self.buffered > 0 {
            self.buffer = 0;
            self.buffered = 0;
            self.counter += 1;
        }
    }

    fn latch(&mut self) -> Result<()> {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.buffer = b;
                self.buffered = 8;
                self.pos += 1;
                Ok(())
            }
            None => Err(Error::eos("no bits left in stream")),
        }
    }

    fn take_bit(&mut self) -> u8 {
        let bit = match self.bit_order {
            BitOrder::Lsb0 => {
                let bit = self.buffer & 1;
                self.buffer >>= 1;
                bit
            }
            BitOrder::Msb0 => (self.buffer >> (self.buffered - 1)) & 1,
        };
        self.buffered -= 1;
        if self.buffered == 0 {
            self.counter += 1;
        }
        bit
    }

    /// Reads `n` bits (1..=8). Returns `None` when the stream holds no
    /// further bits at all; running dry mid-value is an error.
    pub fn read_bits(&mut self, n: u8) -> Result<Option<u8>> {
        if n == 0 || n > 8 {
            return Err(Error::Internal {
                message: format!("bit count must be in 1..8, got {n}"),
            });
        }
        if self.buffered == 0 && self.pos >= self.data.len() {
            return Ok(None);
        }

        let mut acc = 0u8;
        for i in 0..n {
            if self.buffered == 0 {
                self.latch()?;
            }
            let bit = self.take_bit();
            match self.bit_order {
                BitOrder::Lsb0 => acc |= bit << i,
                BitOrder::Msb0 => acc = (acc << 1) | bit,
            }
        }
        Ok(Some(acc))
    }

    /// Reads `n` values of `width` bits each; `None` means until end of
    /// stream.
    pub fn read_bits_array(&mut self, n: Option<usize>, width: u8) -> Result<Vec<u8>> {
        match n {
            Some(n) => {
                let mut out = Vec::with_capacity(n);
                for _ in 0..n {
                    match self.read_bits(width)? {
                        Some(v) => out.push(v),
                        None => return Err(Error::eos("stream ended inside bit array")),
                    }
                }
                Ok(out)
            }
            None => {
                let mut out = Vec::new();
                while let Some(v) = self.read_bits(width)? {
                    out.push(v);
                }
                Ok(out)
            }
        }
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        if self.buffered == 0 {
            match self.data.get(self.pos) {
                Some(&b) => {
                    self.pos += 1;
                    self.counter += 1;
                    Ok(b)
                }
                None => Err(Error::eos("no bytes left in stream")),
            }
        } else {
            self.read_bits(8)?
                .ok_or_else(|| Error::eos("no bytes left in stream"))
        }
    }

    /// Reads `n` bytes, or the whole rest of the stream for `None`.
    pub fn read_byte_array(&mut self, n: Option<usize>) -> Result<Vec<u8>> {
        if self.buffered == 0 {
            // Byte-aligned fast path.
            let remaining = self.data.len() - self.pos;
            let take = match n {
                Some(n) if n > remaining => {
                    return Err(Error::eos(format!(
                        "need {n} bytes, stream has {remaining}"
                    )))
                }
                Some(n) => n,
                None => remaining,
            };
            let out = self.data[self.pos..self.pos + take].to_vec();
            self.pos += take;
            self.counter += take;
            return Ok(out);
        }

        match n {
            Some(n) => (0..n).map(|_| self.read_byte()).collect(),
            None => {
                let mut out = Vec::new();
                while self.has_available_data() {
                    out.push(self.read_byte()?);
                }
                Ok(out)
            }
        }
    }

    pub fn read_unsigned_short(&mut self, order: ByteOrder) -> Result<u16> {
        let a = self.read_byte()? as u16;
        let b = self.read_byte()? as u16;
        Ok(match order {
            ByteOrder::BigEndian => (a << 8) | b,
            ByteOrder::LittleEndian => (b << 8) | a,
        })
    }

    pub fn read_int(&mut self, order: ByteOrder) -> Result<i32> {
        let a = self.read_unsigned_short(order)? as u32;
        let b = self.read_unsigned_short(order)? as u32;
        Ok(match order {
            ByteOrder::BigEndian => ((a << 16) | b) as i32,
            ByteOrder::LittleEndian => ((b << 16) | a) as i32,
        })
    }

    pub fn read_long(&mut self, order: ByteOrder) -> Result<i64> {
        let a = self.read_int(order)? as u32 as u64;
        let b = self.read_int(order)? as u32 as u64;
        Ok(match order {
            ByteOrder::BigEndian => ((a << 32) | b) as i64,
            ByteOrder::LittleEndian => ((b << 32) | a) as i64,
        })
    }

    pub fn read_short_array(&mut self, n: Option<usize>, order: ByteOrder) -> Result<Vec<i16>> {
        match n {
            Some(n) => (0..n)
                .map(|_| self.read_unsigned_short(order).map(|v| v as i16))
                .collect(),
            None => {
                let mut out = Vec::new();
                while self.has_available_data() {
                    out.push(self.read_unsigned_short(order)? as i16);
                }
                Ok(out)
            }
        }
    }

    pub fn read_int_array(&mut self, n: Option<usize>, order: ByteOrder) -> Result<Vec<i32>> {
        match n {
            Some(n) => (0..n).map(|_| self.read_int(order)).collect(),
            None => {
                let mut out = Vec::new();
                while self.has_available_data() {
                    out.push(self.read_int(order)?);
                }
                Ok(out)
            }
        }
    }

    pub fn read_long_array(&mut self, n: Option<usize>, order: ByteOrder) -> Result<Vec<i64>> {
        match n {
            Some(n) => (0..n).map(|_| self.read_long(order)).collect(),
            None => {
                let mut out = Vec::new();
                while self.has_available_data() {
                    out.push(self.read_long(order)?);
                }
                Ok(out)
            }
        }
    }

    /// Skips `n` bytes, honoring a partially read byte. Short skips fail.
    pub fn skip_bytes(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            self.read_byte()
                .map_err(|_| Error::eos(format!("can't skip {n} byte(s)")))?;
        }
        Ok(())
    }
}

/// Renders bytes as a `0`/`1` string under the given bit order.
pub fn bin_to_str(bytes: &[u8], order: BitOrder) -> String {
    let mut out = String::with_capacity(bytes.len() * 8);
    for &b in bytes {
        match order {
            BitOrder::Msb0 => {
                let mut a = b;
                for _ in 0..8 {
                    out.push(if a & 0x01 == 0 { '0' } else { '1' });
                    a >>= 1;
                }
            }
            BitOrder::Lsb0 => {
                let mut a = b;
                for _ in 0..8 {
                    out.push(if a & 0x80 == 0 { '0' } else { '1' });
                    a <<= 1;
                }
            }
        }
    }
    out
}

/// Decodes a `0`/`1` string into bytes under the given bit order.
///
/// `_` and spaces are separators; `x`/`X`/`z`/`Z` count as zero bits.
pub fn str_to_bin(text: &str, order: BitOrder) -> Result<Vec<u8>> {
    let msb0 = order == BitOrder::Msb0;
    let mut out = Vec::with_capacity((text.len() + 7) / 8);
    let mut buff = 0u8;
    let mut cnt = 0u8;

    for (offset, ch) in text.chars().enumerate() {
        match ch {
            '_' | ' ' => continue,
            '0' | 'x' | 'X' | 'z' | 'Z' => {
                if msb0 {
                    buff >>= 1;
                } else {
                    buff <<= 1;
                }
            }
            '1' => {
                if msb0 {
                    buff = (buff >> 1) | 0x80;
                } else {
                    buff = (buff << 1) | 1;
                }
            }
            _ => {
                return Err(Error::Tokenization {
                    offset,
                    message: format!("unsupported char '{ch}' in binary string"),
                })
            }
        }
        cnt += 1;
        if cnt == 8 {
            out.push(buff);
            buff = 0;
            cnt = 0;
        }
    }
    if cnt > 0 {
        out.push(if msb0 { buff >> (8 - cnt) } else { buff });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bits_lsb0() {
        let mut reader = BitReader::new(&[0xA5]);
        assert_eq!(reader.read_bits(4).unwrap(), Some(5));
        assert_eq!(reader.read_bits(4).unwrap(), Some(10));
        assert_eq!(reader.read_bits(1).unwrap(), None);
    }

    #[test]
    fn test_read_bits_msb0() {
        let mut reader = BitReader::with_bit_order(&[0xA5], BitOrder::Msb0);
        assert_eq!(reader.read_bits(4).unwrap(), Some(10));
        assert_eq!(reader.read_bits(4).unwrap(), Some(5));
    }

    #[test]
    fn test_read_bits_across_byte_boundary() {
        // 0x0F = 00001111, 0x03 = 00000011 in LSB0 consumption order:
        // 1,1,1,1,0,0,0,0 then 1,1,0,...
        let mut reader = BitReader::new(&[0x0F, 0x03]);
        assert_eq!(reader.read_bits(6).unwrap(), Some(0b001111));
        assert_eq!(reader.read_bits(4).unwrap(), Some(0b1100));
    }

    #[test]
    fn test_aligned_byte_read_is_order_independent() {
        let mut lsb = BitReader::new(&[0xA5]);
        let mut msb = BitReader::with_bit_order(&[0xA5], BitOrder::Msb0);
        assert_eq!(lsb.read_byte().unwrap(), 0xA5);
        assert_eq!(msb.read_bits(8).unwrap(), Some(0xA5));
    }

    #[test]
    fn test_counter_ignores_partial_bytes() {
        let mut reader = BitReader::new(&[0xFF, 0x01]);
        reader.read_bits(3).unwrap();
        assert_eq!(reader.counter(), 0);
        reader.read_bits(5).unwrap();
        assert_eq!(reader.counter(), 1);
        reader.read_bits(1).unwrap();
        assert_eq!(reader.counter(), 1);
        reader.align_to_byte();
        assert_eq!(reader.counter(), 2);
    }

    #[test]
    fn test_align_on_boundary_is_noop() {
        let mut reader = BitReader::new(&[0x01, 0x02]);
        reader.read_byte().unwrap();
        reader.align_to_byte();
        assert_eq!(reader.counter(), 1);
        assert_eq!(reader.read_byte().unwrap(), 0x02);
    }

    #[test]
    fn test_reset_counter_drops_partial_byte() {
        let mut reader = BitReader::new(&[0xFF, 0xA5]);
        reader.read_bits(3).unwrap();
        reader.reset_counter();
        assert_eq!(reader.counter(), 0);
        assert_eq!(reader.read_byte().unwrap(), 0xA5);
        assert_eq!(reader.counter(), 1);
    }

    #[test]
    fn test_read_multibyte_orders() {
        let mut reader = BitReader::new(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(reader.read_int(ByteOrder::BigEndian).unwrap(), 0x01020304);

        let mut reader = BitReader::new(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            reader.read_int(ByteOrder::LittleEndian).unwrap(),
            0x04030201
        );

        let mut reader = BitReader::new(&[0xFF, 0xFE]);
        assert_eq!(
            reader.read_unsigned_short(ByteOrder::BigEndian).unwrap(),
            0xFFFE
        );
    }

    #[test]
    fn test_read_long() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut reader = BitReader::new(&data);
        assert_eq!(
            reader.read_long(ByteOrder::BigEndian).unwrap(),
            0x0102030405060708
        );
        let mut reader = BitReader::new(&data);
        assert_eq!(
            reader.read_long(ByteOrder::LittleEndian).unwrap(),
            0x0807060504030201
        );
    }

    #[test]
    fn test_read_byte_array_whole_stream() {
        let mut reader = BitReader::new(&[1, 2, 3]);
        assert_eq!(reader.read_byte_array(None).unwrap(), vec![1, 2, 3]);
        assert!(!reader.has_available_data());
        assert_eq!(reader.counter(), 3);
    }

    #[test]
    fn test_read_byte_array_too_short() {
        let mut reader = BitReader::new(&[1, 2]);
        assert!(matches!(
            reader.read_byte_array(Some(3)),
            Err(Error::EndOfStream { .. })
        ));
    }

    #[test]
    fn test_read_short_array_whole_stream_odd_tail() {
        let mut reader = BitReader::new(&[0, 1, 0, 2, 9]);
        assert!(matches!(
            reader.read_short_array(None, ByteOrder::BigEndian),
            Err(Error::EndOfStream { .. })
        ));
    }

    #[test]
    fn test_skip_bytes() {
        let mut reader = BitReader::new(&[1, 2, 3]);
        reader.skip_bytes(2).unwrap();
        assert_eq!(reader.read_byte().unwrap(), 3);
        assert!(matches!(
            reader.skip_bytes(1),
            Err(Error::EndOfStream { .. })
        ));
    }

    #[test]
    fn test_unaligned_byte_read_spans_boundary() {
        // LSB0: after 4 bits of 0xA5 (0101), a byte read takes 1010 then
        // the low nibble of the next byte.
        let mut reader = BitReader::new(&[0xA5, 0x3C]);
        assert_eq!(reader.read_bits(4).unwrap(), Some(0x5));
        assert_eq!(reader.read_byte().unwrap(), 0xCA);
    }

    #[test]
    fn test_bin_str_round_trip() {
        let bytes = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x80];
        for order in [BitOrder::Lsb0, BitOrder::Msb0] {
            let text = bin_to_str(&bytes, order);
            assert_eq!(str_to_bin(&text, order).unwrap(), bytes);
        }
    }

    #[test]
    fn test_str_to_bin_separators_and_partial() {
        assert_eq!(str_to_bin("0000_0001", BitOrder::Lsb0).unwrap(), vec![1]);
        assert_eq!(str_to_bin("1", BitOrder::Lsb0).unwrap(), vec![1]);
        assert_eq!(str_to_bin("1", BitOrder::Msb0).unwrap(), vec![1]);
        assert!(str_to_bin("012", BitOrder::Lsb0).is_err());
    }
}
