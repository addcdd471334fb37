use bit_set::BitSet;

use crate::error::{CdcError, Result};

/// Cursor over one binlog event (or one text-protocol packet).
///
/// MySQL mixes little endian integers (packet fields, most column
/// values) with big endian ones (the v2 temporal types and packed
/// decimals), so both orders are provided.
pub struct LogBuffer<'a> {
    buf: &'a [u8],
    pos: usize,
}

const DIG_PER_DEC: usize = 9;
const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

impl<'a> LogBuffer<'a> {
    pub fn new(buf: &'a [u8]) -> LogBuffer<'a> {
        LogBuffer { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(self.out_of_bounds(pos - self.pos));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn forward(&mut self, len: usize) -> Result<()> {
        self.seek(self.pos + len)
    }

    fn out_of_bounds(&self, want: usize) -> CdcError {
        CdcError::Event(format!(
            "read of {} byte(s) at {} exceeds event size {}",
            want,
            self.pos,
            self.buf.len()
        ))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.out_of_bounds(len));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(self.get_u8()? as i8)
    }

    /// Little endian unsigned integer of `len` bytes, 1 to 8.
    pub fn get_uint(&mut self, len: usize) -> Result<u64> {
        let bytes = self.take(len)?;
        let mut v = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            v |= (*b as u64) << (8 * i);
        }
        Ok(v)
    }

    /// Big endian unsigned integer of `len` bytes, 1 to 8.
    pub fn get_uint_be(&mut self, len: usize) -> Result<u64> {
        let bytes = self.take(len)?;
        let mut v = 0u64;
        for b in bytes {
            v = v << 8 | *b as u64;
        }
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(self.get_uint(2)? as u16)
    }

    pub fn get_u24(&mut self) -> Result<u32> {
        Ok(self.get_uint(3)? as u32)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(self.get_uint(4)? as u32)
    }

    pub fn get_u48(&mut self) -> Result<u64> {
        self.get_uint(6)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.get_uint(8)
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Length encoded integer ("packed" in the replication docs).
    /// The 0xfb NULL marker is reported as `None`.
    pub fn get_packed(&mut self) -> Result<Option<u64>> {
        let first = self.get_u8()?;
        match first {
            0xfb => Ok(None),
            0xfc => Ok(Some(self.get_uint(2)?)),
            0xfd => Ok(Some(self.get_uint(3)?)),
            0xfe => Ok(Some(self.get_uint(8)?)),
            v => Ok(Some(v as u64)),
        }
    }

    /// Length encoded integer where NULL is a protocol violation.
    pub fn get_packed_num(&mut self) -> Result<u64> {
        self.get_packed()?
            .ok_or_else(|| CdcError::Event("unexpected NULL length".into()))
    }

    pub fn get_fixed_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Fixed width string; trailing NUL padding is trimmed.
    pub fn get_fixed_string(&mut self, len: usize) -> Result<String> {
        let raw = self.take(len)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn get_string_nul(&mut self) -> Result<String> {
        let start = self.pos;
        let end = self.buf[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|i| start + i)
            .ok_or_else(|| CdcError::Event("unterminated string".into()))?;
        let out = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
        self.pos = end + 1;
        Ok(out)
    }

    /// Length encoded byte string; `None` for the NULL marker.
    pub fn get_packed_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        match self.get_packed()? {
            None => Ok(None),
            Some(len) => Ok(Some(self.take(len as usize)?)),
        }
    }

    /// Bitmap of `count` bits in binlog order: bit `i` is bit `i % 8`
    /// of byte `i / 8`.
    pub fn get_bit_map(&mut self, count: usize) -> Result<BitSet> {
        let bytes = self.take((count + 7) / 8)?;
        let mut set = BitSet::with_capacity(count);
        for i in 0..count {
            if bytes[i / 8] >> (i % 8) & 1 == 1 {
                set.insert(i);
            }
        }
        Ok(set)
    }

    /// Packed decimal, returned as its plain digit string (for example
    /// `-123.4500`). Storage: the integral and fractional parts are
    /// split into groups of nine decimal digits, each group a big
    /// endian integer of `DIG2BYTES` size, sign folded into the first
    /// byte's high bit, negative values stored complemented.
    pub fn get_decimal(&mut self, precision: usize, scale: usize) -> Result<String> {
        let intg = precision - scale;
        let intg0 = intg / DIG_PER_DEC;
        let intg0x = intg % DIG_PER_DEC;
        let frac0 = scale / DIG_PER_DEC;
        let frac0x = scale % DIG_PER_DEC;
        let bin_size = intg0 * 4 + DIG2BYTES[intg0x] + frac0 * 4 + DIG2BYTES[frac0x];

        let mut d = self.take(bin_size)?.to_vec();
        if d.is_empty() {
            return Ok("0".to_string());
        }
        let negative = d[0] & 0x80 == 0;
        d[0] ^= 0x80;
        if negative {
            for b in d.iter_mut() {
                *b = !*b;
            }
        }

        let mut at = 0usize;
        let mut read = |width: usize| -> u64 {
            let mut v = 0u64;
            for b in &d[at..at + width] {
                v = v << 8 | *b as u64;
            }
            at += width;
            v
        };

        let mut int_digits = String::new();
        if intg0x > 0 {
            int_digits.push_str(&format!(
                "{:0width$}",
                read(DIG2BYTES[intg0x]),
                width = intg0x
            ));
        }
        for _ in 0..intg0 {
            int_digits.push_str(&format!("{:09}", read(4)));
        }
        let int_part = int_digits.trim_start_matches('0');
        let int_part = if int_part.is_empty() { "0" } else { int_part };

        let mut out = String::new();
        if negative {
            out.push('-');
        }
        out.push_str(int_part);

        if scale > 0 {
            out.push('.');
            for _ in 0..frac0 {
                out.push_str(&format!("{:09}", read(4)));
            }
            if frac0x > 0 {
                out.push_str(&format!(
                    "{:0width$}",
                    read(DIG2BYTES[frac0x]),
                    width = frac0x
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_and_big_endian_integers() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(LogBuffer::new(&data).get_u32().unwrap(), 0x04030201);
        assert_eq!(LogBuffer::new(&data).get_uint_be(4).unwrap(), 0x01020304);
        assert_eq!(LogBuffer::new(&data).get_u24().unwrap(), 0x030201);
    }

    #[test]
    fn length_encoded_integers() {
        assert_eq!(LogBuffer::new(&[0xfa]).get_packed().unwrap(), Some(250));
        assert_eq!(
            LogBuffer::new(&[0xfc, 0x34, 0x12]).get_packed().unwrap(),
            Some(0x1234)
        );
        assert_eq!(
            LogBuffer::new(&[0xfd, 0x56, 0x34, 0x12]).get_packed().unwrap(),
            Some(0x123456)
        );
        assert_eq!(LogBuffer::new(&[0xfb]).get_packed().unwrap(), None);
        assert!(LogBuffer::new(&[0xfb]).get_packed_num().is_err());
    }

    #[test]
    fn bitmap_bit_order() {
        // bit i is bit i % 8 of byte i / 8
        let set = LogBuffer::new(&[0b0000_0101, 0b0000_0001])
            .get_bit_map(9)
            .unwrap();
        assert!(set.contains(0));
        assert!(!set.contains(1));
        assert!(set.contains(2));
        assert!(set.contains(8));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn reads_past_the_end_error() {
        let mut buf = LogBuffer::new(&[1, 2]);
        assert!(buf.get_u32().is_err());
        assert_eq!(buf.get_u16().unwrap(), 0x0201);
        assert!(buf.get_u8().is_err());
    }

    #[test]
    fn packed_decimal_positive() {
        // decimal(4,2) 12.34: integral 12 in one byte with the sign
        // bit set, fraction 34 in one byte
        let mut buf = LogBuffer::new(&[0x8c, 0x22]);
        assert_eq!(buf.get_decimal(4, 2).unwrap(), "12.34");
    }

    #[test]
    fn packed_decimal_negative_is_complemented() {
        let mut buf = LogBuffer::new(&[!0x8c, !0x22]);
        assert_eq!(buf.get_decimal(4, 2).unwrap(), "-12.34");
    }

    #[test]
    fn packed_decimal_nine_digit_groups() {
        // decimal(10,0) 1234567890: leading digit 1, then the group
        // 234567890 as a big endian u32
        let mut data = vec![0x81];
        data.extend_from_slice(&234_567_890u32.to_be_bytes());
        let mut buf = LogBuffer::new(&data);
        assert_eq!(buf.get_decimal(10, 0).unwrap(), "1234567890");
    }

    #[test]
    fn packed_decimal_zero() {
        let mut buf = LogBuffer::new(&[0x80, 0x00]);
        assert_eq!(buf.get_decimal(4, 2).unwrap(), "0.00");
    }
}
