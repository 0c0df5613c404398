//! Pure conversions between raw register words and typed values.
//!
//! Word order is big-endian throughout: the high word of a 32-bit value
//! arrives first, matching how the Venus transmits its energy counters and
//! power pairs. Scaling is a plain multiplication by the definition's factor,
//! so fixed-point registers use fractional scales and sign-flip conventions
//! use negative ones.

use crate::catalog::{ActiveRegister, BitFlag, Encoding};
use crate::error::{DecodeError, EncodeError};
use crate::value::{Flag, FlagSet, Value};

/// Decode a raw word block per the register's encoding and scale.
///
/// The only possible failure is a word-count mismatch; every input of the
/// declared width decodes to some value.
pub fn decode(reg: &ActiveRegister, words: &[u16]) -> Result<Value, DecodeError> {
    let expected = reg.words();
    if words.len() != expected as usize {
        return Err(DecodeError::MalformedLength {
            name: reg.name(),
            expected,
            got: words.len() as u16,
        });
    }

    let value = match reg.encoding {
        Encoding::U16 => scaled(words[0] as f64, reg),
        Encoding::I16 => scaled(words[0] as i16 as f64, reg),
        Encoding::U32 => {
            let raw = ((words[0] as u32) << 16) | words[1] as u32;
            scaled(raw as f64, reg)
        }
        Encoding::I32 => {
            let raw = (((words[0] as u32) << 16) | words[1] as u32) as i32;
            scaled(raw as f64, reg)
        }
        Encoding::Ascii { .. } => Value::Text(unpack_ascii(words)),
        Encoding::Bitfield { map, .. } => Value::Flags(unpack_bits(words, map)),
    };
    Ok(value)
}

/// Validate and encode a typed value into exactly the register's word width.
///
/// Access mode and range/step are checked before any conversion, so a
/// rejected write never produces words for the transport.
pub fn encode(reg: &ActiveRegister, value: &Value) -> Result<Vec<u16>, EncodeError> {
    let name = reg.name();
    if !reg.def.access.writable() {
        return Err(EncodeError::NotWritable { name });
    }
    let v = value
        .as_number()
        .ok_or(EncodeError::UnsupportedValue { name })?;
    if let Some(bounds) = reg.def.bounds {
        if !bounds.admits(v) {
            return Err(EncodeError::OutOfRange { name, value: v });
        }
    }

    let raw = (v / reg.def.scale).round() as i64;
    let out_of_range = EncodeError::OutOfRange { name, value: v };
    match reg.encoding {
        Encoding::U16 => {
            let w = u16::try_from(raw).map_err(|_| out_of_range)?;
            Ok(vec![w])
        }
        Encoding::I16 => {
            let w = i16::try_from(raw).map_err(|_| out_of_range)?;
            Ok(vec![w as u16])
        }
        Encoding::U32 => {
            let w = u32::try_from(raw).map_err(|_| out_of_range)?;
            Ok(vec![(w >> 16) as u16, w as u16])
        }
        Encoding::I32 => {
            let w = i32::try_from(raw).map_err(|_| out_of_range)? as u32;
            Ok(vec![(w >> 16) as u16, w as u16])
        }
        Encoding::Ascii { .. } | Encoding::Bitfield { .. } => {
            Err(EncodeError::UnsupportedValue { name })
        }
    }
}

fn scaled(raw: f64, reg: &ActiveRegister) -> Value {
    Value::Number(raw * reg.def.scale)
}

/// Two ASCII bytes per word, high byte first; trailing NUL and space padding
/// is trimmed.
fn unpack_ascii(words: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for &w in words {
        bytes.push((w >> 8) as u8);
        bytes.push(w as u8);
    }
    while matches!(bytes.last(), Some(&0) | Some(&b' ')) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Flat bit scan over the word block. Bit `n` lives in word `n / 16` at
/// position `n % 16`. Set bits without a map entry come back as reserved
/// flags so nothing is silently dropped.
fn unpack_bits(words: &[u16], map: &'static [BitFlag]) -> FlagSet {
    let mut flags = Vec::new();
    for bit in 0..(words.len() * 16) as u8 {
        let word = words[bit as usize / 16];
        if word >> (bit % 16) & 1 == 0 {
            continue;
        }
        match map.iter().find(|b| b.bit == bit) {
            Some(named) => flags.push(Flag::Named(named.name)),
            None => flags.push(Flag::Reserved(bit)),
        }
    }
    FlagSet(flags)
}
