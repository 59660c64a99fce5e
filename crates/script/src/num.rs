//! Minimal little-endian sign-magnitude integers used by script arithmetic.

use crate::interpreter::ScriptError;

pub const DEFAULT_MAX_NUM_SIZE: usize = 4;
/// Lock-time operands may use one extra byte.
pub const LOCKTIME_MAX_NUM_SIZE: usize = 5;

pub fn decode_num(data: &[u8], require_minimal: bool, max_size: usize) -> Result<i64, ScriptError> {
    if data.len() > max_size {
        return Err(ScriptError::NumOverflow);
    }
    if require_minimal && !is_minimally_encoded(data) {
        return Err(ScriptError::NumNotMinimal);
    }
    if data.is_empty() {
        return Ok(0);
    }
    let mut result: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        result |= (*byte as i64) << (8 * i);
    }
    let last = data[data.len() - 1];
    if (last & 0x80) != 0 {
        let mask = !(0x80i64 << (8 * (data.len() - 1)));
        return Ok(-(result & mask));
    }
    Ok(result)
}

pub fn is_minimally_encoded(data: &[u8]) -> bool {
    match data.split_last() {
        None => true,
        Some((last, rest)) => {
            if (last & 0x7f) != 0 {
                return true;
            }
            // A bare sign byte is only allowed when the next byte needs it.
            rest.last().is_some_and(|prev| (prev & 0x80) != 0)
        }
    }
}

pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut result = Vec::with_capacity(9);
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = result.last_mut() {
        if (*last & 0x80) != 0 {
            result.push(if negative { 0x80 } else { 0 });
        } else if negative {
            *last |= 0x80;
        }
    }
    result
}

pub fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // Negative zero is false.
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_values() {
        assert_eq!(encode_num(0), Vec::<u8>::new());
        assert_eq!(encode_num(1), vec![0x01]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(encode_num(127), vec![0x7f]);
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_num(-128), vec![0x80, 0x80]);
        assert_eq!(encode_num(255), vec![0xff, 0x00]);
        assert_eq!(encode_num(256), vec![0x00, 0x01]);
    }

    #[test]
    fn decode_inverts_encode() {
        for value in [
            0i64,
            1,
            -1,
            127,
            -127,
            128,
            -128,
            32767,
            -32768,
            8_388_607,
            2_147_483_647,
            -2_147_483_647,
        ] {
            let encoded = encode_num(value);
            assert_eq!(decode_num(&encoded, true, 4).expect("decode"), value);
        }
    }

    #[test]
    fn rejects_overflow_and_padding() {
        assert_eq!(
            decode_num(&[0, 0, 0, 0, 1], false, 4),
            Err(ScriptError::NumOverflow)
        );
        assert_eq!(decode_num(&[0, 0, 0, 0, 1], false, 5), Ok(1 << 32));
        assert_eq!(decode_num(&[0x01, 0x00], true, 4), Err(ScriptError::NumNotMinimal));
        assert_eq!(decode_num(&[0x01, 0x00], false, 4), Ok(1));
        assert_eq!(decode_num(&[0x80], true, 4), Err(ScriptError::NumNotMinimal));
        assert!(is_minimally_encoded(&[0xff, 0x00]));
        assert!(is_minimally_encoded(&[0xff, 0x80]));
    }

    #[test]
    fn bool_casting() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0x00, 0x00]));
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x80, 0x00]));
        assert!(cast_to_bool(&[0x01]));
    }
}
