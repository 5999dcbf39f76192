use crate::data_type::DataType;
use crate::error::{AbortCode, ErrorCode};
use crate::prelude::*;
use crate::util;

/// A typed object dictionary value. One variant per CiA 301 scalar type so
/// that every value knows its exact wire width; strings and domains carry
/// their own length.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer8(i8),
    Integer16(i16),
    Integer32(i32),
    Integer64(i64),
    Unsigned8(u8),
    Unsigned16(u16),
    Unsigned32(u32),
    Unsigned64(u64),
    Real32(f32),
    Real64(f64),
    VisibleString(String),
    OctetString(Vec<u8>),
    UnicodeString(String),
    /// Milliseconds after midnight (28 bits) and days since 1984-01-01.
    TimeOfDay { millis: u32, days: u16 },
    TimeDifference { millis: u32, days: u16 },
    Domain(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match *self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Integer8(_) => DataType::Integer8,
            Value::Integer16(_) => DataType::Integer16,
            Value::Integer32(_) => DataType::Integer32,
            Value::Integer64(_) => DataType::Integer64,
            Value::Unsigned8(_) => DataType::Unsigned8,
            Value::Unsigned16(_) => DataType::Unsigned16,
            Value::Unsigned32(_) => DataType::Unsigned32,
            Value::Unsigned64(_) => DataType::Unsigned64,
            Value::Real32(_) => DataType::Real32,
            Value::Real64(_) => DataType::Real64,
            Value::VisibleString(_) => DataType::VisibleString,
            Value::OctetString(_) => DataType::OctetString,
            Value::UnicodeString(_) => DataType::UnicodeString,
            Value::TimeOfDay { .. } => DataType::TimeOfDay,
            Value::TimeDifference { .. } => DataType::TimeDifference,
            Value::Domain(_) => DataType::Domain,
        }
    }

    /// Zero / empty value for a data type, used when an EDS entry carries no
    /// DefaultValue.
    pub fn default_for(data_type: DataType) -> Value {
        match data_type {
            DataType::Boolean => Value::Boolean(false),
            DataType::Integer8 => Value::Integer8(0),
            DataType::Integer16 => Value::Integer16(0),
            DataType::Integer32 => Value::Integer32(0),
            DataType::Integer64 => Value::Integer64(0),
            DataType::Unsigned16 => Value::Unsigned16(0),
            DataType::Unsigned32 => Value::Unsigned32(0),
            DataType::Unsigned64 => Value::Unsigned64(0),
            DataType::Real32 => Value::Real32(0.0),
            DataType::Real64 => Value::Real64(0.0),
            DataType::VisibleString => Value::VisibleString(String::new()),
            DataType::OctetString => Value::OctetString(Vec::new()),
            DataType::UnicodeString => Value::UnicodeString(String::new()),
            DataType::TimeOfDay => Value::TimeOfDay { millis: 0, days: 0 },
            DataType::TimeDifference => Value::TimeDifference { millis: 0, days: 0 },
            DataType::Domain => Value::Domain(Vec::new()),
            // Unsigned8 doubles as the fallback for Unknown so that count
            // sub-objects built without a type still encode as one byte.
            _ => Value::Unsigned8(0),
        }
    }

    /// Little-endian wire encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Boolean(b) => vec![*b as u8],
            Value::Integer8(v) => v.to_le_bytes().to_vec(),
            Value::Integer16(v) => v.to_le_bytes().to_vec(),
            Value::Integer32(v) => v.to_le_bytes().to_vec(),
            Value::Integer64(v) => v.to_le_bytes().to_vec(),
            Value::Unsigned8(v) => v.to_le_bytes().to_vec(),
            Value::Unsigned16(v) => v.to_le_bytes().to_vec(),
            Value::Unsigned32(v) => v.to_le_bytes().to_vec(),
            Value::Unsigned64(v) => v.to_le_bytes().to_vec(),
            Value::Real32(v) => v.to_le_bytes().to_vec(),
            Value::Real64(v) => v.to_le_bytes().to_vec(),
            // Visible strings are ISO 646 (ASCII); unicode strings are
            // arrays of UNSIGNED16, encoded UTF-16LE.
            Value::VisibleString(s) => s.as_bytes().to_vec(),
            Value::UnicodeString(s) => s
                .encode_utf16()
                .flat_map(|cu| cu.to_le_bytes())
                .collect(),
            Value::OctetString(b) | Value::Domain(b) => b.clone(),
            Value::TimeOfDay { millis, days } | Value::TimeDifference { millis, days } => {
                let mut out = (millis & 0x0FFF_FFFF).to_le_bytes().to_vec();
                out.extend_from_slice(&days.to_le_bytes());
                out
            }
        }
    }

    /// Decodes `raw` as `data_type`. Integer widths accept short input and
    /// extend it the way the wire allows (expedited SDO frames may omit the
    /// high bytes); everything else wants the exact length.
    pub fn from_bytes(data_type: DataType, raw: &[u8]) -> Result<Value, AbortCode> {
        fn uint(raw: &[u8], width: usize) -> Result<u64, AbortCode> {
            if raw.is_empty() {
                return Err(AbortCode::GeneralError);
            }
            if raw.len() > width {
                return Err(AbortCode::DataTypeMismatchLengthTooHigh);
            }
            let mut v = 0u64;
            for &b in raw.iter().rev() {
                v = (v << 8) | b as u64;
            }
            Ok(v)
        }
        fn int(raw: &[u8], width: usize) -> Result<i64, AbortCode> {
            let v = uint(raw, width)?;
            let shift = 64 - raw.len() * 8;
            Ok(((v << shift) as i64) >> shift)
        }
        fn exact<const N: usize>(raw: &[u8]) -> Result<[u8; N], AbortCode> {
            raw.try_into().map_err(|_| AbortCode::GeneralError)
        }

        match data_type {
            DataType::Boolean => Ok(Value::Boolean(uint(raw, 1)? != 0)),
            DataType::Integer8 => Ok(Value::Integer8(int(raw, 1)? as i8)),
            DataType::Integer16 => Ok(Value::Integer16(int(raw, 2)? as i16)),
            DataType::Integer32 => Ok(Value::Integer32(int(raw, 4)? as i32)),
            DataType::Integer64 => Ok(Value::Integer64(int(raw, 8)?)),
            DataType::Unsigned8 => Ok(Value::Unsigned8(uint(raw, 1)? as u8)),
            DataType::Unsigned16 => Ok(Value::Unsigned16(uint(raw, 2)? as u16)),
            DataType::Unsigned32 => Ok(Value::Unsigned32(uint(raw, 4)? as u32)),
            DataType::Unsigned64 => Ok(Value::Unsigned64(uint(raw, 8)?)),
            DataType::Real32 => Ok(Value::Real32(f32::from_le_bytes(exact::<4>(raw)?))),
            DataType::Real64 => Ok(Value::Real64(f64::from_le_bytes(exact::<8>(raw)?))),
            DataType::VisibleString => {
                if !raw.is_ascii() {
                    return Err(AbortCode::GeneralError);
                }
                String::from_utf8(raw.to_vec())
                    .map(Value::VisibleString)
                    .map_err(|_| AbortCode::GeneralError)
            }
            DataType::UnicodeString => {
                if raw.len() % 2 != 0 {
                    return Err(AbortCode::GeneralError);
                }
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16(&units)
                    .map(Value::UnicodeString)
                    .map_err(|_| AbortCode::GeneralError)
            }
            DataType::OctetString => Ok(Value::OctetString(raw.to_vec())),
            DataType::Domain | DataType::Unknown => Ok(Value::Domain(raw.to_vec())),
            DataType::TimeOfDay | DataType::TimeDifference => {
                let b = exact::<6>(raw)?;
                let millis = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) & 0x0FFF_FFFF;
                let days = u16::from_le_bytes([b[4], b[5]]);
                Ok(match data_type {
                    DataType::TimeOfDay => Value::TimeOfDay { millis, days },
                    _ => Value::TimeDifference { millis, days },
                })
            }
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Value::VisibleString(s) => s.len(),
            Value::UnicodeString(s) => s.encode_utf16().count() * 2,
            Value::OctetString(b) | Value::Domain(b) => b.len(),
            other => other.data_type().size().unwrap_or(0),
        }
    }

    /// Unsigned view of an integer value. Signed negatives and non-integers
    /// yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Boolean(b) => Some(b as u64),
            Value::Unsigned8(v) => Some(v as u64),
            Value::Unsigned16(v) => Some(v as u64),
            Value::Unsigned32(v) => Some(v as u64),
            Value::Unsigned64(v) => Some(v),
            Value::Integer8(v) if v >= 0 => Some(v as u64),
            Value::Integer16(v) if v >= 0 => Some(v as u64),
            Value::Integer32(v) if v >= 0 => Some(v as u64),
            Value::Integer64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().map(|v| v as u32)
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::Boolean(b) => Some(b as i128),
            Value::Integer8(v) => Some(v as i128),
            Value::Integer16(v) => Some(v as i128),
            Value::Integer32(v) => Some(v as i128),
            Value::Integer64(v) => Some(v as i128),
            Value::Unsigned8(v) => Some(v as i128),
            Value::Unsigned16(v) => Some(v as i128),
            Value::Unsigned32(v) => Some(v as i128),
            Value::Unsigned64(v) => Some(v as i128),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real32(v) => Some(*v as f64),
            Value::Real64(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    /// Range check against optional limits, write-access semantics.
    pub fn check_limits(
        &self,
        low: Option<&Value>,
        high: Option<&Value>,
    ) -> Result<(), AbortCode> {
        if let (Some(this), Some(lo)) = (self.as_f64(), low.and_then(|l| l.as_f64())) {
            if this < lo {
                return Err(AbortCode::ValueWrittenTooLow);
            }
        }
        if let (Some(this), Some(hi)) = (self.as_f64(), high.and_then(|h| h.as_f64())) {
            if this > hi {
                return Err(AbortCode::ValueWrittenTooHigh);
            }
        }
        Ok(())
    }

    /// Parses an EDS value string. `$NODEID+K` (either operand order) is
    /// substituted for integer data types only.
    pub fn from_eds_str(
        data_type: DataType,
        raw: &str,
        node_id: u8,
    ) -> Result<Value, ErrorCode> {
        let s = raw.trim();
        let parse_err = || ErrorCode::StringToValueFailed {
            data_type,
            str: s.to_string(),
        };
        if data_type.is_integer() {
            let v = if s.to_ascii_uppercase().contains("$NODEID") {
                util::eval_node_id_expr(s, node_id).ok_or_else(parse_err)?
            } else {
                util::parse_int(s).ok_or_else(parse_err)?
            };
            return Value::from_int(data_type, v).ok_or_else(parse_err);
        }
        match data_type {
            DataType::Real32 => s.parse::<f32>().map(Value::Real32).map_err(|_| parse_err()),
            DataType::Real64 => s.parse::<f64>().map(Value::Real64).map_err(|_| parse_err()),
            DataType::VisibleString => Ok(Value::VisibleString(s.to_string())),
            DataType::UnicodeString => Ok(Value::UnicodeString(s.to_string())),
            DataType::OctetString => util::parse_hex_bytes(s)
                .map(Value::OctetString)
                .ok_or_else(parse_err),
            DataType::Domain => util::parse_hex_bytes(s).map(Value::Domain).ok_or_else(parse_err),
            // No EDS text form is defined for timestamps.
            _ => Err(parse_err()),
        }
    }

    pub fn from_int(data_type: DataType, v: i128) -> Option<Value> {
        match data_type {
            DataType::Boolean => Some(Value::Boolean(v != 0)),
            DataType::Integer8 => i8::try_from(v).ok().map(Value::Integer8),
            DataType::Integer16 => i16::try_from(v).ok().map(Value::Integer16),
            DataType::Integer32 => i32::try_from(v).ok().map(Value::Integer32),
            DataType::Integer64 => i64::try_from(v).ok().map(Value::Integer64),
            DataType::Unsigned8 => u8::try_from(v).ok().map(Value::Unsigned8),
            DataType::Unsigned16 => u16::try_from(v).ok().map(Value::Unsigned16),
            DataType::Unsigned32 => u32::try_from(v).ok().map(Value::Unsigned32),
            DataType::Unsigned64 => u64::try_from(v).ok().map(Value::Unsigned64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_round_trips() {
        let cases = [
            Value::Unsigned8(0xAB),
            Value::Unsigned16(0xBEEF),
            Value::Unsigned32(0xDEAD_BEEF),
            Value::Unsigned64(0x0123_4567_89AB_CDEF),
            Value::Integer8(-5),
            Value::Integer16(-1234),
            Value::Integer32(-123_456),
            Value::Integer64(-9_876_543_210),
        ];
        for v in cases {
            let bytes = v.to_bytes();
            assert_eq!(bytes.len(), v.data_type().size().unwrap());
            assert_eq!(Value::from_bytes(v.data_type(), &bytes).unwrap(), v);
        }
    }

    #[test]
    fn test_short_integer_extension() {
        // Expedited frames may deliver fewer bytes than the full width.
        assert_eq!(
            Value::from_bytes(DataType::Unsigned32, &[0xE8, 0x03]).unwrap(),
            Value::Unsigned32(0x03E8)
        );
        assert_eq!(
            Value::from_bytes(DataType::Integer16, &[0xFF]).unwrap(),
            Value::Integer16(-1)
        );
        assert!(Value::from_bytes(DataType::Unsigned8, &[1, 2]).is_err());
    }

    #[test]
    fn test_string_codecs() {
        let v = Value::VisibleString("CANopen".to_string());
        assert_eq!(v.to_bytes(), b"CANopen");
        assert_eq!(Value::from_bytes(DataType::VisibleString, b"CANopen").unwrap(), v);
        assert!(Value::from_bytes(DataType::VisibleString, &[0xC3, 0xA9]).is_err());

        let u = Value::UnicodeString("Hi".to_string());
        assert_eq!(u.to_bytes(), vec![b'H', 0, b'i', 0]);
        assert_eq!(Value::from_bytes(DataType::UnicodeString, &[b'H', 0, b'i', 0]).unwrap(), u);
    }

    #[test]
    fn test_time_of_day_layout() {
        let v = Value::TimeOfDay { millis: 43_200_000, days: 15_000 };
        let bytes = v.to_bytes();
        assert_eq!(bytes.len(), 6);
        assert_eq!(Value::from_bytes(DataType::TimeOfDay, &bytes).unwrap(), v);
        // The millisecond field is 28 bits wide.
        let clipped = Value::TimeOfDay { millis: 0xFFFF_FFFF & 0x0FFF_FFFF, days: 1 };
        assert_eq!(Value::from_bytes(DataType::TimeOfDay, &clipped.to_bytes()).unwrap(), clipped);
    }

    #[test]
    fn test_limits() {
        let v = Value::Unsigned16(500);
        assert!(v
            .check_limits(Some(&Value::Unsigned16(0)), Some(&Value::Unsigned16(1000)))
            .is_ok());
        assert_eq!(
            v.check_limits(Some(&Value::Unsigned16(600)), None),
            Err(AbortCode::ValueWrittenTooLow)
        );
        assert_eq!(
            v.check_limits(None, Some(&Value::Unsigned16(100))),
            Err(AbortCode::ValueWrittenTooHigh)
        );
    }

    #[test]
    fn test_eds_strings() {
        assert_eq!(
            Value::from_eds_str(DataType::Unsigned32, "$NODEID+0x600", 2).unwrap(),
            Value::Unsigned32(0x602)
        );
        assert_eq!(
            Value::from_eds_str(DataType::Unsigned16, "0x1000", 1).unwrap(),
            Value::Unsigned16(0x1000)
        );
        assert_eq!(
            Value::from_eds_str(DataType::Integer8, "-3", 1).unwrap(),
            Value::Integer8(-3)
        );
        assert!(Value::from_eds_str(DataType::Unsigned8, "0x1FF", 1).is_err());
    }
}
