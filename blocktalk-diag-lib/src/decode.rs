//! Conversion of measuring block triples `(id, a, b)` to physical values.

use std::fmt;

/// A decoded measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    /// Raw, binary and counter formats
    Unsigned(u16),
    /// Two characters (formula 0x11)
    Text(String),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Unsigned(v) => Some(f64::from(*v)),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => {
                let text = format!("{v:.3}");
                let text = text.trim_end_matches('0').trim_end_matches('.');
                f.write_str(if text == "-0" { "0" } else { text })
            }
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Decode one measurement triple into a value and its unit.
pub fn decode_block_data(id: u8, a: u8, b: u8) -> (Value, &'static str) {
    let fa = f64::from(a);
    let fb = f64::from(b);
    let word = (u16::from(a) << 8) | u16::from(b);

    match id {
        0x01 => (Value::Float(fa * fb / 5.0), "rpm"),
        0x04 => {
            let unit = if b > 127 { "° ATDC" } else { "° BTDC" };
            (Value::Float((fb - 127.0).abs() * 0.01 * fa), unit)
        }
        0x07 => (Value::Float(0.01 * fa * fb), "km/h"),
        0x08 | 0x10 | 0x25 => (Value::Unsigned(word), "Binary"),
        0x11 => {
            let text: String = [char::from(a), char::from(b)].iter().collect();
            (Value::Text(text), "ASCII")
        }
        0x12 => (Value::Float(fa * fb / 25.0), "mbar"),
        0x14 => (Value::Float(fa * fb / 128.0 - 1.0), "%"),
        0x15 => (Value::Float(fa * fb / 1000.0), "V"),
        0x16 => (Value::Float(0.001 * fa * fb), "ms"),
        0x17 => (Value::Float(fb * fa / 256.0), "%"),
        0x1A => (Value::Float(fb - fa), "° C"),
        0x21 => {
            let v = if a == 0 { 100.0 * fb } else { 100.0 * fb / fa };
            (Value::Float(v), "%")
        }
        0x22 => (Value::Float((fb - 128.0) * 0.01 * fa), "kW"),
        0x23 => (Value::Float(fa * fb / 100.0), "l/h"),
        0x27 => (Value::Float(fa * fb / 256.0), "mg/stk"),
        0x31 => (Value::Float(fa * fb / 40.0), "mg/stk"),
        0x33 => (Value::Float(((fb - 128.0) / 255.0) * fa), "mg/stk Δ"),
        0x36 => (Value::Unsigned(u16::from(a) * 256 + u16::from(b)), "Count"),
        0x37 => (Value::Float(fa * fb / 200.0), "s"),
        // TODO: confirm 0x51 and 0x5E against logs from a real ECU
        0x51 => (Value::Float((fa * 112_000.0 + fb * 436.0) / 1000.0), "° CF"),
        0x5E => (Value::Float(fa * (fb / 50.0 - 1.0)), "Nm"),
        _ => (Value::Unsigned(word), "Raw"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float(id: u8, a: u8, b: u8) -> f64 {
        decode_block_data(id, a, b).0.as_f64().unwrap()
    }

    #[test]
    fn test_engine_speed() {
        assert_eq!(decode_block_data(0x01, 10, 25), (Value::Float(50.0), "rpm"));
    }

    #[test]
    fn test_vehicle_speed() {
        let (value, unit) = decode_block_data(0x07, 20, 50);
        assert!((value.as_f64().unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(unit, "km/h");
    }

    #[test]
    fn test_timing_direction() {
        assert_eq!(decode_block_data(0x04, 10, 150).1, "° ATDC");
        assert_eq!(decode_block_data(0x04, 10, 100).1, "° BTDC");
        assert!((float(0x04, 10, 100) - 2.7).abs() < 1e-9);
    }

    #[test]
    fn test_signed_formulas() {
        assert_eq!(float(0x1A, 20, 10), -10.0);
        assert!((float(0x22, 100, 0) + 128.0).abs() < 1e-9);
        assert_eq!(float(0x14, 0, 0), -1.0);
    }

    #[test]
    fn test_percentage_with_zero_divisor() {
        assert_eq!(float(0x21, 0, 42), 4200.0);
        assert_eq!(float(0x21, 2, 42), 2100.0);
    }

    #[test]
    fn test_integer_formats() {
        assert_eq!(decode_block_data(0x10, 0x0A, 0x01), (Value::Unsigned(0x0A01), "Binary"));
        assert_eq!(decode_block_data(0x36, 1, 44), (Value::Unsigned(300), "Count"));
        assert_eq!(decode_block_data(0xEE, 0x12, 0x34), (Value::Unsigned(0x1234), "Raw"));
    }

    #[test]
    fn test_ascii() {
        assert_eq!(decode_block_data(0x11, b'D', b'4'), (Value::Text("D4".to_string()), "ASCII"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Float(50.0).to_string(), "50");
        assert_eq!(Value::Float(14.0).to_string(), "14");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Float(0.1 + 0.2).to_string(), "0.3");
        assert_eq!(Value::Unsigned(7).to_string(), "7");
    }
}
