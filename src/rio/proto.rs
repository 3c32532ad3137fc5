//! Multi-bulk protocol framing on top of a [`Stream`].

use super::Stream;
use crate::error::RioResult;

impl<'a> Stream<'a> {
    /// Writes `<prefix><count>\r\n` and returns the bytes produced.
    ///
    /// # Errors
    /// Propagates the stream write error.
    pub fn write_bulk_count(&mut self, prefix: u8, count: i64) -> RioResult<usize> {
        let header = format!("{}{count}\r\n", char::from(prefix));
        self.write_copied(header.as_bytes())
    }

    /// Writes `$<len>\r\n<payload>\r\n` and returns the bytes produced.
    ///
    /// # Errors
    /// Propagates the stream write error.
    pub fn write_bulk_string(&mut self, payload: &'a [u8]) -> RioResult<usize> {
        let header = self.write_bulk_count(b'$', payload.len() as i64)?;
        if !payload.is_empty() {
            self.write(payload)?;
        }
        self.write(b"\r\n")?;
        Ok(header + payload.len() + 2)
    }

    /// Writes `value` as a bulk string of its decimal digits.
    ///
    /// # Errors
    /// Propagates the stream write error.
    pub fn write_bulk_i64(&mut self, value: i64) -> RioResult<usize> {
        self.write_bulk_owned(value.to_string().as_bytes())
    }

    /// Writes `value` as a bulk string in shortest round-trip form.
    ///
    /// # Errors
    /// Propagates the stream write error.
    pub fn write_bulk_f64(&mut self, value: f64) -> RioResult<usize> {
        self.write_bulk_owned(format_double(value).as_bytes())
    }

    fn write_bulk_owned(&mut self, payload: &[u8]) -> RioResult<usize> {
        let header = self.write_bulk_count(b'$', payload.len() as i64)?;
        self.write_copied(payload)?;
        self.write(b"\r\n")?;
        Ok(header + payload.len() + 2)
    }
}

/// Shortest digits that parse back to `value`, switching to exponent form for very
/// large or very small magnitudes (`1e+21`, `1.5e-7`).
#[must_use]
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    let magnitude = value.abs();
    if value.is_infinite() || magnitude == 0.0 || (1e-6..1e21).contains(&magnitude) {
        return value.to_string();
    }

    let formatted = format!("{value:e}");
    match formatted.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => formatted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(f: impl FnOnce(&mut Stream<'static>) -> RioResult<usize>) -> (usize, String) {
        let mut stream = Stream::with_buffer(Vec::new());
        let n = f(&mut stream).unwrap();
        let bytes = stream.into_buffer().unwrap();
        (n, String::from_utf8(bytes).unwrap())
    }

    #[test]
    fn bulk_framing() {
        assert_eq!(written(|s| s.write_bulk_count(b'*', 3)), (4, "*3\r\n".into()));
        assert_eq!(
            written(|s| s.write_bulk_string(b"foo")),
            (9, "$3\r\nfoo\r\n".into())
        );
        assert_eq!(written(|s| s.write_bulk_string(b"")), (6, "$0\r\n\r\n".into()));
        assert_eq!(
            written(|s| s.write_bulk_i64(-42)),
            (9, "$3\r\n-42\r\n".into())
        );
    }

    #[test]
    fn doubles_use_shortest_form() {
        assert_eq!(format_double(1.5), "1.5");
        assert_eq!(format_double(3.0), "3");
        assert_eq!(format_double(-0.25), "-0.25");
        assert_eq!(format_double(1e21), "1e+21");
        assert_eq!(format_double(1.5e-7), "1.5e-7");
        assert_eq!(format_double(f64::INFINITY), "inf");
        assert_eq!(format_double(f64::NAN), "nan");
        assert_eq!(
            written(|s| s.write_bulk_f64(2.5)),
            (9, "$3\r\n2.5\r\n".into())
        );
    }
}
