//! HPACK glue
//!
//! Header compression is delegated to the `hpack` crate. Each connection owns
//! exactly one encoder (used under the writer lock) and one decoder (used by
//! the read loop); both are order-dependent, so a header block must be
//! encoded and written, or read and decoded, as one unit.

use super::error::{ConnectionError, ErrorCode};
use super::headers::HeaderField;
use bytes::Bytes;

/// Compresses header lists for one connection
pub struct HeaderEncoder {
    inner: ::hpack::Encoder<'static>,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        HeaderEncoder {
            inner: ::hpack::Encoder::new(),
        }
    }

    /// Encode a header list into one header block
    ///
    /// Field names are lowercased on the way out.
    pub fn encode(&mut self, fields: &[HeaderField]) -> Bytes {
        let lowered: Vec<(Vec<u8>, &[u8])> = fields
            .iter()
            .map(|f| (f.name.to_ascii_lowercase().into_bytes(), f.value.as_bytes()))
            .collect();
        let block = self
            .inner
            .encode(lowered.iter().map(|(n, v)| (n.as_slice(), *v)));
        Bytes::from(block)
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of decoding one complete header block
#[derive(Debug, Default)]
pub struct DecodedBlock {
    pub fields: Vec<HeaderField>,
    /// Fields were dropped because the list exceeded the size budget
    pub truncated: bool,
    /// A field was not valid UTF-8 text
    pub invalid: bool,
}

/// Decompresses header blocks for one connection
pub struct HeaderDecoder {
    inner: ::hpack::Decoder<'static>,
    max_list_size: usize,
}

impl HeaderDecoder {
    pub fn new(max_list_size: usize) -> Self {
        HeaderDecoder {
            inner: ::hpack::Decoder::new(),
            max_list_size,
        }
    }

    pub fn set_max_list_size(&mut self, size: usize) {
        self.max_list_size = size;
    }

    pub fn max_list_size(&self) -> usize {
        self.max_list_size
    }

    /// Decode a complete header block
    ///
    /// The whole block is always run through the decoder so the dynamic
    /// table stays in sync with the peer. Fields past the size budget are
    /// discarded and the result is marked truncated. A decoding failure
    /// desynchronizes the table and is therefore a connection error.
    pub fn decode(&mut self, block: &[u8]) -> Result<DecodedBlock, ConnectionError> {
        let mut out = DecodedBlock::default();
        let mut budget = self.max_list_size;

        self.inner
            .decode_with_cb(block, |name, value| {
                let size = name.len() + value.len() + 32;
                if out.truncated || size > budget {
                    out.truncated = true;
                    return;
                }
                budget -= size;

                match (
                    String::from_utf8(name.into_owned()),
                    String::from_utf8(value.into_owned()),
                ) {
                    (Ok(name), Ok(value)) => out.fields.push(HeaderField { name, value }),
                    _ => out.invalid = true,
                }
            })
            .map_err(|e| {
                ConnectionError::new(
                    ErrorCode::CompressionError,
                    format!("header block decoding failed: {:?}", e),
                )
            })?;

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_order_and_lowercases() {
        let mut encoder = HeaderEncoder::new();
        let mut decoder = HeaderDecoder::new(16 << 10);

        let fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":path", "/"),
            HeaderField::new("X-Custom", "One"),
            HeaderField::new("accept", "*/*"),
        ];
        let block = encoder.encode(&fields);
        let decoded = decoder.decode(&block).unwrap();

        assert!(!decoded.truncated);
        let names: Vec<&str> = decoded.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![":method", ":path", "x-custom", "accept"]);
        assert_eq!(decoded.fields[2].value, "One");
    }

    #[test]
    fn test_dynamic_table_stays_in_sync_across_blocks() {
        let mut encoder = HeaderEncoder::new();
        let mut decoder = HeaderDecoder::new(16 << 10);
        let fields = vec![HeaderField::new("x-repeat", "value-that-gets-indexed")];

        for _ in 0..3 {
            let block = encoder.encode(&fields);
            let decoded = decoder.decode(&block).unwrap();
            assert_eq!(decoded.fields, fields);
        }
    }

    #[test]
    fn test_budget_truncates_but_keeps_decoding() {
        let mut encoder = HeaderEncoder::new();
        let mut decoder = HeaderDecoder::new(100);

        let big = vec![
            HeaderField::new("a", "1"),
            HeaderField::new("b", "x".repeat(200)),
        ];
        let decoded = decoder.decode(&encoder.encode(&big)).unwrap();
        assert!(decoded.truncated);
        assert_eq!(decoded.fields.len(), 1);

        // The next block still decodes against the same table.
        let small = vec![HeaderField::new("c", "3")];
        let decoded = decoder.decode(&encoder.encode(&small)).unwrap();
        assert!(!decoded.truncated);
        assert_eq!(decoded.fields, small);
    }

    #[test]
    fn test_garbage_is_compression_error() {
        let mut decoder = HeaderDecoder::new(1024);
        // Indexed field with an index far outside both tables.
        let err = decoder.decode(&[0xff, 0xff, 0xff, 0x7f]).unwrap_err();
        assert_eq!(err.code, ErrorCode::CompressionError);
    }
}
