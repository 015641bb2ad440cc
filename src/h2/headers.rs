//! Header fields and HTTP/2 message validation
//!
//! RFC 9113 Section 8 tightens HTTP semantics: field names are lowercase,
//! pseudo-headers come first and appear once, and connection-specific
//! fields are forbidden. A message that breaks these rules is malformed and
//! is reset with PROTOCOL_ERROR; the connection itself survives.

use std::fmt;

/// A single decoded header field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }

    /// True for `:method`, `:status` and friends
    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }

    /// Size as counted against SETTINGS_MAX_HEADER_LIST_SIZE
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Fields that only make sense hop-by-hop in HTTP/1.1
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// Check a regular field name as it must appear on an HTTP/2 wire
pub fn valid_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| is_token_char(b) && !b.is_ascii_uppercase())
}

/// Check a field value: no NUL, CR, LF or other control bytes except HTAB
pub fn valid_field_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

/// True when the field may not be carried over HTTP/2
pub fn is_connection_specific(field: &HeaderField) -> bool {
    if CONNECTION_SPECIFIC.contains(&field.name.as_str()) {
        return true;
    }
    field.name == "te" && field.value != "trailers"
}

/// Structural checks applied to every decoded header block
///
/// Returns a short reason on failure.
pub fn check_block(fields: &[HeaderField]) -> Result<(), &'static str> {
    let mut seen_regular = false;
    let mut pseudo: Vec<&str> = Vec::new();

    for field in fields {
        if !valid_field_value(&field.value) {
            return Err("invalid header field value");
        }
        if field.is_pseudo() {
            if seen_regular {
                return Err("pseudo-header after regular header");
            }
            if pseudo.contains(&field.name.as_str()) {
                return Err("duplicate pseudo-header");
            }
            pseudo.push(&field.name);
        } else {
            seen_regular = true;
            if !valid_field_name(&field.name) {
                return Err("invalid header field name");
            }
            if is_connection_specific(field) {
                return Err("connection-specific header field");
            }
        }
    }
    Ok(())
}

/// The request line and fields of an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    /// `:protocol` (extended CONNECT, RFC 8441)
    pub protocol: Option<String>,
    pub fields: Vec<HeaderField>,
}

impl RequestHead {
    /// Parse and validate a server-side request header block
    pub fn parse(fields: Vec<HeaderField>) -> Result<Self, &'static str> {
        let mut head = RequestHead {
            method: String::new(),
            scheme: None,
            authority: None,
            path: None,
            protocol: None,
            fields: Vec::with_capacity(fields.len()),
        };
        let mut method = None;

        for field in fields {
            match field.name.as_str() {
                ":method" => method = Some(field.value),
                ":scheme" => head.scheme = Some(field.value),
                ":authority" => head.authority = Some(field.value),
                ":path" => head.path = Some(field.value),
                ":protocol" => head.protocol = Some(field.value),
                name if name.starts_with(':') => return Err("unknown request pseudo-header"),
                _ => head.fields.push(field),
            }
        }

        head.method = method.ok_or("missing :method")?;
        if head.method.is_empty() {
            return Err("empty :method");
        }

        let is_connect = head.method == "CONNECT";
        if is_connect && head.protocol.is_none() {
            // Plain CONNECT: authority only.
            if head.scheme.is_some() || head.path.is_some() {
                return Err("CONNECT request with :scheme or :path");
            }
            if head.authority.is_none() {
                return Err("CONNECT request without :authority");
            }
            return Ok(head);
        }
        if head.protocol.is_some() && !is_connect {
            return Err(":protocol on a non-CONNECT request");
        }

        match head.path.as_deref() {
            None | Some("") => return Err("missing :path"),
            Some("*") if head.method == "OPTIONS" => {}
            Some(path) if path.starts_with('/') => {}
            Some(_) => return Err(":path must start with '/' or be '*'"),
        }
        if head.scheme.as_deref().map_or(true, str::is_empty) {
            return Err("missing :scheme");
        }

        Ok(head)
    }

    /// Value of a regular field
    pub fn header(&self, name: &str) -> Option<&str> {
        find(&self.fields, name)
    }
}

/// Status and fields of an inbound response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub fields: Vec<HeaderField>,
}

impl ResponseHead {
    /// Parse and validate a client-side response header block
    pub fn parse(fields: Vec<HeaderField>) -> Result<Self, &'static str> {
        let mut status = None;
        let mut regular = Vec::with_capacity(fields.len());

        for field in fields {
            match field.name.as_str() {
                ":status" => status = Some(field.value),
                name if name.starts_with(':') => return Err("unknown response pseudo-header"),
                _ => regular.push(field),
            }
        }

        let status = status.ok_or("missing :status")?;
        if status.len() != 3 || !status.bytes().all(|b| b.is_ascii_digit()) {
            return Err("malformed :status");
        }
        let status: u16 = status.parse().map_err(|_| "malformed :status")?;
        if status < 100 {
            return Err("malformed :status");
        }

        Ok(ResponseHead {
            status,
            fields: regular,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find(&self.fields, name)
    }
}

/// Trailers may not carry pseudo-headers
pub fn check_trailers(fields: &[HeaderField]) -> Result<(), &'static str> {
    if fields.iter().any(HeaderField::is_pseudo) {
        return Err("pseudo-header in trailers");
    }
    Ok(())
}

/// First value of a field by (lowercase) name
pub fn find<'a>(fields: &'a [HeaderField], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|f| f.name == name)
        .map(|f| f.value.as_str())
}

/// Parse a `content-length` field
///
/// Multiple identical values are tolerated; conflicting ones are not.
pub fn content_length(fields: &[HeaderField]) -> Result<Option<u64>, &'static str> {
    let mut length = None;
    for field in fields.iter().filter(|f| f.name == "content-length") {
        let value = field.value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err("malformed content-length");
        }
        let parsed: u64 = value.parse().map_err(|_| "malformed content-length")?;
        match length {
            Some(prev) if prev != parsed => return Err("conflicting content-length"),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

/// Validate fields a local caller wants to send
///
/// Names are lowercased; connection-specific fields are rejected.
pub fn normalize_outgoing(fields: &[HeaderField]) -> Result<Vec<HeaderField>, String> {
    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let name = field.name.to_ascii_lowercase();
        let field = HeaderField::new(name, field.value.clone());
        if !valid_field_name(&field.name) {
            return Err(format!("invalid header field name {:?}", field.name));
        }
        if !valid_field_value(&field.value) {
            return Err(format!("invalid value for header {:?}", field.name));
        }
        if is_connection_specific(&field) {
            return Err(format!("connection-specific header {:?}", field.name));
        }
        out.push(field);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<HeaderField> {
        pairs.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
    }

    #[test]
    fn test_field_name_rules() {
        assert!(valid_field_name("content-type"));
        assert!(!valid_field_name("Content-Type"));
        assert!(!valid_field_name(""));
        assert!(!valid_field_name("bad name"));
        assert!(valid_field_value("text/plain; q=1\tx"));
        assert!(!valid_field_value("a\r\nb"));
    }

    #[test]
    fn test_block_structure() {
        assert!(check_block(&fields(&[(":status", "200"), ("server", "x")])).is_ok());
        assert_eq!(
            check_block(&fields(&[("server", "x"), (":status", "200")])),
            Err("pseudo-header after regular header")
        );
        assert_eq!(
            check_block(&fields(&[(":path", "/"), (":path", "/a")])),
            Err("duplicate pseudo-header")
        );
        assert_eq!(
            check_block(&fields(&[("connection", "close")])),
            Err("connection-specific header field")
        );
        assert!(check_block(&fields(&[("te", "trailers")])).is_ok());
        assert!(check_block(&fields(&[("te", "gzip")])).is_err());
    }

    #[test]
    fn test_request_path_rules() {
        let ok = RequestHead::parse(fields(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/index"),
            (":authority", "example.com"),
        ]))
        .unwrap();
        assert_eq!(ok.path.as_deref(), Some("/index"));

        let bad = RequestHead::parse(fields(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "index"),
        ]));
        assert!(bad.is_err());

        let star = RequestHead::parse(fields(&[
            (":method", "OPTIONS"),
            (":scheme", "https"),
            (":path", "*"),
        ]));
        assert!(star.is_ok());

        let missing = RequestHead::parse(fields(&[(":method", "GET"), (":scheme", "http")]));
        assert_eq!(missing, Err("missing :path"));
    }

    #[test]
    fn test_connect_rules() {
        let connect = RequestHead::parse(fields(&[
            (":method", "CONNECT"),
            (":authority", "example.com:443"),
        ]));
        assert!(connect.is_ok());

        let with_path = RequestHead::parse(fields(&[
            (":method", "CONNECT"),
            (":authority", "example.com:443"),
            (":path", "/"),
        ]));
        assert!(with_path.is_err());

        let extended = RequestHead::parse(fields(&[
            (":method", "CONNECT"),
            (":protocol", "websocket"),
            (":scheme", "https"),
            (":path", "/chat"),
            (":authority", "example.com"),
        ]));
        assert!(extended.is_ok());
    }

    #[test]
    fn test_response_status() {
        let head = ResponseHead::parse(fields(&[(":status", "204"), ("server", "t")])).unwrap();
        assert_eq!(head.status, 204);
        assert_eq!(head.header("server"), Some("t"));

        assert!(ResponseHead::parse(fields(&[(":status", "20")])).is_err());
        assert!(ResponseHead::parse(fields(&[(":status", "abc")])).is_err());
        assert!(ResponseHead::parse(fields(&[("server", "t")])).is_err());
        assert!(ResponseHead::parse(fields(&[(":status", "200"), (":path", "/")])).is_err());
    }

    #[test]
    fn test_content_length() {
        assert_eq!(content_length(&fields(&[("content-length", "12")])), Ok(Some(12)));
        assert_eq!(content_length(&fields(&[])), Ok(None));
        assert!(content_length(&fields(&[("content-length", "1"), ("content-length", "2")])).is_err());
        assert!(content_length(&fields(&[("content-length", "-1")])).is_err());
    }

    #[test]
    fn test_normalize_outgoing_lowercases() {
        let out = normalize_outgoing(&fields(&[("X-Trace", "1")])).unwrap();
        assert_eq!(out[0].name, "x-trace");
        assert!(normalize_outgoing(&fields(&[("Transfer-Encoding", "chunked")])).is_err());
    }
}
