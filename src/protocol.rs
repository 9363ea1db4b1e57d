//! Protocol-mode detection and HTTP request/response handling.
//!
//! The wire carries two modes transparently on one listening port: a
//! persistent raw line protocol, and a one-shot HTTP/1.x request whose
//! reply gets wrapped in a synthetic HTTP/2.0-labelled response before
//! the connection closes. Detection happens once, on the first line of
//! a connection.

/// Which wire mode a connection is speaking. Starts `Raw` and may
/// transition at most once, on the first line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    Raw,
    Get,
    Put,
    Post,
    Patch,
    Delete,
}

impl ProtocolMode {
    pub fn is_raw(self) -> bool {
        matches!(self, ProtocolMode::Raw)
    }
}

/// Examines the first line of a connection for a leading HTTP method
/// verb followed by a space. Matching is ASCII and case-sensitive -- a
/// lowercase `get /` is not recognised and the connection stays in Raw
/// mode.
pub fn detect_method(first_line: &str) -> ProtocolMode {
    const METHODS: &[(&str, ProtocolMode)] = &[
        ("GET ", ProtocolMode::Get),
        ("PUT ", ProtocolMode::Put),
        ("POST ", ProtocolMode::Post),
        ("PATCH ", ProtocolMode::Patch),
        ("DELETE ", ProtocolMode::Delete),
    ];
    for (prefix, mode) in METHODS {
        if first_line.starts_with(prefix) {
            return *mode;
        }
    }
    ProtocolMode::Raw
}

/// Pulls the raw query out of a GET request line: the substring between
/// the first `/` and the literal token ` HTTP` that follows it.
///
/// Scanning for the literal ` HTTP` (leading space) rather than bare
/// `HTTP` narrows, but does not eliminate, false matches on a query
/// that happens to contain the letters `HTTP` preceded by a space.
pub fn extract_get_query(request_line: &str) -> Option<&str> {
    let slash = request_line.find('/')?;
    let after_slash = &request_line[slash + 1..];
    let http_pos = after_slash.find(" HTTP")?;
    Some(&after_slash[..http_pos])
}

/// Parses a `Content-Length: <n>` header line, if this is one. Header
/// name matching is a plain case-sensitive substring scan.
pub fn parse_content_length(header_line: &str) -> Option<usize> {
    let rest = header_line.strip_prefix("Content-Length: ")?;
    rest.trim().parse::<usize>().ok()
}

/// Decodes one `application/x-www-form-urlencoded` segment in place:
/// `+` becomes space, `%HH` with two hex digits becomes that byte, and
/// any malformed escape (not enough or non-hex digits) passes through
/// untouched rather than erroring.
pub fn url_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len()
                && is_hex_digit(bytes[i + 1])
                && is_hex_digit(bytes[i + 2]) =>
            {
                let hi = hex_val(bytes[i + 1]);
                let lo = hex_val(bytes[i + 2]);
                out.push((hi << 4) | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_hex_digit(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn hex_val(b: u8) -> u8 {
    (b as char).to_digit(16).unwrap_or(0) as u8
}

/// Splits a POST body / GET query into its `&`-delimited segments. An
/// empty body yields no segments at all.
pub fn split_segments(body: &str) -> Vec<&str> {
    if body.is_empty() {
        Vec::new()
    } else {
        body.split('&').collect()
    }
}

const MIN_STAGING_SIZE: usize = 8192;

/// Per-connection output accumulator used while the protocol mode is
/// non-Raw; handler replies are buffered here instead of going straight
/// out on the wire, then flushed wholesale inside the HTTP response
/// body on disconnect. Overflow is silently truncated rather than
/// erroring or growing without bound.
pub struct StagingBuffer {
    data: Vec<u8>,
    cap: usize,
}

impl StagingBuffer {
    pub fn new() -> StagingBuffer {
        StagingBuffer {
            data: Vec::new(),
            cap: MIN_STAGING_SIZE,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let take = bytes.len().min(room);
        self.data.extend_from_slice(&bytes[..take]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Default for StagingBuffer {
    fn default() -> StagingBuffer {
        StagingBuffer::new()
    }
}

/// Builds the synthetic HTTP response envelope: an HTTP/2.0-labelled
/// status line, a fixed set of CORS/content headers, and the staged
/// reply body.
pub fn build_http_response(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(b"HTTP/2.0 200 OK\r\n");
    out.extend_from_slice(b"Access-Control-Allow-Origin: *\r\n");
    out.extend_from_slice(b"Access-Control-Allow-Methods: GET, POST\r\n");
    out.extend_from_slice(b"Access-Control-Allow-Credentials: true\r\n");
    out.extend_from_slice(b"Content-type: text/plain\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_methods_case_sensitively() {
        assert_eq!(detect_method("GET /int=9 HTTP/1.1"), ProtocolMode::Get);
        assert_eq!(detect_method("POST / HTTP/1.1"), ProtocolMode::Post);
        assert_eq!(detect_method("get /int=9 HTTP/1.1"), ProtocolMode::Raw);
        assert_eq!(detect_method("int=7"), ProtocolMode::Raw);
    }

    #[test]
    fn extracts_get_query_between_slash_and_http_token() {
        assert_eq!(
            extract_get_query("GET /int=42 HTTP/1.1"),
            Some("int=42")
        );
    }

    #[test]
    fn parses_content_length_header() {
        assert_eq!(parse_content_length("Content-Length: 6"), Some(6));
        assert_eq!(parse_content_length("Host: x"), None);
    }

    #[test]
    fn url_decode_handles_plus_and_percent_escapes() {
        assert_eq!(url_decode("a+b%20c"), "a b c");
        assert_eq!(url_decode("bad%gzescape"), "bad%gzescape");
    }

    #[test]
    fn split_segments_on_ampersand() {
        assert_eq!(split_segments("a=1&b=2"), vec!["a=1", "b=2"]);
        assert_eq!(split_segments(""), Vec::<&str>::new());
    }

    #[test]
    fn http_response_envelope_matches_template() {
        let resp = build_http_response(b"OK\n");
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/2.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("OK\n"));
    }

    #[test]
    fn staging_buffer_silently_truncates_past_capacity() {
        let mut staging = StagingBuffer::new();
        staging.append(&vec![b'x'; MIN_STAGING_SIZE + 100]);
        assert_eq!(staging.as_bytes().len(), MIN_STAGING_SIZE);
    }
}
