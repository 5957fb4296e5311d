//! Message parsing and RFC 6376 canonicalization

use super::DkimError;
use std::collections::HashMap;

/// DKIM canonicalization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canonicalization {
    Simple,
    Relaxed,
}

impl Canonicalization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        }
    }

    fn parse(value: &str) -> Result<Self, DkimError> {
        match value.trim() {
            "simple" => Ok(Canonicalization::Simple),
            "relaxed" => Ok(Canonicalization::Relaxed),
            other => Err(DkimError::InvalidSignature(format!(
                "unknown canonicalization {}",
                other
            ))),
        }
    }
}

/// Parse a `c=` tag value into (header, body) algorithms.
///
/// A missing body part defaults to simple, as does an absent tag.
pub fn parse_canonicalization(
    value: Option<&str>,
) -> Result<(Canonicalization, Canonicalization), DkimError> {
    let Some(value) = value else {
        return Ok((Canonicalization::Simple, Canonicalization::Simple));
    };

    match value.split_once('/') {
        Some((header, body)) => Ok((Canonicalization::parse(header)?, Canonicalization::parse(body)?)),
        None => Ok((Canonicalization::parse(value)?, Canonicalization::Simple)),
    }
}

/// One header field as it appeared in the message.
///
/// `value` is everything after the colon, folding included, without the
/// terminating CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn name_is(&self, name: &str) -> bool {
        self.name.trim_end().eq_ignore_ascii_case(name.trim())
    }
}

/// Message split into ordered header fields and a CRLF-normalized body
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub headers: Vec<HeaderField>,
    pub body: Vec<u8>,
}

impl ParsedMessage {
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.name_is(name))
    }
}

/// Convert bare LF line endings to CRLF
pub fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 32);
    let mut prev = 0u8;
    for &b in input {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Split a message into header fields and body.
///
/// A message without a blank line is all header. Continuation lines
/// before the first field, lines without a colon and non UTF-8 header
/// text are rejected.
pub fn parse_message(message: &[u8]) -> Result<ParsedMessage, DkimError> {
    let normalized = normalize_line_endings(message);

    if normalized.is_empty() || normalized.starts_with(b"\r\n") {
        return Err(DkimError::MalformedMessage(
            "message has no header fields".to_string(),
        ));
    }

    let (header_block, body) = match find_subslice(&normalized, b"\r\n\r\n") {
        Some(pos) => (&normalized[..pos + 2], normalized[pos + 4..].to_vec()),
        None => (&normalized[..], Vec::new()),
    };

    let text = std::str::from_utf8(header_block).map_err(|_| {
        DkimError::MalformedMessage("header section is not valid UTF-8".to_string())
    })?;

    let mut headers: Vec<HeaderField> = Vec::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        if line.starts_with(' ') || line.starts_with('\t') {
            let field = headers.last_mut().ok_or_else(|| {
                DkimError::MalformedMessage("continuation line before first header".to_string())
            })?;
            field.value.push_str("\r\n");
            field.value.push_str(line);
            continue;
        }

        let (name, value) = line.split_once(':').ok_or_else(|| {
            DkimError::MalformedMessage(format!("header line without colon: {}", line))
        })?;
        let trimmed = name.trim_end_matches(is_wsp);
        if trimmed.is_empty() || trimmed.contains(is_wsp) {
            return Err(DkimError::MalformedMessage(format!(
                "invalid header field name: {:?}",
                name
            )));
        }

        headers.push(HeaderField {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    Ok(ParsedMessage { headers, body })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn is_wsp(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Canonicalize one header field, including its trailing CRLF
pub fn canonicalize_header(method: Canonicalization, field: &HeaderField) -> String {
    match method {
        Canonicalization::Simple => format!("{}:{}\r\n", field.name, field.value),
        Canonicalization::Relaxed => {
            let unfolded = field.value.replace("\r\n", "");
            let mut value = String::with_capacity(unfolded.len());
            let mut in_wsp = false;
            for c in unfolded.chars() {
                if is_wsp(c) {
                    if !in_wsp {
                        value.push(' ');
                    }
                    in_wsp = true;
                } else {
                    value.push(c);
                    in_wsp = false;
                }
            }

            format!(
                "{}:{}\r\n",
                field.name.trim_end_matches(is_wsp).to_ascii_lowercase(),
                value.trim_matches(is_wsp)
            )
        }
    }
}

/// Canonicalize the signed header fields listed in `h=`.
///
/// Each listed name consumes the bottom-most unused instance of that
/// field. Names listed more often than the field occurs contribute
/// nothing.
pub fn select_headers(
    method: Canonicalization,
    names: &[String],
    headers: &[HeaderField],
) -> String {
    let mut consumed: HashMap<String, usize> = HashMap::new();
    let mut out = String::new();

    for name in names {
        let key = name.trim().to_ascii_lowercase();
        let skip = consumed.entry(key.clone()).or_insert(0);

        if let Some(field) = headers.iter().rev().filter(|h| h.name_is(&key)).nth(*skip) {
            out.push_str(&canonicalize_header(method, field));
        }
        *skip += 1;
    }

    out
}

/// Canonicalize a CRLF-normalized body
pub fn canonicalize_body(method: Canonicalization, body: &[u8]) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = body
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
        .collect();

    // A body ending in CRLF yields a final empty piece that is not a line.
    if body.ends_with(b"\n") {
        lines.pop();
    }

    if method == Canonicalization::Relaxed {
        for line in lines.iter_mut() {
            let mut reduced = Vec::with_capacity(line.len());
            let mut in_wsp = false;
            for &b in line.iter() {
                if b == b' ' || b == b'\t' {
                    in_wsp = true;
                } else {
                    if in_wsp {
                        reduced.push(b' ');
                    }
                    reduced.push(b);
                    in_wsp = false;
                }
            }
            *line = reduced;
        }
    }

    while lines.last().map_or(false, |l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return match method {
            Canonicalization::Simple => b"\r\n".to_vec(),
            Canonicalization::Relaxed => Vec::new(),
        };
    }

    let mut out = Vec::with_capacity(body.len());
    for line in lines {
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Empty the `b=` tag of a DKIM-Signature value, keeping everything else
/// byte for byte.
pub fn strip_b_tag(value: &str) -> String {
    value
        .split(';')
        .map(|segment| match segment.split_once('=') {
            Some((tag, _)) if tag.trim_matches(|c: char| c.is_ascii_whitespace()) == "b" => {
                format!("{}=", tag)
            }
            _ => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(name: &str, value: &str) -> HeaderField {
        HeaderField {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings(b"a\nb\r\nc\n"), b"a\r\nb\r\nc\r\n".to_vec());
    }

    #[test]
    fn test_parse_message_with_folding() {
        let msg = b"From: a@example.com\r\nSubject: hello\r\n\tworld\r\n\r\nBody\r\n";
        let parsed = parse_message(msg).unwrap();
        assert_eq!(parsed.headers.len(), 2);
        assert_eq!(parsed.headers[1], field("Subject", " hello\r\n\tworld"));
        assert_eq!(parsed.body, b"Body\r\n".to_vec());
    }

    #[test]
    fn test_parse_message_bare_lf() {
        let parsed = parse_message(b"From: a@example.com\nTo: b@example.org\n\nHi\n").unwrap();
        assert_eq!(parsed.headers.len(), 2);
        assert_eq!(parsed.body, b"Hi\r\n".to_vec());
    }

    #[test]
    fn test_parse_message_without_body() {
        let parsed = parse_message(b"From: a@example.com\r\n").unwrap();
        assert!(parsed.has_header("from"));
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_parse_message_rejects_garbage() {
        assert!(parse_message(b"").is_err());
        assert!(parse_message(b"\r\nbody only").is_err());
        assert!(parse_message(b" leading continuation\r\n\r\n").is_err());
        assert!(parse_message(b"no colon here\r\n\r\nbody").is_err());
    }

    #[test]
    fn test_relaxed_header() {
        let f = field("Subject ", " Hello \r\n\t  World  ");
        assert_eq!(
            canonicalize_header(Canonicalization::Relaxed, &f),
            "subject:Hello World\r\n"
        );
    }

    #[test]
    fn test_simple_header() {
        let f = field("Subject", " Hello \r\n\tWorld");
        assert_eq!(
            canonicalize_header(Canonicalization::Simple, &f),
            "Subject: Hello \r\n\tWorld\r\n"
        );
    }

    #[test]
    fn test_select_headers_bottom_up() {
        let headers = vec![
            field("Received", " first"),
            field("From", " a@example.com"),
            field("Received", " second"),
        ];
        let names = vec![
            "received".to_string(),
            "received".to_string(),
            "received".to_string(),
            "from".to_string(),
        ];
        assert_eq!(
            select_headers(Canonicalization::Relaxed, &names, &headers),
            "received:second\r\nreceived:first\r\nfrom:a@example.com\r\n"
        );
    }

    #[test]
    fn test_body_canonicalization() {
        let body = b"Hi  there \t\r\n\r\n\r\n";
        assert_eq!(
            canonicalize_body(Canonicalization::Relaxed, body),
            b"Hi there\r\n".to_vec()
        );
        assert_eq!(
            canonicalize_body(Canonicalization::Simple, body),
            b"Hi  there \t\r\n".to_vec()
        );
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(canonicalize_body(Canonicalization::Simple, b""), b"\r\n".to_vec());
        assert!(canonicalize_body(Canonicalization::Relaxed, b"\r\n\r\n").is_empty());
    }

    #[test]
    fn test_body_without_final_crlf() {
        assert_eq!(
            canonicalize_body(Canonicalization::Relaxed, b"line"),
            b"line\r\n".to_vec()
        );
    }

    #[test]
    fn test_strip_b_tag_keeps_bh() {
        let value = " v=1; bh=abc=; b=dGVz\r\n\tdA==; d=example.com";
        assert_eq!(strip_b_tag(value), " v=1; bh=abc=; b=; d=example.com");
    }

    #[test]
    fn test_parse_canonicalization() {
        assert_eq!(
            parse_canonicalization(Some("relaxed")).unwrap(),
            (Canonicalization::Relaxed, Canonicalization::Simple)
        );
        assert_eq!(
            parse_canonicalization(Some("simple/relaxed")).unwrap(),
            (Canonicalization::Simple, Canonicalization::Relaxed)
        );
        assert_eq!(
            parse_canonicalization(None).unwrap(),
            (Canonicalization::Simple, Canonicalization::Simple)
        );
        assert!(parse_canonicalization(Some("loose/simple")).is_err());
    }
}
