//! DKIM tag-list parsing (RFC 6376 section 3.2)

use super::canon::{parse_canonicalization, Canonicalization};
use super::DkimError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailtrust_common::DkimAlgorithm;
use std::collections::HashMap;

/// Parse `tag=value` pairs separated by `;`.
///
/// Values are trimmed of surrounding folding whitespace. Duplicate tags
/// make the whole list invalid.
pub fn parse_tag_list(input: &str) -> Result<HashMap<String, String>, DkimError> {
    let mut tags = HashMap::new();

    for part in input.split(';') {
        let part = part.trim_matches(|c: char| c.is_ascii_whitespace());
        if part.is_empty() {
            continue;
        }

        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| DkimError::InvalidSignature(format!("malformed tag: {}", part)))?;
        let name = name.trim_matches(|c: char| c.is_ascii_whitespace());
        if name.is_empty() {
            return Err(DkimError::InvalidSignature("empty tag name".to_string()));
        }

        let value = value
            .trim_matches(|c: char| c.is_ascii_whitespace())
            .to_string();
        if tags.insert(name.to_string(), value).is_some() {
            return Err(DkimError::InvalidSignature(format!("duplicate tag {}", name)));
        }
    }

    Ok(tags)
}

/// Decode base64 that may contain folding whitespace
pub fn decode_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64.decode(compact)
}

/// A parsed DKIM-Signature header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignature {
    pub algorithm: DkimAlgorithm,
    pub header_canon: Canonicalization,
    pub body_canon: Canonicalization,
    pub domain: String,
    pub selector: String,
    pub signed_headers: Vec<String>,
    pub body_hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub timestamp: Option<i64>,
    pub expiration: Option<i64>,
    pub body_length: Option<usize>,
}

impl DkimSignature {
    pub fn parse(value: &str) -> Result<Self, DkimError> {
        Self::from_tags(&parse_tag_list(value)?)
    }

    pub fn from_tags(tags: &HashMap<String, String>) -> Result<Self, DkimError> {
        let required = |name: &str| {
            tags.get(name)
                .map(String::as_str)
                .ok_or_else(|| DkimError::InvalidSignature(format!("missing {}= tag", name)))
        };

        if required("v")? != "1" {
            return Err(DkimError::InvalidSignature("unsupported version".to_string()));
        }

        let algorithm = match required("a")?.to_ascii_lowercase().as_str() {
            "rsa-sha256" => DkimAlgorithm::Rsa,
            "ed25519-sha256" => DkimAlgorithm::Ed25519,
            other => return Err(DkimError::UnsupportedAlgorithm(other.to_string())),
        };

        let (header_canon, body_canon) = parse_canonicalization(tags.get("c").map(String::as_str))?;

        let domain = required("d")?.to_string();
        let selector = required("s")?.to_string();
        if domain.is_empty() || selector.is_empty() {
            return Err(DkimError::InvalidSignature("empty d= or s= tag".to_string()));
        }

        let signed_headers: Vec<String> = required("h")?
            .split(':')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if !signed_headers.iter().any(|h| h.eq_ignore_ascii_case("from")) {
            return Err(DkimError::InvalidSignature("From is not signed".to_string()));
        }

        let body_hash = decode_base64(required("bh")?)
            .map_err(|e| DkimError::InvalidSignature(format!("bh= is not base64: {}", e)))?;
        let signature = decode_base64(required("b")?)
            .map_err(|e| DkimError::InvalidSignature(format!("b= is not base64: {}", e)))?;
        if signature.is_empty() {
            return Err(DkimError::InvalidSignature("empty b= tag".to_string()));
        }

        let number = |name: &str| -> Result<Option<i64>, DkimError> {
            tags.get(name)
                .map(|v| {
                    v.parse::<i64>()
                        .map_err(|_| DkimError::InvalidSignature(format!("invalid {}= tag", name)))
                })
                .transpose()
        };
        let timestamp = number("t")?;
        let expiration = number("x")?;
        if let (Some(t), Some(x)) = (timestamp, expiration) {
            if x < t {
                return Err(DkimError::InvalidSignature("x= precedes t=".to_string()));
            }
        }

        let body_length = number("l")?
            .map(|l| {
                usize::try_from(l)
                    .map_err(|_| DkimError::InvalidSignature("invalid l= tag".to_string()))
            })
            .transpose()?;

        Ok(Self {
            algorithm,
            header_canon,
            body_canon,
            domain,
            selector,
            signed_headers,
            body_hash,
            signature,
            timestamp,
            expiration,
            body_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_tag_list() {
        let tags = parse_tag_list(" v=DKIM1;\r\n\tk=rsa; p=MIGf\r\n MA0 ;").unwrap();
        assert_eq!(tags.get("v").unwrap(), "DKIM1");
        assert_eq!(tags.get("k").unwrap(), "rsa");
        assert_eq!(tags.get("p").unwrap(), "MIGf\r\n MA0");
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        assert!(parse_tag_list("v=1; d=a.com; d=b.com").is_err());
        assert!(parse_tag_list("v=1; garbage").is_err());
    }

    #[test]
    fn test_parse_signature() {
        let sig = DkimSignature::parse(
            "v=1; a=ed25519-sha256; c=relaxed/simple; d=example.com; s=s1;\r\n\
             \tt=100; x=200; h=From:To; bh=AAAA; b=AQID\r\n\tBA==",
        )
        .unwrap();
        assert_eq!(sig.algorithm, DkimAlgorithm::Ed25519);
        assert_eq!(sig.header_canon, Canonicalization::Relaxed);
        assert_eq!(sig.body_canon, Canonicalization::Simple);
        assert_eq!(sig.signed_headers, vec!["From".to_string(), "To".to_string()]);
        assert_eq!(sig.signature, vec![1, 2, 3, 4]);
        assert_eq!(sig.expiration, Some(200));
    }

    #[test]
    fn test_signature_requirements() {
        let base = "v=1; a=rsa-sha256; d=example.com; s=s1; bh=AAAA; b=AQID";
        assert!(DkimSignature::parse(&format!("{}; h=To", base)).is_err());
        assert!(DkimSignature::parse("v=1; a=rsa-sha256; d=example.com; h=From; bh=AAAA; b=AQID").is_err());
        assert!(matches!(
            DkimSignature::parse("v=1; a=rsa-sha1; d=example.com; s=s1; h=From; bh=AAAA; b=AQID"),
            Err(DkimError::UnsupportedAlgorithm(_))
        ));
        assert!(DkimSignature::parse(&format!("{}; h=from", base)).is_ok());
    }
}
