//! Domain name encoding and decoding, including bounded compression-pointer
//! resolution for the answer/authority sections of responses.

use crate::error::CoreError;

const MAX_DOMAIN_LENGTH: usize = 253;
const MAX_LABEL_LENGTH: usize = 63;
const MAX_LABEL_COUNT: usize = 127;
const MAX_COMPRESSION_JUMPS: u8 = 5;

/// Decode a domain name starting at `start`. Compression pointers are
/// followed (bounded to `MAX_COMPRESSION_JUMPS`) when `allow_compression`
/// is true; a pointer byte encountered while `false` is a malformed packet
/// (used for the question section, where compression is never valid).
///
/// Returns the dotted domain string and the offset immediately after the
/// name *in the original stream* (i.e. after a pointer's two bytes, not
/// after any jump target).
pub fn decode_name(
    buf: &[u8],
    start: usize,
    allow_compression: bool,
) -> Result<(String, usize), CoreError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end_of_name: Option<usize> = None;
    let mut jumps = 0u8;
    let mut total_len = 0usize;

    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| CoreError::MalformedPacket("truncated name".into()))?;

        if len == 0 {
            pos += 1;
            if end_of_name.is_none() {
                end_of_name = Some(pos);
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            if !allow_compression {
                return Err(CoreError::MalformedPacket(
                    "compression pointer not allowed in question section".into(),
                ));
            }
            let hi = (len & 0x3F) as usize;
            let lo = *buf
                .get(pos + 1)
                .ok_or_else(|| CoreError::MalformedPacket("truncated compression pointer".into()))?
                as usize;
            let target = (hi << 8) | lo;

            if end_of_name.is_none() {
                end_of_name = Some(pos + 2);
            }

            jumps += 1;
            if jumps > MAX_COMPRESSION_JUMPS {
                return Err(CoreError::MalformedPacket(
                    "too many compression jumps".into(),
                ));
            }
            if target >= pos {
                return Err(CoreError::MalformedPacket(
                    "compression pointer does not point backward".into(),
                ));
            }
            pos = target;
            continue;
        }

        if len & 0xC0 != 0 {
            return Err(CoreError::MalformedPacket("invalid label length byte".into()));
        }

        let label_len = len as usize;
        if label_len > MAX_LABEL_LENGTH {
            return Err(CoreError::MalformedPacket("label exceeds 63 octets".into()));
        }

        let label_start = pos + 1;
        let label_end = label_start + label_len;
        let label_bytes = buf
            .get(label_start..label_end)
            .ok_or_else(|| CoreError::MalformedPacket("truncated label".into()))?;

        let label = std::str::from_utf8(label_bytes)
            .map_err(|_| CoreError::MalformedPacket("label is not valid UTF-8/ASCII".into()))?;

        total_len += label_len + 1;
        if total_len > MAX_DOMAIN_LENGTH {
            return Err(CoreError::MalformedPacket("domain name exceeds 253 octets".into()));
        }
        if labels.len() >= MAX_LABEL_COUNT {
            return Err(CoreError::MalformedPacket("too many labels".into()));
        }

        labels.push(label.to_string());
        pos = label_end;
    }

    Ok((labels.join("."), end_of_name.unwrap_or(pos)))
}

/// Encode a domain name with no compression (always valid to write, used
/// both for outbound questions and as the fallback answer-name encoding).
pub fn encode_name(domain: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + 2);
    if !domain.is_empty() {
        for label in domain.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    out
}

/// Skip over a name (following compression pointers for validity) without
/// allocating the decoded string, returning the offset immediately after it.
pub fn skip_name(buf: &[u8], start: usize) -> Result<usize, CoreError> {
    decode_name(buf, start, true).map(|(_, end)| end)
}
