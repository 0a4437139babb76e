//! Strict, bounds-checked query/response parsing and synthetic-answer
//! building. Every public function here either returns a value or a typed
//! `CoreError::MalformedPacket` - never a panic, regardless of input.

use crate::dns::enums::{QClass, QType, ResponseCode};
use crate::dns::header::{HEADER_LEN, Header};
use crate::dns::name::{decode_name, encode_name};
use crate::error::CoreError;
use std::net::{Ipv4Addr, Ipv6Addr};

const MAX_QUERY_LEN: usize = 512;
const MIN_PACKET_LEN: usize = HEADER_LEN;
const DEFAULT_ANSWER_TTL: u32 = 60;
const DEFAULT_RESPONSE_TTL: u32 = 300;
const QUESTION_POINTER: u16 = 0xC00C;

#[derive(Debug, Clone)]
pub struct Query {
    pub transaction_id: u16,
    pub domain: String,
    pub qtype: QType,
    pub qclass: QClass,
    /// The verbatim question section bytes (qname + qtype + qclass), used
    /// to copy the question section unchanged into synthesized replies.
    pub question_bytes: Vec<u8>,
    pub recursion_desired: bool,
    pub original_bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub transaction_id: u16,
    pub domain: String,
    pub qtype: QType,
    pub response_code: ResponseCode,
    pub ttl: u32,
    pub answers: Vec<String>,
    pub original_bytes: Vec<u8>,
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, CoreError> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or_else(|| CoreError::MalformedPacket("truncated u16 field".into()))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, CoreError> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or_else(|| CoreError::MalformedPacket("truncated u32 field".into()))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parse an inbound client query. Rejects anything that is not a
/// well-formed single-question query per RFC 1035 §4.1.1/§4.1.2.
pub fn parse_query(bytes: &[u8]) -> Result<Query, CoreError> {
    if bytes.len() < MIN_PACKET_LEN || bytes.len() > MAX_QUERY_LEN {
        return Err(CoreError::MalformedPacket(format!(
            "query length {} out of bounds [12, 512]",
            bytes.len()
        )));
    }

    let header = Header::parse(bytes)?;
    if header.qr {
        return Err(CoreError::MalformedPacket("QR bit set on a query".into()));
    }
    if header.qdcount == 0 {
        return Err(CoreError::MalformedPacket("zero questions".into()));
    }

    let (domain, name_end) = decode_name(bytes, HEADER_LEN, false)?;
    let qtype_pos = name_end;
    let qclass_pos = name_end + 2;
    let qtype = read_u16(bytes, qtype_pos)?;
    let qclass = read_u16(bytes, qclass_pos)?;
    let question_end = qclass_pos + 2;

    let question_bytes = bytes[HEADER_LEN..question_end].to_vec();

    Ok(Query {
        transaction_id: header.id,
        domain,
        qtype: QType::from(qtype),
        qclass: QClass::from(qclass),
        question_bytes,
        recursion_desired: header.rd,
        original_bytes: bytes.to_vec(),
    })
}

struct RecordInfo {
    rtype: u16,
    ttl_offset: usize,
    ttl: u32,
    rdata_start: usize,
    rdata_end: usize,
}

/// Walk `count` resource records starting at `pos`, bounds-checking every
/// field, and return the records found plus the offset after the last one.
fn walk_records(
    buf: &[u8],
    mut pos: usize,
    count: u16,
) -> Result<(Vec<RecordInfo>, usize), CoreError> {
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (_, name_end) = decode_name(buf, pos, true)?;
        let rtype = read_u16(buf, name_end)?;
        let _rclass = read_u16(buf, name_end + 2)?;
        let ttl_offset = name_end + 4;
        let ttl = read_u32(buf, ttl_offset)?;
        let rdlength_pos = ttl_offset + 4;
        let rdlength = read_u16(buf, rdlength_pos)? as usize;
        let rdata_start = rdlength_pos + 2;
        let rdata_end = rdata_start + rdlength;
        if rdata_end > buf.len() {
            return Err(CoreError::MalformedPacket("rdata extends past packet end".into()));
        }
        records.push(RecordInfo {
            rtype,
            ttl_offset,
            ttl,
            rdata_start,
            rdata_end,
        });
        pos = rdata_end;
    }
    Ok((records, pos))
}

fn decode_address(rtype: u16, rdata: &[u8]) -> Option<String> {
    match rtype {
        1 if rdata.len() == 4 => {
            Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string())
        }
        28 if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Parse an upstream response. Only A/AAAA answers are decoded into
/// dotted/compressed address strings; everything else is skipped via its
/// `rdlength` but still bounds-checked.
pub fn parse_response(bytes: &[u8]) -> Result<Response, CoreError> {
    if bytes.len() < MIN_PACKET_LEN {
        return Err(CoreError::MalformedPacket("response shorter than 12 bytes".into()));
    }

    let header = Header::parse(bytes)?;
    if !header.qr {
        return Err(CoreError::MalformedPacket("QR bit unset on a response".into()));
    }
    if header.qdcount == 0 {
        return Err(CoreError::MalformedPacket("zero questions in response".into()));
    }

    let (domain, name_end) = decode_name(bytes, HEADER_LEN, false)?;
    let qtype = read_u16(bytes, name_end)?;
    let question_end = name_end + 4;

    let (records, _) = walk_records(bytes, question_end, header.ancount)?;

    let mut min_ttl: Option<u32> = None;
    let mut answers = Vec::new();
    for record in &records {
        min_ttl = Some(min_ttl.map_or(record.ttl, |m: u32| m.min(record.ttl)));
        if let Some(addr) = decode_address(record.rtype, &bytes[record.rdata_start..record.rdata_end]) {
            answers.push(addr);
        }
    }

    Ok(Response {
        transaction_id: header.id,
        domain,
        qtype: QType::from(qtype),
        response_code: ResponseCode::from(header.rcode),
        ttl: min_ttl.unwrap_or(DEFAULT_RESPONSE_TTL),
        answers,
        original_bytes: bytes.to_vec(),
    })
}

/// Rewrite every TTL in the answer and authority sections to `new_ttl`.
/// The additional section is left untouched. Fully validates the packet
/// structure before mutating anything, so a malformed packet is returned
/// unmodified (as an error).
pub fn update_ttl(bytes: &[u8], new_ttl: u32) -> Result<Vec<u8>, CoreError> {
    if bytes.len() < MIN_PACKET_LEN {
        return Err(CoreError::MalformedPacket("packet shorter than 12 bytes".into()));
    }
    let header = Header::parse(bytes)?;

    let mut pos = HEADER_LEN;
    for _ in 0..header.qdcount {
        let (_, name_end) = decode_name(bytes, pos, true)?;
        pos = name_end + 4; // qtype + qclass
        if pos > bytes.len() {
            return Err(CoreError::MalformedPacket("question section truncated".into()));
        }
    }

    let (answer_records, pos_after_answers) = walk_records(bytes, pos, header.ancount)?;
    let (authority_records, pos_after_authority) =
        walk_records(bytes, pos_after_answers, header.nscount)?;
    // Additional section is only validated, never rewritten.
    let (_, _) = walk_records(bytes, pos_after_authority, header.arcount)?;

    let mut out = bytes.to_vec();
    let ttl_bytes = new_ttl.to_be_bytes();
    for record in answer_records.iter().chain(authority_records.iter()) {
        out[record.ttl_offset..record.ttl_offset + 4].copy_from_slice(&ttl_bytes);
    }
    Ok(out)
}

fn build_header_bytes(id: u16, rd: bool, rcode: ResponseCode, ancount: u16) -> [u8; HEADER_LEN] {
    Header {
        id,
        qr: true,
        opcode: 0,
        aa: false,
        tc: false,
        rd,
        ra: true,
        z: 0,
        rcode: rcode.into(),
        qdcount: 1,
        ancount,
        nscount: 0,
        arcount: 0,
    }
    .to_bytes()
}

fn build_address_answer(ttl: u32, rtype: u16, rdata: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + rdata.len());
    out.extend_from_slice(&QUESTION_POINTER.to_be_bytes());
    out.extend_from_slice(&rtype.to_be_bytes());
    out.extend_from_slice(&u16::from(QClass::In).to_be_bytes());
    out.extend_from_slice(&ttl.to_be_bytes());
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(rdata);
    out
}

/// Synthesize a sinkhole `A` reply pointing at 127.0.0.1.
pub fn build_blocked_a(query: &Query) -> Vec<u8> {
    let answer = build_address_answer(DEFAULT_ANSWER_TTL, u16::from(QType::A), &[127, 0, 0, 1]);
    let mut out = build_header_bytes(query.transaction_id, query.recursion_desired, ResponseCode::NoError, 1).to_vec();
    out.extend_from_slice(&query.question_bytes);
    out.extend_from_slice(&answer);
    out
}

/// Synthesize a sinkhole `AAAA` reply pointing at ::1.
pub fn build_blocked_aaaa(query: &Query) -> Vec<u8> {
    let loopback = Ipv6Addr::LOCALHOST.octets();
    let answer = build_address_answer(DEFAULT_ANSWER_TTL, u16::from(QType::AAAA), &loopback);
    let mut out = build_header_bytes(query.transaction_id, query.recursion_desired, ResponseCode::NoError, 1).to_vec();
    out.extend_from_slice(&query.question_bytes);
    out.extend_from_slice(&answer);
    out
}

/// Synthesize an NXDOMAIN reply with no answers.
pub fn build_nxdomain(query: &Query) -> Vec<u8> {
    let mut out = build_header_bytes(query.transaction_id, query.recursion_desired, ResponseCode::NxDomain, 0).to_vec();
    out.extend_from_slice(&query.question_bytes);
    out
}

/// Synthesize a SERVFAIL reply with no answers.
pub fn build_servfail(query: &Query) -> Vec<u8> {
    let mut out = build_header_bytes(query.transaction_id, query.recursion_desired, ResponseCode::ServFail, 0).to_vec();
    out.extend_from_slice(&query.question_bytes);
    out
}

/// Best-effort FORMERR reply for a client datagram that failed to parse.
/// Salvages the transaction id from the first two bytes when present;
/// never fails, since a reply must always be produced.
pub fn build_formerr_raw(raw: &[u8]) -> Vec<u8> {
    let id = if raw.len() >= 2 {
        u16::from_be_bytes([raw[0], raw[1]])
    } else {
        0
    };
    build_header_bytes(id, false, ResponseCode::FormErr, 0).to_vec()
}

/// Encode a bare domain as a standalone question section (qtype/qclass
/// supplied), used by tests and by callers building queries from scratch.
pub fn encode_question(domain: &str, qtype: QType, qclass: QClass) -> Vec<u8> {
    let mut out = encode_name(domain);
    out.extend_from_slice(&u16::from(qtype).to_be_bytes());
    out.extend_from_slice(&u16::from(qclass).to_be_bytes());
    out
}

/// Build a well-formed query packet, primarily for tests and for the
/// interface binder's path-validation probes.
pub fn build_query(id: u16, domain: &str, qtype: QType, recursion_desired: bool) -> Vec<u8> {
    let mut out = Header {
        id,
        qr: false,
        opcode: 0,
        aa: false,
        tc: false,
        rd: recursion_desired,
        ra: false,
        z: 0,
        rcode: 0,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    }
    .to_bytes()
    .to_vec();
    out.extend_from_slice(&encode_question(domain, qtype, QClass::In));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_query() {
        let bytes = build_query(0x1234, "ads.example.com", QType::A, true);
        let query = parse_query(&bytes).unwrap();
        assert_eq!(query.transaction_id, 0x1234);
        assert_eq!(query.domain, "ads.example.com");
        assert_eq!(query.qtype, QType::A);
    }

    #[test]
    fn rejects_response_bit_set_on_query() {
        let mut bytes = build_query(1, "example.com", QType::A, true);
        bytes[2] |= 0x80; // set QR
        assert!(parse_query(&bytes).is_err());
    }

    #[test]
    fn rejects_zero_questions() {
        let mut bytes = build_query(1, "example.com", QType::A, true);
        bytes[4] = 0;
        bytes[5] = 0;
        assert!(parse_query(&bytes).is_err());
    }

    #[test]
    fn rejects_oversize_query() {
        let mut bytes = build_query(1, "example.com", QType::A, true);
        bytes.extend(std::iter::repeat(0u8).take(600));
        assert!(parse_query(&bytes).is_err());
    }

    #[test]
    fn builds_blocked_a_answer() {
        let bytes = build_query(0x1234, "ads.example.com", QType::A, true);
        let query = parse_query(&bytes).unwrap();
        let reply = build_blocked_a(&query);
        let parsed = parse_response(&reply).unwrap();
        assert_eq!(parsed.transaction_id, 0x1234);
        assert_eq!(parsed.answers, vec!["127.0.0.1".to_string()]);
        assert_eq!(parsed.ttl, 60);
    }

    #[test]
    fn builds_blocked_aaaa_answer() {
        let bytes = build_query(0x55, "tracker.net", QType::AAAA, true);
        let query = parse_query(&bytes).unwrap();
        let reply = build_blocked_aaaa(&query);
        let parsed = parse_response(&reply).unwrap();
        assert_eq!(parsed.answers, vec!["::1".to_string()]);
    }

    #[test]
    fn nxdomain_has_no_answers() {
        let bytes = build_query(7, "nope.invalid", QType::A, true);
        let query = parse_query(&bytes).unwrap();
        let reply = build_nxdomain(&query);
        let parsed = parse_response(&reply).unwrap();
        assert_eq!(parsed.response_code, ResponseCode::NxDomain);
        assert!(parsed.answers.is_empty());
    }

    #[test]
    fn formerr_survives_garbage_input() {
        let reply = build_formerr_raw(&[0xAB, 0xCD]);
        assert_eq!(reply.len(), HEADER_LEN);
        let header = Header::parse(&reply).unwrap();
        assert_eq!(header.id, 0xABCD);
        assert_eq!(header.rcode, u8::from(ResponseCode::FormErr));
    }

    #[test]
    fn formerr_survives_empty_input() {
        let reply = build_formerr_raw(&[]);
        assert_eq!(reply.len(), HEADER_LEN);
    }

    #[test]
    fn ttl_rewrite_is_idempotent() {
        let bytes = build_query(9, "example.com", QType::A, true);
        let query = parse_query(&bytes).unwrap();
        let reply = build_blocked_a(&query);
        let once = update_ttl(&reply, 120).unwrap();
        let twice = update_ttl(&once, 120).unwrap();
        assert_eq!(once, twice);
        assert_eq!(parse_response(&once).unwrap().ttl, 120);
    }

    #[test]
    fn ttl_rewrite_leaves_additional_section_untouched() {
        // Build a response with one answer then hand-append an additional
        // record (OPT-shaped) whose TTL must survive rewriting untouched.
        let bytes = build_query(9, "example.com", QType::A, true);
        let query = parse_query(&bytes).unwrap();
        let mut reply = build_blocked_a(&query);
        // header.arcount = 1
        reply[10] = 0;
        reply[11] = 1;
        // additional record: root name, type=41 (OPT), class=4096, ttl=999, rdlength=0
        reply.push(0); // root name
        reply.extend_from_slice(&41u16.to_be_bytes());
        reply.extend_from_slice(&4096u16.to_be_bytes());
        reply.extend_from_slice(&999u32.to_be_bytes());
        reply.extend_from_slice(&0u16.to_be_bytes());

        let rewritten = update_ttl(&reply, 10).unwrap();
        // the additional record's ttl bytes are the last 6 bytes minus the 2-byte rdlength
        let additional_ttl_offset = rewritten.len() - 6;
        let ttl = u32::from_be_bytes(
            rewritten[additional_ttl_offset..additional_ttl_offset + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(ttl, 999);
    }

    #[test]
    fn ttl_rewrite_rejects_malformed_without_mutating() {
        let mut bytes = build_query(1, "example.com", QType::A, true);
        // Claim one answer record that does not exist in the buffer.
        bytes[2] |= 0x80; // make it look like a response (QR=1)
        bytes[6] = 0;
        bytes[7] = 1; // ancount = 1
        let result = update_ttl(&bytes, 30);
        assert!(result.is_err());
    }

    #[test]
    fn parser_never_panics_on_bounded_random_bytes() {
        // Deterministic pseudo-random bytes, bounded length, exercising
        // the "no crash" universal invariant without adding a fuzz dep.
        let mut state: u64 = 0x243F6A8885A308D3;
        for len in 0..=600usize {
            let mut buf = vec![0u8; len];
            for b in buf.iter_mut() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                *b = (state & 0xFF) as u8;
            }
            let _ = parse_query(&buf);
            let _ = parse_response(&buf);
            let _ = update_ttl(&buf, 42);
        }
    }
}
