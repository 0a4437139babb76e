//! DNS wire codec: header/name primitives plus strict query/response
//! parsing and synthetic-answer building on top of them.

pub mod codec;
pub mod enums;
pub mod header;
pub mod name;

pub use codec::{
    build_blocked_a, build_blocked_aaaa, build_formerr_raw, build_nxdomain, build_query,
    build_servfail, encode_question, parse_query, parse_response, update_ttl, Query, Response,
};
pub use enums::{QClass, QType, ResponseCode};
pub use header::{Header, HEADER_LEN};
