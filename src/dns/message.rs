//! DNS message encoding/decoding
//!
//! Builds one recursive question and reads the A/AAAA records out of the
//! answer, on top of `hickory-proto`.

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::net::IpAddr;
use thiserror::Error;

/// DNS message errors
#[derive(Error, Debug)]
pub enum DnsError {
    /// Name cannot be encoded as a question
    #[error("Invalid query name: {0}")]
    InvalidName(String),

    /// Message could not be encoded or decoded
    #[error("Malformed DNS message: {0}")]
    Malformed(#[from] ProtoError),

    /// Response id does not match the query
    #[error("Response id {got:#06x} does not match query id {expected:#06x}")]
    IdMismatch {
        /// Id of the outstanding query
        expected: u16,
        /// Id carried by the response
        got: u16,
    },

    /// Message is a query, not a response
    #[error("Message is not a response")]
    NotResponse,

    /// Server returned a non-zero RCODE
    #[error("Server returned {0}")]
    ServerFailure(ResponseCode),

    /// Response carries no A or AAAA records
    #[error("No addresses in response")]
    NoAnswer,
}

/// Build a recursive query for `name`
pub fn build_query(id: u16, name: &str, record_type: RecordType) -> Result<Vec<u8>, DnsError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() {
        return Err(DnsError::InvalidName("empty name".to_string()));
    }
    let qname = Name::from_ascii(trimmed)
        .map_err(|e| DnsError::InvalidName(format!("{}: {}", name, e)))?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);

    let mut query = Query::query(qname, record_type);
    query.set_query_class(DNSClass::IN);
    message.add_query(query);

    Ok(message.to_vec()?)
}

/// Parse a response to the query with id `expected_id`
///
/// Returns every A and AAAA record in answer order. Other record types
/// (CNAME chains included) are skipped.
pub fn parse_response(expected_id: u16, response: &[u8]) -> Result<Vec<IpAddr>, DnsError> {
    let message = Message::from_vec(response)?;

    if message.id() != expected_id {
        return Err(DnsError::IdMismatch {
            expected: expected_id,
            got: message.id(),
        });
    }
    if message.message_type() != MessageType::Response {
        return Err(DnsError::NotResponse);
    }
    if message.response_code() != ResponseCode::NoError {
        return Err(DnsError::ServerFailure(message.response_code()));
    }

    let addresses: Vec<IpAddr> = message
        .answers()
        .iter()
        .filter(|record| record.dns_class() == DNSClass::IN)
        .filter_map(|record| match record.data() {
            Some(RData::A(A(ip))) => Some(IpAddr::V4(*ip)),
            Some(RData::AAAA(AAAA(ip))) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
        .collect();

    if addresses.is_empty() {
        return Err(DnsError::NoAnswer);
    }
    Ok(addresses)
}

/// Build a response answering `query` with `addresses`
///
/// Answers are owned by the first question name. Useful for stub resolvers
/// in tests.
pub fn build_response(query: &[u8], addresses: &[IpAddr], ttl: u32) -> Result<Vec<u8>, DnsError> {
    let query = Message::from_vec(query)?;
    let name = query
        .queries()
        .first()
        .map(|q| q.name().clone())
        .ok_or_else(|| DnsError::InvalidName("query has no question".to_string()))?;

    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true);
    response.add_queries(query.queries().to_vec());

    for addr in addresses {
        let rdata = match addr {
            IpAddr::V4(ip) => RData::A(A(*ip)),
            IpAddr::V6(ip) => RData::AAAA(AAAA(*ip)),
        };
        response.add_answer(Record::from_rdata(name.clone(), ttl, rdata));
    }

    Ok(response.to_vec()?)
}
