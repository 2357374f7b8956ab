//! DNS wire message adapter
//!
//! Thin wrapper over `hickory_proto::op::Message`. Every byte that comes in
//! over the wire goes back out unchanged except for the fields this module
//! explicitly mutates (id, response code, truncated flag, answer TTLs).
//! There is no lossy intermediate representation here: callers that need
//! the parsed question or answer set reach into the wrapped `Message`
//! directly through `inner()`/`inner_mut()`.

use std::str::FromStr;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use thiserror::Error;

/// Errors from parsing, encoding, or constructing DNS wire messages
#[derive(Error, Debug)]
pub enum DnsError {
    #[error("malformed DNS message: {0}")]
    Malformed(String),

    #[error("failed to encode DNS message: {0}")]
    EncodeError(String),

    #[error("invalid domain name: {0}")]
    InvalidName(String),

    #[error("message has no question")]
    NoQuestion,
}

/// A DNS wire message, opaque beyond the header fields this adapter exposes
#[derive(Debug, Clone)]
pub struct DnsMessage {
    inner: Message,
}

impl DnsMessage {
    /// Parse a DNS message from raw wire bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, DnsError> {
        let inner = Message::from_bytes(bytes).map_err(|e| DnsError::Malformed(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Serialize back to the exact wire bytes hickory_proto produces for
    /// this message's current field values
    pub fn serialize(&self) -> Result<Vec<u8>, DnsError> {
        self.inner
            .to_bytes()
            .map_err(|e| DnsError::EncodeError(e.to_string()))
    }

    /// Build a fresh query message for `name`/`record_type`
    ///
    /// `dnssec_ok` attaches an OPT pseudo-record with the DO bit set,
    /// matching the original proxy's `dnssec` flag on outbound queries.
    /// This forwards the bit; it does not perform DNSSEC validation.
    pub fn make_query(
        id: u16,
        name: &str,
        record_type: RecordType,
        dnssec_ok: bool,
    ) -> Result<Self, DnsError> {
        let qname = Name::from_str(name).map_err(|e| DnsError::InvalidName(e.to_string()))?;

        let mut inner = Message::new();
        inner.set_id(id);
        inner.set_message_type(MessageType::Query);
        inner.set_op_code(OpCode::Query);
        inner.set_recursion_desired(true);
        inner.add_query(Query::query(qname, record_type));

        if dnssec_ok {
            let mut edns = Edns::new();
            edns.set_dnssec_ok(true);
            edns.set_max_payload(4096);
            inner.set_edns(edns);
        }

        Ok(Self { inner })
    }

    /// Build a response shell for `query`, copying its id and question
    pub fn make_response(query: &DnsMessage) -> Result<Self, DnsError> {
        let question = query.inner.queries().first().ok_or(DnsError::NoQuestion)?;

        let mut inner = Message::new();
        inner.set_id(query.inner.id());
        inner.set_message_type(MessageType::Response);
        inner.set_op_code(OpCode::Query);
        inner.set_recursion_desired(query.inner.recursion_desired());
        inner.set_recursion_available(true);
        inner.add_query(question.clone());

        Ok(Self { inner })
    }

    /// Build a minimal SERVFAIL response for a parsed or unparseable query,
    /// using an explicit id when the incoming bytes couldn't be parsed
    pub fn servfail_for_id(id: u16) -> Self {
        let mut inner = Message::new();
        inner.set_id(id);
        inner.set_message_type(MessageType::Response);
        inner.set_op_code(OpCode::Query);
        inner.set_response_code(ResponseCode::ServFail);
        Self { inner }
    }

    pub fn id(&self) -> u16 {
        self.inner.id()
    }

    pub fn set_id(&mut self, id: u16) {
        self.inner.set_id(id);
    }

    pub fn set_rcode(&mut self, rcode: ResponseCode) {
        self.inner.set_response_code(rcode);
    }

    pub fn rcode(&self) -> ResponseCode {
        self.inner.response_code()
    }

    pub fn is_query(&self) -> bool {
        self.inner.message_type() == MessageType::Query
    }

    pub fn is_response(&self) -> bool {
        self.inner.message_type() == MessageType::Response
    }

    pub fn truncated(&self) -> bool {
        self.inner.truncated()
    }

    pub fn set_truncated(&mut self, truncated: bool) {
        self.inner.set_truncated(truncated);
    }

    pub fn question_count(&self) -> usize {
        self.inner.queries().len()
    }

    pub fn answer_count(&self) -> usize {
        self.inner.answers().len()
    }

    /// Lowest TTL across all answer records, for the DoH response's
    /// Cache-Control max-age. `None` when there are no answers, matching
    /// the original `get_ttl`'s treatment of an empty answer section.
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.inner.answers().iter().map(|r| r.ttl()).min()
    }

    /// Name of the first question, without the trailing root dot, for
    /// logging
    pub fn question_name(&self) -> Option<String> {
        self.inner
            .queries()
            .first()
            .map(|q| q.name().to_string().trim_end_matches('.').to_string())
    }

    pub fn inner(&self) -> &Message {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Message {
        &mut self.inner
    }

    pub fn into_inner(self) -> Message {
        self.inner
    }
}

impl From<Message> for DnsMessage {
    fn from(inner: Message) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::RecordType as RT;

    #[test]
    fn make_query_roundtrips_through_wire_bytes() {
        let q = DnsMessage::make_query(0x1234, "example.com", RT::A, false).unwrap();
        let bytes = q.serialize().unwrap();
        let parsed = DnsMessage::parse(&bytes).unwrap();

        assert_eq!(parsed.id(), 0x1234);
        assert!(parsed.is_query());
        assert_eq!(parsed.question_name().as_deref(), Some("example.com"));
    }

    #[test]
    fn make_query_dnssec_ok_sets_edns_do_bit() {
        let q = DnsMessage::make_query(1, "example.com", RT::A, true).unwrap();
        let edns = q.inner().edns().expect("edns should be present");
        assert!(edns.dnssec_ok());
    }

    #[test]
    fn make_query_without_dnssec_has_no_edns() {
        let q = DnsMessage::make_query(1, "example.com", RT::A, false).unwrap();
        assert!(q.inner().edns().is_none());
    }

    #[test]
    fn make_response_copies_id_and_question() {
        let query = DnsMessage::make_query(0xabcd, "example.org", RT::AAAA, false).unwrap();
        let response = DnsMessage::make_response(&query).unwrap();

        assert_eq!(response.id(), 0xabcd);
        assert!(response.is_response());
        assert_eq!(response.question_name().as_deref(), Some("example.org"));
    }

    #[test]
    fn make_response_without_question_errors() {
        let empty = DnsMessage::from(Message::new());
        assert!(matches!(
            DnsMessage::make_response(&empty),
            Err(DnsError::NoQuestion)
        ));
    }

    #[test]
    fn set_rcode_is_preserved_across_serialize() {
        let mut response =
            DnsMessage::make_response(&DnsMessage::make_query(1, "x.test", RT::A, false).unwrap())
                .unwrap();
        response.set_rcode(ResponseCode::NXDomain);

        let bytes = response.serialize().unwrap();
        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.rcode(), ResponseCode::NXDomain);
    }

    #[test]
    fn min_answer_ttl_is_none_without_answers() {
        let query = DnsMessage::make_query(1, "x.test", RT::A, false).unwrap();
        let response = DnsMessage::make_response(&query).unwrap();
        assert_eq!(response.min_answer_ttl(), None);
    }

    #[test]
    fn servfail_for_id_preserves_given_id_on_unparseable_input() {
        let msg = DnsMessage::servfail_for_id(0x55aa);
        assert_eq!(msg.id(), 0x55aa);
        assert_eq!(msg.rcode(), ResponseCode::ServFail);

        let bytes = msg.serialize().unwrap();
        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.id(), 0x55aa);
        assert_eq!(parsed.rcode(), ResponseCode::ServFail);
    }

    #[test]
    fn parse_rejects_truncated_garbage() {
        assert!(DnsMessage::parse(&[0x00]).is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use hickory_proto::rr::RecordType as RT;
    use proptest::prelude::*;

    fn domain_strategy() -> impl Strategy<Value = String> {
        let label = "[a-z][a-z0-9]{0,9}";
        (label, label).prop_map(|(l1, l2)| format!("{}.{}", l1, l2))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Encoding then decoding a freshly built query preserves its id,
        /// question name, and message type, per spec.md section 8's
        /// "id preservation" and "wire round-trip" invariants.
        #[test]
        fn prop_query_wire_roundtrip(id in any::<u16>(), domain in domain_strategy()) {
            let query = DnsMessage::make_query(id, &domain, RT::A, false).unwrap();
            let bytes = query.serialize().unwrap();
            let parsed = DnsMessage::parse(&bytes).unwrap();

            prop_assert_eq!(parsed.id(), id);
            prop_assert!(parsed.is_query());
            prop_assert_eq!(parsed.question_name().unwrap().to_lowercase(), domain.to_lowercase());
        }

        /// Rewriting the id before serialization (the GET-path id=0 trick
        /// from spec.md section 4.E) must be visible in the re-parsed bytes.
        #[test]
        fn prop_set_id_then_serialize_roundtrips(
            original_id in any::<u16>(),
            new_id in any::<u16>(),
            domain in domain_strategy()
        ) {
            let mut query = DnsMessage::make_query(original_id, &domain, RT::A, false).unwrap();
            query.set_id(new_id);
            let bytes = query.serialize().unwrap();
            let parsed = DnsMessage::parse(&bytes).unwrap();

            prop_assert_eq!(parsed.id(), new_id);
        }
    }
}
