//! Wire codec properties.
//!
//! The decoder sits directly behind the UDP socket, so the important property
//! is that arbitrary bytes never panic and that anything we encode decodes to
//! the same message.

use mote_proto::{
    BlockValue, Code, ContentFormat, Message, MessageType, OptionNumber, ProtocolError, Token,
    link_format::{Link, LinkAttribute, encode_links},
};
use proptest::prelude::*;

fn message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Confirmable),
        Just(MessageType::NonConfirmable),
        Just(MessageType::Acknowledgement),
    ]
}

fn message() -> impl Strategy<Value = Message> {
    (
        message_type(),
        prop_oneof![Just(Code::GET), Just(Code::POST), Just(Code::CONTENT), Just(Code::CHANGED)],
        any::<u16>(),
        prop::collection::vec(any::<u8>(), 0..=8),
        prop::collection::vec(("[a-z0-9]{1,8}", 0u16..4), 0..5),
        prop::collection::vec(any::<u8>(), 0..300),
    )
        .prop_map(|(ty, code, mid, token, segments, payload)| {
            let token = Token::new(&token).unwrap_or_default();
            let mut msg = Message::request(ty, code, mid, token);
            for (segment, query) in &segments {
                msg.add_uri_path([segment.as_str()]);
                msg.add_uri_query(format!("q={query}"));
            }
            msg.set_content_format(ContentFormat::OCTET_STREAM);
            msg.with_payload(payload)
        })
}

proptest! {
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Message::decode(&bytes);
    }

    #[test]
    fn encoded_messages_decode_identically(msg in message()) {
        let bytes = msg.encode().unwrap();
        prop_assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn block_values_survive_encoding(num in 0u32..=BlockValue::MAX_NUM, more in any::<bool>(), szx in 0u8..7) {
        let block = BlockValue { num, more, szx };
        prop_assert_eq!(BlockValue::decode(&block.encode()).unwrap(), block);
    }
}

#[test]
fn piggybacked_content_vector() {
    // ACK 2.05, MID 0x7d34, token 0x71, Content-Format text/plain, "22.3 C"
    let bytes = hex_literal::hex!("61 45 7d 34 71 c0 ff 32 32 2e 33 20 43");
    let msg = Message::decode(&bytes).unwrap();

    assert_eq!(msg.message_type, MessageType::Acknowledgement);
    assert_eq!(msg.code, Code::CONTENT);
    assert_eq!(msg.message_id, 0x7d34);
    assert_eq!(msg.token.as_bytes(), &[0x71]);
    assert_eq!(msg.content_format(), Some(ContentFormat::TEXT_PLAIN));
    assert_eq!(&msg.payload[..], b"22.3 C");
    assert_eq!(msg.encode().unwrap(), bytes.to_vec());
}

#[test]
fn reserved_option_length_rejected() {
    let bytes = hex_literal::hex!("40 01 00 01 bf");
    assert_eq!(Message::decode(&bytes), Err(ProtocolError::ReservedOptionNibble { field: "length" }));
}

#[test]
fn unknown_options_are_preserved() {
    let mut msg = Message::new(MessageType::Confirmable, Code::GET, 1);
    msg.add_option(OptionNumber(2049), vec![1, 2, 3]);
    let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
    assert_eq!(decoded.option(OptionNumber(2049)), Some(&[1u8, 2, 3][..]));
}

#[test]
fn registration_links_snapshot() {
    let links = vec![
        Link::new("/".parse_path()).with(LinkAttribute::new("rt", "\"oma.lwm2m\"")),
        Link::new("/1/0".parse_path()),
        Link::new("/3/0".parse_path()).with(LinkAttribute::new("ver", "1.1")),
        Link::new("/3303/0".parse_path()),
    ];
    insta::assert_snapshot!(encode_links(&links), @r#"</>;rt="oma.lwm2m",</1/0>,</3/0>;ver=1.1,</3303/0>"#);
}

trait ParsePath {
    fn parse_path(self) -> mote_proto::ResourcePath;
}

impl ParsePath for &str {
    fn parse_path(self) -> mote_proto::ResourcePath {
        mote_proto::ResourcePath::parse(self).unwrap()
    }
}
