//! Client-originated LwM2M requests.
//!
//! | Operation         | Request                                      |
//! |-------------------|----------------------------------------------|
//! | Register          | `POST /rd?ep=&lt=&lwm2m=&b=` + link format   |
//! | Update            | `POST /{location}[?lt=&b=]`                  |
//! | De-register       | `DELETE /{location}`                         |
//! | Bootstrap-Request | `POST /bs?ep=`                               |
//! | Send              | `POST /dp` + SenML CBOR                      |
//!
//! Message type, ID and token are filled in by the transaction store.

use bytes::Bytes;
use mote_core::ServerAccount;
use mote_proto::{
    Code, ContentFormat, Link, LinkAttribute, Message, MessageType, ResourcePath, Token,
    link_format::encode_links,
};

/// Root link advertising an LwM2M client.
pub fn root_link() -> Link {
    Link::new(ResourcePath::root()).with(LinkAttribute::new("rt", "\"oma.lwm2m\""))
}

fn post(segments: &[&str]) -> Message {
    let mut message = Message::request(MessageType::Confirmable, Code::POST, 0, Token::empty());
    message.add_uri_path(segments.iter().map(|s| s.as_bytes()));
    message
}

/// Register request carrying `links`.
pub fn register(endpoint: &str, account: &ServerAccount, version: &str, links: &[Link]) -> Message {
    let mut message = post(&["rd"]);
    message.add_uri_query(format!("ep={endpoint}"));
    message.add_uri_query(format!("lt={}", account.lifetime.as_secs()));
    message.add_uri_query(format!("lwm2m={version}"));
    message.add_uri_query(format!("b={}", account.binding.to_query()));
    message.set_content_format(ContentFormat::LINK_FORMAT);

    let mut all = Vec::with_capacity(links.len() + 1);
    all.push(root_link());
    all.extend_from_slice(links);
    message.with_payload(encode_links(&all))
}

/// Registration update. Lifetime and binding are repeated when they changed.
pub fn update(location: &[String], account: &ServerAccount, changed: bool) -> Message {
    let mut message = Message::request(MessageType::Confirmable, Code::POST, 0, Token::empty());
    message.add_uri_path(location);
    if changed {
        message.add_uri_query(format!("lt={}", account.lifetime.as_secs()));
        message.add_uri_query(format!("b={}", account.binding.to_query()));
    }
    message
}

/// De-register request.
pub fn deregister(location: &[String]) -> Message {
    let mut message = Message::request(MessageType::Confirmable, Code::DELETE, 0, Token::empty());
    message.add_uri_path(location);
    message
}

/// Bootstrap-Request.
pub fn bootstrap_request(endpoint: &str) -> Message {
    let mut message = post(&["bs"]);
    message.add_uri_query(format!("ep={endpoint}"));
    message
}

/// LwM2M Send of an already encoded SenML CBOR payload.
pub fn send(payload: Bytes) -> Message {
    let mut message = post(&["dp"]);
    message.set_content_format(ContentFormat::SENML_CBOR);
    message.with_payload(payload)
}

/// `Location-Path` segments of a Register response, empty segments dropped.
pub fn location_of(response: &Message) -> Vec<String> {
    response.location_path().into_iter().filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mote_proto::{Binding, OptionNumber};

    use super::*;

    fn path(text: &str) -> ResourcePath {
        ResourcePath::parse(text).unwrap()
    }

    #[test]
    fn register_request_layout() {
        let account = ServerAccount::server(1, "coap://lwm2m.example")
            .with_lifetime(Duration::from_secs(300))
            .with_binding(Binding::U | Binding::Q);
        let links = vec![
            Link::new(path("/1/0")),
            Link::new(path("/3/0")).with(LinkAttribute::new("ver", "1.1")),
        ];
        let message = register("mote-01", &account, "1.1", &links);

        assert_eq!(message.code, Code::POST);
        assert_eq!(message.uri_path_segments(), vec!["rd"]);
        assert_eq!(message.uri_query(), vec!["ep=mote-01", "lt=300", "lwm2m=1.1", "b=UQ"]);
        assert_eq!(message.content_format(), Some(ContentFormat::LINK_FORMAT));
        insta::assert_snapshot!(
            String::from_utf8_lossy(&message.payload),
            @r#"</>;rt="oma.lwm2m",</1/0>,</3/0>;ver=1.1"#
        );
    }

    #[test]
    fn update_repeats_parameters_only_when_changed() {
        let account = ServerAccount::server(1, "coap://a").with_lifetime(Duration::from_secs(60));
        let location = vec!["rd".to_string(), "4a2b".to_string()];

        let plain = update(&location, &account, false);
        assert_eq!(plain.uri_path_segments(), location);
        assert!(plain.uri_query().is_empty());

        let changed = update(&location, &account, true);
        assert_eq!(changed.uri_query(), vec!["lt=60", "b=U"]);
    }

    #[test]
    fn bootstrap_and_send_requests() {
        let bs = bootstrap_request("mote-01");
        assert_eq!(bs.uri_path_segments(), vec!["bs"]);
        assert_eq!(bs.uri_query(), vec!["ep=mote-01"]);

        let dp = send(Bytes::from_static(&[0x81, 0xa1]));
        assert_eq!(dp.uri_path_segments(), vec!["dp"]);
        assert_eq!(dp.content_format(), Some(ContentFormat::SENML_CBOR));
        assert_eq!(dp.payload.as_ref(), &[0x81, 0xa1]);

        let dereg = deregister(&["rd".to_string(), "7".to_string()]);
        assert_eq!(dereg.code, Code::DELETE);
        assert_eq!(dereg.option_values(OptionNumber::URI_PATH).count(), 2);
    }
}
