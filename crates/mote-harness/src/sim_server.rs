//! Scripted LwM2M servers.
//!
//! A [`SimServer`] answers the client-originated interfaces (Register,
//! Update, De-register, Bootstrap-Request, Send) according to its
//! [`Behavior`], records everything it receives, and can issue device
//! management requests of its own through [`SimServer::send`].
//!
//! A bootstrap server built with [`SimServer::bootstrap`] answers a
//! Bootstrap-Request with 2.04 and then provisions its accounts: one
//! Bootstrap-Delete of `/`, plain-text writes into the Security and Server
//! objects, and Bootstrap-Finish.

use std::collections::VecDeque;

use mote_core::ServerAccount;
use mote_proto::{Code, ContentFormat, Message, MessageType, OptionNumber, ResourcePath, Token};

/// How a server reacts to client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer with the success code of each interface.
    Accept,
    /// Never answer.
    Silent,
    /// Answer everything with this code.
    Reject(Code),
}

/// One simulated server.
#[derive(Debug, Clone)]
pub struct SimServer {
    uri: String,
    behavior: Behavior,
    provisioning: Vec<ServerAccount>,
    location: Option<String>,
    registrations: u32,
    next_message_id: u16,
    next_token: u64,
    requests: Vec<Message>,
    responses: Vec<Message>,
    outbox: VecDeque<Message>,
}

impl SimServer {
    /// Management server.
    pub fn new(uri: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            uri: uri.into(),
            behavior,
            provisioning: Vec::new(),
            location: None,
            registrations: 0,
            next_message_id: 0x4000,
            next_token: 0x5eed_0000,
            requests: Vec::new(),
            responses: Vec::new(),
            outbox: VecDeque::new(),
        }
    }

    /// Bootstrap server that provisions `accounts`.
    pub fn bootstrap(uri: impl Into<String>, accounts: Vec<ServerAccount>) -> Self {
        Self { provisioning: accounts, ..Self::new(uri, Behavior::Accept) }
    }

    /// Server URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Change how requests are answered from now on.
    pub fn set_behavior(&mut self, behavior: Behavior) {
        self.behavior = behavior;
    }

    /// Location of the current registration, if any.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// A registration is active.
    pub fn is_registered(&self) -> bool {
        self.location.is_some()
    }

    /// Register requests accepted so far.
    pub fn registrations(&self) -> u32 {
        self.registrations
    }

    /// Requests received from the client, oldest first.
    pub fn requests(&self) -> &[Message] {
        &self.requests
    }

    /// Requests whose first Uri-Path segment is `segment`.
    pub fn requests_to<'a>(&'a self, segment: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.requests.iter().filter(move |m| m.uri_path_segments().first().is_some_and(|s| s == segment))
    }

    /// Responses and notifications from the client, oldest first.
    pub fn responses(&self) -> &[Message] {
        &self.responses
    }

    /// Last response carrying `token`.
    pub fn response_to(&self, token: &Token) -> Option<&Message> {
        self.responses.iter().rev().find(|m| m.token == *token)
    }

    /// Every response carrying `token` and an Observe option.
    pub fn notifications(&self, token: &Token) -> Vec<&Message> {
        self.responses.iter().filter(|m| m.token == *token && m.observe().is_some()).collect()
    }

    /// Confirmable request with a fresh message id and token.
    pub fn new_request(&mut self, code: Code, path: &ResourcePath) -> Message {
        let token = Token::from_u64(self.next_token);
        self.next_token += 1;
        let mut message =
            Message::request(MessageType::Confirmable, code, self.allocate_message_id(), token);
        message.add_uri_path(path.uri_segments());
        message
    }

    /// Queue a message for the client.
    pub fn send(&mut self, message: Message) {
        self.outbox.push_back(message);
    }

    /// Encoded datagrams queued for the client.
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        self.outbox
            .drain(..)
            .filter_map(|m| match m.encode() {
                Ok(datagram) => Some(datagram),
                Err(err) => {
                    tracing::warn!(uri = %self.uri, %err, "simulated server built an invalid message");
                    None
                },
            })
            .collect()
    }

    /// Process one datagram from the client.
    pub fn handle(&mut self, datagram: &[u8]) {
        let Ok(message) = Message::decode(datagram) else {
            tracing::debug!(uri = %self.uri, "undecodable datagram at server");
            return;
        };

        if message.code.is_request() {
            self.requests.push(message.clone());
            self.on_request(&message);
        } else if message.code.is_response() {
            if message.message_type == MessageType::Confirmable {
                self.send(Message::empty_ack(message.message_id));
            }
            self.responses.push(message);
        } else {
            self.responses.push(message);
        }
    }

    fn on_request(&mut self, request: &Message) {
        let code = match self.behavior {
            Behavior::Silent => return,
            Behavior::Reject(code) => {
                self.reply(request, Message::new(MessageType::Acknowledgement, code, 0));
                return;
            },
            Behavior::Accept => self.accept(request),
        };
        let mut reply = Message::new(MessageType::Acknowledgement, code, 0);
        if code == Code::CREATED {
            if let Some(location) = &self.location {
                for segment in location.trim_start_matches('/').split('/') {
                    reply.add_option(OptionNumber::LOCATION_PATH, segment.as_bytes());
                }
            }
        }
        self.reply(request, reply);

        if self.is_bootstrap_request(request) {
            self.provision();
        }
    }

    fn accept(&mut self, request: &Message) -> Code {
        let path = request.uri_path_segments();
        let path: Vec<&str> = path.iter().map(String::as_str).collect();
        match (request.code, path.as_slice()) {
            (Code::POST, ["rd"]) => {
                self.registrations += 1;
                self.location = Some(format!("/rd/{:04x}", self.registrations));
                Code::CREATED
            },
            (Code::POST, ["rd", _]) => Code::CHANGED,
            (Code::DELETE, ["rd", _]) => {
                self.location = None;
                Code::DELETED
            },
            (Code::POST, ["bs"] | ["dp"]) => Code::CHANGED,
            _ => Code::NOT_FOUND,
        }
    }

    fn is_bootstrap_request(&self, request: &Message) -> bool {
        !self.provisioning.is_empty()
            && request.code == Code::POST
            && request.uri_path_segments() == ["bs"]
    }

    /// Piggyback on the ACK for CON, answer NON with NON.
    fn reply(&mut self, request: &Message, mut reply: Message) {
        reply.token = request.token.clone();
        if request.message_type == MessageType::Confirmable {
            reply.message_type = MessageType::Acknowledgement;
            reply.message_id = request.message_id;
        } else {
            reply.message_type = MessageType::NonConfirmable;
            reply.message_id = self.allocate_message_id();
        }
        self.send(reply);
    }

    fn provision(&mut self) {
        let delete = self.new_request(Code::DELETE, &ResourcePath::root());
        self.send(delete);

        for (n, account) in self.provisioning.clone().iter().enumerate() {
            let instance = u16::try_from(n + 1).unwrap_or(u16::MAX);
            for (path, value) in provisioning_writes(instance, account) {
                let mut write = self.new_request(Code::PUT, &path);
                write.set_content_format(ContentFormat::TEXT_PLAIN);
                let write = write.with_payload(value);
                self.send(write);
            }
        }

        let mut finish = self.new_request(Code::POST, &ResourcePath::root());
        finish.add_uri_path(["bs"]);
        self.send(finish);
    }

    fn allocate_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }
}

/// Security (/0) and Server (/1) object writes describing `account`.
pub fn provisioning_writes(instance: u16, account: &ServerAccount) -> Vec<(ResourcePath, String)> {
    let path = |object: u16, resource: u16| ResourcePath::new(&[object, instance, resource]).unwrap_or_default();
    vec![
        (path(0, 0), account.uri.clone()),
        (path(0, 1), "false".to_string()),
        (path(0, 10), account.short_id.to_string()),
        (path(1, 0), account.short_id.to_string()),
        (path(1, 1), account.lifetime.as_secs().to_string()),
        (path(1, 7), account.binding.to_query()),
        (path(1, 26), u8::from(account.confirmable_notifications).to_string()),
    ]
}
