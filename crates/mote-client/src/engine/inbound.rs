//! Datagrams arriving from servers.
//!
//! Requests (Read, Write, Execute, Observe, Discover, Write-Attributes,
//! Delete, and the Bootstrap interface) are answered here; responses, ACKs
//! and RSTs are matched against the transaction store and dispatched to
//! the engine's outcome handlers.
//!
//! Replies to confirmable requests are cached per (session, message id) for
//! `EXCHANGE_LIFETIME` so a retransmitted request gets the same reply
//! without being executed twice.

use std::{collections::BTreeMap, time::Instant};

use bytes::Bytes;
use mote_core::{
    BlockError, BlockKey, BlockOutcome, Direction, Environment, ObservationKey, ResourceStore,
    ResourceValue, ResponseOutcome, ServerAccount, ServerStatus, SessionId, StoreError, Transport,
};
use mote_proto::{
    BlockValue, Code, ContentFormat, Link, LinkAttribute, Message, MessageType, OptionNumber,
    ResourcePath, block, link_format::encode_links,
};

use super::{Engine, merge_accounts};
use crate::event::EngineEvent;

/// Critical options a request may carry.
const UNDERSTOOD: [OptionNumber; 8] = [
    OptionNumber::IF_MATCH,
    OptionNumber::URI_HOST,
    OptionNumber::URI_PORT,
    OptionNumber::URI_PATH,
    OptionNumber::URI_QUERY,
    OptionNumber::ACCEPT,
    OptionNumber::BLOCK2,
    OptionNumber::BLOCK1,
];

#[derive(Debug, Clone)]
struct CachedReply {
    datagram: Vec<u8>,
    expires: Instant,
}

/// Replies sent to confirmable messages, for deduplication.
#[derive(Debug, Clone, Default)]
pub(super) struct ResponseCache {
    replies: BTreeMap<(SessionId, u16), CachedReply>,
}

impl ResponseCache {
    fn lookup(&self, session: SessionId, message_id: u16, now: Instant) -> Option<&[u8]> {
        self.replies
            .get(&(session, message_id))
            .filter(|r| r.expires > now)
            .map(|r| r.datagram.as_slice())
    }

    fn insert(&mut self, session: SessionId, message_id: u16, datagram: Vec<u8>, expires: Instant) {
        self.replies.insert((session, message_id), CachedReply { datagram, expires });
    }

    pub(super) fn purge(&mut self, now: Instant) {
        self.replies.retain(|_, r| r.expires > now);
    }

    pub(super) fn forget_session(&mut self, session: SessionId) {
        self.replies.retain(|(s, _), _| *s != session);
    }
}

impl<E: Environment, T: Transport, S: ResourceStore> Engine<E, T, S> {
    /// Process one datagram received on `session`.
    ///
    /// [`Engine::step`] calls this for everything the transport returns;
    /// runtimes that receive on their own can call it directly.
    pub fn handle_datagram(&mut self, session: SessionId, datagram: &[u8], now: Instant) {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%session, %err, len = datagram.len(), "undecodable datagram dropped");
                return;
            },
        };
        let Some((server, bootstrap)) =
            self.servers.by_session(session).map(|r| (r.short_id, r.is_bootstrap()))
        else {
            tracing::debug!(%session, "datagram on unknown session dropped");
            return;
        };

        if message.message_type == MessageType::Confirmable {
            if let Some(reply) = self.responses.lookup(session, message.message_id, now) {
                tracing::debug!(%session, mid = message.message_id, "duplicate, resending cached reply");
                let reply = reply.to_vec();
                self.send_datagram(session, &reply);
                return;
            }
        }

        if message.code.is_request() {
            let reply = if bootstrap {
                self.bootstrap_request(&message, now)
            } else {
                self.management_request(server, &message, now)
            };
            self.respond(session, &message, reply, now);
            return;
        }

        if message.is_empty_message() && message.message_type == MessageType::Confirmable {
            // CoAP ping.
            self.reply(session, &Message::reset(message.message_id));
            return;
        }

        match self.transactions.on_response(session, &message, now) {
            ResponseOutcome::Unmatched => {
                tracing::debug!(%session, mid = message.message_id, token = %message.token, "unmatched message");
                if message.message_type == MessageType::Confirmable {
                    self.reply(session, &Message::reset(message.message_id));
                }
            },
            outcome => {
                if message.message_type == MessageType::Confirmable {
                    let ack = Message::empty_ack(message.message_id);
                    self.respond_cached(session, message.message_id, &ack, now);
                }
                self.on_outcome(outcome, now);
            },
        }
    }

    /// Send `reply` to `request`: piggybacked on an ACK for CON, as a NON
    /// with its own message id otherwise.
    fn respond(&mut self, session: SessionId, request: &Message, mut reply: Message, now: Instant) {
        if request.message_type == MessageType::Confirmable {
            self.respond_cached(session, request.message_id, &reply, now);
            return;
        }

        match self.transactions.next_message_id(session, &self.env) {
            Ok(message_id) => {
                reply.message_type = MessageType::NonConfirmable;
                reply.message_id = message_id;
                self.reply(session, &reply);
            },
            Err(err) => tracing::warn!(%session, %err, "reply to NON request dropped"),
        }
    }

    fn respond_cached(&mut self, session: SessionId, message_id: u16, reply: &Message, now: Instant) {
        match reply.encode() {
            Ok(datagram) => {
                self.send_datagram(session, &datagram);
                let expires = now + self.config.transmission.exchange_lifetime();
                self.responses.insert(session, message_id, datagram, expires);
            },
            Err(err) => tracing::warn!(%session, %err, "reply encoding failed"),
        }
    }

    fn reply(&mut self, session: SessionId, message: &Message) {
        match message.encode() {
            Ok(datagram) => self.send_datagram(session, &datagram),
            Err(err) => tracing::warn!(%session, %err, "reply encoding failed"),
        }
    }

    fn management_request(&mut self, server: u16, request: &Message, now: Instant) -> Message {
        let registered = self.servers.get(server).is_some_and(|r| r.status.is_registered());
        if !registered {
            tracing::debug!(server, code = %request.code, "request from unregistered server");
            return request.piggybacked_response(Code::UNAUTHORIZED);
        }
        if let Some(option) = unknown_critical(request) {
            tracing::debug!(server, option = option.0, "unrecognised critical option");
            return request.piggybacked_response(Code::BAD_OPTION);
        }
        let Ok(path) = request.resource_path() else {
            return request.piggybacked_response(Code::NOT_FOUND);
        };

        match request.code {
            Code::GET if request.accept() == Some(ContentFormat::LINK_FORMAT) => {
                self.discover(server, request, &path)
            },
            Code::GET => match request.observe() {
                Some(0) => self.start_observation(server, request, path, now),
                Some(1) => {
                    let key = ObservationKey::new(server, path.clone());
                    if self.observations.cancel(&key) {
                        self.events.push_back(EngineEvent::ObservationCancelled { server, path: path.clone() });
                    }
                    self.read(request, &path)
                },
                _ => self.read(request, &path),
            },
            Code::PUT if request.payload.is_empty() && !request.uri_query().is_empty() => {
                let key = ObservationKey::new(server, path);
                if self.observations.write_attributes(key, &request.uri_query()) {
                    request.piggybacked_response(Code::CHANGED)
                } else {
                    request.piggybacked_response(Code::BAD_REQUEST)
                }
            },
            Code::PUT => self.write(server, request, path, now),
            Code::POST => match self.store.execute(&path, &request.payload) {
                Ok(()) => {
                    tracing::info!(server, %path, "executed");
                    self.events.push_back(EngineEvent::ResourceExecuted { server, path });
                    request.piggybacked_response(Code::CHANGED)
                },
                Err(err) => store_error(request, &err),
            },
            Code::DELETE => match self.store.delete(&path) {
                Ok(()) => {
                    for id in self.servers.ids() {
                        for key in self.observations.cancel_within(id, &path) {
                            self.events
                                .push_back(EngineEvent::ObservationCancelled { server: id, path: key.path });
                        }
                    }
                    request.piggybacked_response(Code::DELETED)
                },
                Err(err) => store_error(request, &err),
            },
            _ => request.piggybacked_response(Code::METHOD_NOT_ALLOWED),
        }
    }

    fn bootstrap_request(&mut self, request: &Message, now: Instant) -> Message {
        self.bootstrap.activity(now);

        if request.code == Code::POST && request.uri_path_segments() == ["bs"] {
            return self.finish_bootstrap(request);
        }
        if !self.bootstrap.is_running() {
            tracing::debug!(code = %request.code, "bootstrap request outside bootstrap");
            return request.piggybacked_response(Code::UNAUTHORIZED);
        }
        if unknown_critical(request).is_some() {
            return request.piggybacked_response(Code::BAD_OPTION);
        }
        let Ok(path) = request.resource_path() else {
            return request.piggybacked_response(Code::NOT_FOUND);
        };

        match request.code {
            Code::PUT => self.write(ServerAccount::BOOTSTRAP_SHORT_ID, request, path, now),
            Code::DELETE => match self.store.delete(&path) {
                Ok(()) | Err(StoreError::NotFound(_)) => request.piggybacked_response(Code::DELETED),
                Err(err) => store_error(request, &err),
            },
            Code::GET if request.accept() == Some(ContentFormat::LINK_FORMAT) => {
                let mut links = vec![
                    Link::new(ResourcePath::root())
                        .with(LinkAttribute::new("lwm2m", self.config.lwm2m_version.clone())),
                ];
                links.extend(self.store.object_links().into_iter().filter(|l| path.contains(&l.path)));
                link_format_response(request, &links)
            },
            Code::GET => self.read(request, &path),
            _ => request.piggybacked_response(Code::METHOD_NOT_ALLOWED),
        }
    }

    fn finish_bootstrap(&mut self, request: &Message) -> Message {
        if !self.bootstrap.is_running() {
            tracing::warn!("Bootstrap-Finish without a running bootstrap");
            return request.piggybacked_response(Code::NOT_ACCEPTABLE);
        }

        let provisioned = self.store.server_accounts();
        let (bootstrap, live): (Vec<ServerAccount>, Vec<ServerAccount>) =
            provisioned.into_iter().partition(|a| a.bootstrap);
        let live: Vec<ServerAccount> = live.into_iter().filter(|a| a.validate().is_ok()).collect();
        if live.is_empty() {
            let reason = "bootstrap provisioned no usable server account".to_string();
            self.bootstrap.fail(reason.clone());
            self.bootstrap_failed(reason);
            return request.piggybacked_response(Code::NOT_ACCEPTABLE);
        }

        let configured: Vec<ServerAccount> = self.accounts.iter().filter(|a| a.bootstrap).cloned().collect();
        let accounts = merge_accounts(merge_accounts(Vec::new(), live), configured);
        self.accounts = merge_accounts(accounts, bootstrap);
        self.bootstrap.finish();
        if let Some(record) = self.servers.bootstrap_server_mut() {
            record.status = ServerStatus::BootstrapFinished;
            record.pending = None;
        }
        tracing::info!(servers = self.accounts.iter().filter(|a| !a.bootstrap).count(), "bootstrap finished");
        self.events.push_back(EngineEvent::BootstrapFinished);
        request.piggybacked_response(Code::CHANGED)
    }

    fn discover(&self, server: u16, request: &Message, path: &ResourcePath) -> Message {
        let attributes = self.observations.effective_attributes(&ObservationKey::new(server, path.clone()));
        let mut target = Link::new(path.clone());
        if let Some(pmin) = attributes.pmin {
            target = target.with(LinkAttribute::new("pmin", pmin.as_secs().to_string()));
        }
        if let Some(pmax) = attributes.pmax {
            target = target.with(LinkAttribute::new("pmax", pmax.as_secs().to_string()));
        }
        for (name, value) in [("gt", attributes.gt), ("lt", attributes.lt), ("st", attributes.st)] {
            if let Some(value) = value {
                target = target.with(LinkAttribute::new(name, value.to_string()));
            }
        }

        let mut below: Vec<Link> = self
            .store
            .object_links()
            .into_iter()
            .filter(|l| path.contains(&l.path) && l.path != *path)
            .collect();
        if !path.is_root() {
            below.extend(self.store.resources(path).into_iter().map(Link::new));
            below.sort_by(|a, b| a.path.cmp(&b.path));
        }
        if below.is_empty() && !path.is_root() && self.store.read(path).is_err() {
            return request.piggybacked_response(Code::NOT_FOUND);
        }

        let mut links = Vec::with_capacity(below.len() + 1);
        if !path.is_root() {
            links.push(target);
        }
        links.extend(below);
        link_format_response(request, &links)
    }

    fn start_observation(&mut self, server: u16, request: &Message, path: ResourcePath, now: Instant) -> Message {
        let value = match self.store.read(&path) {
            Ok(value) => value,
            Err(err) => return store_error(request, &err),
        };
        let key = ObservationKey::new(server, path.clone());
        let counter = self.observations.observe(key, request.token.clone(), value.clone(), now);
        tracing::info!(server, %path, "observation started");
        self.events.push_back(EngineEvent::ObservationStarted { server, path });
        self.content(request, &value, Some(counter))
    }

    fn read(&self, request: &Message, path: &ResourcePath) -> Message {
        match self.store.read(path) {
            Ok(value) => self.content(request, &value, None),
            Err(err) => store_error(request, &err),
        }
    }

    /// 2.05 carrying `value`, split into Block2 blocks when it is larger
    /// than the block size or the peer asked for a block.
    fn content(&self, request: &Message, value: &ResourceValue, observe: Option<u32>) -> Message {
        let mut response = request.piggybacked_response(Code::CONTENT);
        if let Some(counter) = observe {
            response.set_observe(counter);
        }
        response.set_content_format(value.format);

        let max = self.config.block.max_block_size;
        let requested = match request.block2() {
            Ok(requested) => requested,
            Err(_) => return request.piggybacked_response(Code::BAD_OPTION),
        };
        let (num, size) = match requested {
            None if value.bytes.len() <= usize::from(max) => return response.with_payload(value.bytes.clone()),
            None => (0, max),
            Some(requested) => {
                let size = requested.size().min(max);
                let Ok(num) = u32::try_from(requested.offset() / usize::from(size)) else {
                    return request.piggybacked_response(Code::BAD_OPTION);
                };
                (num, size)
            },
        };

        let Some((chunk, more)) = block::slice(&value.bytes, num, size) else {
            return request.piggybacked_response(Code::BAD_OPTION);
        };
        let Ok(option) = BlockValue::new(num, more, size) else {
            return request.piggybacked_response(Code::BAD_OPTION);
        };
        response.set_block2(option);
        if num == 0 {
            response.set_size(OptionNumber::SIZE2, value.bytes.len());
        }
        response.with_payload(Bytes::copy_from_slice(chunk))
    }

    fn write(&mut self, server: u16, request: &Message, path: ResourcePath, now: Instant) -> Message {
        let format = request.content_format();
        let (body, echo) = match request.block1() {
            Err(_) => return request.piggybacked_response(Code::BAD_OPTION),
            Ok(None) => {
                self.blocks.discard(&BlockKey::new(server, path.clone(), Direction::Block1));
                (request.payload.clone(), None)
            },
            Ok(Some(option)) => {
                let key = BlockKey::new(server, path.clone(), Direction::Block1);
                let accepted = self.blocks.accept_block(
                    &key,
                    option.num,
                    &request.payload,
                    !option.more,
                    option.size(),
                    now,
                );
                match accepted {
                    Ok(BlockOutcome::Continue { .. }) => {
                        let mut response = request.piggybacked_response(Code::CONTINUE);
                        response.set_block1(option);
                        return response;
                    },
                    Ok(BlockOutcome::Complete(body)) => (Bytes::from(body), Some(option)),
                    Err(err) => return self.block_error(request, &err),
                }
            },
        };

        match self.store.write(&path, ResourceValue::from_payload(format, body)) {
            Ok(()) => {
                tracing::debug!(server, %path, "written");
                self.events.push_back(EngineEvent::ResourceWritten { server, path });
                let mut response = request.piggybacked_response(Code::CHANGED);
                if let Some(option) = echo {
                    response.set_block1(option);
                }
                response
            },
            Err(err) => store_error(request, &err),
        }
    }

    fn block_error(&self, request: &Message, err: &BlockError) -> Message {
        match err {
            BlockError::TooLarge { limit } => {
                let mut response = request.piggybacked_response(Code::REQUEST_ENTITY_TOO_LARGE);
                response.set_size(OptionNumber::SIZE1, *limit);
                response
            },
            BlockError::InvalidSize(size) if *size > self.config.block.max_block_size => {
                // Tell the peer which block size to retry with.
                let mut response = request.piggybacked_response(Code::REQUEST_ENTITY_TOO_LARGE);
                if let Ok(preferred) = BlockValue::new(0, false, self.config.block.max_block_size) {
                    response.set_block1(preferred);
                }
                response
            },
            BlockError::UnexpectedBlock { .. } => request.piggybacked_response(Code::REQUEST_ENTITY_INCOMPLETE),
            BlockError::InvalidSize(_) | BlockError::SizeChanged { .. } | BlockError::OversizedBlock { .. } => {
                request.piggybacked_response(Code::BAD_REQUEST)
            },
        }
    }
}

fn unknown_critical(request: &Message) -> Option<OptionNumber> {
    request
        .options()
        .iter()
        .map(|o| o.number)
        .find(|n| n.is_critical() && !UNDERSTOOD.contains(n))
}

fn store_error(request: &Message, err: &StoreError) -> Message {
    let code = match err {
        StoreError::NotFound(_) => Code::NOT_FOUND,
        StoreError::MethodNotAllowed(_) => Code::METHOD_NOT_ALLOWED,
        StoreError::BadValue { .. } => Code::BAD_REQUEST,
        StoreError::Internal(reason) => {
            tracing::error!(%reason, "resource store failure");
            Code::INTERNAL_SERVER_ERROR
        },
    };
    request.piggybacked_response(code)
}

fn link_format_response(request: &Message, links: &[Link]) -> Message {
    let mut response = request.piggybacked_response(Code::CONTENT);
    response.set_content_format(ContentFormat::LINK_FORMAT);
    response.with_payload(encode_links(links))
}
