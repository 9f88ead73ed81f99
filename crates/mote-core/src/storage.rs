//! Resource store collaborator.
//!
//! The engine never interprets resource payloads beyond what it needs to
//! decide whether an observed value changed. Everything else (object
//! definitions, TLV/SenML encoding, persistence) sits behind
//! [`ResourceStore`].
//!
//! [`MemoryStore`] is a flat path-to-value map used by the simulation harness
//! and the demo device. It understands enough of the Security (0) and Server
//! (1) objects to turn bootstrap writes into [`ServerAccount`]s.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use bytes::Bytes;
use mote_proto::{Binding, ContentFormat, Link, LinkAttribute, ResourcePath};

use crate::{config::ServerAccount, error::StoreError};

/// Security object.
pub const SECURITY_OBJECT: u16 = 0;
/// Server object.
pub const SERVER_OBJECT: u16 = 1;
/// Device object.
pub const DEVICE_OBJECT: u16 = 3;

mod security {
    pub const URI: u16 = 0;
    pub const BOOTSTRAP: u16 = 1;
    pub const IDENTITY: u16 = 3;
    pub const SECRET_KEY: u16 = 5;
    pub const SHORT_ID: u16 = 10;
}

mod server {
    pub const SHORT_ID: u16 = 0;
    pub const LIFETIME: u16 = 1;
    pub const BINDING: u16 = 7;
    pub const NOTIFICATION_MODE: u16 = 26;
}

/// A resource value as exchanged with servers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceValue {
    /// Encoding of `bytes`.
    pub format: ContentFormat,
    /// Encoded value.
    pub bytes: Bytes,
    /// Numeric interpretation, used for `gt`/`lt`/`st` observation
    /// thresholds.
    pub numeric: Option<f64>,
}

impl ResourceValue {
    /// Plain-text value.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let numeric = text.trim().parse::<f64>().ok();
        Self { format: ContentFormat::TEXT_PLAIN, bytes: Bytes::from(text), numeric }
    }

    /// Numeric value, rendered as text.
    pub fn number(value: f64) -> Self {
        Self {
            format: ContentFormat::TEXT_PLAIN,
            bytes: Bytes::from(value.to_string()),
            numeric: Some(value),
        }
    }

    /// Opaque bytes.
    pub fn opaque(bytes: impl Into<Bytes>) -> Self {
        Self { format: ContentFormat::OCTET_STREAM, bytes: bytes.into(), numeric: None }
    }

    /// Value received in a request payload.
    pub fn from_payload(format: Option<ContentFormat>, bytes: Bytes) -> Self {
        match format.unwrap_or(ContentFormat::TEXT_PLAIN) {
            ContentFormat::TEXT_PLAIN => match std::str::from_utf8(&bytes) {
                Ok(text) => Self::text(text),
                Err(_) => Self::opaque(bytes),
            },
            format => Self { format, bytes, numeric: None },
        }
    }

    /// UTF-8 view of the value.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

/// Object and resource storage.
pub trait ResourceStore {
    /// Read the value at `path`.
    fn read(&self, path: &ResourcePath) -> Result<ResourceValue, StoreError>;

    /// Write (create or replace) the value at `path`.
    fn write(&mut self, path: &ResourcePath, value: ResourceValue) -> Result<(), StoreError>;

    /// Execute the resource at `path` with `arguments`.
    fn execute(&mut self, path: &ResourcePath, arguments: &[u8]) -> Result<(), StoreError>;

    /// Delete the object or instance at `path`.
    fn delete(&mut self, path: &ResourcePath) -> Result<(), StoreError>;

    /// Object instances to advertise at registration.
    fn object_links(&self) -> Vec<Link>;

    /// Resources strictly below `path`, in path order.
    fn resources(&self, path: &ResourcePath) -> Vec<ResourcePath>;

    /// Server accounts provisioned in the Security and Server objects.
    fn server_accounts(&self) -> Vec<ServerAccount>;
}

/// In-memory [`ResourceStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<ResourcePath, ResourceValue>,
    executable: BTreeSet<ResourcePath>,
    versions: BTreeMap<u16, String>,
    executions: Vec<(ResourcePath, Vec<u8>)>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding a minimal Device object (/3/0).
    pub fn with_device(manufacturer: &str, model: &str) -> Self {
        let mut store = Self::new();
        store.insert(device_path(0), ResourceValue::text(manufacturer));
        store.insert(device_path(1), ResourceValue::text(model));
        store.insert_executable(device_path(4));
        store.insert(device_path(9), ResourceValue::number(100.0));
        store.set_version(DEVICE_OBJECT, "1.1");
        store
    }

    /// Set a value without going through the write path.
    pub fn insert(&mut self, path: ResourcePath, value: ResourceValue) {
        self.values.insert(path, value);
    }

    /// Declare an executable resource.
    pub fn insert_executable(&mut self, path: ResourcePath) {
        self.executable.insert(path);
    }

    /// Advertise an object version (`ver=` link attribute).
    pub fn set_version(&mut self, object: u16, version: impl Into<String>) {
        self.versions.insert(object, version.into());
    }

    /// Write `account` into Security instance `instance` and, for management
    /// servers, the Server instance with the same number.
    pub fn provision(&mut self, instance: u16, account: &ServerAccount) {
        let sec = |resource| resource_path(SECURITY_OBJECT, instance, resource);
        self.insert(sec(security::URI), ResourceValue::text(account.uri.clone()));
        self.insert(sec(security::BOOTSTRAP), ResourceValue::text(account.bootstrap.to_string()));
        if let Some(psk) = &account.psk {
            self.insert(sec(security::IDENTITY), ResourceValue::opaque(psk.identity.clone()));
            self.insert(sec(security::SECRET_KEY), ResourceValue::opaque(psk.key.clone()));
        }
        if account.bootstrap {
            return;
        }
        self.insert(sec(security::SHORT_ID), ResourceValue::number(f64::from(account.short_id)));

        let srv = |resource| resource_path(SERVER_OBJECT, instance, resource);
        self.insert(srv(server::SHORT_ID), ResourceValue::number(f64::from(account.short_id)));
        self.insert(srv(server::LIFETIME), ResourceValue::number(account.lifetime.as_secs() as f64));
        self.insert(srv(server::BINDING), ResourceValue::text(account.binding.to_query()));
        self.insert(
            srv(server::NOTIFICATION_MODE),
            ResourceValue::number(if account.confirmable_notifications { 1.0 } else { 0.0 }),
        );
    }

    /// Executions performed so far, oldest first.
    pub fn executions(&self) -> &[(ResourcePath, Vec<u8>)] {
        &self.executions
    }

    /// Value at an exact path.
    pub fn get(&self, path: &ResourcePath) -> Option<&ResourceValue> {
        self.values.get(path)
    }

    fn text_at(&self, object: u16, instance: u16, resource: u16) -> Option<&str> {
        self.values.get(&resource_path(object, instance, resource)).and_then(ResourceValue::as_text)
    }

    fn number_at(&self, object: u16, instance: u16, resource: u16) -> Option<f64> {
        self.values.get(&resource_path(object, instance, resource)).and_then(|v| v.numeric)
    }

    fn bytes_at(&self, object: u16, instance: u16, resource: u16) -> Option<Vec<u8>> {
        self.values.get(&resource_path(object, instance, resource)).map(|v| v.bytes.to_vec())
    }

    fn instances(&self, object: u16) -> BTreeSet<u16> {
        self.values
            .keys()
            .chain(self.executable.iter())
            .filter(|p| p.object() == Some(object))
            .filter_map(ResourcePath::instance)
            .collect()
    }

    fn is_bootstrap_instance(&self, instance: u16) -> bool {
        self.text_at(SECURITY_OBJECT, instance, security::BOOTSTRAP).is_some_and(parse_bool)
    }
}

impl ResourceStore for MemoryStore {
    fn read(&self, path: &ResourcePath) -> Result<ResourceValue, StoreError> {
        if self.executable.contains(path) {
            return Err(StoreError::MethodNotAllowed(path.clone()));
        }
        if let Some(value) = self.values.get(path) {
            return Ok(value.clone());
        }

        // Object or instance read: one `path=value` line per readable
        // resource underneath.
        let lines: Vec<String> = self
            .values
            .iter()
            .filter(|(p, _)| path.contains(p))
            .map(|(p, v)| match v.as_text() {
                Some(text) => format!("{p}={text}"),
                None => format!("{p}=0x{}", hex::encode(&v.bytes)),
            })
            .collect();
        if lines.is_empty() {
            return Err(StoreError::NotFound(path.clone()));
        }
        Ok(ResourceValue::text(lines.join("\n")))
    }

    fn write(&mut self, path: &ResourcePath, value: ResourceValue) -> Result<(), StoreError> {
        if path.depth() < 3 {
            return Err(StoreError::BadValue {
                path: path.clone(),
                reason: "resource path required".to_string(),
            });
        }
        if self.executable.contains(path) {
            return Err(StoreError::MethodNotAllowed(path.clone()));
        }
        self.values.insert(path.clone(), value);
        Ok(())
    }

    fn execute(&mut self, path: &ResourcePath, arguments: &[u8]) -> Result<(), StoreError> {
        if self.executable.contains(path) {
            self.executions.push((path.clone(), arguments.to_vec()));
            return Ok(());
        }
        if self.values.contains_key(path) {
            return Err(StoreError::MethodNotAllowed(path.clone()));
        }
        Err(StoreError::NotFound(path.clone()))
    }

    fn delete(&mut self, path: &ResourcePath) -> Result<(), StoreError> {
        if path.depth() >= 3 {
            return Err(StoreError::MethodNotAllowed(path.clone()));
        }

        if path.is_root() {
            // Bootstrap-Delete "/": every server account except the bootstrap
            // account itself.
            let keep: BTreeSet<u16> = self
                .instances(SECURITY_OBJECT)
                .into_iter()
                .filter(|i| self.is_bootstrap_instance(*i))
                .collect();
            self.values.retain(|p, _| match p.object() {
                Some(SECURITY_OBJECT) => p.instance().is_some_and(|i| keep.contains(&i)),
                Some(SERVER_OBJECT) => false,
                _ => true,
            });
            return Ok(());
        }

        let before = self.values.len() + self.executable.len();
        self.values.retain(|p, _| !path.contains(p));
        self.executable.retain(|p| !path.contains(p));
        if self.values.len() + self.executable.len() == before {
            return Err(StoreError::NotFound(path.clone()));
        }
        Ok(())
    }

    fn object_links(&self) -> Vec<Link> {
        let objects: BTreeSet<u16> = self
            .values
            .keys()
            .chain(self.executable.iter())
            .filter_map(ResourcePath::object)
            .filter(|o| *o != SECURITY_OBJECT)
            .collect();

        let mut links = Vec::new();
        for object in objects {
            for (n, instance) in self.instances(object).into_iter().enumerate() {
                let Ok(path) = ResourcePath::new(&[object, instance]) else { continue };
                let mut link = Link::new(path);
                if n == 0 {
                    if let Some(version) = self.versions.get(&object) {
                        link = link.with(LinkAttribute::new("ver", version.clone()));
                    }
                }
                links.push(link);
            }
        }
        links
    }

    fn resources(&self, path: &ResourcePath) -> Vec<ResourcePath> {
        let below: BTreeSet<&ResourcePath> = self
            .values
            .keys()
            .chain(self.executable.iter())
            .filter(|p| p.depth() == 3 && p != &path && path.contains(p))
            .filter(|p| p.object() != Some(SECURITY_OBJECT))
            .collect();
        below.into_iter().cloned().collect()
    }

    fn server_accounts(&self) -> Vec<ServerAccount> {
        let mut accounts = Vec::new();
        for instance in self.instances(SECURITY_OBJECT) {
            let Some(uri) = self.text_at(SECURITY_OBJECT, instance, security::URI) else {
                continue;
            };
            let psk = match (
                self.bytes_at(SECURITY_OBJECT, instance, security::IDENTITY),
                self.bytes_at(SECURITY_OBJECT, instance, security::SECRET_KEY),
            ) {
                (Some(identity), Some(key)) => Some(crate::config::Psk { identity, key }),
                _ => None,
            };

            if self.is_bootstrap_instance(instance) {
                accounts.push(ServerAccount { psk, ..ServerAccount::bootstrap(uri) });
                continue;
            }

            let Some(short_id) = self
                .number_at(SECURITY_OBJECT, instance, security::SHORT_ID)
                .and_then(|n| u16::try_from(n as i64).ok())
            else {
                tracing::debug!(instance, "security instance without short server id");
                continue;
            };

            let mut account = ServerAccount { psk, ..ServerAccount::server(short_id, uri) };
            if let Some(server_instance) = self.instances(SERVER_OBJECT).into_iter().find(|i| {
                self.number_at(SERVER_OBJECT, *i, server::SHORT_ID)
                    .is_some_and(|n| n as i64 == i64::from(short_id))
            }) {
                if let Some(lifetime) = self.number_at(SERVER_OBJECT, server_instance, server::LIFETIME) {
                    if lifetime >= 1.0 {
                        account.lifetime = Duration::from_secs(lifetime as u64);
                    }
                }
                if let Some(binding) = self
                    .text_at(SERVER_OBJECT, server_instance, server::BINDING)
                    .and_then(Binding::parse)
                {
                    account.binding = binding;
                }
                account.confirmable_notifications = self
                    .number_at(SERVER_OBJECT, server_instance, server::NOTIFICATION_MODE)
                    .is_some_and(|mode| mode >= 1.0);
            }
            accounts.push(account);
        }
        accounts
    }
}

fn resource_path(object: u16, instance: u16, resource: u16) -> ResourcePath {
    ResourcePath::new(&[object, instance, resource]).unwrap_or_default()
}

fn device_path(resource: u16) -> ResourcePath {
    resource_path(DEVICE_OBJECT, 0, resource)
}

fn parse_bool(text: &str) -> bool {
    matches!(text.trim(), "1" | "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> ResourcePath {
        ResourcePath::parse(text).unwrap()
    }

    #[test]
    fn read_write_execute() {
        let mut store = MemoryStore::with_device("Acme", "M1");
        assert_eq!(store.read(&path("/3/0/0")).unwrap().as_text(), Some("Acme"));
        assert_eq!(store.read(&path("/3/0/9")).unwrap().numeric, Some(100.0));

        store.write(&path("/3/0/9"), ResourceValue::number(42.0)).unwrap();
        assert_eq!(store.read(&path("/3/0/9")).unwrap().numeric, Some(42.0));

        store.execute(&path("/3/0/4"), b"").unwrap();
        assert_eq!(store.executions().len(), 1);
        assert_eq!(store.read(&path("/3/0/4")), Err(StoreError::MethodNotAllowed(path("/3/0/4"))));
        assert_eq!(store.execute(&path("/3/0/0"), b""), Err(StoreError::MethodNotAllowed(path("/3/0/0"))));
        assert_eq!(store.read(&path("/5/0/1")), Err(StoreError::NotFound(path("/5/0/1"))));
    }

    #[test]
    fn instance_read_lists_resources() {
        let store = MemoryStore::with_device("Acme", "M1");
        let value = store.read(&path("/3/0")).unwrap();
        assert_eq!(value.as_text(), Some("/3/0/0=Acme\n/3/0/1=M1\n/3/0/9=100"));
    }

    #[test]
    fn provisioned_accounts_roundtrip() {
        let mut store = MemoryStore::new();
        let bootstrap = ServerAccount::bootstrap("coap://bs.example");
        let server = ServerAccount::server(101, "coap://lwm2m.example")
            .with_lifetime(Duration::from_secs(300))
            .with_binding(Binding::U | Binding::Q)
            .with_confirmable_notifications();
        store.provision(0, &bootstrap);
        store.provision(1, &server);

        let accounts = store.server_accounts();
        assert_eq!(accounts, vec![bootstrap, server]);
    }

    #[test]
    fn bootstrap_delete_keeps_bootstrap_account_and_device() {
        let mut store = MemoryStore::with_device("Acme", "M1");
        store.provision(0, &ServerAccount::bootstrap("coap://bs"));
        store.provision(1, &ServerAccount::server(1, "coap://a"));

        store.delete(&ResourcePath::root()).unwrap();

        let accounts = store.server_accounts();
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].bootstrap);
        assert!(store.get(&path("/3/0/0")).is_some());
    }

    #[test]
    fn object_links_skip_security_object() {
        let mut store = MemoryStore::with_device("Acme", "M1");
        store.provision(0, &ServerAccount::server(1, "coap://a"));
        let links: Vec<String> = store.object_links().iter().map(ToString::to_string).collect();
        assert_eq!(links, vec!["</1/0>", "</3/0>;ver=1.1"]);
    }

    #[test]
    fn resources_below_instance() {
        let mut store = MemoryStore::with_device("Acme", "M1");
        store.provision(0, &ServerAccount::server(1, "coap://a"));

        let below = store.resources(&path("/3/0"));
        assert_eq!(below, vec![path("/3/0/0"), path("/3/0/1"), path("/3/0/4"), path("/3/0/9")]);
        assert!(store.resources(&path("/3/0/0")).is_empty());
        assert!(store.resources(&ResourcePath::root()).iter().all(|p| p.object() != Some(0)));
    }
}
