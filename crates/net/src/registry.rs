//! Tag-to-factory table.
//!
//! Inbound bytes become a typed, empty [`Packet`] through this table before
//! any field is read. Externally supplied kinds plug in through
//! [`PluginPayload`] and are keyed by a hash of their type name, so adding one
//! never touches the core dispatch path.

use crate::codec::{encode_packet, plugin_type_hash};
use crate::dispatch::PluginContext;
use crate::protocol::{Packet, PacketType};
use crate::wire::{WireError, WireReader, WireWriter};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Capability set every externally supplied payload implements.
pub trait PluginPayload: fmt::Debug {
    /// Stable type name; its hash is the wire key.
    fn type_name(&self) -> &'static str;

    /// Append this payload's fields.
    fn write_fields(&self, w: &mut WireWriter);

    /// Populate fields from `r`.
    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError>;

    /// Reaction run once the payload has been decoded.
    fn on_dispatched(&mut self, ctx: &mut PluginContext<'_>) -> anyhow::Result<()>;
}

/// Constructor for an empty plugin payload.
pub type PluginFactory = fn() -> Box<dyn PluginPayload>;

/// Adapter carrying an external payload through the core [`Packet`] enum.
#[derive(Debug)]
pub struct PluginPacket {
    type_hash: u32,
    payload: Box<dyn PluginPayload>,
}

impl PluginPacket {
    /// Wrap an outbound payload.
    pub fn new<P: PluginPayload + 'static>(payload: P) -> Self {
        Self {
            type_hash: plugin_type_hash(payload.type_name()),
            payload: Box::new(payload),
        }
    }

    /// Wire key of the wrapped type.
    pub fn type_hash(&self) -> u32 {
        self.type_hash
    }

    /// Borrow the wrapped payload.
    pub fn payload(&self) -> &dyn PluginPayload {
        self.payload.as_ref()
    }

    /// Mutably borrow the wrapped payload.
    pub fn payload_mut(&mut self) -> &mut dyn PluginPayload {
        self.payload.as_mut()
    }

    /// Writes the type hash followed by the payload fields.
    pub(crate) fn write_fields(&self, w: &mut WireWriter) {
        w.write_u32(self.type_hash);
        self.payload.write_fields(w);
    }

    /// Reads the payload fields; the registry has already consumed the hash.
    pub(crate) fn read_payload_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.payload.read_fields(r)
    }
}

impl PartialEq for PluginPacket {
    fn eq(&self, other: &Self) -> bool {
        if self.type_hash != other.type_hash {
            return false;
        }
        let mut a = WireWriter::new();
        let mut b = WireWriter::new();
        self.payload.write_fields(&mut a);
        other.payload.write_fields(&mut b);
        a.as_slice() == b.as_slice()
    }
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The core tag is already registered.
    #[error("packet tag {0} is already registered")]
    DuplicateTag(u8),
    /// Another plugin type hashes to the same key.
    #[error("plugin {name} collides with an existing registration (hash {hash:#010x})")]
    DuplicatePlugin {
        /// Type name that failed to register.
        name: &'static str,
        /// Colliding hash.
        hash: u32,
    },
}

/// Factory table for every packet kind this endpoint understands.
#[derive(Debug, Clone)]
pub struct PacketRegistry {
    core: BTreeMap<u8, PacketType>,
    plugins: HashMap<u32, (&'static str, PluginFactory)>,
}

impl PacketRegistry {
    /// Registry with every core kind registered.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for kind in PacketType::CORE {
            registry.core.insert(kind.as_u8(), kind);
        }
        registry
    }

    /// Registry that knows nothing.
    pub fn empty() -> Self {
        Self {
            core: BTreeMap::new(),
            plugins: HashMap::new(),
        }
    }

    /// Register one core kind.
    pub fn register(&mut self, kind: PacketType) -> Result<(), RegistryError> {
        if kind == PacketType::Plugin || self.core.contains_key(&kind.as_u8()) {
            return Err(RegistryError::DuplicateTag(kind.as_u8()));
        }
        self.core.insert(kind.as_u8(), kind);
        Ok(())
    }

    /// Register an external payload type.
    pub fn register_plugin<P>(&mut self) -> Result<u32, RegistryError>
    where
        P: PluginPayload + Default + 'static,
    {
        let name = P::default().type_name();
        let hash = plugin_type_hash(name);
        if self.plugins.contains_key(&hash) {
            return Err(RegistryError::DuplicatePlugin { name, hash });
        }

        fn build<P: PluginPayload + Default + 'static>() -> Box<dyn PluginPayload> {
            Box::new(P::default())
        }
        let factory: PluginFactory = build::<P>;
        self.plugins.insert(hash, (name, factory));
        debug!("Registered plugin packet {} as {:#010x}", name, hash);
        Ok(hash)
    }

    /// True if `tag` names a registered core kind or the plugin tag with at
    /// least one plugin installed.
    pub fn is_registered(&self, tag: u8) -> bool {
        if tag == PacketType::Plugin.as_u8() {
            return !self.plugins.is_empty();
        }
        self.core.contains_key(&tag)
    }

    /// Number of registered plugin kinds.
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Encode a packet; identical to [`encode_packet`].
    pub fn encode(&self, packet: &Packet) -> Vec<u8> {
        encode_packet(packet)
    }

    /// Decode one complete packet.
    ///
    /// Fails on an empty buffer, an unknown tag or plugin hash, a short read,
    /// or bytes left over after the last field.
    pub fn decode(&self, bytes: &[u8]) -> Result<Packet, WireError> {
        let mut r = WireReader::new(bytes);
        let tag = r.read_u8().map_err(|_| WireError::Empty)?;
        let mut packet = self.construct(tag, &mut r)?;
        packet.read_fields(&mut r)?;
        r.finish()?;
        Ok(packet)
    }

    fn construct(&self, tag: u8, r: &mut WireReader<'_>) -> Result<Packet, WireError> {
        if tag == PacketType::Plugin.as_u8() {
            let hash = r.read_u32()?;
            let (_, factory) = self
                .plugins
                .get(&hash)
                .ok_or(WireError::UnknownPlugin(hash))?;
            return Ok(Packet::Plugin(PluginPacket {
                type_hash: hash,
                payload: factory(),
            }));
        }

        let kind = self
            .core
            .get(&tag)
            .copied()
            .ok_or(WireError::UnknownTag(tag))?;
        Packet::empty(kind).ok_or(WireError::UnknownTag(tag))
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
