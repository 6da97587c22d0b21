//! Registry of per-`msg_type` content serializers.

use std::collections::HashMap;

use serde_json::Value;

use crate::content::{builtin_codecs, MessageContent};
use crate::error::RegistryError;

/// Serializer/deserializer pair for one `msg_type`.
#[derive(Clone, Copy)]
pub struct ContentCodec {
    pub serialize: fn(&MessageContent) -> serde_json::Result<Value>,
    pub deserialize: fn(Value) -> serde_json::Result<MessageContent>,
}

impl std::fmt::Debug for ContentCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCodec").finish_non_exhaustive()
    }
}

/// Maps each `msg_type` tag to exactly one [`ContentCodec`].
///
/// Codecs refuse to build from a registry that fails [`validate`](Self::validate),
/// so an incomplete registry is caught at startup instead of on first use.
#[derive(Debug, Clone, Default)]
pub struct ContentRegistry {
    codecs: HashMap<String, ContentCodec>,
}

impl ContentRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding every built-in content type.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (msg_type, codec) in builtin_codecs() {
            registry.codecs.insert(msg_type.to_string(), codec);
        }
        registry
    }

    pub fn register(&mut self, msg_type: &str, codec: ContentCodec) -> Result<(), RegistryError> {
        if self.codecs.contains_key(msg_type) {
            return Err(RegistryError::Duplicate(msg_type.to_string()));
        }
        self.codecs.insert(msg_type.to_string(), codec);
        Ok(())
    }

    pub fn unregister(&mut self, msg_type: &str) -> Option<ContentCodec> {
        self.codecs.remove(msg_type)
    }

    pub fn contains(&self, msg_type: &str) -> bool {
        self.codecs.contains_key(msg_type)
    }

    /// Checks that every built-in tag has both directions registered.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut missing: Vec<String> = MessageContent::MSG_TYPES
            .iter()
            .filter(|t| !self.codecs.contains_key(**t))
            .map(|t| t.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            missing.sort();
            Err(RegistryError::Incomplete(missing))
        }
    }

    pub fn serialize(
        &self,
        msg_type: &str,
        content: &MessageContent,
    ) -> Option<serde_json::Result<Value>> {
        self.codecs.get(msg_type).map(|c| (c.serialize)(content))
    }

    pub fn deserialize(
        &self,
        msg_type: &str,
        value: Value,
    ) -> Option<serde_json::Result<MessageContent>> {
        self.codecs.get(msg_type).map(|c| (c.deserialize)(value))
    }
}
