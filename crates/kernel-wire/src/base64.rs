//! The `buffers` field of a JSON text frame.
//!
//! Attachments ride inline as an array of standard base64 strings. They are
//! encoded and decoded one element at a time against the serde stream, and a
//! bad element is reported by its index. Use with
//! `#[serde(with = "crate::base64::inline_buffers")]`.

pub mod inline_buffers {
    use std::fmt;

    use base64::prelude::*;
    use bytes::Bytes;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(buffers: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(buffers.iter().map(|b| BASE64_STANDARD.encode(b)))
    }

    /// `null` and a missing field both yield no attachments.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(BuffersVisitor)
    }

    struct BuffersVisitor;

    impl<'de> Visitor<'de> for BuffersVisitor {
        type Value = Vec<Bytes>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an array of base64 strings or null")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            d.deserialize_seq(self)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut buffers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(encoded) = seq.next_element::<String>()? {
                let index = buffers.len();
                let decoded = BASE64_STANDARD.decode(&encoded).map_err(|e| {
                    de::Error::custom(format_args!("buffers[{index}] is not base64: {e}"))
                })?;
                buffers.push(Bytes::from(decoded));
            }
            Ok(buffers)
        }
    }
}
