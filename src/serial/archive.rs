//! Byte archives used by `Component::save` / `Component::load`.

use crate::component::{ComponentPtr, Props};
use crate::error::{Error, Result};
use crate::registry::ComponentRegistry;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Tag written in place of an absent component.
const TAG_ABSENT: u8 = 0;
/// Tag preceding a present component.
const TAG_PRESENT: u8 = 1;

/// Deepest component nesting accepted when reading.
pub const MAX_DEPTH: usize = 256;

/// Append-only archive.
///
/// All integers are little-endian; strings and blobs are prefixed with a
/// `u32` length.
#[derive(Debug, Default)]
pub struct OutputArchive {
    buf: BytesMut,
}

impl OutputArchive {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and take the bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// View the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Write a byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Write a bool as one byte.
    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    /// Write a `u32`.
    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    /// Write a `u64`.
    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    /// Write an `i64`.
    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    /// Write an `f64`.
    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Write a `u32` length or count prefix.
    ///
    /// Fails instead of truncating when `len` does not fit.
    pub fn write_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| {
            Error::InvalidState(format!("length {len} does not fit a u32 prefix"))
        })?;
        self.buf.put_u32_le(len);
        Ok(())
    }

    /// Write a length-prefixed blob.
    pub fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write_len(v.len())?;
        self.buf.put_slice(v);
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, v: &str) -> Result<()> {
        self.write_bytes(v.as_bytes())
    }

    /// Write a length-prefixed slice of `f64`.
    pub fn write_f64_slice(&mut self, v: &[f64]) -> Result<()> {
        self.write_len(v.len())?;
        for x in v {
            self.buf.put_f64_le(*x);
        }
        Ok(())
    }

    /// Write a JSON value as a string.
    pub fn write_json(&mut self, v: &Props) -> Result<()> {
        let text = serde_json::to_string(v)?;
        self.write_str(&text)
    }

    /// Write a possibly absent component.
    ///
    /// Layout: tag, then for a present component its registry key, its
    /// locator and a length-prefixed block holding whatever its `save` wrote.
    /// Owned children are written recursively from within `save`.
    pub fn write_component(&mut self, component: Option<&ComponentPtr>) -> Result<()> {
        let Some(component) = component else {
            self.write_u8(TAG_ABSENT);
            return Ok(());
        };
        self.write_u8(TAG_PRESENT);
        self.write_str(component.key())?;
        self.write_str(component.loc())?;

        let mut fields = OutputArchive::new();
        component.get().save(&mut fields)?;
        self.write_bytes(fields.as_slice())
    }
}

/// Read cursor over bytes produced by [`OutputArchive`].
///
/// Components found in the stream are recreated through the registry by key.
/// Nesting deeper than [`MAX_DEPTH`] is rejected.
pub struct InputArchive<'a> {
    buf: &'a [u8],
    registry: &'a ComponentRegistry,
    depth: usize,
}

impl<'a> InputArchive<'a> {
    /// Read from `buf`, creating components through `registry`.
    pub fn new(buf: &'a [u8], registry: &'a ComponentRegistry) -> Self {
        Self {
            buf,
            registry,
            depth: 0,
        }
    }

    /// Nesting level of the component whose fields this archive reads.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Registry used to recreate components.
    pub fn registry(&self) -> &'a ComponentRegistry {
        self.registry
    }

    /// Unread byte count.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::DeserializationFormat(format!(
                "unexpected end of stream reading {what} ({} of {n} bytes left)",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Read a byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    /// Read a bool.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::DeserializationFormat(format!(
                "invalid bool byte {other}"
            ))),
        }
    }

    /// Read a `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    /// Read a `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    /// Read an `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8, "i64")?;
        Ok(self.buf.get_i64_le())
    }

    /// Read an `f64`.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8, "f64")?;
        Ok(self.buf.get_f64_le())
    }

    /// Read a length-prefixed blob without copying.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.ensure(len, "blob")?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::DeserializationFormat("string is not valid UTF-8".into()))
    }

    /// Read a length-prefixed slice of `f64`.
    pub fn read_f64_vec(&mut self) -> Result<Vec<f64>> {
        let len = self.read_u32()? as usize;
        self.ensure(len.saturating_mul(8), "f64 slice")?;
        Ok((0..len).map(|_| self.buf.get_f64_le()).collect())
    }

    /// Read a JSON value.
    pub fn read_json(&mut self) -> Result<Props> {
        let text = self.read_string()?;
        serde_json::from_str(&text)
            .map_err(|e| Error::DeserializationFormat(format!("invalid JSON state: {e}")))
    }

    /// Read a possibly absent component written by [`OutputArchive::write_component`].
    ///
    /// A fresh instance is created by key and its `load` is applied to its
    /// field block, which must be consumed exactly.
    pub fn read_component(&mut self) -> Result<Option<ComponentPtr>> {
        match self.read_u8()? {
            TAG_ABSENT => return Ok(None),
            TAG_PRESENT => {}
            tag => {
                return Err(Error::DeserializationFormat(format!(
                    "invalid component tag {tag}"
                )));
            }
        }
        if self.depth >= MAX_DEPTH {
            return Err(Error::DeserializationFormat(format!(
                "components nested deeper than {MAX_DEPTH} levels"
            )));
        }
        let key = self.read_string()?;
        let loc = self.read_string()?;
        let block = self.read_bytes()?;

        let mut component = self.registry.instantiate(&key, &loc).map_err(|e| match e {
            Error::ComponentNotFound { key } => {
                tracing::error!(key = %key, "stream references a component that is not registered");
                Error::DeserializationKeyMismatch { key }
            }
            other => other,
        })?;

        let mut fields = InputArchive {
            buf: block,
            registry: self.registry,
            depth: self.depth + 1,
        };
        component.get_mut().load(&mut fields)?;
        if fields.remaining() != 0 {
            return Err(Error::DeserializationFormat(format!(
                "component '{key}' left {} unread bytes",
                fields.remaining()
            )));
        }
        Ok(Some(component))
    }

    /// Load into `slot`, replacing (and releasing) any previous occupant.
    ///
    /// An absent marker clears the slot.
    pub fn read_component_into(&mut self, slot: &mut Option<ComponentPtr>) -> Result<()> {
        *slot = self.read_component()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives() {
        let registry = ComponentRegistry::new();
        let mut out = OutputArchive::new();
        out.write_u8(7);
        out.write_bool(true);
        out.write_u64(u64::MAX);
        out.write_i64(-5);
        out.write_f64(0.25);
        out.write_str("film").unwrap();
        out.write_f64_slice(&[1.0, 2.0]).unwrap();
        out.write_json(&serde_json::json!({ "a": 1 })).unwrap();
        let bytes = out.into_bytes();

        let mut input = InputArchive::new(&bytes, &registry);
        assert_eq!(input.read_u8().unwrap(), 7);
        assert!(input.read_bool().unwrap());
        assert_eq!(input.read_u64().unwrap(), u64::MAX);
        assert_eq!(input.read_i64().unwrap(), -5);
        assert_eq!(input.read_f64().unwrap(), 0.25);
        assert_eq!(input.read_string().unwrap(), "film");
        assert_eq!(input.read_f64_vec().unwrap(), vec![1.0, 2.0]);
        assert_eq!(input.read_json().unwrap()["a"], 1);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn test_truncated_input() {
        let registry = ComponentRegistry::new();
        let mut input = InputArchive::new(&[1, 2], &registry);
        assert!(matches!(
            input.read_u32(),
            Err(Error::DeserializationFormat(_))
        ));
    }

    #[test]
    fn test_oversized_length_prefix() {
        let registry = ComponentRegistry::new();
        let mut out = OutputArchive::new();
        out.write_u32(1_000);
        out.write_u8(b'x');
        let bytes = out.into_bytes();
        let mut input = InputArchive::new(&bytes, &registry);
        assert!(matches!(
            input.read_string(),
            Err(Error::DeserializationFormat(_))
        ));
    }

    #[test]
    fn test_absent_component() {
        let registry = ComponentRegistry::new();
        let mut out = OutputArchive::new();
        out.write_component(None).unwrap();
        let bytes = out.into_bytes();
        let mut input = InputArchive::new(&bytes, &registry);
        assert!(input.read_component().unwrap().is_none());
    }

    #[test]
    fn test_invalid_tag() {
        let registry = ComponentRegistry::new();
        let mut input = InputArchive::new(&[9], &registry);
        assert!(matches!(
            input.read_component(),
            Err(Error::DeserializationFormat(_))
        ));
    }

    #[test]
    fn test_length_prefix_overflow_is_an_error() {
        let mut out = OutputArchive::new();
        out.write_len(u32::MAX as usize).unwrap();
        assert!(matches!(
            out.write_len(u32::MAX as usize + 1),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(out.len(), 4);
    }

    /// Hand-written stream of `levels` nested `test::box` components.
    ///
    /// Each level is a header whose block is everything after it, ending
    /// with an absent marker.
    fn nested_stream(levels: usize) -> Vec<u8> {
        const KEY: &str = "test::box";
        let header = 1 + 4 + KEY.len() + 4 + 4;
        let mut out = OutputArchive::new();
        for level in 0..levels {
            out.write_u8(TAG_PRESENT);
            out.write_str(KEY).unwrap();
            out.write_str("").unwrap();
            out.write_len(1 + (levels - level - 1) * header).unwrap();
        }
        out.write_u8(TAG_ABSENT);
        out.as_slice().to_vec()
    }

    #[derive(Default)]
    struct Boxed {
        inner: Option<ComponentPtr>,
    }

    impl crate::component::Component for Boxed {
        fn save(&self, ar: &mut OutputArchive) -> Result<()> {
            ar.write_component(self.inner.as_ref())
        }

        fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
            ar.read_component_into(&mut self.inner)
        }
    }

    #[test]
    fn test_nesting_depth_limit() {
        let registry = ComponentRegistry::new();
        registry.register_type::<Boxed>("test::box");

        let bytes = nested_stream(MAX_DEPTH);
        let mut input = InputArchive::new(&bytes, &registry);
        assert!(input.read_component().unwrap().is_some());

        let bytes = nested_stream(MAX_DEPTH + 1);
        let mut input = InputArchive::new(&bytes, &registry);
        assert!(matches!(
            input.read_component(),
            Err(Error::DeserializationFormat(_))
        ));
    }

    #[test]
    fn test_deep_stream_fails_without_exhausting_the_stack() {
        let registry = ComponentRegistry::new();
        registry.register_type::<Boxed>("test::box");
        let bytes = nested_stream(100_000);
        let mut input = InputArchive::new(&bytes, &registry);
        assert!(matches!(
            input.read_component(),
            Err(Error::DeserializationFormat(_))
        ));
    }
}
