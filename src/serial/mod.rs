//! Polymorphic serialization of component graphs.
//!
//! A component is written as its registry key followed by the fields its
//! [`Component::save`](crate::component::Component::save) appends. Loading
//! recreates the instance through the registry by key, so any registered
//! component can be restored, including ones provided by plugins or defined
//! as extension classes at runtime.
//!
//! [`to_bytes`] / [`from_bytes`] add a stream header (magic and version) so
//! that foreign or truncated data is rejected up front.

mod archive;

pub use archive::{InputArchive, MAX_DEPTH, OutputArchive};

use crate::component::ComponentPtr;
use crate::error::{Error, Result};
use crate::registry::ComponentRegistry;
use bytes::Bytes;

/// Stream magic.
pub const STREAM_MAGIC: [u8; 4] = *b"LMSR";

/// Stream format version.
pub const STREAM_VERSION: u16 = 1;

const HEADER_SIZE: usize = 6;

/// Serialize a possibly absent component (and everything it owns) with a stream header.
pub fn to_bytes(component: Option<&ComponentPtr>) -> Result<Bytes> {
    let mut ar = OutputArchive::new();
    for b in STREAM_MAGIC {
        ar.write_u8(b);
    }
    for b in STREAM_VERSION.to_le_bytes() {
        ar.write_u8(b);
    }
    ar.write_component(component)?;
    Ok(ar.into_bytes())
}

/// Restore a component written by [`to_bytes`].
pub fn from_bytes(registry: &ComponentRegistry, data: &[u8]) -> Result<Option<ComponentPtr>> {
    if data.len() < HEADER_SIZE || data[..4] != STREAM_MAGIC {
        return Err(Error::DeserializationFormat(
            "malformed stream header".into(),
        ));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != STREAM_VERSION {
        return Err(Error::DeserializationFormat(format!(
            "unsupported stream version {version} (expected {STREAM_VERSION})"
        )));
    }

    let mut ar = InputArchive::new(&data[HEADER_SIZE..], registry);
    let component = ar.read_component()?;
    if ar.remaining() != 0 {
        return Err(Error::DeserializationFormat(format!(
            "{} trailing bytes after component",
            ar.remaining()
        )));
    }
    Ok(component)
}
