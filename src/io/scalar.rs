//! Binary serializer for store-backed scalar features.
//!
//! Per-feature wire format (big-endian):
//!
//! ```text
//! [magic:u32][version:u8]
//! [n_projection_specs:u16] { [key:str][units:str] }*
//! [n_channels:u16]
//! then one block per projection instance, spec-major:
//!   [entry_count:u32] { [file_id:u32][value:f64] }*
//! ```
//!
//! Strings are u16-length-prefixed UTF-8. The header is written complete
//! before any data, and every (file-id, value) pair is fixed width, so a
//! corrupt feature is independently skippable and never blocks the rest
//! of the container.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::feature::{Feature, FeatureSpec, Projection, ScalarFeature, TargetType};
use crate::{Error, Result};

use super::remap::{FileIdToObjectMap, ObjectToFileIdMap};
use super::FeatureSerializer;

const MAGIC: u32 = 0x5446_4554; // "TFET"
const VERSION: u8 = 1;

// ============================================================================
// ScalarFeatureSerializer
// ============================================================================

/// Serializes any [`ScalarFeature`] matching a spec template.
pub struct ScalarFeatureSerializer {
    template: FeatureSpec,
}

impl ScalarFeatureSerializer {
    pub fn new(template: FeatureSpec) -> Self {
        Self { template }
    }
}

impl FeatureSerializer for ScalarFeatureSerializer {
    fn key(&self) -> &str {
        &self.template.key
    }

    fn serialize(
        &self,
        feature: &dyn Feature,
        remap: &ObjectToFileIdMap,
        out: &mut dyn std::io::Write,
    ) -> Result<()> {
        let scalar = feature
            .as_any()
            .downcast_ref::<ScalarFeature>()
            .ok_or_else(|| Error::SerializationError {
                feature: self.template.key.clone(),
                message: "not a scalar feature".into(),
            })?;
        let spec = scalar.spec();

        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u8(VERSION);

        // Header: projection spec keys with resolved units.
        buf.put_u16(spec.projection_specs.len() as u16);
        for pspec in &spec.projection_specs {
            let units = scalar
                .scalar_projections()
                .iter()
                .find(|p| p.key().key == pspec.key)
                .map(|p| p.units())
                .unwrap_or("");
            put_string(&mut buf, &pspec.key);
            put_string(&mut buf, units);
        }
        buf.put_u16(scalar.n_channels() as u16);

        // Data blocks, spec-major projection order.
        for projection in scalar.scalar_projections() {
            let mut pairs: Vec<(u32, f64)> = Vec::new();
            for (index, generation, value) in projection.store.iter_set() {
                let file_id = match spec.target {
                    TargetType::Vertex => {
                        remap.vertex_file_id(crate::graph::SpotId { index, generation })
                    }
                    TargetType::Edge => remap.edge_file_id(crate::graph::LinkId { index, generation }),
                };
                // Entries for objects no longer in the graph are dropped.
                if let Some(file_id) = file_id {
                    pairs.push((file_id, value));
                }
            }
            buf.put_u32(pairs.len() as u32);
            for (file_id, value) in pairs {
                buf.put_u32(file_id);
                buf.put_f64(value);
            }
        }

        out.write_all(&buf)?;
        Ok(())
    }

    fn deserialize(
        &self,
        input: &mut dyn std::io::Read,
        remap: &FileIdToObjectMap,
    ) -> Result<Box<dyn Feature>> {
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;
        let mut buf = Bytes::from(raw);
        let key = &self.template.key;

        need(&buf, 5, key)?;
        if buf.get_u32() != MAGIC {
            return Err(corrupt(key, "bad magic"));
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(corrupt(key, &format!("unsupported version {version}")));
        }

        need(&buf, 2, key)?;
        let n_specs = buf.get_u16() as usize;
        if n_specs != self.template.projection_specs.len() {
            return Err(corrupt(key, "projection spec count mismatch"));
        }
        let mut units = Vec::with_capacity(n_specs);
        for pspec in &self.template.projection_specs {
            let stored_key = get_string(&mut buf, key)?;
            if stored_key != pspec.key {
                return Err(corrupt(key, &format!("unexpected projection '{stored_key}'")));
            }
            units.push(get_string(&mut buf, key)?);
        }

        need(&buf, 2, key)?;
        let n_channels = buf.get_u16() as u32;
        let mut feature =
            ScalarFeature::with_projection_units(self.template.clone(), n_channels, &units);

        let mut dropped = 0usize;
        for projection in feature.scalar_projections_mut() {
            need(&buf, 4, key)?;
            let count = buf.get_u32() as usize;
            for _ in 0..count {
                need(&buf, 12, key)?;
                let file_id = buf.get_u32();
                let value = buf.get_f64();
                let id = match self.template.target {
                    TargetType::Vertex => {
                        remap.vertex(file_id).map(|s| (s.index, s.generation))
                    }
                    TargetType::Edge => remap.edge(file_id).map(|l| (l.index, l.generation)),
                };
                match id {
                    Some((index, generation)) if !value.is_nan() => {
                        projection.store.set(index, generation, value);
                    }
                    _ => dropped += 1,
                }
            }
        }
        if dropped > 0 {
            warn!(feature = %key, dropped, "dropped entries with unresolvable file ids");
        }

        Ok(Box::new(feature))
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

fn corrupt(feature: &str, message: &str) -> Error {
    Error::SerializationError {
        feature: feature.to_string(),
        message: message.to_string(),
    }
}

fn need(buf: &Bytes, n: usize, feature: &str) -> Result<()> {
    if buf.remaining() < n {
        Err(corrupt(feature, "truncated data"))
    } else {
        Ok(())
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes, feature: &str) -> Result<String> {
    need(buf, 2, feature)?;
    let len = buf.get_u16() as usize;
    need(buf, len, feature)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| corrupt(feature, "invalid utf-8 in string"))
}

// ============================================================================
// Tests
// ============================================================================
