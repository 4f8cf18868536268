//! Cell-update batches.
//!
//! Raw batch layout: `count:i32` then `count` records of
//! `{cell:i32, element:u16, temperature:f32, mass:f32, disease:u8, disease_count:i32}`.
//! On the wire the raw batch is wrapped as `[codec:u8][len:i32][bytes]`, where
//! codec 1 is zstd and codec 0 is the raw batch.

use crate::wire::{WireError, WireReader, WireWriter};
use colonysync_core::{CellIndex, CellState};
use tracing::warn;

/// Encoded size of one cell record.
pub const CELL_RECORD_SIZE: usize = 4 + 2 + 4 + 4 + 1 + 4;

/// Temperature substituted for impossible readings on cells with mass.
pub const FALLBACK_TEMPERATURE: f32 = 293.15;

/// Largest decompressed batch accepted from the wire.
const MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

const CODEC_RAW: u8 = 0;
const CODEC_ZSTD: u8 = 1;

/// One replicated cell.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CellUpdate {
    /// Cell index.
    pub cell: CellIndex,
    /// Element table index.
    pub element: u16,
    /// Temperature in kelvin.
    pub temperature: f32,
    /// Mass in kilograms.
    pub mass: f32,
    /// Disease table index.
    pub disease: u8,
    /// Germ count.
    pub disease_count: i32,
}

impl CellUpdate {
    /// Record for `cell` carrying `state`.
    pub fn new(cell: CellIndex, state: CellState) -> Self {
        Self {
            cell,
            element: state.element,
            temperature: state.temperature,
            mass: state.mass,
            disease: state.disease,
            disease_count: state.disease_count,
        }
    }

    /// The state this record carries.
    pub fn state(&self) -> CellState {
        CellState {
            element: self.element,
            temperature: self.temperature,
            mass: self.mass,
            disease: self.disease,
            disease_count: self.disease_count,
        }
    }

    /// Clean up physically impossible values before applying.
    ///
    /// Returns `None` for records that must be skipped (negative or
    /// non-finite mass). Cells with mass get a fallback temperature when the
    /// reading is at or below 1 K or non-finite; empty cells get 0 K.
    pub fn sanitized(&self) -> Option<Self> {
        if !self.mass.is_finite() || self.mass < 0.0 {
            return None;
        }

        let mut clean = *self;
        if clean.mass > 0.0 {
            if !clean.temperature.is_finite() || clean.temperature <= 1.0 {
                clean.temperature = FALLBACK_TEMPERATURE;
            }
        } else {
            clean.temperature = 0.0;
        }
        Some(clean)
    }
}

/// Encode a raw (uncompressed) batch.
pub fn encode_batch(updates: &[CellUpdate]) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(4 + updates.len() * CELL_RECORD_SIZE);
    w.write_i32(updates.len() as i32);
    for update in updates {
        w.write_i32(update.cell);
        w.write_u16(update.element);
        w.write_f32(update.temperature);
        w.write_f32(update.mass);
        w.write_u8(update.disease);
        w.write_i32(update.disease_count);
    }
    w.into_bytes()
}

/// Decode a raw batch, requiring every byte to be consumed.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<CellUpdate>, WireError> {
    let mut r = WireReader::new(bytes);
    let count = r.read_len_i32()?;
    let mut updates = Vec::with_capacity(r.capacity_hint(count, CELL_RECORD_SIZE));
    for _ in 0..count {
        updates.push(CellUpdate {
            cell: r.read_i32()?,
            element: r.read_u16()?,
            temperature: r.read_f32()?,
            mass: r.read_f32()?,
            disease: r.read_u8()?,
            disease_count: r.read_i32()?,
        });
    }
    r.finish()?;
    Ok(updates)
}

/// Write a batch compressed with zstd at `level`.
///
/// Falls back to the raw codec if compression fails.
pub fn write_compressed_batch(w: &mut WireWriter, updates: &[CellUpdate], level: i32) {
    let raw = encode_batch(updates);
    match zstd::encode_all(&raw[..], level) {
        Ok(compressed) => {
            w.write_u8(CODEC_ZSTD);
            w.write_byte_array(&compressed);
        }
        Err(e) => {
            warn!("Failed to compress cell batch, sending raw: {}", e);
            w.write_u8(CODEC_RAW);
            w.write_byte_array(&raw);
        }
    }
}

/// Read a batch written by [`write_compressed_batch`].
pub fn read_compressed_batch(r: &mut WireReader<'_>) -> Result<Vec<CellUpdate>, WireError> {
    let codec = r.read_u8()?;
    let body = r.read_byte_array()?;
    match codec {
        CODEC_RAW => decode_batch(&body),
        CODEC_ZSTD => {
            let raw = decompress_bounded(&body)?;
            decode_batch(&raw)
        }
        other => Err(WireError::InvalidEnum {
            what: "batch codec",
            value: i64::from(other),
        }),
    }
}

fn decompress_bounded(body: &[u8]) -> Result<Vec<u8>, WireError> {
    zstd::bulk::decompress(body, MAX_BATCH_BYTES).map_err(|_| WireError::Decompress)
}

/// Split `updates` into batches of at most `max_per_packet` records.
pub fn split_batches(updates: &[CellUpdate], max_per_packet: usize) -> Vec<Vec<CellUpdate>> {
    updates
        .chunks(max_per_packet.max(1))
        .map(<[CellUpdate]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cell: i32) -> CellUpdate {
        CellUpdate {
            cell,
            element: 12,
            temperature: 300.5,
            mass: 1.25,
            disease: 255,
            disease_count: 0,
        }
    }

    #[test]
    fn test_raw_batch_layout() {
        let bytes = encode_batch(&[sample(7)]);
        assert_eq!(bytes.len(), 4 + CELL_RECORD_SIZE);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[7, 0, 0, 0]);
        assert_eq!(&bytes[8..10], &[12, 0]);
    }

    #[test]
    fn test_compressed_batch_decodes() {
        let updates: Vec<_> = (0..180).map(sample).collect();
        let mut w = WireWriter::new();
        write_compressed_batch(&mut w, &updates, 3);
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], CODEC_ZSTD);
        assert!(bytes.len() < 4 + updates.len() * CELL_RECORD_SIZE);

        let mut r = WireReader::new(&bytes);
        let decoded = read_compressed_batch(&mut r).expect("decodes");
        assert_eq!(decoded, updates);
    }

    #[test]
    fn test_garbage_zstd_frame_rejected() {
        let mut w = WireWriter::new();
        w.write_u8(CODEC_ZSTD);
        w.write_byte_array(&[1, 2, 3, 4, 5]);
        let bytes = w.into_bytes();
        assert!(read_compressed_batch(&mut WireReader::new(&bytes)).is_err());
    }

    #[test]
    fn test_split_batches_respects_limit() {
        let updates: Vec<_> = (0..400).map(sample).collect();
        let batches = split_batches(&updates, 180);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![180, 180, 40]);
    }

    #[test]
    fn test_sanitize_rules() {
        let mut cold = sample(1);
        cold.temperature = 0.5;
        assert_eq!(cold.sanitized().expect("kept").temperature, FALLBACK_TEMPERATURE);

        let mut nan = sample(1);
        nan.temperature = f32::NAN;
        assert_eq!(nan.sanitized().expect("kept").temperature, FALLBACK_TEMPERATURE);

        let mut vacuum = sample(1);
        vacuum.mass = 0.0;
        assert_eq!(vacuum.sanitized().expect("kept").temperature, 0.0);

        let mut negative = sample(1);
        negative.mass = -1.0;
        assert!(negative.sanitized().is_none());

        let mut infinite = sample(1);
        infinite.mass = f32::INFINITY;
        assert!(infinite.sanitized().is_none());

        assert_eq!(sample(1).sanitized(), Some(sample(1)));
    }
}
