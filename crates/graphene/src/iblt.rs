//! Invertible Bloom lookup table.
//!
//! Keys are 64-bit short IDs; an optional fixed-width value can ride along
//! with each key. Two tables built over different key sets can be subtracted
//! and the symmetric difference peeled back out, as long as the difference
//! fits the table's sizing.

use std::io::Cursor;

use bchu_primitives::{Decodable, DecodeError, Decoder, Encodable, Encoder};

use crate::iblt_params::optimal_params;

const N_HASHCHECK: u32 = 11;
const MIN_OVERHEAD: f64 = 0.1;
const MAX_CELLS: u64 = 16_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbltError {
    /// `subtract` requires both tables to share size, hash count and salt.
    ShapeMismatch,
    /// Peeling stalled before the table emptied.
    DecodeFailure,
}

impl std::fmt::Display for IbltError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IbltError::ShapeMismatch => write!(f, "iblt shapes differ"),
            IbltError::DecodeFailure => write!(f, "iblt failed to decode"),
        }
    }
}

impl std::error::Error for IbltError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Cell {
    count: i32,
    key_sum: u64,
    key_check: u32,
    value_sum: Vec<u8>,
}

impl Cell {
    fn is_pure(&self, key_check_mask: u32) -> bool {
        (self.count == 1 || self.count == -1)
            && self.key_check == key_checksum(self.key_sum, key_check_mask)
    }

    fn is_empty(&self) -> bool {
        self.count == 0 && self.key_sum == 0 && self.key_check == 0
    }
}

fn key_checksum(key: u64, key_check_mask: u32) -> u32 {
    let bytes = key.to_le_bytes();
    murmur3::murmur3_32(&mut Cursor::new(&bytes[..]), N_HASHCHECK).unwrap_or(0) & key_check_mask
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iblt {
    version: u64,
    n_hash: u8,
    is_modified: bool,
    salt: u32,
    key_check_mask: u32,
    value_size: usize,
    cells: Vec<Cell>,
}

impl Iblt {
    pub fn new(
        version: u64,
        expected_items: u64,
        value_size: usize,
        salt: u32,
        key_check_mask: u32,
    ) -> Self {
        let (overhead, n_hash) = optimal_params(expected_items);
        let mut entries = (expected_items as f64 * overhead).ceil() as usize;
        entries = entries.max(n_hash as usize);
        if entries % n_hash as usize != 0 {
            entries += n_hash as usize - entries % n_hash as usize;
        }
        Self {
            version,
            n_hash,
            is_modified: false,
            salt,
            key_check_mask,
            value_size,
            cells: vec![Cell::default(); entries],
        }
    }

    /// Same shape as `self`, all cells zeroed. The receiver builds its local
    /// table this way so the two can be subtracted.
    pub fn cloned_empty(&self) -> Self {
        Self {
            version: self.version,
            n_hash: self.n_hash,
            is_modified: false,
            salt: self.salt,
            key_check_mask: self.key_check_mask,
            value_size: self.value_size,
            cells: vec![Cell::default(); self.cells.len()],
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn n_hash(&self) -> u8 {
        self.n_hash
    }

    pub fn salt(&self) -> u32 {
        self.salt
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    pub fn key_check_mask(&self) -> u32 {
        self.key_check_mask
    }

    fn buckets_per_hash(&self) -> usize {
        self.cells.len() / self.n_hash as usize
    }

    fn bucket(&self, region: u8, key: u64) -> usize {
        let seed = self
            .salt
            .wrapping_mul(self.n_hash as u32)
            .wrapping_add(region as u32);
        let bytes = key.to_le_bytes();
        let hash = murmur3::murmur3_32(&mut Cursor::new(&bytes[..]), seed).unwrap_or(0);
        let per_region = self.buckets_per_hash();
        region as usize * per_region + (hash as usize % per_region)
    }

    fn apply(&mut self, delta: i32, key: u64, value: &[u8]) {
        let check = key_checksum(key, self.key_check_mask);
        for region in 0..self.n_hash {
            let index = self.bucket(region, key);
            let cell = &mut self.cells[index];
            cell.count += delta;
            cell.key_sum ^= key;
            cell.key_check ^= check;
            if !value.is_empty() {
                cell.value_sum.resize(self.value_size, 0);
                for (sum, byte) in cell.value_sum.iter_mut().zip(value.iter()) {
                    *sum ^= byte;
                }
            }
        }
        self.is_modified = true;
    }

    pub fn insert(&mut self, key: u64, value: &[u8]) {
        self.apply(1, key, value);
    }

    pub fn erase(&mut self, key: u64, value: &[u8]) {
        self.apply(-1, key, value);
    }

    /// Cell-wise difference `self - other`.
    pub fn subtract(&self, other: &Iblt) -> Result<Iblt, IbltError> {
        if self.n_hash != other.n_hash
            || self.salt != other.salt
            || self.cells.len() != other.cells.len()
            || self.key_check_mask != other.key_check_mask
        {
            return Err(IbltError::ShapeMismatch);
        }
        let mut result = self.cloned_empty();
        for (out, (a, b)) in result
            .cells
            .iter_mut()
            .zip(self.cells.iter().zip(other.cells.iter()))
        {
            out.count = a.count - b.count;
            out.key_sum = a.key_sum ^ b.key_sum;
            out.key_check = a.key_check ^ b.key_check;
            if !a.value_sum.is_empty() || !b.value_sum.is_empty() {
                out.value_sum.resize(self.value_size, 0);
                for (i, sum) in out.value_sum.iter_mut().enumerate() {
                    let lhs = a.value_sum.get(i).copied().unwrap_or(0);
                    let rhs = b.value_sum.get(i).copied().unwrap_or(0);
                    *sum = lhs ^ rhs;
                }
            }
        }
        result.is_modified = self.is_modified || other.is_modified;
        Ok(result)
    }

    /// Looks up a single key, peeling a scratch copy if the key's cells are
    /// not immediately pure.
    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>, IbltError> {
        let (positive, negative) = self.list_entries()?;
        for (candidate, value) in positive.into_iter().chain(negative) {
            if candidate == key {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Peels the table, returning keys with positive and negative counts.
    /// Fails when the remaining cells cannot be resolved.
    pub fn list_entries(&self) -> Result<(Vec<(u64, Vec<u8>)>, Vec<(u64, Vec<u8>)>), IbltError> {
        let mut scratch = self.clone();
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        let erase_bound = (self.cells.len() as f64 / MIN_OVERHEAD) as usize;
        let mut total_erased = 0usize;
        loop {
            let mut erased = 0usize;
            for index in 0..scratch.cells.len() {
                let cell = &scratch.cells[index];
                if !cell.is_pure(self.key_check_mask) {
                    continue;
                }
                let key = cell.key_sum;
                let count = cell.count;
                let value = cell.value_sum.clone();
                if count > 0 {
                    positive.push((key, value.clone()));
                } else {
                    negative.push((key, value.clone()));
                }
                scratch.apply(-count, key, &value);
                erased += 1;
                total_erased += 1;
            }
            if erased == 0 || total_erased >= erase_bound {
                break;
            }
        }
        // The table decoded iff one full hash region drained. Checking a
        // single region suffices: every key hits every region once.
        let per_region = scratch.buckets_per_hash();
        if scratch.cells[..per_region].iter().all(Cell::is_empty) {
            Ok((positive, negative))
        } else {
            Err(IbltError::DecodeFailure)
        }
    }
}

impl Encodable for Iblt {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.version);
        encoder.write_u8(self.n_hash);
        encoder.write_bool(self.is_modified);
        encoder.write_u32_le(self.salt);
        encoder.write_u32_le(self.key_check_mask);
        encoder.write_varint(self.value_size as u64);
        encoder.write_varint(self.cells.len() as u64);
        for cell in &self.cells {
            encoder.write_i32_le(cell.count);
            encoder.write_u64_le(cell.key_sum);
            encoder.write_u32_le(cell.key_check);
            encoder.write_var_bytes(&cell.value_sum);
        }
    }
}

impl Decodable for Iblt {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_varint()?;
        let n_hash = decoder.read_u8()?;
        if n_hash == 0 {
            return Err(DecodeError::InvalidData("iblt with zero hash functions"));
        }
        let is_modified = decoder.read_bool()?;
        let salt = decoder.read_u32_le()?;
        let key_check_mask = decoder.read_u32_le()?;
        let value_size = decoder.read_varint()?;
        let value_size = usize::try_from(value_size).map_err(|_| DecodeError::SizeTooLarge)?;
        let n_cells = decoder.read_varint()?;
        if n_cells == 0 || n_cells > MAX_CELLS || n_cells % n_hash as u64 != 0 {
            return Err(DecodeError::InvalidData("iblt cell count out of range"));
        }
        let n_cells = n_cells as usize;
        let mut cells = Vec::with_capacity(n_cells.min(4096));
        for _ in 0..n_cells {
            let count = decoder.read_u32_le()? as i32;
            let key_sum = decoder.read_u64_le()?;
            let key_check = decoder.read_u32_le()?;
            let value_sum = decoder.read_var_bytes()?;
            if value_sum.len() > value_size {
                return Err(DecodeError::InvalidData("iblt value wider than declared"));
            }
            cells.push(Cell {
                count,
                key_sum,
                key_check,
                value_sum,
            });
        }
        Ok(Self {
            version,
            n_hash,
            is_modified,
            salt,
            key_check_mask,
            value_size,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bchu_primitives::{decode, encode, Encoder};

    const FULL_MASK: u32 = 0xffff_ffff;

    #[test]
    fn insert_then_erase_restores_empty() {
        let mut table = Iblt::new(2, 4, 0, 7, FULL_MASK);
        table.insert(0xdead_beef, &[]);
        table.erase(0xdead_beef, &[]);
        assert!(table.cells.iter().all(Cell::is_empty));
    }

    #[test]
    fn peels_inserted_keys() {
        let mut table = Iblt::new(2, 8, 0, 1, FULL_MASK);
        let keys = [3u64, 1_000_003, 77_777_777, 0xffff_ffff_ffff];
        for &key in &keys {
            table.insert(key, &[]);
        }
        let (positive, negative) = table.list_entries().unwrap();
        assert!(negative.is_empty());
        let mut recovered: Vec<u64> = positive.into_iter().map(|(key, _)| key).collect();
        recovered.sort_unstable();
        let mut expected = keys.to_vec();
        expected.sort_unstable();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn subtract_recovers_symmetric_difference() {
        let shared: Vec<u64> = (1..=40).map(|i| i * 0x9e37_79b9).collect();
        let mut sender = Iblt::new(2, 4, 0, 5, FULL_MASK);
        let mut receiver = sender.cloned_empty();
        for &key in &shared {
            sender.insert(key, &[]);
            receiver.insert(key, &[]);
        }
        sender.insert(424_242, &[]);
        receiver.insert(515_151, &[]);
        let diff = sender.subtract(&receiver).unwrap();
        let (positive, negative) = diff.list_entries().unwrap();
        assert_eq!(positive, vec![(424_242, Vec::new())]);
        assert_eq!(negative, vec![(515_151, Vec::new())]);
    }

    #[test]
    fn subtract_rejects_shape_mismatch() {
        let small = Iblt::new(2, 4, 0, 5, FULL_MASK);
        let large = Iblt::new(2, 500, 0, 5, FULL_MASK);
        assert_eq!(small.subtract(&large), Err(IbltError::ShapeMismatch));
    }

    #[test]
    fn get_finds_key_with_value() {
        let mut table = Iblt::new(2, 4, 4, 9, FULL_MASK);
        table.insert(11, &[1, 2, 3, 4]);
        table.insert(22, &[5, 6, 7, 8]);
        assert_eq!(table.get(11).unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(table.get(33).unwrap(), None);
    }

    #[test]
    fn overloaded_table_reports_failure() {
        let mut table = Iblt::new(2, 1, 0, 3, FULL_MASK);
        for key in 0..200u64 {
            table.insert(key.wrapping_mul(0x1234_5678_9abc), &[]);
        }
        assert_eq!(table.list_entries(), Err(IbltError::DecodeFailure));
    }

    #[test]
    fn wire_round_trip() {
        let mut table = Iblt::new(2, 8, 0, 13, FULL_MASK);
        table.insert(101, &[]);
        table.insert(202, &[]);
        let bytes = encode(&table);
        let decoded: Iblt = decode(&bytes).unwrap();
        assert_eq!(decoded, table);
        let (positive, _) = decoded.list_entries().unwrap();
        assert_eq!(positive.len(), 2);
    }

    #[test]
    fn zero_hash_count_is_rejected() {
        let table = Iblt::new(2, 2, 0, 1, FULL_MASK);
        let mut bytes = encode(&table);
        bytes[1] = 0;
        assert!(decode::<Iblt>(&bytes).is_err());
    }

    #[test]
    fn zero_cell_table_is_rejected() {
        // A cell-less table would divide by zero on the first bucket lookup.
        let mut encoder = Encoder::new();
        encoder.write_varint(2);
        encoder.write_u8(3);
        encoder.write_bool(false);
        encoder.write_u32_le(1);
        encoder.write_u32_le(FULL_MASK);
        encoder.write_varint(0);
        encoder.write_varint(0);
        assert!(decode::<Iblt>(&encoder.into_inner()).is_err());
    }
}
