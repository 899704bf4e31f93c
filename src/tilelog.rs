//! C3: the tile-backed Merkle tree itself (spec §4.3).
//!
//! [`TileLog`] owns the append path and the root/range-hash computations
//! that [`crate::proof`] builds proofs out of. Tile content is prefix-stable
//! — appending only ever extends a tile, never rewrites an earlier offset —
//! so every read here is safe to serve concurrently with writers as long as
//! the `size` passed in was observed from a point that already durably
//! committed the data it implies.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::LogError;
use crate::hash::{leaf_hash, node_hash, Hash};
use crate::metrics::ApiMetrics;
use crate::storage::BlobStore;
use crate::tile::{self, TileAddr};

/// Read access to committed node hashes, keyed by level and node index,
/// bounded by a tree size the caller already knows is durable.
///
/// This is the seam [`crate::proof`] depends on instead of `TileLog`
/// directly, so proof generation can be tested against a fake in-memory
/// reader without spinning up a `BlobStore`.
#[async_trait]
pub trait TileReader: Send + Sync {
    async fn node_hash(&self, level: u8, node_index: u64, size: u64) -> Result<Hash, LogError>;
}

/// The tile-backed log. Wraps a [`BlobStore`] and speaks in node hashes and
/// leaf preimages; has no opinion on entry metadata or COSE, which live in
/// [`crate::registrar`].
pub struct TileLog {
    blobs: Arc<dyn BlobStore>,
}

impl TileLog {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Append one leaf at position `old_size`, writing the entry tile, the
    /// level-0 hash tile, and every higher-level tile that completes as a
    /// result. Returns the new hash-tree root.
    ///
    /// `statement_hash` is the 32-byte `SHA-256(statement_bytes)` (spec
    /// §4.3): the entry tile stores this hash, never the raw statement
    /// bytes, and the Merkle leaf is `LeafHash(statement_hash)`.
    ///
    /// `old_size` must be the tree size immediately before this leaf, under
    /// the caller's serialization guarantee (spec §5: `MetaStore`'s write
    /// transaction holds this invariant, not this type).
    pub async fn append(&self, old_size: u64, statement_hash: &Hash) -> Result<Hash, LogError> {
        let new_size = old_size + 1;
        let leaf = leaf_hash(statement_hash);

        self.write_entries_tile(old_size, statement_hash).await?;
        self.write_node_tile(0, old_size, leaf).await?;

        // Every level `L` from 1 up to the number of trailing zero bits of
        // `new_size` completes a subtree as of this append: its two
        // children are durably written already, either from an earlier
        // append or from a lower level within this same call.
        let levels_completing = new_size.trailing_zeros();
        let mut current = leaf;
        for level in 1..=levels_completing {
            let node_index_below = old_size >> (level - 1);
            let sibling_index = node_index_below ^ 1;
            let sibling = self.read_node(level - 1, sibling_index, new_size).await?;
            current = if node_index_below % 2 == 0 {
                node_hash(&current, &sibling)
            } else {
                node_hash(&sibling, &current)
            };
            let parent_index = node_index_below >> 1;
            self.write_node_tile(level, parent_index << level, current).await?;
        }

        self.root_at(new_size).await
    }

    /// The root hash of the whole tree at the given size.
    pub async fn root_at(&self, size: u64) -> Result<Hash, LogError> {
        if size == 0 {
            return Ok(leaf_hash(b""));
        }
        self.root_of_range(0, size).await
    }

    /// The root hash of the subtree covering leaves `[lo, hi)`. Used both
    /// for the whole-tree root (`lo = 0`) and by [`crate::proof`] for
    /// sub-ranges during proof construction.
    pub async fn root_of_range(&self, lo: u64, hi: u64) -> Result<Hash, LogError> {
        debug_assert!(lo < hi);
        if hi - lo == 1 {
            return self.read_node(0, lo, hi).await;
        }
        // If [lo, hi) is itself a complete, tile-aligned subtree, its root
        // is stored directly and we avoid walking leaf-by-leaf.
        if let Some(level) = aligned_subtree_level(lo, hi) {
            return self.read_node(level, lo >> level, hi).await;
        }
        let k = crate::hash::split_point(hi - lo);
        let left = Box::pin(self.root_of_range(lo, lo + k)).await?;
        let right = Box::pin(self.root_of_range(lo + k, hi)).await?;
        Ok(node_hash(&left, &right))
    }

    async fn read_node(&self, level: u8, node_index: u64, size: u64) -> Result<Hash, LogError> {
        TileReader::node_hash(self, level, node_index, size).await
    }

    /// Writes the entry tile's slot for `position`: a flat 32-byte
    /// `statement_hash`, concatenated the same way node tiles pack hashes
    /// (spec §4.3: entry tiles hold "raw 32-byte statement hashes
    /// concatenated", not the submitted statement bytes themselves).
    async fn write_entries_tile(&self, position: u64, statement_hash: &Hash) -> Result<(), LogError> {
        let tile_index = position / tile::WIDTH;
        let offset = position % tile::WIDTH;
        self.write_hash_tile(TileAddr::entries(tile_index), offset, *statement_hash)
            .await
    }

    async fn write_node_tile(&self, level: u8, node_index: u64, hash: Hash) -> Result<(), LogError> {
        let (tile_index, offset) = tile::tile_coords(level, node_index);
        self.write_hash_tile(TileAddr::node(level, tile_index), offset, hash).await
    }

    async fn read_raw_hashes(&self, level: u8, tile_index: u64, width: u64) -> Result<Vec<Hash>, LogError> {
        self.read_raw_hashes_at(TileAddr::node(level, tile_index), width).await
    }

    /// Appends one 32-byte hash to the tile at `addr`'s slot `offset`,
    /// reading back whatever narrower tile already exists first. Shared by
    /// entry tiles and every level's node tiles — both are just
    /// concatenated 32-byte hashes, addressed differently.
    async fn write_hash_tile(&self, addr: TileAddr, offset: u64, hash: Hash) -> Result<(), LogError> {
        let new_width = offset + 1;
        let mut hashes = if offset == 0 {
            Vec::new()
        } else {
            self.read_raw_hashes_at(addr, offset).await?
        };
        hashes.push(hash);

        let mut buf = Vec::with_capacity(hashes.len() * tile::HASH_SIZE);
        for h in &hashes {
            buf.extend_from_slice(h);
        }
        self.blobs.put(&addr.blob_key(new_width), buf).await?;
        ApiMetrics::increment_tiles_written();
        Ok(())
    }

    async fn read_raw_hashes_at(&self, addr: TileAddr, width: u64) -> Result<Vec<Hash>, LogError> {
        let bytes = self.read_tile_at_width(addr, width).await?;
        decode_hashes(&bytes)
    }

    /// Read a tile's bytes, preferring the full-tile key and falling back to
    /// the exact partial-width key the caller expects to exist.
    async fn read_tile_at_width(&self, addr: TileAddr, width: u64) -> Result<Vec<u8>, LogError> {
        if width == tile::WIDTH {
            if let Ok(bytes) = self.blobs.get(&addr.blob_key(tile::WIDTH)).await {
                return Ok(bytes);
            }
        }
        self.blobs.get(&addr.blob_key(width)).await
    }

    /// Startup reconciliation (spec §4.6: "a reconciliation routine at
    /// startup may truncate [orphaned tiles]"). A crash between writing a
    /// tile and committing the `tree_size` that covers it leaves entries-tile
    /// bytes on the blob store past `committed_size`. Every reader is bounded
    /// by `committed_size` (`tile_width_at`), so this data is already inert;
    /// this only detects it and logs, rather than deleting it, since
    /// `BlobStore` has no delete and the next append to this position
    /// deterministically overwrites the same key anyway.
    pub async fn reconcile_orphaned_tiles(&self, committed_size: u64) -> Result<u64, LogError> {
        let tile_index = committed_size / tile::WIDTH;
        let offset = committed_size % tile::WIDTH;
        let addr = TileAddr::entries(tile_index);
        for width in (offset + 1..=tile::WIDTH).rev() {
            if self.blobs.exists(&addr.blob_key(width)).await? {
                return Ok(width - offset);
            }
        }
        Ok(0)
    }
}

#[async_trait]
impl TileReader for TileLog {
    async fn node_hash(&self, level: u8, node_index: u64, size: u64) -> Result<Hash, LogError> {
        let (tile_index, offset) = tile::tile_coords(level, node_index);
        let width = tile::tile_width_at(level, tile_index, size);
        if width == 0 || offset >= width {
            return Err(LogError::TileMissing {
                level,
                index: tile_index,
            });
        }
        let hashes = self.read_raw_hashes(level, tile_index, width).await?;
        hashes
            .get(offset as usize)
            .copied()
            .ok_or(LogError::TileMissing {
                level,
                index: tile_index,
            })
    }
}

/// If `[lo, hi)` is exactly the leaf range of one height-`level` subtree
/// (aligned and power-of-two width), return that level.
fn aligned_subtree_level(lo: u64, hi: u64) -> Option<u8> {
    let width = hi - lo;
    if !width.is_power_of_two() {
        return None;
    }
    let level = width.trailing_zeros() as u8;
    if lo % width == 0 {
        Some(level)
    } else {
        None
    }
}

fn decode_hashes(bytes: &[u8]) -> Result<Vec<Hash>, LogError> {
    if bytes.len() % tile::HASH_SIZE != 0 {
        return Err(LogError::Integrity(format!(
            "tile byte length {} is not a multiple of hash size",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(tile::HASH_SIZE)
        .map(|chunk| {
            let mut h = [0u8; 32];
            h.copy_from_slice(chunk);
            h
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob_fs::FsBlobStore;

    async fn log() -> (tempfile::TempDir, TileLog) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::open(dir.path()).await.unwrap();
        (dir, TileLog::new(Arc::new(blobs)))
    }

    /// Statements hash to their `statement_hash` the same way the registrar
    /// does, so tests exercise the real two-hash leaf formula
    /// (`LeafHash(SHA-256(statement_bytes))`) instead of hashing the raw
    /// bytes directly.
    fn statement_hashes(statements: &[Vec<u8>]) -> Vec<Hash> {
        statements.iter().map(|s| crate::hash::sha256(s)).collect()
    }

    #[tokio::test]
    async fn append_four_leaves_matches_manual_root() {
        let (_dir, log) = log().await;
        let statements = [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()];
        let hashes = statement_hashes(&statements);
        let mut size = 0;
        let mut last_root = [0u8; 32];
        for hash in &hashes {
            last_root = log.append(size, hash).await.unwrap();
            size += 1;
        }

        let h0 = leaf_hash(&hashes[0]);
        let h1 = leaf_hash(&hashes[1]);
        let h2 = leaf_hash(&hashes[2]);
        let h3 = leaf_hash(&hashes[3]);
        let expected = node_hash(&node_hash(&h0, &h1), &node_hash(&h2, &h3));
        assert_eq!(last_root, expected);
        assert_eq!(log.root_at(4).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn root_of_range_matches_incremental_root_for_odd_size() {
        let (_dir, log) = log().await;
        let statements: Vec<Vec<u8>> = (0..5).map(|i| format!("leaf-{i}").into_bytes()).collect();
        let statement_hashes = statement_hashes(&statements);
        let mut size = 0;
        let mut root = [0u8; 32];
        for hash in &statement_hashes {
            root = log.append(size, hash).await.unwrap();
            size += 1;
        }
        assert_eq!(log.root_at(5).await.unwrap(), root);

        // Manually fold 5 leaves per RFC 6962 shape: split_point(5) = 4.
        let hashes: Vec<Hash> = statement_hashes.iter().map(|h| leaf_hash(h)).collect();
        let left = node_hash(&node_hash(&hashes[0], &hashes[1]), &node_hash(&hashes[2], &hashes[3]));
        let right = hashes[4];
        let expected = node_hash(&left, &right);
        assert_eq!(root, expected);
    }

    #[tokio::test]
    async fn entries_tile_holds_flat_statement_hashes() {
        let (_dir, log) = log().await;
        let statements = [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let hashes = statement_hashes(&statements);
        let mut size = 0;
        for hash in &hashes {
            log.append(size, hash).await.unwrap();
            size += 1;
        }

        let addr = TileAddr::entries(0);
        let bytes = log.blobs.get(&addr.blob_key(3)).await.unwrap();
        assert_eq!(bytes.len(), 3 * tile::HASH_SIZE);
        for (i, hash) in hashes.iter().enumerate() {
            assert_eq!(&bytes[i * tile::HASH_SIZE..(i + 1) * tile::HASH_SIZE], hash);
        }
    }

    #[tokio::test]
    async fn reconcile_finds_nothing_when_disk_matches_committed_size() {
        let (_dir, log) = log().await;
        let hashes = statement_hashes(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let mut size = 0;
        for hash in &hashes {
            log.append(size, hash).await.unwrap();
            size += 1;
        }
        assert_eq!(log.reconcile_orphaned_tiles(size).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_detects_tile_bytes_written_past_committed_size() {
        let (_dir, log) = log().await;
        let hashes = statement_hashes(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        let mut size = 0;
        for hash in &hashes[..3] {
            log.append(size, hash).await.unwrap();
            size += 1;
        }
        // Simulate a crash after the 4th append's tile writes landed but
        // before `tree_size` advanced past 3.
        log.append(3, &hashes[3]).await.unwrap();
        assert_eq!(log.reconcile_orphaned_tiles(3).await.unwrap(), 1);
    }
}
