//! Append-only block store.
//!
//! `blocks.dat` holds `{length(u32 LE) || bincode block}` records;
//! `blocks.idx` holds fixed 48-byte `{height || offset || hash}` records.
//! Appends are serialized behind a write lock and follow the order
//! write-data, fsync, update in-memory index, append index record,
//! fsync. On startup the index file is preferred; a missing or torn
//! index is rebuilt by scanning the log, so the log alone is
//! authoritative after a crash.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::block::Block;
use crate::constants::storage::{DATA_FILE, INDEX_FILE, INDEX_RECORD_BYTES, MAX_RANGE};
use crate::error::{NodeError, NodeResult};
use crate::types::Hash256;

/// Outcome of [`BlockStore::validate_chain`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainCheck {
    pub ok: bool,
    pub first_bad_height: Option<u64>,
}

struct StoreInner {
    data: File,
    index: File,
    /// height -> byte offset of the length prefix in blocks.dat
    offsets: Vec<u64>,
    by_hash: HashMap<Hash256, u64>,
    /// transaction hash -> containing block height
    tx_heights: HashMap<Hash256, u64>,
    /// Next append position in blocks.dat
    write_pos: u64,
}

pub struct BlockStore {
    inner: RwLock<StoreInner>,
    data_path: PathBuf,
}

impl BlockStore {
    /// Open (or create) the store in `dir`, rebuilding the index from the
    /// log when the index file is absent or does not cover it.
    pub fn open<P: AsRef<Path>>(dir: P) -> NodeResult<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let data_path = dir.as_ref().join(DATA_FILE);
        let index_path = dir.as_ref().join(INDEX_FILE);

        let data = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&data_path)?;
        let mut index = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&index_path)?;

        let data_len = data.metadata()?.len();
        let mut inner = StoreInner {
            data,
            index,
            offsets: Vec::new(),
            by_hash: HashMap::new(),
            tx_heights: HashMap::new(),
            write_pos: data_len,
        };

        let loaded = Self::load_index(&mut inner, data_len);
        if !loaded {
            Self::rebuild_index(&mut inner, &data_path, &index_path)?;
        } else {
            // The index only carries header hashes; the tx lookup needs
            // one pass over the log either way.
            Self::build_tx_index(&mut inner, &data_path)?;
        }

        if !inner.offsets.is_empty() {
            info!(
                "📂 Block store opened at height {} ({} blocks)",
                inner.offsets.len() as u64 - 1,
                inner.offsets.len()
            );
        }

        Ok(Self {
            inner: RwLock::new(inner),
            data_path,
        })
    }

    /// Load `blocks.idx` if it is whole and consistent with the log
    /// length. Returns false when a rebuild is required.
    fn load_index(inner: &mut StoreInner, data_len: u64) -> bool {
        let mut raw = Vec::new();
        if inner.index.seek(SeekFrom::Start(0)).is_err()
            || inner.index.read_to_end(&mut raw).is_err()
        {
            return false;
        }
        if raw.is_empty() {
            return data_len == 0;
        }
        if raw.len() % INDEX_RECORD_BYTES != 0 {
            warn!("⚠️  Torn block index ({} bytes), rebuilding", raw.len());
            return false;
        }

        let mut offsets = Vec::new();
        let mut by_hash = HashMap::new();
        for (i, record) in raw.chunks_exact(INDEX_RECORD_BYTES).enumerate() {
            let height = u64::from_le_bytes(record[0..8].try_into().expect("8 bytes"));
            let offset = u64::from_le_bytes(record[8..16].try_into().expect("8 bytes"));
            if height != i as u64 || offset >= data_len {
                warn!("⚠️  Inconsistent index record at height {height}, rebuilding");
                return false;
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&record[16..48]);
            offsets.push(offset);
            by_hash.insert(hash, height);
        }

        // The index must cover the whole log: a crash between the data
        // fsync and the index append leaves a tail block only the log
        // knows about.
        if let Some(&last_offset) = offsets.last() {
            let covered = (|| -> std::io::Result<u64> {
                inner.data.seek(SeekFrom::Start(last_offset))?;
                let mut len_buf = [0u8; 4];
                inner.data.read_exact(&mut len_buf)?;
                Ok(last_offset + 4 + u32::from_le_bytes(len_buf) as u64)
            })();
            match covered {
                Ok(end) if end == data_len => {}
                _ => {
                    warn!("⚠️  Block log extends past the index, rebuilding");
                    return false;
                }
            }
        }

        inner.offsets = offsets;
        inner.by_hash = by_hash;
        true
    }

    /// Scan the log to reconstruct every index structure. A torn tail
    /// (partial final record after a crash) is truncated away.
    fn rebuild_index(
        inner: &mut StoreInner,
        data_path: &Path,
        index_path: &Path,
    ) -> NodeResult<()> {
        inner.offsets.clear();
        inner.by_hash.clear();
        inner.tx_heights.clear();

        let mut reader = File::open(data_path)?;
        let file_len = reader.metadata()?.len();
        let mut pos = 0u64;
        let mut index_records = Vec::new();

        while pos + 4 <= file_len {
            let mut len_buf = [0u8; 4];
            reader.seek(SeekFrom::Start(pos))?;
            if reader.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as u64;
            if pos + 4 + len > file_len {
                break;
            }
            let mut body = vec![0u8; len as usize];
            reader.read_exact(&mut body)?;
            let block: Block = match bincode::deserialize(&body) {
                Ok(b) => b,
                Err(e) => {
                    warn!("⚠️  Undecodable block at offset {pos}, truncating log: {e}");
                    break;
                }
            };
            if block.height != inner.offsets.len() as u64 {
                warn!(
                    "⚠️  Out-of-order block at offset {pos} (height {}), truncating log",
                    block.height
                );
                break;
            }

            let height = block.height;
            inner.offsets.push(pos);
            inner.by_hash.insert(block.hash, height);
            for tx in &block.transactions {
                inner.tx_heights.insert(tx.hash, height);
            }
            index_records.push((height, pos, block.hash));
            pos += 4 + len;
        }

        if pos < file_len {
            warn!(
                "✂️  Truncating {} torn byte(s) from block log",
                file_len - pos
            );
            let data = OpenOptions::new().write(true).open(data_path)?;
            data.set_len(pos)?;
        }
        inner.write_pos = pos;

        // Rewrite the index file to match exactly what survived.
        let mut index = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(index_path)?;
        for (height, offset, hash) in &index_records {
            index.write_all(&height.to_le_bytes())?;
            index.write_all(&offset.to_le_bytes())?;
            index.write_all(hash)?;
        }
        index.sync_data()?;
        inner.index = OpenOptions::new().read(true).append(true).open(index_path)?;

        if !index_records.is_empty() {
            info!("🔧 Rebuilt block index: {} record(s)", index_records.len());
        }
        Ok(())
    }

    fn build_tx_index(inner: &mut StoreInner, data_path: &Path) -> NodeResult<()> {
        let mut reader = File::open(data_path)?;
        for (height, offset) in inner.offsets.clone().iter().enumerate() {
            let block = Self::read_at(&mut reader, *offset)?;
            for tx in &block.transactions {
                inner.tx_heights.insert(tx.hash, height as u64);
            }
        }
        Ok(())
    }

    fn read_at(reader: &mut File, offset: u64) -> NodeResult<Block> {
        reader.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        Ok(bincode::deserialize(&body)?)
    }

    /// Append a block. The caller guarantees it was validated and
    /// applied; the store only enforces height continuity.
    pub fn add_block(&self, block: &Block) -> NodeResult<()> {
        let mut inner = self.inner.write();

        let expected = inner.offsets.len() as u64;
        if block.height != expected {
            return Err(NodeError::InvalidHeight {
                expected,
                got: block.height,
            });
        }

        let body = bincode::serialize(block)?;
        if body.len() > u32::MAX as usize {
            return Err(NodeError::InvalidStructure("block too large".to_string()));
        }

        let offset = inner.write_pos;
        inner.data.write_all(&(body.len() as u32).to_le_bytes())?;
        inner.data.write_all(&body)?;
        inner.data.sync_data()?;

        inner.write_pos = offset + 4 + body.len() as u64;
        inner.offsets.push(offset);
        inner.by_hash.insert(block.hash, block.height);
        for tx in &block.transactions {
            inner.tx_heights.insert(tx.hash, block.height);
        }

        let height = block.height;
        inner.index.write_all(&height.to_le_bytes())?;
        inner.index.write_all(&offset.to_le_bytes())?;
        inner.index.write_all(&block.hash)?;
        inner.index.sync_data()?;

        Ok(())
    }

    /// Number of stored blocks (tip height + 1).
    pub fn len(&self) -> u64 {
        self.inner.read().offsets.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Height of the chain tip, if any block is stored.
    pub fn tip_height(&self) -> Option<u64> {
        let len = self.len();
        (len > 0).then(|| len - 1)
    }

    pub fn get_by_height(&self, height: u64) -> NodeResult<Option<Block>> {
        let offset = {
            let inner = self.inner.read();
            match inner.offsets.get(height as usize) {
                Some(o) => *o,
                None => return Ok(None),
            }
        };
        // Readers open their own handle so they never contend with the
        // writer's append position.
        let mut reader = File::open(&self.data_path)?;
        Ok(Some(Self::read_at(&mut reader, offset)?))
    }

    pub fn get_by_hash(&self, hash: &Hash256) -> NodeResult<Option<Block>> {
        let height = {
            let inner = self.inner.read();
            match inner.by_hash.get(hash) {
                Some(h) => *h,
                None => return Ok(None),
            }
        };
        self.get_by_height(height)
    }

    /// Blocks in `[start, end]`, bounded to [`MAX_RANGE`] entries.
    pub fn get_range(&self, start: u64, end: u64) -> NodeResult<Vec<Block>> {
        if end < start {
            return Ok(Vec::new());
        }
        let capped_end = end.min(start + MAX_RANGE - 1);
        let mut blocks = Vec::new();
        for height in start..=capped_end {
            match self.get_by_height(height)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Transaction lookup across stored blocks.
    pub fn transaction_by_hash(
        &self,
        hash: &Hash256,
    ) -> NodeResult<Option<(crate::types::Transaction, u64)>> {
        let height = {
            let inner = self.inner.read();
            match inner.tx_heights.get(hash) {
                Some(h) => *h,
                None => return Ok(None),
            }
        };
        let Some(block) = self.get_by_height(height)? else {
            return Ok(None);
        };
        Ok(block
            .transactions
            .into_iter()
            .find(|tx| &tx.hash == hash)
            .map(|tx| (tx, height)))
    }

    /// Walk `[start, end]` verifying linkage, merkle roots, block hashes
    /// and proposer signatures. `proposer_key` resolves a validator
    /// address to its public key; genesis is exempt from the signature
    /// check because its parameters come from the genesis document.
    pub fn validate_chain<F>(&self, start: u64, end: u64, proposer_key: F) -> NodeResult<ChainCheck>
    where
        F: Fn(&str) -> Option<Vec<u8>>,
    {
        let mut prev: Option<Block> = if start > 0 {
            self.get_by_height(start - 1)?
        } else {
            None
        };

        for height in start..=end {
            let Some(block) = self.get_by_height(height)? else {
                return Ok(ChainCheck {
                    ok: false,
                    first_bad_height: Some(height),
                });
            };

            let bad = |_: &str| ChainCheck {
                ok: false,
                first_bad_height: Some(height),
            };

            if block.height != height {
                return Ok(bad("height"));
            }
            if let Some(prev) = &prev {
                if block.previous_hash != prev.hash {
                    return Ok(bad("parent"));
                }
            }
            if block.merkle_root != crate::block::merkle_root(&block.transactions) {
                return Ok(bad("merkle"));
            }
            if block.hash != block.compute_hash() {
                return Ok(bad("hash"));
            }
            if !block.is_genesis() {
                match proposer_key(&block.validator_address) {
                    Some(pk) if block.verify_signature(&pk) => {}
                    _ => return Ok(bad("signature")),
                }
            }
            prev = Some(block);
        }

        Ok(ChainCheck {
            ok: true,
            first_bad_height: None,
        })
    }

    /// Flush both files; called during shutdown.
    pub fn sync(&self) -> NodeResult<()> {
        let inner = self.inner.read();
        inner.data.sync_data()?;
        inner.index.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::types::{Transaction, ZERO_HASH};

    fn chain(kp: &Keypair, blocks: u64) -> Vec<Block> {
        let mut out = Vec::new();
        let mut prev_hash = ZERO_HASH;
        for height in 0..blocks {
            let txs = if height == 0 {
                vec![Transaction::coinbase(kp.address(), 101, 1_000)]
            } else {
                Vec::new()
            };
            let mut block = Block::new(
                height,
                prev_hash,
                1_000 + height * 1_000,
                txs,
                kp.address(),
                if height == 0 { 0 } else { 21 },
            );
            block.sign(kp);
            prev_hash = block.hash;
            out.push(block);
        }
        out
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let kp = Keypair::generate();

        for block in chain(&kp, 5) {
            store.add_block(&block).unwrap();
        }
        assert_eq!(store.len(), 5);
        assert_eq!(store.tip_height(), Some(4));

        let b3 = store.get_by_height(3).unwrap().unwrap();
        assert_eq!(b3.height, 3);
        assert_eq!(b3.hash, b3.compute_hash());

        let by_hash = store.get_by_hash(&b3.hash).unwrap().unwrap();
        assert_eq!(by_hash, b3);
        assert!(store.get_by_height(99).unwrap().is_none());
    }

    #[test]
    fn test_rejects_height_gap() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let kp = Keypair::generate();
        let blocks = chain(&kp, 3);

        store.add_block(&blocks[0]).unwrap();
        assert!(matches!(
            store.add_block(&blocks[2]).unwrap_err(),
            NodeError::InvalidHeight { expected: 1, got: 2 }
        ));
    }

    #[test]
    fn test_range_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let kp = Keypair::generate();
        for block in chain(&kp, 150) {
            store.add_block(&block).unwrap();
        }

        let range = store.get_range(0, 149).unwrap();
        assert_eq!(range.len(), MAX_RANGE as usize);
        assert_eq!(range[0].height, 0);
        assert_eq!(range.last().unwrap().height, MAX_RANGE - 1);

        assert!(store.get_range(10, 5).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let kp = Keypair::generate();
        let blocks = chain(&kp, 2);
        let coinbase_hash = blocks[0].transactions[0].hash;

        for block in &blocks {
            store.add_block(block).unwrap();
        }
        let (tx, height) = store.transaction_by_hash(&coinbase_hash).unwrap().unwrap();
        assert_eq!(height, 0);
        assert_eq!(tx.hash, coinbase_hash);
        assert!(store.transaction_by_hash(&[9u8; 32]).unwrap().is_none());
    }

    #[test]
    fn test_reopen_reuses_index() {
        let dir = tempfile::tempdir().unwrap();
        let kp = Keypair::generate();
        let blocks = chain(&kp, 10);
        let tip_hash = blocks.last().unwrap().hash;

        {
            let store = BlockStore::open(dir.path()).unwrap();
            for block in &blocks {
                store.add_block(block).unwrap();
            }
        }

        let store = BlockStore::open(dir.path()).unwrap();
        assert_eq!(store.tip_height(), Some(9));
        let tip = store.get_by_height(9).unwrap().unwrap();
        assert_eq!(tip.hash, tip_hash);
    }

    #[test]
    fn test_index_rebuilt_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let kp = Keypair::generate();
        let blocks = chain(&kp, 10);
        let tip_hash = blocks.last().unwrap().hash;
        let coinbase_hash = blocks[0].transactions[0].hash;

        {
            let store = BlockStore::open(dir.path()).unwrap();
            for block in &blocks {
                store.add_block(block).unwrap();
            }
        }
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        let store = BlockStore::open(dir.path()).unwrap();
        assert_eq!(store.tip_height(), Some(9));
        assert_eq!(store.get_by_height(9).unwrap().unwrap().hash, tip_hash);
        assert!(store.get_by_hash(&tip_hash).unwrap().is_some());
        assert!(store.transaction_by_hash(&coinbase_hash).unwrap().is_some());
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let kp = Keypair::generate();
        let blocks = chain(&kp, 3);

        {
            let store = BlockStore::open(dir.path()).unwrap();
            for block in &blocks {
                store.add_block(block).unwrap();
            }
        }
        // Simulate a crash mid-append: garbage half-record at the tail,
        // and a stale index.
        {
            let mut data = OpenOptions::new()
                .append(true)
                .open(dir.path().join(DATA_FILE))
                .unwrap();
            data.write_all(&[0xFF, 0xFF, 0xFF]).unwrap();
        }
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        let store = BlockStore::open(dir.path()).unwrap();
        assert_eq!(store.tip_height(), Some(2));
        // The store keeps working after truncation.
        let mut next = chain(&kp, 4).pop().unwrap();
        next.previous_hash = blocks[2].hash;
        next.hash = next.compute_hash();
        next.sign(&kp);
        store.add_block(&next).unwrap();
        assert_eq!(store.tip_height(), Some(3));
    }

    #[test]
    fn test_validate_chain_detects_relink() {
        let dir = tempfile::tempdir().unwrap();
        let kp = Keypair::generate();
        let pk = kp.public_bytes().to_vec();
        let blocks = chain(&kp, 5);

        let store = BlockStore::open(dir.path()).unwrap();
        for block in &blocks {
            store.add_block(block).unwrap();
        }

        let check = store
            .validate_chain(0, 4, |_| Some(pk.clone()))
            .unwrap();
        assert!(check.ok);
        assert_eq!(check.first_bad_height, None);

        // Unknown proposer key fails the signature leg.
        let check = store.validate_chain(1, 4, |_| None).unwrap();
        assert!(!check.ok);
        assert_eq!(check.first_bad_height, Some(1));

        let other = Keypair::generate();
        let check = store
            .validate_chain(0, 4, |_| Some(other.public_bytes().to_vec()))
            .unwrap();
        assert!(!check.ok);
    }
}
