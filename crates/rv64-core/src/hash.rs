//! Keccak-256 leaf hashing and the binary-Merkle tree over machine state.
//!
//! The tree spans the full 64-bit physical address space. Every 8-byte aligned
//! word is a leaf; internal node hashes are `keccak256(left || right)`. Most of
//! the address space is unbacked by any [`crate::pma::PmaTable`] entry, so a
//! table of "pristine" hashes (the hash of an all-zero subtree at each size) is
//! precomputed once and substituted wherever a range has no PMA overlap at all,
//! avoiding the need to materialize zero-filled subtrees.
use crate::pma::PmaTable;
use crate::primitives::constants::{LOG2_ROOT_SIZE, LOG2_WORD_SIZE};
use sha3::{Digest, Keccak256};

/// Anything the Merkle walk can read an 8-byte word out of. [`PmaTable`]
/// implements this directly for memory-only state (devices read back as
/// zero); [`crate::machine::Machine`] implements it by routing device
/// ranges through the owning driver's `peek`, so the hash reflects the same
/// side-effect-free projection a proof must show.
pub trait AddressSpace {
    fn overlaps_any(&self, addr: u64, size: u64) -> bool;
    fn peek_word(&self, addr: u64) -> [u8; 8];
}

impl AddressSpace for PmaTable {
    fn overlaps_any(&self, addr: u64, size: u64) -> bool {
        PmaTable::overlaps_any(self, addr, size)
    }

    fn peek_word(&self, addr: u64) -> [u8; 8] {
        self.read_memory_word(addr).unwrap_or([0u8; 8])
    }
}

/// A 32-byte Keccak-256 digest.
pub type Hash = [u8; 32];

/// `keccak256(bytes)`, the leaf/node hash primitive the rest of the crate is
/// built on.
pub fn keccak256(bytes: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn hash_node(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    keccak256(&buf)
}

/// Precomputed hash of an all-zero subtree at every power-of-two size from a
/// single word up to the whole address space.
pub struct PristineHashes {
    /// `table[k]` is the hash of a zero-filled subtree of size `2^(k + LOG2_WORD_SIZE)`.
    table: Vec<Hash>,
}

impl PristineHashes {
    pub fn new() -> Self {
        let levels = (LOG2_ROOT_SIZE - LOG2_WORD_SIZE) as usize;
        let mut table = Vec::with_capacity(levels + 1);
        table.push(keccak256(&[0u8; 8]));
        for _ in 0..levels {
            let prev = *table.last().unwrap();
            table.push(hash_node(&prev, &prev));
        }
        Self { table }
    }

    /// Hash of an all-zero subtree of size `2^log2_size`.
    pub fn get(&self, log2_size: u32) -> Hash {
        self.table[(log2_size - LOG2_WORD_SIZE) as usize]
    }
}

impl Default for PristineHashes {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash of the subtree of size `2^log2_size` rooted at `addr` (which must be
/// aligned to that size). Short-circuits to the pristine hash for any range
/// the address space does not back at all.
pub fn subtree_hash<A: AddressSpace + ?Sized>(
    space: &A,
    addr: u64,
    log2_size: u32,
    pristine: &PristineHashes,
) -> Hash {
    if log2_size == LOG2_WORD_SIZE {
        return keccak256(&space.peek_word(addr));
    }
    let size = 1u64 << log2_size;
    if !space.overlaps_any(addr, size) {
        return pristine.get(log2_size);
    }
    let half = log2_size - 1;
    let mid = addr + (1u64 << half);
    let left = subtree_hash(space, addr, half, pristine);
    let right = subtree_hash(space, mid, half, pristine);
    hash_node(&left, &right)
}

/// Root hash of the entire machine state.
pub fn root_hash<A: AddressSpace + ?Sized>(space: &A) -> Hash {
    let pristine = PristineHashes::new();
    subtree_hash(space, 0, LOG2_ROOT_SIZE, &pristine)
}

fn subtree_hash_with_proof<A: AddressSpace + ?Sized>(
    space: &A,
    addr: u64,
    log2_size: u32,
    target_addr: u64,
    target_log2: u32,
    pristine: &PristineHashes,
    siblings: &mut Vec<Hash>,
) -> Hash {
    if log2_size == target_log2 {
        return subtree_hash(space, addr, log2_size, pristine);
    }
    let half = log2_size - 1;
    let mid = addr + (1u64 << half);
    if target_addr < mid {
        let left =
            subtree_hash_with_proof(space, addr, half, target_addr, target_log2, pristine, siblings);
        let right = subtree_hash(space, mid, half, pristine);
        siblings.push(right);
        hash_node(&left, &right)
    } else {
        let left = subtree_hash(space, addr, half, pristine);
        let right =
            subtree_hash_with_proof(space, mid, half, target_addr, target_log2, pristine, siblings);
        siblings.push(left);
        hash_node(&left, &right)
    }
}

/// A Merkle inclusion proof of one target range against a machine's root hash.
///
/// `sibling_hashes` is ordered from leaf-adjacent to root-adjacent, matching
/// the Merkle proof wire format.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MerkleProof {
    pub log2_root_size: u32,
    pub log2_target_size: u32,
    pub target_address: u64,
    pub root_hash: Hash,
    pub target_hash: Hash,
    pub sibling_hashes: Vec<Hash>,
}

impl MerkleProof {
    /// Builds a proof of the `2^log2_size` range at `addr` against `space`'s current state.
    pub fn new<A: AddressSpace + ?Sized>(space: &A, addr: u64, log2_size: u32) -> Self {
        let pristine = PristineHashes::new();
        let mut siblings = Vec::with_capacity((LOG2_ROOT_SIZE - log2_size) as usize);
        let target_hash = subtree_hash_with_proof(
            space,
            0,
            LOG2_ROOT_SIZE,
            addr,
            log2_size,
            &pristine,
            &mut siblings,
        );
        let root = root_hash(space);
        Self {
            log2_root_size: LOG2_ROOT_SIZE,
            log2_target_size: log2_size,
            target_address: addr,
            root_hash: root,
            target_hash,
            sibling_hashes: siblings,
        }
    }

    /// Recomputes the root from `target_hash` and `sibling_hashes` and checks
    /// it against the embedded `root_hash`.
    pub fn is_consistent(&self) -> bool {
        if self.sibling_hashes.len() != (self.log2_root_size - self.log2_target_size) as usize {
            return false;
        }
        let mut hash = self.target_hash;
        let mut addr = self.target_address;
        let mut log2_size = self.log2_target_size;
        for sibling in &self.sibling_hashes {
            let bit = (addr >> log2_size) & 1;
            hash = if bit == 0 {
                hash_node(&hash, sibling)
            } else {
                hash_node(sibling, &hash)
            };
            addr &= !(1u64 << log2_size);
            log2_size += 1;
        }
        hash == self.root_hash
    }

    /// Climbs `sibling_hashes` from `new_target_hash` instead of `target_hash`,
    /// returning the root that results from replacing the target leaf/subtree
    /// with `new_target_hash` without re-walking the tree. This is how replay
    /// advances its running root hash after a logged write, mirroring
    /// `merkle_tree_proof::bubble_up` in the source.
    pub fn bubble_up(&self, new_target_hash: Hash) -> Hash {
        let mut hash = new_target_hash;
        let mut addr = self.target_address;
        let mut log2_size = self.log2_target_size;
        for sibling in &self.sibling_hashes {
            let bit = (addr >> log2_size) & 1;
            hash = if bit == 0 {
                hash_node(&hash, sibling)
            } else {
                hash_node(sibling, &hash)
            };
            addr &= !(1u64 << log2_size);
            log2_size += 1;
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pma::{PmaFlags, PmaTable};

    #[test]
    fn pristine_hashes_chain_correctly() {
        let pristine = PristineHashes::new();
        let word = pristine.get(LOG2_WORD_SIZE);
        assert_eq!(word, keccak256(&[0u8; 8]));
        let next = pristine.get(LOG2_WORD_SIZE + 1);
        assert_eq!(next, hash_node(&word, &word));
    }

    #[test]
    fn empty_table_root_is_pristine_root() {
        let pmas = PmaTable::new();
        let pristine = PristineHashes::new();
        assert_eq!(root_hash(&pmas), pristine.get(LOG2_ROOT_SIZE));
    }

    #[test]
    fn proof_of_written_word_is_consistent() {
        let mut pmas = PmaTable::new();
        pmas.add_memory(0x8000_0000, 0x1000, PmaFlags::ram()).unwrap();
        pmas.write_memory_word(0x8000_0008, &42u64.to_le_bytes())
            .unwrap();
        let proof = MerkleProof::new(&pmas, 0x8000_0008, LOG2_WORD_SIZE);
        assert!(proof.is_consistent());
        assert_eq!(proof.target_hash, keccak256(&42u64.to_le_bytes()));
    }

    #[test]
    fn bubble_up_matches_a_real_write_then_reproof() {
        let mut pmas = PmaTable::new();
        pmas.add_memory(0x8000_0000, 0x1000, PmaFlags::ram()).unwrap();
        let proof_before = MerkleProof::new(&pmas, 0x8000_0008, LOG2_WORD_SIZE);
        pmas.write_memory_word(0x8000_0008, &99u64.to_le_bytes()).unwrap();
        let new_leaf_hash = keccak256(&99u64.to_le_bytes());
        let bubbled = proof_before.bubble_up(new_leaf_hash);
        assert_eq!(bubbled, root_hash(&pmas));
    }

    #[test]
    fn proof_idempotent_without_mutation() {
        let pmas = PmaTable::new();
        let a = root_hash(&pmas);
        let b = root_hash(&pmas);
        assert_eq!(a, b);
    }
}
