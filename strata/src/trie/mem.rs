// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The bundled reference trie.
//!
//! A deliberately simple authenticated map: every entry is a leaf node
//! stored at `path = key` whose blob is the RLP pair `[key, value]`, and
//! a single root node at the empty path lists all `[key, leaf_hash]`
//! pairs in key order. The root hash therefore commits to every entry,
//! range proofs are the root node itself, and the empty trie hashes to
//! [EMPTY_ROOT].
//!
//! It trades compactness for transparency and exists to exercise the
//! database; real deployments supply a Merkle-Patricia or Verkle
//! implementation of the same traits.

use std::collections::BTreeMap;

use bytes::Bytes;
use rlp::{Rlp, RlpStream};

use super::{
    NodeIterator, NodeSource, OnStackNode, RangeProof, StackTrie, Trie, TrieLoader,
};
use crate::error::{Error, Result};
use crate::node::{Node, NodeSet};
use crate::types::{Hash, EMPTY_ROOT};

fn encode_leaf(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut stream = RlpStream::new_list(2);
    stream.append(&key).append(&value);
    stream.out().to_vec()
}

fn decode_leaf(blob: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let rlp = Rlp::new(blob);
    Ok((rlp.val_at(0)?, rlp.val_at(1)?))
}

fn encode_root<'a>(pairs: impl ExactSizeIterator<Item = (&'a Vec<u8>, &'a Hash)>) -> Vec<u8> {
    let mut stream = RlpStream::new_list(pairs.len());
    for (key, hash) in pairs {
        stream.begin_list(2).append(key).append(&hash.as_ref());
    }
    stream.out().to_vec()
}

fn decode_root(blob: &[u8]) -> Result<Vec<(Vec<u8>, Hash)>> {
    let rlp = Rlp::new(blob);
    let mut pairs = Vec::with_capacity(rlp.item_count()?);
    for item in rlp.iter() {
        let key: Vec<u8> = item.val_at(0)?;
        let hash: Vec<u8> = item.val_at(1)?;
        let hash = Hash::try_from(hash.as_slice())
            .map_err(|_| Error::Decode(rlp::DecoderError::Custom("bad leaf hash length")))?;
        pairs.push((key, hash));
    }
    Ok(pairs)
}

/// The reference trie over a [NodeSource].
pub struct MemTrie<'a> {
    owner: Hash,
    root: Hash,
    source: &'a dyn NodeSource,
    index: BTreeMap<Vec<u8>, Hash>,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> MemTrie<'a> {
    /// Opens the trie committed to by `root`, resolving nodes of `owner`
    /// through `source`. Fails with [Error::MissingTrie] when the root
    /// node cannot be resolved.
    pub fn open(owner: Hash, root: Hash, source: &'a dyn NodeSource) -> Result<Self> {
        let index = if root == *EMPTY_ROOT {
            BTreeMap::new()
        } else {
            let blob = source
                .node(&owner, &[], Some(&root))
                .map_err(|_| Error::MissingTrie { root })?;
            decode_root(&blob)?.into_iter().collect()
        };
        Ok(MemTrie {
            owner,
            root,
            source,
            index,
            overlay: BTreeMap::new(),
        })
    }

    fn read_leaf(&self, key: &[u8], hash: &Hash) -> Result<(Vec<u8>, Vec<u8>)> {
        let blob = self.source.node(&self.owner, key, Some(hash))?;
        if blob.is_empty() {
            return Err(Error::MissingNode {
                owner: self.owner,
                path: key.to_vec(),
            });
        }
        decode_leaf(&blob)
    }
}

impl Trie for MemTrie<'_> {
    fn root(&self) -> Hash {
        self.root
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.overlay.get(key) {
            return Ok(staged.clone());
        }
        match self.index.get(key) {
            Some(hash) => {
                let (_, value) = self.read_leaf(key, hash)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.overlay.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.overlay.insert(key.to_vec(), None);
        Ok(())
    }

    fn commit(&mut self) -> Result<(Hash, NodeSet)> {
        if self.overlay.is_empty() {
            return Ok((self.root, NodeSet::new()));
        }
        let mut set = NodeSet::new();
        for (key, staged) in std::mem::take(&mut self.overlay) {
            match staged {
                Some(value) => {
                    let node = Node::from_blob(Bytes::from(encode_leaf(&key, &value)));
                    self.index.insert(key.clone(), node.hash);
                    set.insert(self.owner, key, node);
                }
                None => {
                    if self.index.remove(&key).is_some() {
                        set.insert(self.owner, key, Node::deleted());
                    }
                }
            }
        }
        let new_root = if self.index.is_empty() {
            // only an existing root node leaves a deletion behind
            if self.root != *EMPTY_ROOT {
                set.insert(self.owner, Vec::new(), Node::deleted());
            }
            *EMPTY_ROOT
        } else {
            let blob = encode_root(self.index.iter());
            let node = Node::from_blob(Bytes::from(blob));
            let hash = node.hash;
            set.insert(self.owner, Vec::new(), node);
            hash
        };
        self.root = new_root;
        Ok((new_root, set))
    }

    fn node_iterator(&self, start: &[u8]) -> Result<Box<dyn NodeIterator + '_>> {
        let keys: Vec<(Vec<u8>, Hash)> = self
            .index
            .range(start.to_vec()..)
            .map(|(key, hash)| (key.clone(), *hash))
            .collect();
        let include_root = start.is_empty() && self.root != *EMPTY_ROOT;
        Ok(Box::new(MemNodeIterator {
            trie: self,
            keys,
            next_leaf: 0,
            root_pending: include_root,
            current: None,
        }))
    }

    fn range_proof(&self, _origin: &[u8], _last: &[u8]) -> Result<RangeProof> {
        let blob = encode_root(self.index.iter());
        Ok(RangeProof { nodes: vec![blob] })
    }
}

struct CurrentNode {
    path: Vec<u8>,
    hash: Hash,
    blob: Vec<u8>,
    leaf: Option<(Vec<u8>, Vec<u8>)>,
}

struct MemNodeIterator<'a, 'b> {
    trie: &'b MemTrie<'a>,
    keys: Vec<(Vec<u8>, Hash)>,
    next_leaf: usize,
    root_pending: bool,
    current: Option<CurrentNode>,
}

impl NodeIterator for MemNodeIterator<'_, '_> {
    fn next(&mut self) -> Result<bool> {
        if self.root_pending {
            self.root_pending = false;
            self.current = Some(CurrentNode {
                path: Vec::new(),
                hash: self.trie.root,
                blob: encode_root(self.trie.index.iter()),
                leaf: None,
            });
            return Ok(true);
        }
        let Some((key, hash)) = self.keys.get(self.next_leaf).cloned() else {
            self.current = None;
            return Ok(false);
        };
        self.next_leaf += 1;
        let (leaf_key, value) = self.trie.read_leaf(&key, &hash)?;
        self.current = Some(CurrentNode {
            path: key.clone(),
            hash,
            blob: encode_leaf(&leaf_key, &value),
            leaf: Some((leaf_key, value)),
        });
        Ok(true)
    }

    fn path(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |node| &node.path)
    }

    fn hash(&self) -> Hash {
        self.current.as_ref().map_or(Hash::ZERO, |node| node.hash)
    }

    fn blob(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |node| &node.blob)
    }

    fn leaf(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .and_then(|node| node.leaf.as_ref())
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }
}

/// Stack builder for the reference trie.
struct MemStackTrie<'a> {
    pairs: Vec<(Vec<u8>, Hash)>,
    on_node: OnStackNode<'a>,
}

impl StackTrie for MemStackTrie<'_> {
    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some((last, _)) = self.pairs.last() {
            if last.as_slice() >= key {
                return Err(Error::InvalidProof(
                    "stack trie keys not strictly ascending".to_string(),
                ));
            }
        }
        let blob = encode_leaf(key, value);
        let hash = Hash::of(&blob);
        (self.on_node)(&hash, &blob);
        self.pairs.push((key.to_vec(), hash));
        Ok(())
    }

    fn finish(&mut self) -> Hash {
        if self.pairs.is_empty() {
            return *EMPTY_ROOT;
        }
        let blob = encode_root(self.pairs.iter().map(|(key, hash)| (key, hash)));
        let hash = Hash::of(&blob);
        (self.on_node)(&hash, &blob);
        hash
    }
}

/// Loader facade of the reference trie.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemTrieLoader;

impl TrieLoader for MemTrieLoader {
    fn open<'a>(&self, root: &Hash, source: &'a dyn NodeSource) -> Result<Box<dyn Trie + 'a>> {
        Ok(Box::new(MemTrie::open(Hash::ZERO, *root, source)?))
    }

    fn open_storage<'a>(
        &self,
        owner: &Hash,
        root: &Hash,
        source: &'a dyn NodeSource,
    ) -> Result<Box<dyn Trie + 'a>> {
        Ok(Box::new(MemTrie::open(*owner, *root, source)?))
    }

    fn stack_trie<'a>(&self, on_node: OnStackNode<'a>) -> Box<dyn StackTrie + 'a> {
        Box::new(MemStackTrie {
            pairs: Vec::new(),
            on_node,
        })
    }

    fn verify_range_proof(
        &self,
        root: &Hash,
        origin: &[u8],
        keys: &[Vec<u8>],
        vals: &[Vec<u8>],
        proof: &RangeProof,
    ) -> Result<bool> {
        if keys.len() != vals.len() {
            return Err(Error::InvalidProof(format!(
                "{} keys but {} values",
                keys.len(),
                vals.len()
            )));
        }
        let blob = proof
            .nodes
            .iter()
            .find(|blob| Hash::of(blob) == *root)
            .ok_or_else(|| Error::InvalidProof("no proof node matches root".to_string()))?;
        let pairs = decode_root(blob)?;
        let segment: Vec<_> = pairs
            .into_iter()
            .filter(|(key, _)| key.as_slice() >= origin)
            .collect();
        if keys.is_empty() {
            return if segment.is_empty() {
                Ok(false)
            } else {
                Err(Error::InvalidProof(
                    "trie holds entries the flat range misses".to_string(),
                ))
            };
        }
        if segment.len() < keys.len() {
            return Err(Error::InvalidProof(
                "flat range holds more entries than the trie".to_string(),
            ));
        }
        for (i, (key, value)) in keys.iter().zip(vals).enumerate() {
            if i > 0 && keys[i - 1].as_slice() >= key.as_slice() {
                return Err(Error::InvalidProof(
                    "range keys not strictly ascending".to_string(),
                ));
            }
            let (trie_key, trie_hash) = &segment[i];
            if trie_key != key {
                return Err(Error::InvalidProof(format!(
                    "key mismatch at position {i}"
                )));
            }
            if Hash::of(&encode_leaf(key, value)) != *trie_hash {
                return Err(Error::InvalidProof(format!(
                    "value mismatch at position {i}"
                )));
            }
        }
        Ok(segment.len() > keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::StoreNodeSource;
    use strata_storage::{schema, MemDb};

    /// Persists a dirty node set the way a buffer flush would.
    fn write_nodes(db: &MemDb, set: &NodeSet) {
        for (owner, subset) in set.iter() {
            for (path, node) in subset {
                if owner.is_zero() {
                    if node.is_deleted() {
                        schema::delete_account_trie_node(db, path).unwrap();
                    } else {
                        schema::write_account_trie_node(db, path, &node.blob).unwrap();
                    }
                } else if node.is_deleted() {
                    schema::delete_storage_trie_node(db, owner.as_ref(), path).unwrap();
                } else {
                    schema::write_storage_trie_node(db, owner.as_ref(), path, &node.blob).unwrap();
                }
            }
        }
    }

    fn seeded(db: &MemDb, entries: &[(&[u8], &[u8])]) -> Hash {
        let source = StoreNodeSource::new(db);
        let mut trie = MemTrie::open(Hash::ZERO, *EMPTY_ROOT, &source).unwrap();
        for (key, value) in entries {
            trie.put(key, value.to_vec()).unwrap();
        }
        let (root, set) = trie.commit().unwrap();
        write_nodes(db, &set);
        root
    }

    #[test]
    fn test_put_commit_get() {
        let db = MemDb::new();
        let root = seeded(&db, &[(b"aa", b"1"), (b"bb", b"2")]);

        let source = StoreNodeSource::new(&db);
        let trie = MemTrie::open(Hash::ZERO, root, &source).unwrap();
        assert_eq!(trie.get(b"aa").unwrap(), Some(b"1".to_vec()));
        assert_eq!(trie.get(b"bb").unwrap(), Some(b"2".to_vec()));
        assert_eq!(trie.get(b"cc").unwrap(), None);
    }

    #[test]
    fn test_delete_to_empty() {
        let db = MemDb::new();
        let root = seeded(&db, &[(b"aa", b"1")]);

        let source = StoreNodeSource::new(&db);
        let mut trie = MemTrie::open(Hash::ZERO, root, &source).unwrap();
        trie.delete(b"aa").unwrap();
        let (root, set) = trie.commit().unwrap();
        assert_eq!(root, *EMPTY_ROOT);
        assert!(set.get(&Hash::ZERO, b"aa").unwrap().is_deleted());
        assert!(set.get(&Hash::ZERO, &[]).unwrap().is_deleted());
    }

    #[test]
    fn test_missing_trie() {
        let db = MemDb::new();
        let source = StoreNodeSource::new(&db);
        let missing = Hash::of(b"nowhere");
        assert!(matches!(
            MemTrie::open(Hash::ZERO, missing, &source),
            Err(Error::MissingTrie { root }) if root == missing
        ));
    }

    #[test]
    fn test_iterator_order() {
        let db = MemDb::new();
        let root = seeded(&db, &[(b"cc", b"3"), (b"aa", b"1"), (b"bb", b"2")]);

        let source = StoreNodeSource::new(&db);
        let trie = MemTrie::open(Hash::ZERO, root, &source).unwrap();
        let mut iter = trie.node_iterator(&[]).unwrap();

        // root node comes first, then leaves in key order
        assert!(iter.next().unwrap());
        assert_eq!(iter.hash(), root);
        assert!(iter.leaf().is_none());

        let mut leaves = Vec::new();
        while iter.next().unwrap() {
            let (key, value) = iter.leaf().unwrap();
            leaves.push((key.to_vec(), value.to_vec()));
        }
        assert_eq!(
            leaves,
            vec![
                (b"aa".to_vec(), b"1".to_vec()),
                (b"bb".to_vec(), b"2".to_vec()),
                (b"cc".to_vec(), b"3".to_vec()),
            ]
        );

        // resuming mid-way skips the root node
        let mut iter = trie.node_iterator(b"bb").unwrap();
        assert!(iter.next().unwrap());
        assert_eq!(iter.leaf().unwrap().0, b"bb");
    }

    #[test]
    fn test_range_proof_verification() {
        let db = MemDb::new();
        let root = seeded(&db, &[(b"aa", b"1"), (b"bb", b"2"), (b"cc", b"3")]);

        let source = StoreNodeSource::new(&db);
        let trie = MemTrie::open(Hash::ZERO, root, &source).unwrap();
        let loader = MemTrieLoader;

        let proof = trie.range_proof(b"aa", b"bb").unwrap();
        let keys = vec![b"aa".to_vec(), b"bb".to_vec()];
        let vals = vec![b"1".to_vec(), b"2".to_vec()];
        let cont = loader
            .verify_range_proof(&root, b"aa", &keys, &vals, &proof)
            .unwrap();
        assert!(cont, "one more entry follows the range");

        let tail_keys = vec![b"cc".to_vec()];
        let tail_vals = vec![b"3".to_vec()];
        let cont = loader
            .verify_range_proof(&root, b"bc", &tail_keys, &tail_vals, &proof)
            .unwrap();
        assert!(!cont);

        // a wrong value must fail
        let bad_vals = vec![b"1".to_vec(), b"9".to_vec()];
        assert!(loader
            .verify_range_proof(&root, b"aa", &keys, &bad_vals, &proof)
            .is_err());

        // a missing entry must fail
        let short_keys = vec![b"aa".to_vec()];
        let short_vals = vec![b"1".to_vec()];
        assert!(loader
            .verify_range_proof(&root, b"aa", &short_keys, &short_vals, &proof)
            .is_err());

        // an empty flat range over a populated trie must fail
        assert!(loader
            .verify_range_proof(&root, b"aa", &[], &[], &proof)
            .is_err());
    }

    #[test]
    fn test_stack_trie_matches_commit() {
        let db = MemDb::new();
        let entries: Vec<(&[u8], &[u8])> = vec![(b"aa", b"1"), (b"bb", b"2"), (b"cc", b"3")];
        let root = seeded(&db, &entries);

        let mut hashes = Vec::new();
        let loader = MemTrieLoader;
        let mut stack = loader.stack_trie(Box::new(|hash, _blob| hashes.push(*hash)));
        for (key, value) in &entries {
            stack.update(key, value).unwrap();
        }
        let stack_root = stack.finish();
        drop(stack);

        assert_eq!(stack_root, root);
        // three leaves plus the root node
        assert_eq!(hashes.len(), 4);
        assert!(hashes.contains(&root));

        // out-of-order feeding is rejected
        let mut stack = loader.stack_trie(Box::new(|_, _| {}));
        stack.update(b"bb", b"2").unwrap();
        assert!(stack.update(b"aa", b"1").is_err());
    }
}
