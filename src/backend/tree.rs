//! Disk-backed history tree backend.
//!
//! Intervals accumulate in an in-memory "latest branch" of open nodes
//! (root to leaf). A node that runs out of room is sealed at the current
//! tree end and flushed; a fresh sibling starting one tick later takes
//! its place. When a parent reaches its child limit the split moves up a
//! level, and a full root is replaced by a new root over the old one. An
//! interval that starts before the current leaf's start is promoted to
//! the nearest open ancestor that covers it. Flushed nodes are never
//! rewritten, so the file is strictly append-only.
//!
//! Point queries descend from the root, at each level picking the single
//! child whose time range covers the requested timestamp, then scanning
//! that node's intervals. Node time ranges nest by construction, which
//! keeps the descent unambiguous. A small LRU cache of decoded nodes
//! absorbs temporally-local query bursts.

use crate::backend::node::{
    self, record_size, FileHeader, HtNode, FILE_HEADER_SIZE, NODE_HEADER_SIZE, NO_PARENT,
};
use crate::backend::HistoryBackend;
use crate::error::{Result, StateError};
use crate::types::{Interval, Quark, Timestamp};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// History tree configuration.
#[derive(Clone, Debug)]
pub struct TreeConfig {
    /// Path of the history file.
    pub path: PathBuf,

    /// On-disk node block size in bytes.
    pub block_size: usize,

    /// Maximum children per node before splits move up a level.
    pub max_children: usize,

    /// Number of decoded nodes kept in the read cache.
    pub cache_size: usize,
}

impl TreeConfig {
    /// Default node size; tuning parameter, not a semantic requirement.
    pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

    /// Default maximum children per node.
    pub const DEFAULT_MAX_CHILDREN: usize = 50;

    /// Default node cache capacity.
    pub const DEFAULT_CACHE_SIZE: usize = 256;

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_children: Self::DEFAULT_MAX_CHILDREN,
            cache_size: Self::DEFAULT_CACHE_SIZE,
        }
    }
}

/// Location and time range of a sealed node.
#[derive(Clone, Copy, Debug)]
struct NodeMeta {
    offset: u64,
    start: Timestamp,
    end: Timestamp,
}

/// Mutable tree state, guarded by one RwLock.
struct TreeState {
    /// Open nodes, root first, leaf last. Drained when building ends.
    branch: Vec<HtNode>,

    /// Sealed nodes by id.
    sealed: HashMap<u32, NodeMeta>,

    /// Sealed children per parent id, in seal order.
    children: HashMap<u32, Vec<u32>>,

    /// Sealed nodes with no parent present in the file: the final root
    /// after a clean close, or the surviving subtree roots after a
    /// truncated reopen. Ranges are pairwise disjoint.
    roots: Vec<u32>,

    next_node_id: u32,
    write_offset: u64,
    tree_end: Timestamp,
    max_quark: Option<Quark>,
    building: bool,
}

/// Disk-backed interval store.
pub struct HistoryTreeBackend {
    config: TreeConfig,
    start: Timestamp,
    file: Mutex<File>,
    state: RwLock<TreeState>,
    cache: Mutex<LruCache<u32, Arc<HtNode>>>,
}

impl HistoryTreeBackend {
    /// Create a new history file, starting the time range at `start`.
    pub fn create(config: TreeConfig, start: Timestamp) -> Result<Self> {
        if config.block_size <= NODE_HEADER_SIZE {
            return Err(StateError::InvalidFormat(format!(
                "block size {} too small",
                config.block_size
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&config.path)?;
        file.try_lock_exclusive().map_err(|_| StateError::Locked)?;

        let header = node::encode_file_header(
            config.block_size as u32,
            config.max_children as u32,
            start,
        );
        file.write_all(&header)?;

        debug!(path = %config.path.display(), start = %start, "created history file");

        let state = TreeState {
            branch: vec![HtNode::new(0, NO_PARENT, start)],
            sealed: HashMap::new(),
            children: HashMap::new(),
            roots: Vec::new(),
            next_node_id: 1,
            write_offset: FILE_HEADER_SIZE as u64,
            tree_end: start,
            max_quark: None,
            building: true,
        };

        Ok(Self {
            cache: Mutex::new(LruCache::new(cache_capacity(&config))),
            config,
            start,
            file: Mutex::new(file),
            state: RwLock::new(state),
        })
    }

    /// Open an existing history file.
    ///
    /// The complete prefix of node blocks is indexed; a partial block at
    /// the tail (a crash during a flush) is discarded and the file is
    /// trimmed back to the last complete node. The returned backend can
    /// serve queries over the recovered range and accept further inserts
    /// starting after it.
    pub fn open(config: TreeConfig) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&config.path)?;
        file.try_lock_exclusive().map_err(|_| StateError::Locked)?;

        let mut header = vec![0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut header).map_err(|_| {
            StateError::InvalidFormat("file shorter than header".into())
        })?;
        let FileHeader {
            block_size,
            max_children,
            start,
        } = node::decode_file_header(&header)?;

        let config = TreeConfig {
            block_size: block_size as usize,
            max_children: max_children as usize,
            ..config
        };

        let file_len = file.metadata()?.len();
        let node_region = file_len - FILE_HEADER_SIZE as u64;
        let complete = node_region / block_size as u64;
        let tail = node_region % block_size as u64;
        let data_end = FILE_HEADER_SIZE as u64 + complete * block_size as u64;

        if tail != 0 {
            // Truncated mid-node: recoverable. Keep the complete prefix.
            warn!(
                path = %config.path.display(),
                offset = data_end,
                discarded = tail,
                "history file truncated mid-node, resuming from last complete node"
            );
            file.set_len(data_end)?;
        }

        let mut sealed = HashMap::new();
        let mut parents = HashMap::new();
        let mut max_id_seen: i64 = -1;
        let mut tree_end = start;
        let mut max_quark: Option<Quark> = None;
        let mut block = vec![0u8; block_size as usize];
        for i in 0..complete {
            let offset = FILE_HEADER_SIZE as u64 + i * block_size as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut block)?;
            let decoded = HtNode::decode(&block)?;
            for iv in &decoded.intervals {
                if max_quark.map_or(true, |q| iv.quark > q) {
                    max_quark = Some(iv.quark);
                }
            }
            sealed.insert(
                decoded.node_id,
                NodeMeta {
                    offset,
                    start: decoded.start,
                    end: decoded.end,
                },
            );
            parents.insert(decoded.node_id, decoded.parent_id);
            max_id_seen = max_id_seen
                .max(decoded.node_id as i64)
                .max(decoded.parent_id as i64);
            if decoded.end > tree_end {
                tree_end = decoded.end;
            }
        }

        // Child links for nodes whose parent survived; the rest are the
        // forest roots the query descent starts from.
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut roots = Vec::new();
        for (&id, &parent) in &parents {
            if parent != NO_PARENT && sealed.contains_key(&(parent as u32)) {
                children.entry(parent as u32).or_default().push(id);
            } else {
                roots.push(id);
            }
        }
        for list in children.values_mut() {
            list.sort_unstable_by_key(|id| sealed[id].start);
        }
        roots.sort_unstable_by_key(|id| sealed[id].start);

        debug!(
            path = %config.path.display(),
            nodes = sealed.len(),
            roots = roots.len(),
            end = %tree_end,
            "opened history file"
        );

        // New inserts go to a fresh branch starting after the recovered
        // range; ids continue past every id referenced so far, so orphan
        // parent pointers can never collide with future nodes.
        let next_node_id = (max_id_seen + 1) as u32;
        let branch_start = if sealed.is_empty() {
            start
        } else {
            tree_end.next()
        };

        let state = TreeState {
            branch: vec![HtNode::new(next_node_id, NO_PARENT, branch_start)],
            sealed,
            children,
            roots,
            next_node_id: next_node_id + 1,
            write_offset: data_end,
            tree_end,
            max_quark,
            building: true,
        };

        Ok(Self {
            cache: Mutex::new(LruCache::new(cache_capacity(&config))),
            start,
            config,
            file: Mutex::new(file),
            state: RwLock::new(state),
        })
    }

    /// Number of node blocks flushed to disk so far.
    pub fn node_count(&self) -> usize {
        self.state.read().sealed.len()
    }

    /// Seal `node` at `end` and append its block to the file.
    fn seal_and_flush(&self, st: &mut TreeState, mut node: HtNode, end: Timestamp) -> Result<()> {
        node.seal(end);

        let block = node.encode(self.config.block_size)?;
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(st.write_offset))?;
            file.write_all(&block)?;
        }

        debug!(
            node_id = node.node_id,
            intervals = node.intervals.len(),
            start = %node.start,
            end = %node.end,
            "flushed node"
        );

        st.sealed.insert(
            node.node_id,
            NodeMeta {
                offset: st.write_offset,
                start: node.start,
                end: node.end,
            },
        );
        if node.parent_id == NO_PARENT {
            st.roots.push(node.node_id);
        } else {
            st.children
                .entry(node.parent_id as u32)
                .or_default()
                .push(node.node_id);
        }
        st.write_offset += self.config.block_size as u64;

        self.cache.lock().put(node.node_id, Arc::new(node));
        Ok(())
    }

    /// Replace the branch from `level` down with fresh siblings, sealing
    /// and flushing the old nodes at the current tree end.
    fn add_sibling(&self, st: &mut TreeState, level: usize) -> Result<()> {
        if level == 0 {
            return self.add_new_root(st);
        }
        if st.branch[level - 1].child_count as usize >= self.config.max_children {
            // Parent is full too; split one level higher instead.
            return self.add_sibling(st, level - 1);
        }

        let split = st.tree_end;
        let depth = st.branch.len();
        let old_tail: Vec<HtNode> = st.branch.drain(level..).collect();
        // Leaf first, so any file prefix ends on complete subtrees.
        for old in old_tail.into_iter().rev() {
            self.seal_and_flush(st, old, split)?;
        }

        for i in level..depth {
            let node_id = st.next_node_id;
            st.next_node_id += 1;
            let parent_id = st.branch[i - 1].node_id as i32;
            st.branch[i - 1].child_count += 1;
            st.branch.push(HtNode::new(node_id, parent_id, split.next()));
        }
        Ok(())
    }

    /// The root itself is full: put a new root above the whole branch.
    fn add_new_root(&self, st: &mut TreeState) -> Result<()> {
        let split = st.tree_end;
        let depth = st.branch.len();
        let root_start = st.branch[0].start;

        let new_root_id = st.next_node_id;
        st.next_node_id += 1;
        let mut new_root = HtNode::new(new_root_id, NO_PARENT, root_start);
        new_root.child_count = 1; // the old root

        st.branch[0].parent_id = new_root_id as i32;
        let old_branch: Vec<HtNode> = st.branch.drain(..).collect();
        st.branch.push(new_root);
        for old in old_branch.into_iter().rev() {
            self.seal_and_flush(st, old, split)?;
        }

        // Rebuild the open branch one level deeper.
        for i in 1..=depth {
            let node_id = st.next_node_id;
            st.next_node_id += 1;
            let parent_id = st.branch[i - 1].node_id as i32;
            st.branch[i - 1].child_count += 1;
            st.branch.push(HtNode::new(node_id, parent_id, split.next()));
        }
        Ok(())
    }

    /// Read a sealed node, going through the LRU cache.
    fn read_node(&self, st: &TreeState, node_id: u32) -> Result<Arc<HtNode>> {
        if let Some(cached) = self.cache.lock().get(&node_id) {
            return Ok(Arc::clone(cached));
        }

        let meta = st.sealed.get(&node_id).ok_or(StateError::CorruptNode {
            node_id,
            reason: "node id not present in file index".into(),
        })?;

        let mut block = vec![0u8; self.config.block_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(meta.offset))?;
            // An indexed node that can no longer be read whole means the
            // file shrank underneath us.
            file.read_exact(&mut block).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    StateError::Truncated(meta.offset)
                } else {
                    StateError::Io(e)
                }
            })?;
        }
        let decoded = HtNode::decode(&block)?;
        if decoded.node_id != node_id {
            return Err(StateError::CorruptNode {
                node_id,
                reason: format!("block self-describes as node {}", decoded.node_id),
            });
        }

        let decoded = Arc::new(decoded);
        self.cache.lock().put(node_id, Arc::clone(&decoded));
        Ok(decoded)
    }

    /// Descend a sealed subtree rooted at `top` looking for the interval
    /// covering `t` for `quark`.
    fn query_sealed(
        &self,
        st: &TreeState,
        top: u32,
        quark: Quark,
        t: Timestamp,
    ) -> Result<Option<Interval>> {
        let mut current = top;
        loop {
            let node = self.read_node(st, current)?;
            if let Some(found) = node.find(quark, t) {
                return Ok(Some(found.clone()));
            }
            let next = st.children.get(&current).and_then(|kids| {
                kids.iter()
                    .find(|&&id| {
                        let meta = &st.sealed[&id];
                        meta.start <= t && t <= meta.end
                    })
                    .copied()
            });
            match next {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
    }
}

impl HistoryBackend for HistoryTreeBackend {
    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        self.state.read().tree_end
    }

    fn max_quark(&self) -> Option<Quark> {
        self.state.read().max_quark
    }

    fn insert(&self, interval: Interval) -> Result<()> {
        let mut st = self.state.write();
        if !st.building {
            return Err(StateError::InvalidFormat(
                "insert into a closed history".into(),
            ));
        }
        if interval.start > interval.end {
            return Err(StateError::InvalidRange(interval.start, interval.end));
        }
        // After a truncated reopen, the open branch only covers times
        // past the recovered end; earlier data is already on disk.
        if interval.start < st.branch[0].start {
            return Err(StateError::TimeRangeOutOfBounds(
                interval.start,
                st.branch[0].start,
                st.tree_end,
            ));
        }
        if record_size(&interval) > self.config.block_size - NODE_HEADER_SIZE {
            return Err(StateError::InvalidFormat(format!(
                "interval record of {} bytes exceeds node capacity",
                record_size(&interval)
            )));
        }

        let mut level = st.branch.len() - 1;
        loop {
            if record_size(&interval) > st.branch[level].free_space(self.config.block_size) {
                self.add_sibling(&mut st, level)?;
                level = st.branch.len() - 1;
                continue;
            }
            if interval.start < st.branch[level].start {
                // Starts before this node: promote toward the root.
                level -= 1;
                continue;
            }
            if interval.end > st.tree_end {
                st.tree_end = interval.end;
            }
            if st.max_quark.map_or(true, |q| interval.quark > q) {
                st.max_quark = Some(interval.quark);
            }
            st.branch[level].add(interval);
            return Ok(());
        }
    }

    fn finish_building(&self, end: Timestamp) -> Result<()> {
        let mut st = self.state.write();
        if !st.building {
            return Ok(());
        }

        let end = end.max(st.tree_end);
        st.tree_end = end;

        let branch: Vec<HtNode> = st.branch.drain(..).collect();
        for node in branch.into_iter().rev() {
            if node.intervals.is_empty() && node.start > end {
                // Empty trailing node from a split right at the end;
                // nothing to store and its range would be inverted.
                continue;
            }
            self.seal_and_flush(&mut st, node, end)?;
        }
        st.building = false;

        self.file.lock().sync_all()?;
        debug!(end = %end, nodes = st.sealed.len(), "closed history tree");
        Ok(())
    }

    fn query_at(&self, quark: Quark, t: Timestamp) -> Result<Option<Interval>> {
        let st = self.state.read();

        // Open branch first: still-building nodes are only in memory.
        for node in &st.branch {
            if node.covers(t) {
                if let Some(found) = node.find(quark, t) {
                    return Ok(Some(found.clone()));
                }
            }
        }

        // Sealed subtrees hanging off the open branch, plus the forest
        // roots of a reopened file. Ranges are disjoint, so at most one
        // covers t.
        let top = st
            .branch
            .iter()
            .flat_map(|n| st.children.get(&n.node_id).into_iter().flatten())
            .chain(st.roots.iter())
            .find(|&&id| {
                let meta = &st.sealed[&id];
                meta.start <= t && t <= meta.end
            })
            .copied();

        match top {
            Some(top) => self.query_sealed(&st, top, quark, t),
            None => Ok(None),
        }
    }
}

fn cache_capacity(config: &TreeConfig) -> NonZeroUsize {
    NonZeroUsize::new(config.cache_size.max(1)).unwrap()
}
