use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{BurrowDBError, BurrowDBResult};
use std::collections::{HashMap, LinkedList};

#[derive(Debug)]
struct LRUKNode {
    k: usize,
    // timestamps of the most recent k accesses, oldest first
    history: LinkedList<u64>,
    is_evictable: bool,
}

impl LRUKNode {
    fn new(k: usize) -> Self {
        Self {
            k,
            history: LinkedList::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64) {
        self.history.push_back(timestamp);
        if self.history.len() > self.k {
            self.history.pop_front();
        }
    }

    /// Oldest retained access. With a full history this is the k-th most
    /// recent access; with fewer than k accesses the backward k-distance is
    /// treated as infinite and this timestamp breaks ties.
    fn oldest_access(&self) -> u64 {
        *self.history.front().unwrap_or(&0)
    }

    fn has_full_history(&self) -> bool {
        self.history.len() >= self.k
    }
}

/// LRU-K replacement policy: the victim is the evictable frame with the
/// largest backward k-distance. Frames with fewer than k recorded accesses
/// count as infinitely distant and are preferred, oldest first.
#[derive(Debug)]
pub struct LRUKReplacer {
    // number of frames currently evictable
    current_size: usize,
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LRUKNode>,
    current_timestamp: u64,
}

impl LRUKReplacer {
    pub fn with_k(num_frames: usize, k: usize) -> Self {
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }

    fn check_frame_id(&self, frame_id: FrameId) -> BurrowDBResult<()> {
        if frame_id >= self.replacer_size {
            return Err(BurrowDBError::Internal(format!(
                "frame {} out of replacer range {}",
                frame_id, self.replacer_size
            )));
        }
        Ok(())
    }
}

impl Replacer for LRUKReplacer {
    fn new(capacity: usize) -> Self {
        Self::with_k(capacity, 2)
    }

    fn record_access(&mut self, frame_id: FrameId) -> BurrowDBResult<()> {
        self.check_frame_id(frame_id)?;
        let node = self
            .node_store
            .entry(frame_id)
            .or_insert_with(|| LRUKNode::new(self.k));
        node.record_access(self.current_timestamp);
        self.current_timestamp += 1;
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut victim: Option<FrameId> = None;
        let mut victim_inf = false;
        let mut victim_oldest = 0u64;

        for (frame_id, node) in self.node_store.iter() {
            if !node.is_evictable {
                continue;
            }
            let inf = !node.has_full_history();
            let oldest = node.oldest_access();
            let better = match (inf, victim_inf) {
                // infinite distance beats any finite one
                (true, false) => true,
                (false, true) => false,
                // within a tier the earliest oldest access wins
                _ => victim.is_none() || oldest < victim_oldest,
            };
            if better {
                victim = Some(*frame_id);
                victim_inf = inf;
                victim_oldest = oldest;
            }
        }

        if let Some(frame_id) = victim {
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
        victim
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> BurrowDBResult<()> {
        self.check_frame_id(frame_id)?;
        let Some(node) = self.node_store.get_mut(&frame_id) else {
            return Err(BurrowDBError::Internal(format!(
                "frame {} not tracked by replacer",
                frame_id
            )));
        };
        if set_evictable && !node.is_evictable {
            self.current_size += 1;
        } else if !set_evictable && node.is_evictable {
            self.current_size -= 1;
        }
        node.is_evictable = set_evictable;
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) -> BurrowDBResult<()> {
        let Some(node) = self.node_store.get(&frame_id) else {
            return Ok(());
        };
        if !node.is_evictable {
            return Err(BurrowDBError::Internal(format!(
                "frame {} is pinned and cannot be removed",
                frame_id
            )));
        }
        self.node_store.remove(&frame_id);
        self.current_size -= 1;
        Ok(())
    }

    fn size(&self) -> usize {
        self.current_size
    }
}
