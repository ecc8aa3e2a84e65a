use std::collections::HashMap;

use tessera_types::Fid;

use crate::tree::NodeKey;

#[derive(Debug)]
struct Slot {
    generation: u32,
    live: bool,
    current: Option<NodeKey>,
    /// Every node handle that currently maps to this slot.
    aliases: Vec<NodeKey>,
    claimed_in: Option<u64>,
}

/// Arena of identity slots plus a side table from node handle to slot.
///
/// The registry never owns host nodes; it only remembers their handles. A
/// slot's generation is bumped when its identity is retired, so a stale
/// [`Fid`] can never resolve to whatever reuses the slot later.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_node: HashMap<NodeKey, u32>,
    commit: u64,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of commit `commit`; claims are tracked per commit.
    pub fn begin_commit(&mut self, commit: u64) {
        self.commit = commit;
    }

    /// Returns the identity for `node`, carrying it over from `predecessor`
    /// when the host linked the two, minting a fresh one otherwise.
    pub fn identity_for(&mut self, node: NodeKey, predecessor: Option<NodeKey>) -> Fid {
        if let Some(fid) = self.claim(node, node) {
            return fid;
        }
        if let Some(pred) = predecessor.filter(|p| *p != node)
            && let Some(fid) = self.claim(pred, node)
        {
            self.unlink(pred, fid.slot());
            self.link(node, fid.slot());
            return fid;
        }
        let fid = self.mint(node);
        if let Some(pred) = predecessor.filter(|p| *p != node)
            && !self.by_node.contains_key(&pred)
        {
            self.link(pred, fid.slot());
        }
        fid
    }

    /// Claims the slot `handle` maps to on behalf of `claimant`, unless a
    /// different node already claimed it during this commit.
    fn claim(&mut self, handle: NodeKey, claimant: NodeKey) -> Option<Fid> {
        let index = *self.by_node.get(&handle)?;
        let commit = self.commit;
        let slot = &mut self.slots[index as usize];
        if !slot.live {
            return None;
        }
        if slot.claimed_in == Some(commit) && slot.current != Some(claimant) {
            return None;
        }
        slot.claimed_in = Some(commit);
        slot.current = Some(claimant);
        Some(Fid::new(index, slot.generation))
    }

    fn mint(&mut self, node: NodeKey) -> Fid {
        let commit = self.commit;
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.live = true;
                slot.current = Some(node);
                slot.claimed_in = Some(commit);
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    live: true,
                    current: Some(node),
                    aliases: Vec::new(),
                    claimed_in: Some(commit),
                });
                index
            }
        };
        self.link(node, index);
        Fid::new(index, self.slots[index as usize].generation)
    }

    fn link(&mut self, node: NodeKey, index: u32) {
        if let Some(previous) = self.by_node.insert(node, index)
            && previous != index
        {
            self.slots[previous as usize].aliases.retain(|n| *n != node);
        }
        let aliases = &mut self.slots[index as usize].aliases;
        if !aliases.contains(&node) {
            aliases.push(node);
        }
    }

    fn unlink(&mut self, node: NodeKey, index: u32) {
        if self.by_node.get(&node) == Some(&index) {
            self.by_node.remove(&node);
        }
        self.slots[index as usize].aliases.retain(|n| *n != node);
    }

    /// The identity `node` currently holds, without claiming anything.
    pub fn lookup(&self, node: NodeKey) -> Option<Fid> {
        let index = *self.by_node.get(&node)?;
        let slot = &self.slots[index as usize];
        slot.live.then(|| Fid::new(index, slot.generation))
    }

    /// The node most recently registered under `fid`. `None` means the
    /// component is no longer present.
    pub fn resolve(&self, fid: Fid) -> Option<NodeKey> {
        let slot = self.slots.get(fid.slot() as usize)?;
        if !slot.live || slot.generation != fid.generation() {
            return None;
        }
        slot.current
    }

    /// Retires `fid`; returns `false` if it was not live.
    pub fn retire(&mut self, fid: Fid) -> bool {
        let Some(slot) = self.slots.get_mut(fid.slot() as usize) else {
            return false;
        };
        if !slot.live || slot.generation != fid.generation() {
            return false;
        }
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.current = None;
        slot.claimed_in = None;
        for node in slot.aliases.drain(..) {
            self.by_node.remove(&node);
        }
        self.free.push(fid.slot());
        true
    }

    /// Retires every live identity. Used at session boundaries.
    pub fn reset(&mut self) {
        let live: Vec<Fid> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.live)
            .map(|(index, slot)| Fid::new(index as u32, slot.generation))
            .collect();
        for fid in live {
            self.retire(fid);
        }
        self.by_node.clear();
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.live).count()
    }
}
