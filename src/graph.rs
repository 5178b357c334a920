use std::collections::BTreeMap;

use crate::action::Action;
use crate::block_set::BlockSet;
use crate::error::{BuildError, SchedulingError};

/// One entry of the scheduled stream: an action by its index into the
/// original (unordered) action list, or a stash/free marker.
#[derive(Debug, Clone)]
pub enum ScheduleItem {
    Action(usize),
    Stash { id: u32, blocks: BlockSet },
    Free { id: u32 },
}

#[derive(Debug)]
pub struct ScheduleResult {
    pub items: Vec<ScheduleItem>,
    /// stash id -> (action index that owns the stashed read, stashed blocks)
    pub stash_table: BTreeMap<u32, (usize, BlockSet)>,
}

/// Orders an action list so that every MOVE/DIFF reads its source blocks
/// before some other action overwrites them, breaking unavoidable cycles by
/// stashing.
///
/// Edge `u -> v` holds iff `u.tgt_blocks` intersects `v.src_blocks`: u
/// overwrites blocks v must still read, so v must run before u. `prereqs[u]`
/// collects every such v along with the intersecting range, so `u`'s
/// remaining in-degree is the count of not-yet-scheduled entries in
/// `prereqs[u]`.
pub struct DependencyGraph<'a> {
    partition: &'a str,
    actions: &'a [Action],
}

impl<'a> DependencyGraph<'a> {
    pub fn new(partition: &'a str, actions: &'a [Action]) -> Self {
        DependencyGraph { partition, actions }
    }

    pub fn schedule(&self) -> Result<ScheduleResult, BuildError> {
        let n = self.actions.len();
        let mut prereqs: Vec<Vec<(usize, BlockSet)>> = vec![Vec::new(); n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for u in 0..n {
            for v in 0..n {
                if u == v {
                    continue;
                }
                let overlap = self.actions[u].tgt_blocks.intersect(&self.actions[v].src_blocks);
                if !overlap.is_empty() {
                    prereqs[u].push((v, overlap));
                    dependents[v].push(u);
                }
            }
        }

        let mut remaining: Vec<usize> = prereqs.iter().map(|p| p.len()).collect();
        let mut resolved: Vec<bool> = vec![false; n];
        let mut ready: Vec<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();

        let mut items = Vec::with_capacity(n);
        let mut stash_table = BTreeMap::new();
        let mut next_stash_id = 0u32;
        let mut done = 0usize;

        while done < n {
            if !ready.is_empty() {
                ready.sort_unstable();
                let idx = ready.remove(0);
                self.schedule_node(idx, &mut items, &dependents, &mut remaining, &mut resolved, &mut ready);
                done += 1;
                continue;
            }

            // Cycle: pick the unscheduled node whose remaining incoming
            // edges sum to the smallest block volume.
            let victim = (0..n)
                .filter(|&i| !resolved[i])
                .min_by_key(|&i| {
                    let volume: u64 = prereqs[i]
                        .iter()
                        .filter(|(v, _)| !resolved[*v])
                        .map(|(_, overlap)| overlap.size())
                        .sum();
                    (volume, i)
                })
                .ok_or_else(|| SchedulingError::UnresolvableCycle {
                    partition: self.partition.to_string(),
                })?;

            let mut stashed = BlockSet::empty();
            for (v, overlap) in &prereqs[victim] {
                if !resolved[*v] {
                    stashed = stashed.union(overlap);
                }
            }
            if stashed.is_empty() {
                return Err(SchedulingError::UnresolvableCycle {
                    partition: self.partition.to_string(),
                }
                .into());
            }

            let id = next_stash_id;
            next_stash_id += 1;
            log::debug!(
                "{}: stashing {} blocks (id {id}) to break a dependency cycle",
                self.partition,
                stashed.size()
            );
            items.push(ScheduleItem::Stash {
                id,
                blocks: stashed.clone(),
            });
            stash_table.insert(id, (victim, stashed));

            self.schedule_node(victim, &mut items, &dependents, &mut remaining, &mut resolved, &mut ready);
            done += 1;

            items.push(ScheduleItem::Free { id });
            log::debug!("{}: freed stash id {id}", self.partition);
        }

        Ok(ScheduleResult { items, stash_table })
    }

    fn schedule_node(
        &self,
        idx: usize,
        items: &mut Vec<ScheduleItem>,
        dependents: &[Vec<usize>],
        remaining: &mut [usize],
        resolved: &mut [bool],
        ready: &mut Vec<usize>,
    ) {
        items.push(ScheduleItem::Action(idx));
        resolved[idx] = true;
        for &w in &dependents[idx] {
            if resolved[w] {
                continue;
            }
            remaining[w] -= 1;
            if remaining[w] == 0 && !ready.contains(&w) {
                ready.push(w);
            }
        }
    }
}
