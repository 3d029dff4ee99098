//! Static task graph for tiled multi-pass filters.
//!
//! Tasks are `(pass, tile)` pairs. Edges come from the buffer slots each
//! pass reads and writes: a tile depends on the neighbouring tiles of the
//! last writer of every slot it reads, and a write waits for the earlier
//! readers and writer of that slot in the neighbourhood. Scheduling is a
//! deterministic Kahn sort that always releases the lowest task id first.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use crate::region::Rect;

/// A buffer a pass reads or writes. Passes that alias the same memory use
/// the same slot.
pub type Slot = u32;

/// Access pattern of one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassAccess {
    pub reads: Vec<Slot>,
    pub writes: Slot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Task {
    pub pass: usize,
    pub tile: usize,
}

#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    /// Incoming edges per task.
    deps: Vec<BTreeSet<usize>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, pass: usize, tile: usize) -> usize {
        self.tasks.push(Task { pass, tile });
        self.deps.push(BTreeSet::new());
        self.tasks.len() - 1
    }

    /// `task` may only start after `on` finished.
    pub fn add_dependency(&mut self, task: usize, on: usize) {
        if task != on {
            self.deps[task].insert(on);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: usize) -> Task {
        self.tasks[id]
    }

    pub fn dependencies(&self, id: usize) -> impl Iterator<Item = usize> + '_ {
        self.deps[id].iter().copied()
    }

    /// Build the graph of `passes` over `tiles`. Tiles are neighbours when
    /// they touch (the 3x3 neighbourhood on a regular grid).
    pub fn for_tiled_passes(passes: &[PassAccess], tiles: &[Rect]) -> Self {
        let neighbours: Vec<Vec<usize>> = tiles
            .iter()
            .map(|a| (0..tiles.len()).filter(|&j| touches(a, &tiles[j])).collect())
            .collect();

        let mut graph = Self::new();
        let ids: Vec<Vec<usize>> = (0..passes.len())
            .map(|p| (0..tiles.len()).map(|t| graph.add_task(p, t)).collect())
            .collect();

        for (p, access) in passes.iter().enumerate() {
            let mut earlier = Vec::new();
            let mut add = |earlier: &mut Vec<usize>, q: usize| {
                if !earlier.contains(&q) {
                    earlier.push(q);
                }
            };
            for &slot in &access.reads {
                // Read after write
                if let Some(q) = (0..p).rev().find(|&q| passes[q].writes == slot) {
                    add(&mut earlier, q);
                }
            }
            let last_write = (0..p).rev().find(|&q| passes[q].writes == access.writes);
            if let Some(q) = last_write {
                // Write after write
                add(&mut earlier, q);
            }
            // Write after read, for readers since the last write
            let since = last_write.map_or(0, |q| q + 1);
            for q in since..p {
                if passes[q].reads.contains(&access.writes) {
                    add(&mut earlier, q);
                }
            }

            for t in 0..tiles.len() {
                for &q in &earlier {
                    for &n in &neighbours[t] {
                        graph.add_dependency(ids[p][t], ids[q][n]);
                    }
                }
            }
        }
        graph
    }

    /// Kahn's algorithm, lowest ready id first. `None` on a cycle.
    pub fn topological_order(&self) -> Option<Vec<usize>> {
        let n = self.tasks.len();
        let mut indegree: Vec<usize> = self.deps.iter().map(BTreeSet::len).collect();
        let mut dependents = vec![Vec::new(); n];
        for (task, deps) in self.deps.iter().enumerate() {
            for &d in deps {
                dependents[d].push(task);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..n).filter(|&i| indegree[i] == 0).map(Reverse).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }
        (order.len() == n).then_some(order)
    }

    /// Group tasks into levels whose members are independent of each other.
    pub fn levels(&self) -> Option<Vec<Vec<usize>>> {
        let order = self.topological_order()?;
        let mut level = vec![0usize; self.tasks.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();
        for i in order {
            let l = self.deps[i].iter().map(|&d| level[d] + 1).max().unwrap_or(0);
            level[i] = l;
            if levels.len() <= l {
                levels.resize_with(l + 1, Vec::new);
            }
            levels[l].push(i);
        }
        for l in &mut levels {
            l.sort_unstable();
        }
        Some(levels)
    }
}

/// True when `a` and `b` overlap or share an edge or corner.
fn touches(a: &Rect, b: &Rect) -> bool {
    let ax0 = a.x as i64 - 1;
    let ay0 = a.y as i64 - 1;
    let ax1 = (a.x + a.w) as i64 + 1;
    let ay1 = (a.y + a.h) as i64 + 1;
    (b.x as i64) < ax1 && ax0 < (b.x + b.w) as i64 && (b.y as i64) < ay1 && ay0 < (b.y + b.h) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: u32, size: u32) -> Vec<Rect> {
        (0..n)
            .flat_map(|y| (0..n).map(move |x| Rect::new(x * size, y * size, size, size)))
            .collect()
    }

    #[test]
    fn test_kahn_prefers_lowest_id() {
        let mut g = TaskGraph::new();
        for _ in 0..4 {
            g.add_task(0, 0);
        }
        g.add_dependency(0, 3);
        g.add_dependency(1, 3);
        assert_eq!(g.topological_order(), Some(vec![2, 3, 0, 1]));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut g = TaskGraph::new();
        let a = g.add_task(0, 0);
        let b = g.add_task(1, 0);
        g.add_dependency(a, b);
        g.add_dependency(b, a);
        assert!(g.topological_order().is_none());
    }

    #[test]
    fn test_neighbourhood_edges() {
        let tiles = grid(3, 8);
        let passes = [
            PassAccess { reads: vec![], writes: 0 },
            PassAccess { reads: vec![0], writes: 1 },
        ];
        let g = TaskGraph::for_tiled_passes(&passes, &tiles);
        // Centre tile of pass 1 waits on all nine tiles of pass 0
        let centre = 9 + 4;
        assert_eq!(g.dependencies(centre).collect::<Vec<_>>(), (0..9).collect::<Vec<_>>());
        // Corner tile only on its 2x2 block
        assert_eq!(g.dependencies(9).collect::<Vec<_>>(), vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_aliased_slot_waits_for_readers() {
        let tiles = grid(2, 8);
        let passes = [
            PassAccess { reads: vec![], writes: 0 },
            PassAccess { reads: vec![0], writes: 1 },
            // Reuses slot 0
            PassAccess { reads: vec![1], writes: 0 },
        ];
        let g = TaskGraph::for_tiled_passes(&passes, &tiles);
        let deps: Vec<usize> = g.dependencies(8).collect();
        // Write after write on pass 0 and write after read on pass 1
        assert!(deps.contains(&0) && deps.contains(&4));

        let levels = g.levels().unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec![0, 1, 2, 3]);
        assert_eq!(levels[2], vec![8, 9, 10, 11]);
    }
}
