//! Distance-2 graph coloring, used to probe a stencil operator with few applications.
//!
//! Sites of one color share no neighbor, so applying an operator to the sum of their unit
//! vectors lets every stencil entry be read back unambiguously.
//! See Saad §10.7, §12.4 for background.

use std::collections::HashSet;

/// Sites within two hops of each site, the site itself included, sorted.
pub fn distance2_neighbors(adj: &[Vec<usize>]) -> Vec<Vec<usize>> {
    adj.iter()
        .enumerate()
        .map(|(i, row)| {
            let mut reach: Vec<usize> = std::iter::once(i)
                .chain(row.iter().flat_map(|&j| std::iter::once(j).chain(adj[j].iter().copied())))
                .collect();
            reach.sort_unstable();
            reach.dedup();
            reach
        })
        .collect()
}

/// Greedy coloring in site order: each site takes the smallest color unused within its
/// distance-2 neighborhood.
pub fn greedy_distance2_coloring(dist2: &[Vec<usize>]) -> Vec<usize> {
    const UNSET: usize = usize::MAX;
    let mut colors = vec![UNSET; dist2.len()];
    let mut banned: HashSet<usize> = HashSet::new();
    for (i, reach) in dist2.iter().enumerate() {
        banned.clear();
        banned.extend(reach.iter().map(|&k| colors[k]).filter(|&c| c != UNSET));
        colors[i] = (0..).find(|c| !banned.contains(c)).unwrap_or(0);
    }
    colors
}

/// Colors a graph given as adjacency lists (self loops allowed).
pub fn color_graph(adj: &[Vec<usize>]) -> Vec<usize> {
    greedy_distance2_coloring(&distance2_neighbors(adj))
}

/// Build blocks from a color assignment: blocks[c] = indices with color c
pub fn build_blocks_from_colors(colors: &[usize]) -> Vec<Vec<usize>> {
    let num_colors = colors.iter().copied().max().map(|c| c + 1).unwrap_or(0);
    let mut blocks = vec![Vec::new(); num_colors];
    for (i, &c) in colors.iter().enumerate() {
        blocks[c].push(i);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_coloring_separates_second_neighbours() {
        let n = 9;
        let adj: Vec<Vec<usize>> = (0..n).map(|i| vec![(i + 1) % n, (i + n - 1) % n]).collect();
        let colors = color_graph(&adj);
        for i in 0..n {
            for j in [(i + 1) % n, (i + 2) % n] {
                assert_ne!(colors[i], colors[j]);
            }
        }
        let blocks = build_blocks_from_colors(&colors);
        assert_eq!(blocks.iter().map(Vec::len).sum::<usize>(), n);
    }
}
