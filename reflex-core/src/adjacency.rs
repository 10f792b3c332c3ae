//! Undirected reflection adjacency graph.
//!
//! Built fresh per batch by overlap detection: one vertex per reflection,
//! one edge per pair of overlapping shoeboxes.

/// Adjacency list over reflection indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdjacencyList {
    neighbours: Vec<Vec<usize>>,
    edges: Vec<(usize, usize)>,
}

impl AdjacencyList {
    /// Graph with `n` isolated vertices.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            neighbours: vec![Vec::new(); n],
            edges: Vec::new(),
        }
    }

    #[must_use]
    pub fn num_vertices(&self) -> usize {
        self.neighbours.len()
    }

    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Adds the edge `{a, b}`. Self loops are ignored.
    ///
    /// # Panics
    /// Panics if either vertex is out of range.
    pub fn add_edge(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.neighbours[a].push(b);
        self.neighbours[b].push(a);
        self.edges.push((a.min(b), a.max(b)));
    }

    /// Edges as `(low, high)` vertex pairs in insertion order.
    #[must_use]
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// Vertices adjacent to `v`.
    #[must_use]
    pub fn adjacent_vertices(&self, v: usize) -> &[usize] {
        &self.neighbours[v]
    }

    #[must_use]
    pub fn degree(&self, v: usize) -> usize {
        self.neighbours[v].len()
    }

    /// Sorted, deduplicated edge list; handy for comparing graphs.
    #[must_use]
    pub fn sorted_edges(&self) -> Vec<(usize, usize)> {
        let mut edges = self.edges.clone();
        edges.sort_unstable();
        edges.dedup();
        edges
    }

    /// Component label per vertex; labels are the smallest vertex index in
    /// each component.
    #[must_use]
    pub fn connected_components(&self) -> Vec<usize> {
        let n = self.num_vertices();
        let mut uf = UnionFind::new(n);
        for &(a, b) in &self.edges {
            uf.union(a, b);
        }

        let mut smallest = vec![usize::MAX; n];
        for v in 0..n {
            let root = uf.find(v);
            smallest[root] = smallest[root].min(v);
        }
        (0..n).map(|v| smallest[uf.find(v)]).collect()
    }
}

/// Union-Find data structure for connected component detection.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, x: usize, y: usize) {
        let px = self.find(x);
        let py = self.find(y);

        if px == py {
            return;
        }

        match self.rank[px].cmp(&self.rank[py]) {
            std::cmp::Ordering::Less => self.parent[px] = py,
            std::cmp::Ordering::Greater => self.parent[py] = px,
            std::cmp::Ordering::Equal => {
                self.parent[py] = px;
                self.rank[px] += 1;
            }
        }
    }
}
