//! Density-based clustering over cosine distance.
//!
//! Plain DBSCAN on a precomputed `1 − cosine` distance matrix. A point is a
//! core point when at least `min_samples` points (itself included) lie
//! within `eps`; clusters grow from core points, everything unreachable is
//! noise.

use std::collections::VecDeque;

use crate::dense::cosine_similarity;

/// Pairwise `1 − cosine` distances.
pub fn cosine_distance_matrix(vectors: &[Vec<f32>]) -> Vec<Vec<f64>> {
    let n = vectors.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = 1.0 - cosine_similarity(&vectors[i], &vectors[j]) as f64;
            matrix[i][j] = d;
            matrix[j][i] = d;
        }
    }
    matrix
}

/// Cluster label per point; `None` is noise.
pub fn dbscan(distances: &[Vec<f64>], eps: f64, min_samples: usize) -> Vec<Option<usize>> {
    let n = distances.len();
    let neighbours = |p: usize| -> Vec<usize> { (0..n).filter(|&q| distances[p][q] <= eps).collect() };

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_cluster = 0;

    for p in 0..n {
        if visited[p] {
            continue;
        }
        visited[p] = true;
        let seeds = neighbours(p);
        if seeds.len() < min_samples {
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[p] = Some(cluster);

        let mut queue: VecDeque<usize> = seeds.into_iter().filter(|&q| q != p).collect();
        while let Some(q) = queue.pop_front() {
            if labels[q].is_none() {
                labels[q] = Some(cluster);
            }
            if visited[q] {
                continue;
            }
            visited[q] = true;
            let reach = neighbours(q);
            if reach.len() >= min_samples {
                queue.extend(reach.into_iter().filter(|&r| !visited[r] || labels[r].is_none()));
            }
        }
    }

    labels
}

/// Members of the largest cluster, ascending.
///
/// Equal sizes go to the cluster holding the lowest index. `None` when
/// every point is noise.
pub fn largest_cluster(labels: &[Option<usize>]) -> Option<Vec<usize>> {
    let count = labels.iter().flatten().max().map(|m| m + 1)?;
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (i, label) in labels.iter().enumerate() {
        if let Some(c) = label {
            members[*c].push(i);
        }
    }
    members
        .into_iter()
        .filter(|m| !m.is_empty())
        .max_by(|a, b| a.len().cmp(&b.len()).then(b[0].cmp(&a[0])))
}
