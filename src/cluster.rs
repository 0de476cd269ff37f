//! Hierarchical clustering of expression heatmaps.
//!
//! Distances are `1 - pearson(u, v)` in condensed upper-triangle form.
//! Linkage is UPGMA built with the nearest-neighbour chain algorithm, then
//! sorted by height and relabelled so that the resulting merge table and its
//! leaf order match the classic `linkage(method="average")` +
//! `dendrogram(...)["leaves"]` pair bit for bit.
//!
//! Tie-breaking: the neighbour scan walks clusters in ascending index order
//! and only replaces the current best on a strictly smaller distance, with
//! the previous chain element pre-loaded as the incumbent. Equal-height
//! merges keep their construction order through a stable sort.
//!
//! Means and dot products are summed left to right. Libraries that switch to
//! blocked pairwise summation from eight values on can differ in the last
//! bit, so leaf order is only reproduced up to merges tied within rounding.

use crate::{
    error::ClusterError,
    matrix::ExpressionMatrix,
    transform::{top_variable_genes, zscore_strict},
};
use exprlab_protocol::{ClusterMetadata, ClusteredView};
use tracing::{debug, info};

/// One agglomeration step. After relabelling, `left < right` are cluster ids
/// where ids `>= n` refer to earlier merges (`id - n`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub height: f64,
    pub size: usize,
}

fn condensed_index(n: usize, i: usize, j: usize) -> usize {
    let (i, j) = if i < j { (i, j) } else { (j, i) };
    n * i - (i * (i + 1)) / 2 + (j - i - 1)
}

fn dot(u: &[f64], v: &[f64]) -> f64 {
    u.iter().zip(v).map(|(a, b)| a * b).sum()
}

/// Condensed correlation distances between all pairs of `vectors`.
pub fn correlation_distances(vectors: &[Vec<f64>]) -> Vec<f64> {
    let centered: Vec<Vec<f64>> = vectors
        .iter()
        .map(|v| {
            let m = v.iter().sum::<f64>() / v.len() as f64;
            v.iter().map(|x| x - m).collect()
        })
        .collect();
    let norms: Vec<f64> = centered.iter().map(|v| dot(v, v).sqrt()).collect();

    let n = vectors.len();
    let mut out = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            let cosine = dot(&centered[i], &centered[j]) / (norms[i] * norms[j]);
            let dist = if cosine.abs() > 1.0 {
                1.0 - cosine.signum()
            } else {
                1.0 - cosine
            };
            out.push(dist);
        }
    }
    out
}

/// Average-linkage merge table for `n` observations.
pub fn average_linkage(condensed: &[f64], n: usize) -> Result<Vec<Merge>, ClusterError> {
    if n < 2 {
        return Ok(vec![]);
    }
    let mut d = condensed.to_vec();
    let mut size = vec![1usize; n];
    let mut chain: Vec<usize> = Vec::with_capacity(n);
    let mut merges: Vec<Merge> = Vec::with_capacity(n - 1);

    for _ in 0..n - 1 {
        if chain.is_empty() {
            if let Some(first) = (0..n).find(|&i| size[i] > 0) {
                chain.push(first);
            }
        }

        let (x, y, height) = loop {
            let Some(&x) = chain.last() else {
                return Err(ClusterError::NonFiniteDistance { axis: "linkage" });
            };
            let previous = (chain.len() > 1).then(|| chain[chain.len() - 2]);
            let (mut y, mut current_min) = match previous {
                Some(p) => (Some(p), d[condensed_index(n, x, p)]),
                None => (None, f64::INFINITY),
            };
            for i in 0..n {
                if size[i] == 0 || i == x {
                    continue;
                }
                let dist = d[condensed_index(n, x, i)];
                if dist < current_min {
                    current_min = dist;
                    y = Some(i);
                }
            }
            let Some(y) = y else {
                return Err(ClusterError::NonFiniteDistance { axis: "linkage" });
            };
            if previous == Some(y) {
                break (x, y, current_min);
            }
            chain.push(y);
        };

        chain.truncate(chain.len() - 2);
        let (x, y) = if x > y { (y, x) } else { (x, y) };
        let (nx, ny) = (size[x], size[y]);
        merges.push(Merge {
            left: x,
            right: y,
            height,
            size: nx + ny,
        });
        size[x] = 0;
        size[y] = nx + ny;

        for i in 0..n {
            let ni = size[i];
            if ni == 0 || i == y {
                continue;
            }
            let d_xi = d[condensed_index(n, i, x)];
            let d_yi = d[condensed_index(n, i, y)];
            d[condensed_index(n, i, y)] =
                (nx as f64 * d_xi + ny as f64 * d_yi) / (nx + ny) as f64;
        }
    }

    merges.sort_by(|a, b| a.height.total_cmp(&b.height));
    relabel(&mut merges, n);
    Ok(merges)
}

/// Rewrites slot indices into cluster ids: leaves keep `0..n`, the k-th
/// merge becomes `n + k`, and each merge lists the smaller root first.
fn relabel(merges: &mut [Merge], n: usize) {
    let mut parent: Vec<usize> = (0..2 * n - 1).collect();
    let mut cluster_size = vec![1usize; 2 * n - 1];
    let mut next_label = n;

    let find = |parent: &mut Vec<usize>, mut x: usize| -> usize {
        let mut p = x;
        while parent[x] != x {
            x = parent[x];
        }
        while parent[p] != x {
            let next = parent[p];
            parent[p] = x;
            p = next;
        }
        x
    };

    for merge in merges.iter_mut() {
        let x_root = find(&mut parent, merge.left);
        let y_root = find(&mut parent, merge.right);
        let (left, right) = if x_root < y_root {
            (x_root, y_root)
        } else {
            (y_root, x_root)
        };
        merge.left = left;
        merge.right = right;
        parent[x_root] = next_label;
        parent[y_root] = next_label;
        cluster_size[next_label] = cluster_size[x_root] + cluster_size[y_root];
        merge.size = cluster_size[next_label];
        next_label += 1;
    }
}

/// Left-to-right leaves of the dendrogram described by `merges`.
pub fn leaf_order(merges: &[Merge], n: usize) -> Vec<usize> {
    if n == 0 {
        return vec![];
    }
    if merges.is_empty() {
        return (0..n).collect();
    }
    let mut order = Vec::with_capacity(n);
    let mut stack = vec![n + merges.len() - 1];
    while let Some(node) = stack.pop() {
        if node < n {
            order.push(node);
        } else {
            let merge = &merges[node - n];
            stack.push(merge.right);
            stack.push(merge.left);
        }
    }
    order
}

fn axis_order(vectors: &[Vec<f64>], axis: &'static str) -> Result<Vec<usize>, ClusterError> {
    let distances = correlation_distances(vectors);
    if distances.iter().any(|d| !d.is_finite()) {
        return Err(ClusterError::NonFiniteDistance { axis });
    }
    let merges = average_linkage(&distances, vectors.len())?;
    Ok(leaf_order(&merges, vectors.len()))
}

/// Top-variable genes, z-scored and permuted into dendrogram order on both
/// axes.
pub fn cluster(matrix: &ExpressionMatrix, top_n: usize) -> Result<ClusteredView, ClusterError> {
    let top = top_variable_genes(matrix, top_n);
    if top.n_genes() < 2 || top.n_samples() < 2 {
        return Err(ClusterError::InsufficientSamples {
            rows: top.n_genes(),
            cols: top.n_samples(),
        });
    }
    info!(
        genes = top.n_genes(),
        samples = top.n_samples(),
        "Clustering top variable genes"
    );

    let z = zscore_strict(&top)?;
    let gene_order = axis_order(z.values(), "gene")?;
    let sample_order = axis_order(&z.transposed_values(), "sample")?;
    debug!(?sample_order, "Sample leaf order");

    let reordered = z.select_rows(&gene_order).select_columns(&sample_order);
    let filtered_shape = [reordered.n_genes(), reordered.n_samples()];
    let (genes, samples, expression_data) = reordered.into_parts();
    Ok(ClusteredView {
        expression_data,
        genes,
        samples,
        metadata: ClusterMetadata {
            total_genes: matrix.n_genes(),
            filtered_shape,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labelled(values: Vec<Vec<f64>>) -> ExpressionMatrix {
        let genes = (0..values.len()).map(|i| format!("g{i}")).collect();
        let samples = (0..values[0].len()).map(|j| format!("s{j}")).collect();
        ExpressionMatrix::new(genes, samples, values).expect("test matrix")
    }

    #[test]
    fn condensed_index_walks_upper_triangle() {
        let n = 4;
        let pairs = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
        for (expected, (i, j)) in pairs.iter().enumerate() {
            assert_eq!(condensed_index(n, *i, *j), expected);
            assert_eq!(condensed_index(n, *j, *i), expected);
        }
    }

    #[test]
    fn correlation_distance_of_scaled_and_reversed_vectors() {
        let d = correlation_distances(&[
            vec![1.0, 2.0, 3.0],
            vec![2.0, 4.0, 6.0],
            vec![3.0, 2.0, 1.0],
        ]);
        assert_eq!(d.len(), 3);
        assert!(d[0].abs() < 1e-12);
        assert!((d[1] - 2.0).abs() < 1e-12);
        assert!((d[2] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn constant_vector_gives_non_finite_distance() {
        let d = correlation_distances(&[vec![1.0, 1.0], vec![1.0, 2.0]]);
        assert!(d[0].is_nan());
    }

    #[test]
    fn average_linkage_on_two_pairs() {
        // points at 0, 10, 1, 11 on a line
        let condensed = [10.0, 1.0, 11.0, 9.0, 1.0, 10.0];
        let merges = average_linkage(&condensed, 4).expect("linkage");
        assert_eq!(
            merges,
            vec![
                Merge {
                    left: 0,
                    right: 2,
                    height: 1.0,
                    size: 2
                },
                Merge {
                    left: 1,
                    right: 3,
                    height: 1.0,
                    size: 2
                },
                Merge {
                    left: 4,
                    right: 5,
                    height: 10.0,
                    size: 4
                },
            ]
        );
        assert_eq!(leaf_order(&merges, 4), vec![0, 2, 1, 3]);
    }

    #[test]
    fn linkage_sorts_late_low_merges_first() {
        // d(0,1)=3, d(0,2)=4, d(1,2)=1: the chain starting at 0 discovers the
        // (1,2) pair, which must become cluster 3.
        let merges = average_linkage(&[3.0, 4.0, 1.0], 3).expect("linkage");
        assert_eq!(merges[0].left, 1);
        assert_eq!(merges[0].right, 2);
        assert_eq!(merges[0].height, 1.0);
        assert_eq!(merges[1].left, 0);
        assert_eq!(merges[1].right, 3);
        assert_eq!(merges[1].height, 3.5);
        assert_eq!(leaf_order(&merges, 3), vec![0, 1, 2]);
    }

    #[test]
    fn cluster_groups_correlated_genes() {
        let m = labelled(vec![
            vec![1.0, 2.0, 3.0, 4.0],
            vec![4.0, 3.0, 2.0, 1.0],
            vec![2.0, 4.1, 6.0, 8.2],
            vec![8.0, 6.1, 4.0, 2.0],
        ]);
        let view = cluster(&m, 10).expect("cluster");
        assert_eq!(view.metadata.filtered_shape, [4, 4]);
        assert_eq!(view.metadata.total_genes, 4);
        let pos = |g: &str| view.genes.iter().position(|x| x == g).expect("gene present");
        assert_eq!(pos("g0").abs_diff(pos("g2")), 1);
        assert_eq!(pos("g1").abs_diff(pos("g3")), 1);
    }

    #[test]
    fn cluster_needs_two_rows_and_columns() {
        let m = labelled(vec![vec![1.0, 2.0], vec![3.0, 1.0]]);
        assert_eq!(
            cluster(&m, 1).expect_err("one gene"),
            ClusterError::InsufficientSamples { rows: 1, cols: 2 }
        );
        let single = labelled(vec![vec![1.0], vec![2.0]]);
        assert!(matches!(
            cluster(&single, 5).expect_err("one sample"),
            ClusterError::InsufficientSamples { cols: 1, .. }
        ));
    }

    #[test]
    fn cluster_surfaces_degenerate_rows() {
        let m = labelled(vec![vec![1.0, 2.0, 3.0], vec![5.0, 5.0, 5.0]]);
        assert!(matches!(
            cluster(&m, 2).expect_err("flat row"),
            ClusterError::Transform(_)
        ));
    }

    proptest! {
        #[test]
        fn cluster_output_is_a_permutation(
            rows in prop::collection::vec(prop::collection::vec(0.0f64..1000.0, 4), 2..12),
            top_n in 2usize..15,
        ) {
            let m = labelled(rows);
            if let Ok(view) = cluster(&m, top_n) {
                let mut expected: Vec<String> = top_variable_genes(&m, top_n).genes().to_vec();
                let mut genes = view.genes.clone();
                expected.sort();
                genes.sort();
                prop_assert_eq!(genes, expected);
                let mut samples = view.samples.clone();
                samples.sort();
                let mut all_samples = m.samples().to_vec();
                all_samples.sort();
                prop_assert_eq!(samples, all_samples);
                prop_assert_eq!(view.expression_data.len(), view.genes.len());
            }
        }
    }
}
