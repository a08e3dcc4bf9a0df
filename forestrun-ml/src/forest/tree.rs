//! CART regression tree.
//!
//! Nodes live in a flat arena; children are indices into it. Splits minimise
//! the summed squared error of the two children, with the threshold placed
//! halfway between adjacent distinct feature values.

use crate::data::FeatureMatrix;
use crate::error::MlError;
use rand::Rng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

/// A tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        impurity_decrease: f64,
        n_samples: usize,
    },
    Leaf {
        value: f64,
        n_samples: usize,
    },
}

/// Growth limits for one tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeLimits {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: usize,
}

/// A fitted regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    n_features: usize,
}

impl RegressionTree {
    /// Grow a tree over the rows listed in `indices` (duplicates allowed).
    pub(crate) fn fit<R: Rng>(
        data: &FeatureMatrix,
        target: &[f64],
        indices: Vec<usize>,
        limits: TreeLimits,
        rng: &mut R,
    ) -> Self {
        let mut builder = TreeBuilder {
            data,
            target,
            limits,
            rng,
            nodes: Vec::new(),
        };
        builder.grow(indices, 0);
        Self {
            nodes: builder.nodes,
            n_features: data.n_cols(),
        }
    }

    /// Predict one sample. The caller guarantees `sample.len() == n_features`.
    pub fn predict(&self, sample: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value, .. } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    idx = if sample[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Check that the arena forms a tree [`predict`](Self::predict) can walk:
    /// children point forward and in range, split features exist, leaves are finite.
    pub fn check(&self) -> Result<(), MlError> {
        if self.nodes.is_empty() {
            return Err(MlError::model("tree has no nodes"));
        }
        let len = self.nodes.len();
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Leaf { value, .. } => {
                    if !value.is_finite() {
                        return Err(MlError::model(format!("leaf {idx} has value {value}")));
                    }
                }
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= self.n_features {
                        return Err(MlError::model(format!(
                            "node {idx} splits on feature {feature} of {}",
                            self.n_features
                        )));
                    }
                    if threshold.is_nan() {
                        return Err(MlError::model(format!("node {idx} has a NaN threshold")));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= len {
                            return Err(MlError::model(format!(
                                "node {idx} has child {child} outside {}..{len}",
                                idx + 1
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Length of the longest root-to-leaf path, counted in edges.
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }

    /// Total impurity decrease attributed to each feature, normalised to sum to 1.
    pub fn feature_importances(&self) -> Vec<f64> {
        let mut importances = vec![0.0; self.n_features];
        for node in &self.nodes {
            if let Node::Split {
                feature,
                impurity_decrease,
                ..
            } = node
            {
                importances[*feature] += impurity_decrease;
            }
        }
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            for v in &mut importances {
                *v /= total;
            }
        }
        importances
    }
}

struct TreeBuilder<'a, R> {
    data: &'a FeatureMatrix,
    target: &'a [f64],
    limits: TreeLimits,
    rng: &'a mut R,
    nodes: Vec<Node>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    decrease: f64,
}

impl<R: Rng> TreeBuilder<'_, R> {
    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> usize {
        let n = indices.len();
        let sum: f64 = indices.iter().map(|&i| self.target[i]).sum();
        let mean = if n == 0 { 0.0 } else { sum / n as f64 };
        let sse: f64 = indices
            .iter()
            .map(|&i| (self.target[i] - mean).powi(2))
            .sum();
        // Rounding noise left by subtracting a mean of this magnitude.
        let noise = n as f64 * (f64::EPSILON * mean.abs().max(1.0)).powi(2);

        let depth_reached = self.limits.max_depth.is_some_and(|d| depth >= d);
        if depth_reached
            || n < self.limits.min_samples_split
            || n < 2 * self.limits.min_samples_leaf
            || sse <= noise
        {
            return self.leaf(mean, n);
        }

        let Some(best) = self.best_split(&indices, mean, sse) else {
            return self.leaf(mean, n);
        };

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.data.get(i, best.feature) <= best.threshold);

        // Reserve the slot so the parent precedes its children.
        let node_idx = self.leaf(mean, n);
        let left_idx = self.grow(left, depth + 1);
        let right_idx = self.grow(right, depth + 1);
        self.nodes[node_idx] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left: left_idx,
            right: right_idx,
            impurity_decrease: best.decrease,
            n_samples: n,
        };
        node_idx
    }

    fn leaf(&mut self, value: f64, n_samples: usize) -> usize {
        self.nodes.push(Node::Leaf { value, n_samples });
        self.nodes.len() - 1
    }

    /// Targets are centred on `mean` before the running sums so the SSE
    /// differences keep their precision when values sit on a large offset.
    fn best_split(&mut self, indices: &[usize], mean: f64, parent_sse: f64) -> Option<BestSplit> {
        let n = indices.len();
        let n_features = self.data.n_cols();
        let candidates = index::sample(&mut *self.rng, n_features, self.limits.max_features);
        let min_leaf = self.limits.min_samples_leaf;

        let mut best: Option<BestSplit> = None;
        let mut pairs: Vec<(f64, f64)> = Vec::with_capacity(n);

        for feature in candidates.iter() {
            pairs.clear();
            pairs.extend(
                indices
                    .iter()
                    .map(|&i| (self.data.get(i, feature), self.target[i] - mean)),
            );
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
            if pairs[0].0 == pairs[n - 1].0 {
                continue;
            }

            let total_sum: f64 = pairs.iter().map(|p| p.1).sum();
            let total_sq: f64 = pairs.iter().map(|p| p.1 * p.1).sum();
            let mut left_sum = 0.0;
            let mut left_sq = 0.0;

            for i in 0..n - 1 {
                let y = pairs[i].1;
                left_sum += y;
                left_sq += y * y;

                if pairs[i].0 == pairs[i + 1].0 {
                    continue;
                }
                let left_n = i + 1;
                let right_n = n - left_n;
                if left_n < min_leaf || right_n < min_leaf {
                    continue;
                }

                let right_sum = total_sum - left_sum;
                let right_sq = total_sq - left_sq;
                let child_sse = (left_sq - left_sum * left_sum / left_n as f64)
                    + (right_sq - right_sum * right_sum / right_n as f64);
                let decrease = parent_sse - child_sse;

                if decrease > best.as_ref().map_or(0.0, |b| b.decrease) {
                    let mut threshold = (pairs[i].0 + pairs[i + 1].0) / 2.0;
                    // Midpoint of adjacent floats can round up to the right value.
                    if threshold >= pairs[i + 1].0 {
                        threshold = pairs[i].0;
                    }
                    best = Some(BestSplit {
                        feature,
                        threshold,
                        decrease,
                    });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn limits(max_depth: Option<usize>) -> TreeLimits {
        TreeLimits {
            max_depth,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: 1,
        }
    }

    fn step_data() -> (FeatureMatrix, Vec<f64>) {
        let xs: Vec<f64> = (0..10_i32).map(f64::from).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| if x < 5.0 { 1.0 } else { 3.0 }).collect();
        (FeatureMatrix::new(10, 1, xs).unwrap(), ys)
    }

    #[test]
    fn test_step_function_single_split() {
        let (x, y) = step_data();
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(&x, &y, (0..10).collect(), limits(None), &mut rng);

        assert_eq!(tree.n_nodes(), 3);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.predict(&[2.0]), 1.0);
        assert_eq!(tree.predict(&[7.0]), 3.0);
        match &tree.nodes()[0] {
            Node::Split { threshold, .. } => assert_eq!(*threshold, 4.5),
            other => panic!("expected split, got {other:?}"),
        }
    }

    #[test]
    fn test_max_depth_respected() {
        let xs: Vec<f64> = (0..64_i32).map(f64::from).collect();
        let ys: Vec<f64> = xs.iter().map(|x| x * x).collect();
        let x = FeatureMatrix::new(64, 1, xs).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(&x, &ys, (0..64).collect(), limits(Some(3)), &mut rng);
        assert!(tree.depth() <= 3);
    }

    #[test]
    fn test_constant_target_is_leaf() {
        let x = FeatureMatrix::new(4, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = vec![5.0; 4];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(&x, &y, (0..4).collect(), limits(None), &mut rng);
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.predict(&[100.0]), 5.0);
    }

    #[test]
    fn test_constant_feature_cannot_split() {
        let x = FeatureMatrix::new(4, 1, vec![1.0; 4]).unwrap();
        let y = vec![1.0, 2.0, 3.0, 4.0];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(&x, &y, (0..4).collect(), limits(None), &mut rng);
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.predict(&[1.0]), 2.5);
    }

    #[test]
    fn test_min_samples_leaf() {
        let (x, y) = step_data();
        let mut rng = StdRng::seed_from_u64(0);
        let l = TreeLimits {
            min_samples_leaf: 5,
            ..limits(None)
        };
        let tree = RegressionTree::fit(&x, &y, (0..10).collect(), l, &mut rng);
        for node in tree.nodes() {
            if let Node::Leaf { n_samples, .. } = node {
                assert!(*n_samples >= 5);
            }
        }
    }

    #[test]
    fn test_check_rejects_malformed_arenas() {
        let (x, y) = step_data();
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(&x, &y, (0..10).collect(), limits(None), &mut rng);
        assert!(tree.check().is_ok());

        let empty = RegressionTree {
            nodes: Vec::new(),
            n_features: 1,
        };
        assert!(matches!(empty.check(), Err(MlError::Model(_))));

        let split = |feature, left, right| Node::Split {
            feature,
            threshold: 0.5,
            left,
            right,
            impurity_decrease: 1.0,
            n_samples: 2,
        };
        let leaf = |value| Node::Leaf {
            value,
            n_samples: 1,
        };
        for nodes in [
            vec![split(0, 0, 1), leaf(1.0)],
            vec![split(0, 1, 5), leaf(1.0), leaf(2.0)],
            vec![split(3, 1, 2), leaf(1.0), leaf(2.0)],
            vec![leaf(f64::NAN)],
        ] {
            let bad = RegressionTree {
                nodes,
                n_features: 1,
            };
            assert!(matches!(bad.check(), Err(MlError::Model(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_large_offset_target_still_splits() {
        let (x, y) = step_data();
        let shifted: Vec<f64> = y.iter().map(|v| v + 1e8).collect();
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(&x, &shifted, (0..10).collect(), limits(None), &mut rng);
        assert_eq!(tree.n_nodes(), 3);
        assert_eq!(tree.predict(&[2.0]), 1e8 + 1.0);
        assert_eq!(tree.predict(&[7.0]), 1e8 + 3.0);
    }

    #[test]
    fn test_feature_importances_pick_informative_column() {
        // Column 0 is noise-free signal, column 1 is constant.
        let rows: Vec<Vec<f64>> = (0..20_i32).map(|i| vec![f64::from(i), 1.0]).collect();
        let x = FeatureMatrix::from_rows(&rows).unwrap();
        let y: Vec<f64> = (0..20).map(|i| if i < 10 { 0.0 } else { 10.0 }).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let l = TreeLimits {
            max_features: 2,
            ..limits(None)
        };
        let tree = RegressionTree::fit(&x, &y, (0..20).collect(), l, &mut rng);
        let imp = tree.feature_importances();
        assert_eq!(imp, vec![1.0, 0.0]);
    }
}
