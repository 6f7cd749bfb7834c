//! Greedy single-pass partitioning with an adaptive threshold.
//!
//! Input vectors must be unit length and are visited in slice order. Each
//! group keeps its members in visiting order plus a running normalized
//! centroid. [`partition`] guarantees `groups.len() <= max_topics` without
//! dropping any vector.

use marketbrief_shared::ClusterConfig;
use tracing::debug;

use crate::similarity::{cosine, merge_centroids, nearest};

/// Threshold schedule and topic budget for one partitioning run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionPolicy {
    pub threshold: f32,
    pub threshold_min: f32,
    pub threshold_max: f32,
    pub relax_step: f32,
    pub max_relaxations: u32,
    pub merge_margin: f32,
    pub max_topics: usize,
}

impl From<&ClusterConfig> for PartitionPolicy {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            threshold: config.similarity_threshold,
            threshold_min: config.threshold_min,
            threshold_max: config.threshold_max,
            relax_step: config.relax_step,
            max_relaxations: config.max_relaxations,
            merge_margin: config.merge_margin,
            max_topics: config.max_topics,
        }
    }
}

/// One cluster: indexes into the input slice plus its centroid.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub members: Vec<usize>,
    pub centroid: Vec<f32>,
}

impl Group {
    fn seed(index: usize, vector: &[f32]) -> Self {
        Self {
            members: vec![index],
            centroid: vector.to_vec(),
        }
    }

    fn absorb(&mut self, other: Group) {
        self.centroid = merge_centroids(
            &self.centroid,
            self.members.len(),
            &other.centroid,
            other.members.len(),
        );
        self.members.extend(other.members);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Result of [`partition`]. Groups are in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub groups: Vec<Group>,
    /// Threshold of the final greedy pass.
    pub threshold: f32,
    pub relaxations: u32,
    pub singleton_merges: usize,
    pub forced_merges: usize,
}

/// One greedy pass at a fixed threshold.
pub fn greedy(vectors: &[Vec<f32>], threshold: f32) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for (index, vector) in vectors.iter().enumerate() {
        let best = nearest(
            vector,
            groups.iter().enumerate().map(|(i, g)| (i, g.centroid.as_slice())),
        );
        match best {
            Some((target, sim)) if sim >= threshold => {
                groups[target].absorb(Group::seed(index, vector));
            }
            _ => groups.push(Group::seed(index, vector)),
        }
    }
    groups
}

/// Partition `vectors` within the topic budget.
///
/// Relaxes the threshold while over budget, then folds singletons into
/// their nearest multi-member group, then merges the smallest groups.
pub fn partition(vectors: &[Vec<f32>], policy: &PartitionPolicy) -> Partition {
    let budget = policy.max_topics.max(1);
    let mut threshold = policy
        .threshold
        .clamp(policy.threshold_min, policy.threshold_max);
    let mut groups = greedy(vectors, threshold);
    let mut relaxations = 0;

    while groups.len() > budget
        && threshold > policy.threshold_min
        && relaxations < policy.max_relaxations
    {
        threshold = (threshold - policy.relax_step).max(policy.threshold_min);
        relaxations += 1;
        groups = greedy(vectors, threshold);
        debug!(threshold, relaxations, groups = groups.len(), "relaxed threshold");
    }

    let mut singleton_merges = 0;
    if groups.len() > budget {
        let merge_threshold = (threshold - policy.merge_margin).max(policy.threshold_min);
        singleton_merges = merge_singletons(&mut groups, merge_threshold, budget);
    }

    let mut forced_merges = 0;
    while groups.len() > budget {
        force_merge_smallest(&mut groups);
        forced_merges += 1;
    }

    for group in &mut groups {
        group.members.sort_unstable();
    }

    Partition {
        groups,
        threshold,
        relaxations,
        singleton_merges,
        forced_merges,
    }
}

/// Fold singletons into their nearest multi-member group, first-seen first.
fn merge_singletons(groups: &mut Vec<Group>, merge_threshold: f32, budget: usize) -> usize {
    let targets: Vec<usize> = (0..groups.len()).filter(|&i| groups[i].len() > 1).collect();
    if targets.is_empty() {
        return 0;
    }

    let mut remaining = groups.len();
    let mut merged = vec![false; groups.len()];
    for i in 0..groups.len() {
        if remaining <= budget {
            break;
        }
        if groups[i].len() != 1 {
            continue;
        }
        let best = nearest(
            &groups[i].centroid,
            targets.iter().map(|&t| (t, groups[t].centroid.as_slice())),
        );
        let Some((target, sim)) = best else {
            continue;
        };
        if sim >= merge_threshold {
            let single = std::mem::replace(
                &mut groups[i],
                Group {
                    members: Vec::new(),
                    centroid: Vec::new(),
                },
            );
            groups[target].absorb(single);
            merged[i] = true;
            remaining -= 1;
        }
    }

    let count = merged.iter().filter(|&&m| m).count();
    let mut flags = merged.into_iter();
    groups.retain(|_| !flags.next().unwrap_or(false));
    count
}

/// Merge the smallest group (latest on ties) into its most similar peer.
fn force_merge_smallest(groups: &mut Vec<Group>) {
    let Some(smallest) = groups
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)))
        .map(|(i, _)| i)
    else {
        return;
    };

    let victim = groups.remove(smallest);
    let best = nearest(
        &victim.centroid,
        groups.iter().enumerate().map(|(i, g)| (i, g.centroid.as_slice())),
    );
    match best {
        Some((target, sim)) => {
            debug!(size = victim.len(), similarity = sim, "forced merge");
            groups[target].absorb(victim);
        }
        None => groups.push(victim),
    }
}

/// Similarity of each member of `group` to the group's centroid.
pub fn member_similarities(group: &Group, vectors: &[Vec<f32>]) -> Vec<(usize, f32)> {
    group
        .members
        .iter()
        .map(|&m| (m, cosine(&vectors[m], &group.centroid)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::normalize;

    fn policy(max_topics: usize) -> PartitionPolicy {
        PartitionPolicy {
            threshold: 0.82,
            threshold_min: 0.60,
            threshold_max: 0.90,
            relax_step: 0.02,
            max_relaxations: 6,
            merge_margin: 0.05,
            max_topics,
        }
    }

    fn one_hot(n: usize, dims: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let mut v = vec![0.0; dims];
                v[i % dims] = 1.0;
                v
            })
            .collect()
    }

    fn sizes(p: &Partition) -> Vec<usize> {
        p.groups.iter().map(Group::len).collect()
    }

    #[test]
    fn greedy_groups_near_duplicates() {
        let vectors: Vec<Vec<f32>> = [
            [1.0, 0.0, 0.0],
            [0.98, 0.2, 0.0],
            [0.0, 0.0, 1.0],
            [0.97, 0.15, 0.1],
        ]
        .iter()
        .map(|v| normalize(v))
        .collect();

        let groups = greedy(&vectors, 0.82);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members, vec![0, 1, 3]);
        assert_eq!(groups[1].members, vec![2]);
    }

    #[test]
    fn threshold_is_clamped() {
        let vectors = one_hot(2, 2);
        let p = partition(
            &vectors,
            &PartitionPolicy {
                threshold: 0.99,
                ..policy(10)
            },
        );
        assert_eq!(p.threshold, 0.90);
        assert_eq!(p.relaxations, 0);
    }

    #[test]
    fn relaxation_joins_moderately_similar_items() {
        // cosine ~0.81: below 0.82, above 0.80 after one step.
        let vectors = vec![vec![1.0, 0.0], normalize(&[0.81, 0.586])];
        let p = partition(&vectors, &policy(1));
        assert_eq!(sizes(&p), vec![2]);
        assert_eq!(p.relaxations, 1);
        assert!((p.threshold - 0.80).abs() < 1e-6);
        assert_eq!(p.forced_merges, 0);
    }

    #[test]
    fn within_budget_keeps_initial_threshold() {
        let vectors = one_hot(3, 3);
        let p = partition(&vectors, &policy(5));
        assert_eq!(p.groups.len(), 3);
        assert_eq!(p.relaxations, 0);
        assert_eq!(p.threshold, 0.82);
    }

    #[test]
    fn singletons_fold_into_nearest_group() {
        let vectors = vec![
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![0.8, 0.6],
            vec![0.0, 1.0],
        ];
        let p = partition(
            &vectors,
            &PartitionPolicy {
                threshold: 0.9,
                max_relaxations: 0,
                merge_margin: 0.15,
                ..policy(2)
            },
        );
        assert_eq!(p.singleton_merges, 1);
        assert_eq!(p.forced_merges, 0);
        assert_eq!(p.groups[0].members, vec![0, 1, 2]);
        assert_eq!(p.groups[1].members, vec![3]);
    }

    #[test]
    fn forced_merge_enforces_budget_without_losing_items() {
        let vectors = one_hot(10, 10);
        let p = partition(&vectors, &policy(3));
        assert_eq!(p.groups.len(), 3);
        assert_eq!(p.relaxations, 6);
        assert_eq!(p.forced_merges, 7);
        let mut all: Vec<usize> = p.groups.iter().flat_map(|g| g.members.clone()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn budget_of_one_collapses_everything() {
        let vectors = one_hot(4, 4);
        let p = partition(&vectors, &policy(1));
        assert_eq!(sizes(&p), vec![4]);
        assert_eq!(p.groups[0].members, vec![0, 1, 2, 3]);
    }

    #[test]
    fn partition_is_deterministic() {
        let vectors: Vec<Vec<f32>> = (0..25)
            .map(|i| normalize(&[(i % 5) as f32 + 1.0, (i % 3) as f32, (i % 7) as f32 * 0.5]))
            .collect();
        let a = partition(&vectors, &policy(4));
        let b = partition(&vectors, &policy(4));
        assert_eq!(a, b);
        assert!(a.groups.len() <= 4);
    }

    #[test]
    fn member_similarity_to_centroid() {
        let vectors = vec![vec![1.0, 0.0], vec![1.0, 0.0]];
        let groups = greedy(&vectors, 0.5);
        let sims = member_similarities(&groups[0], &vectors);
        assert_eq!(sims.len(), 2);
        assert!(sims.iter().all(|(_, s)| (*s - 1.0).abs() < 1e-6));
    }
}
