//! Topic clustering for a day's normalized news entries.
//!
//! [`ClusterEngine`] deduplicates and orders entries, embeds them through an
//! [`EmbeddingClient`](marketbrief_inference::EmbeddingClient), partitions
//! them greedily against running centroids with an adaptive threshold, and
//! titles multi-item topics through a
//! [`LabelingClient`](marketbrief_inference::LabelingClient).

pub mod embedding;
pub mod engine;
pub mod labeling;
pub mod partition;
pub mod similarity;
pub mod text;

pub use engine::{ClusterEngine, ClusterOutcome, ClusterSummary};
pub use partition::{Partition, PartitionPolicy, partition};
