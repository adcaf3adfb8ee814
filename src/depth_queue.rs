// SPDX-License-Identifier: MIT OR Apache-2.0

//! Depth-ordered scheduler for cascading updates down the thread tree.
//!
//! Pending per-thread change notifications are bucketed by tree depth and released strictly in
//! non-decreasing depth order. Because a thread's depth is strictly greater than the depth of
//! both its parent and its containing thread, keying purely on depth guarantees that a thread
//! is recomputed only after all of its relevant ancestors have concluded, without a general
//! topological sort. Two notifications landing on the same thread within one depth layer are
//! merged before the layer is released, so each thread is processed exactly once per
//! operation.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;

/// An item schedulable on a [`DepthQueue`].
pub trait DepthItem: Sized {
    type Key: Copy + Debug + Eq + Hash;
    type Error: Error;

    /// The tree depth of the thread this item concerns.
    fn depth(&self) -> u32;

    /// The thread this item concerns. Items with equal keys at the same depth are merged.
    fn key(&self) -> Self::Key;

    /// Merge another item for the same thread into this one.
    ///
    /// Fails when the two items disagree on fields that must be immutable for one thread,
    /// which indicates a storage inconsistency.
    fn merge(self, other: Self) -> Result<Self, Self::Error>;
}

#[derive(Debug, Error, PartialEq)]
pub enum DepthQueueError<E>
where
    E: Error,
{
    /// An item arrived at a depth at or below one that was already dequeued. Depths must only
    /// ever increase as an operation proceeds, since a thread is always deeper than its
    /// ancestors.
    #[error("item queued at depth {depth} but depth {max_dequeued} was already processed")]
    DepthRegression { depth: u32, max_dequeued: u32 },

    #[error(transparent)]
    Merge(E),
}

/// Priority structure holding pending per-thread change notifications keyed by tree depth.
#[derive(Clone, Debug)]
pub struct DepthQueue<I>
where
    I: DepthItem,
{
    buckets: BTreeMap<u32, HashMap<I::Key, I>>,
    max_dequeued: Option<u32>,
}

impl<I> DepthQueue<I>
where
    I: DepthItem,
{
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            max_dequeued: None,
        }
    }

    /// Queue one item, merging it into any item already pending for the same thread.
    pub fn add_info(&mut self, info: I) -> Result<(), DepthQueueError<I::Error>> {
        let depth = info.depth();
        if let Some(max_dequeued) = self.max_dequeued {
            if depth <= max_dequeued {
                return Err(DepthQueueError::DepthRegression { depth, max_dequeued });
            }
        }

        let bucket = self.buckets.entry(depth).or_default();
        let key = info.key();
        let merged = match bucket.remove(&key) {
            Some(existing) => existing.merge(info).map_err(DepthQueueError::Merge)?,
            None => info,
        };
        bucket.insert(key, merged);
        Ok(())
    }

    pub fn add_infos(
        &mut self,
        infos: impl IntoIterator<Item = I>,
    ) -> Result<(), DepthQueueError<I::Error>> {
        for info in infos {
            self.add_info(info)?;
        }
        Ok(())
    }

    /// Remove and return the next non-empty depth layer, advancing the dequeued-depth cursor
    /// past any empty depths. Returns `None` once no deeper layer remains.
    pub fn next_depth(&mut self) -> Option<Vec<I>> {
        let (depth, bucket) = self.buckets.pop_first()?;
        self.max_dequeued = Some(depth);
        Some(bucket.into_values().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl<I> Default for DepthQueue<I>
where
    I: DepthItem,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestItem {
        key: u32,
        depth: u32,
        values: Vec<u32>,
    }

    impl DepthItem for TestItem {
        type Key = u32;
        type Error = Infallible;

        fn depth(&self) -> u32 {
            self.depth
        }

        fn key(&self) -> u32 {
            self.key
        }

        fn merge(mut self, other: Self) -> Result<Self, Infallible> {
            self.values.extend(other.values);
            Ok(self)
        }
    }

    fn item(key: u32, depth: u32, value: u32) -> TestItem {
        TestItem {
            key,
            depth,
            values: vec![value],
        }
    }

    #[test]
    fn layers_come_out_in_depth_order() {
        let mut queue = DepthQueue::new();
        queue.add_info(item(30, 7, 0)).unwrap();
        queue.add_info(item(10, 2, 0)).unwrap();
        queue.add_info(item(20, 2, 0)).unwrap();

        // Depths are not dense; empty depths are skipped.
        let first = queue.next_depth().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|info| info.depth == 2));

        let second = queue.next_depth().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].depth, 7);

        assert!(queue.next_depth().is_none());
    }

    #[test]
    fn same_key_merges_within_a_layer() {
        let mut queue = DepthQueue::new();
        queue.add_info(item(10, 3, 1)).unwrap();
        queue.add_info(item(10, 3, 2)).unwrap();

        let layer = queue.next_depth().unwrap();
        assert_eq!(layer.len(), 1);
        assert_eq!(layer[0].values, vec![1, 2]);
    }

    #[test]
    fn depth_regression_is_rejected() {
        let mut queue = DepthQueue::new();
        queue.add_info(item(10, 2, 0)).unwrap();
        queue.next_depth().unwrap();

        // Deeper layers can still be queued while draining.
        queue.add_info(item(20, 3, 0)).unwrap();

        assert_eq!(
            queue.add_info(item(30, 2, 0)),
            Err(DepthQueueError::DepthRegression {
                depth: 2,
                max_dequeued: 2
            })
        );
        assert_eq!(
            queue.add_info(item(30, 1, 0)),
            Err(DepthQueueError::DepthRegression {
                depth: 1,
                max_dequeued: 2
            })
        );
    }
}
