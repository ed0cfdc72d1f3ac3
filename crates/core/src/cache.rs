// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame cache: at most one running frame per frame id on this host.
//!
//! Like the ledger, the cache carries no lock of its own; the supervisor
//! serializes access under its single mutex.

use crate::error::Error;
use crate::frame::RunningFrame;
use std::collections::HashMap;
use std::sync::Arc;

/// Mapping from frame id to its live record.
#[derive(Debug, Default)]
pub struct FrameCache {
    frames: HashMap<String, Arc<RunningFrame>>,
}

impl FrameCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a frame, failing when its id is already present.
    pub fn insert(&mut self, frame: Arc<RunningFrame>) -> Result<(), Error> {
        let frame_id = frame.frame_id().to_owned();
        if self.frames.contains_key(&frame_id) {
            return Err(Error::DuplicateFrame { frame_id });
        }
        let _ = self.frames.insert(frame_id, frame);
        Ok(())
    }

    /// Removes a frame only when the cached record is the given one, so a
    /// losing duplicate launch can never evict the frame that won the id.
    /// Idempotent.
    pub fn remove(&mut self, frame: &Arc<RunningFrame>) {
        if let Some(cached) = self.frames.get(frame.frame_id()) {
            if Arc::ptr_eq(cached, frame) {
                let _ = self.frames.remove(frame.frame_id());
            }
        }
    }

    /// Looks up a frame by id.
    pub fn get(&self, frame_id: &str) -> Option<Arc<RunningFrame>> {
        self.frames.get(frame_id).cloned()
    }

    /// Whether the frame id is present.
    pub fn contains(&self, frame_id: &str) -> bool {
        self.frames.contains_key(frame_id)
    }

    /// All live frames, in no particular order.
    pub fn frames(&self) -> Vec<Arc<RunningFrame>> {
        self.frames.values().cloned().collect()
    }

    /// All live frame ids, in no particular order.
    pub fn frame_ids(&self) -> Vec<String> {
        self.frames.keys().cloned().collect()
    }

    /// Whether no frames are running.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of running frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }
}
