//! Background compaction.
//!
//! One thread per engine, woken by commits. Each wake-up compacts whatever
//! is over the threshold at that moment, so a burst of commits coalesces
//! into at most one pending run.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::graph::engine::GraphEngine;

pub enum CompactionMessage {
    Trigger,
    Shutdown,
}

pub struct CompactionWorker {
    sender: Sender<CompactionMessage>,
    handle: Option<JoinHandle<()>>,
}

impl CompactionWorker {
    pub fn spawn(engine: GraphEngine) -> Self {
        // One slot: a trigger already queued covers any that follow.
        let (sender, receiver) = bounded(1);
        let handle = thread::Builder::new()
            .name("cgdb-compaction".into())
            .spawn(move || compaction_loop(engine, receiver))
            .map_err(|e| tracing::error!(error = %e, "failed to start compaction worker"))
            .ok();
        Self { sender, handle }
    }

    /// Ask for a compaction pass. Never blocks.
    pub fn trigger(&self) {
        match self.sender.try_send(CompactionMessage::Trigger) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("compaction worker is gone; trigger dropped")
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker after its current pass.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // The slot may hold a trigger; a blocking send waits for it to drain.
        let _ = self.sender.send(CompactionMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn compaction_loop(engine: GraphEngine, receiver: Receiver<CompactionMessage>) {
    tracing::debug!("compaction worker started");
    while let Ok(CompactionMessage::Trigger) = receiver.recv() {
        if !engine.needs_compaction() {
            continue;
        }
        match engine.compact() {
            Ok(result) if !result.is_noop() => tracing::debug!(
                version = result.manifest_version,
                partitions = result.partitions_compacted.len(),
                "background compaction finished"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "background compaction failed"),
        }
    }
    tracing::debug!("compaction worker stopped");
}
