// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress streamer: fan-out of job progress to live subscribers.
//!
//! One broadcast channel per job plus one aggregate channel for every job.
//! Publishing never waits on subscribers. Each subscriber gets a bounded
//! buffer; one that falls further behind than that is disconnected rather
//! than slowing the producer down. Dropping a [`Subscription`] releases
//! everything the streamer held for it.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::locks::resilient_lock;
use crate::queue::types::QueueProgressStatus;

/// Default per-subscriber buffer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// A progress snapshot tagged with the job it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: String,
    pub model: String,
    pub base_url: String,
    #[serde(flatten)]
    pub progress: QueueProgressStatus,
}

/// Receiving end of a progress channel.
pub struct Subscription {
    rx: broadcast::Receiver<ProgressEvent>,
    label: String,
}

impl Subscription {
    /// Next event, or `None` once the channel closed or this subscriber was
    /// dropped for lagging.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(subscription = %self.label, missed, "Subscriber lagged, disconnecting");
                None
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next). `None` if nothing is
    /// buffered right now.
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Turn the subscription into a stream that ends on close or lag.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        let label = self.label;
        BroadcastStream::new(self.rx)
            .take_while(move |item| match item {
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!(subscription = %label, error = %err, "Subscriber lagged, disconnecting");
                    false
                }
            })
            .filter_map(|item| item.ok())
    }
}

pub struct ProgressStreamer {
    buffer: usize,
    all: broadcast::Sender<ProgressEvent>,
    per_job: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressStreamer {
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1);
        let (all, _) = broadcast::channel(buffer);
        Self {
            buffer,
            all,
            per_job: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver an event to the aggregate channel and to the job's channel.
    pub fn publish(&self, event: ProgressEvent) {
        // No receivers is not an error here.
        let _ = self.all.send(event.clone());
        if let Some(tx) = resilient_lock(&self.per_job).get(&event.job_id) {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to every job's events.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.all.subscribe(),
            label: "all".to_string(),
        }
    }

    /// Subscribe to one job. The channel is created on first use and closed
    /// by [`close_job`](Self::close_job).
    pub fn subscribe_job(&self, job_id: &str) -> Subscription {
        let mut jobs = resilient_lock(&self.per_job);
        let tx = jobs
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0);
        Subscription {
            rx: tx.subscribe(),
            label: job_id.to_string(),
        }
    }

    /// Drop a job's channel. Its subscribers observe end-of-stream once they
    /// drained what was already buffered.
    pub fn close_job(&self, job_id: &str) {
        resilient_lock(&self.per_job).remove(job_id);
    }

    /// Live subscribers across all channels.
    pub fn subscriber_count(&self) -> usize {
        let per_job: usize = resilient_lock(&self.per_job)
            .values()
            .map(|tx| tx.receiver_count())
            .sum();
        self.all.receiver_count() + per_job
    }
}

impl Default for ProgressStreamer {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER)
    }
}
