//! Single writer per node
//!
//! Every store mutation a node makes goes through one actor task, so a node
//! never races itself: heartbeats, claims, renewals and privileged passes
//! are applied one at a time, in submission order. Reads bypass the writer.

use crate::common::{Error, Result, RetryPolicy};
use crate::store::{compare_and_write, CoordinationStore, Document, Mutation, WriteOutcome};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job =
    Box<dyn FnOnce(Arc<dyn CoordinationStore>, RetryPolicy) -> BoxFuture<'static, ()> + Send>;

const QUEUE_DEPTH: usize = 64;

#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<Job>,
}

impl StoreWriter {
    /// Start the writer task. It stops once every handle is dropped.
    pub fn spawn(store: Arc<dyn CoordinationStore>, policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job(store.clone(), policy.clone()).await;
            }
            tracing::debug!("Store writer stopped");
        });
        (Self { tx }, handle)
    }

    /// Run `f` on the writer task and wait for its result.
    pub async fn submit<R, F, Fut>(&self, f: F) -> Result<R>
    where
        F: FnOnce(Arc<dyn CoordinationStore>, RetryPolicy) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |store, policy| {
            Box::pin(async move {
                let result = f(store, policy).await;
                let _ = reply_tx.send(result);
            })
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| Error::Internal("store writer is not running".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("store writer dropped the request".into()))?
    }

    /// Serialized [`compare_and_write`].
    pub async fn mutate<T, F>(&self, mutate: F) -> Result<WriteOutcome<T>>
    where
        T: Document,
        F: FnMut(&mut T) -> Mutation + Send + 'static,
    {
        self.submit(move |store, policy| async move {
            compare_and_write::<T, F>(store.as_ref(), &policy, mutate).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Roster;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_writes_are_serialized() {
        let store = MemoryStore::new();
        let (writer, _handle) =
            StoreWriter::spawn(Arc::new(store.clone()), RetryPolicy::immediate(1));

        let mut pending = Vec::new();
        for i in 0..10 {
            let writer = writer.clone();
            pending.push(tokio::spawn(async move {
                writer
                    .mutate::<Roster, _>(move |roster| {
                        let node = crate::model::Node::new(
                            format!("node-{}", i),
                            "default",
                            Default::default(),
                            chrono::Utc::now(),
                        );
                        roster.upsert(node);
                        Mutation::Changed(format!("add node-{}", i))
                    })
                    .await
            }));
        }
        for p in pending {
            // a single attempt never conflicts when the node is the only writer
            assert!(p.await.unwrap().unwrap().is_written());
        }
        assert_eq!(store.snapshot::<Roster>().unwrap().len(), 10);
        assert_eq!(store.conflict_count(), 0);
    }

    #[tokio::test]
    async fn test_writer_stops_when_handles_dropped() {
        let (writer, handle) =
            StoreWriter::spawn(Arc::new(MemoryStore::new()), RetryPolicy::immediate(1));
        drop(writer);
        handle.await.unwrap();
    }
}
