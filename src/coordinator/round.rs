//! Completion of a round: aggregation and redistribution of the global model.

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;

use super::Context;
use crate::{
    aggregator::{Aggregator, AggregatorError},
    protocol::send_file,
    storage::StorageError,
};

/// Why a full buffer was left untouched.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error("global model {0} not found")]
    MissingModel(String),
    #[error("cannot load the global model: {0}")]
    Storage(StorageError),
}

#[derive(Debug)]
pub enum RoundOutcome {
    /// Fewer than K models are buffered.
    NotReady { occupancy: usize },
    /// The aggregation failed. The buffer is unchanged and the next tick tries again.
    Deferred(RoundError),
    /// The global model was sent to the cohort. Clients that received it are idle again.
    Completed {
        model: String,
        delivered: usize,
        dropped: usize,
    },
}

/// Triggers an aggregation whenever the buffer holds a full cohort.
pub struct RoundOrchestrator {
    ctx: Arc<Context>,
    aggregator: Arc<dyn Aggregator>,
}

impl RoundOrchestrator {
    pub fn new(ctx: Arc<Context>, aggregator: Arc<dyn Aggregator>) -> Self {
        Self { ctx, aggregator }
    }

    /// Runs one orchestration step.
    pub async fn tick(&self) -> RoundOutcome {
        let buffer = &self.ctx.buffer;
        let occupancy = buffer.len();
        if occupancy < buffer.capacity() {
            debug!("{}/{} models buffered", occupancy, buffer.capacity());
            return RoundOutcome::NotReady { occupancy };
        }

        info!("{} models buffered, starting aggregation", occupancy);
        let name = match self.aggregator.request_round().await {
            Ok(name) => name,
            Err(e) => return RoundOutcome::Deferred(e.into()),
        };
        let model = match self.ctx.store.global_model(&name).await {
            Ok(Some(model)) => model,
            Ok(None) => return RoundOutcome::Deferred(RoundError::MissingModel(name)),
            Err(e) => return RoundOutcome::Deferred(RoundError::Storage(e)),
        };

        let mut cohort = buffer.drain_all();
        let total = cohort.len();
        let transfer = self.ctx.transfer;
        let deliveries = cohort.take_members().into_iter().map(|mut conn| {
            let model = model.clone();
            async move {
                match send_file(&mut conn, &model, &transfer).await {
                    Ok(_) => Some(conn),
                    Err(e) => {
                        warn!("{}: failed to send the global model: {}", conn, e);
                        None
                    }
                }
            }
        });
        let delivered: Vec<_> = join_all(deliveries).await.into_iter().flatten().collect();

        let outcome = RoundOutcome::Completed {
            model: name,
            delivered: delivered.len(),
            dropped: total - delivered.len(),
        };
        for conn in delivered {
            self.ctx.idle.insert(conn).await;
        }
        cohort.release();
        outcome
    }

    /// Calls [`tick`](Self::tick) at every aggregation interval.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.ctx.aggregation_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.tick().await {
                RoundOutcome::NotReady { .. } => {}
                RoundOutcome::Deferred(e) => warn!("aggregation deferred: {}", e),
                RoundOutcome::Completed {
                    model,
                    delivered,
                    dropped,
                } => info!(
                    "round completed: {} sent to {} clients ({} dropped)",
                    model, delivered, dropped
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;
    use crate::{protocol::Connection, settings::Settings, storage::MemoryStore};

    struct FakeAggregator {
        model: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeAggregator {
        fn new(model: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                model: model.map(String::from),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Aggregator for FakeAggregator {
        async fn request_round(&self) -> Result<String, AggregatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.model.clone().ok_or(AggregatorError::Empty)
        }
    }

    fn context(k: usize, store: Arc<MemoryStore>) -> Arc<Context> {
        Arc::new(Context::new(
            &Settings::default(),
            NonZeroUsize::new(k).unwrap(),
            store,
        ))
    }

    fn buffered(ctx: &Context) -> DuplexStream {
        let (local, remote) = duplex(1024);
        ctx.buffer.insert(Connection::new(local, "test")).unwrap();
        remote
    }

    async fn expect_model(remote: DuplexStream) -> Vec<u8> {
        let mut remote = BufReader::new(remote);
        let mut size = String::new();
        remote.read_line(&mut size).await.unwrap();
        remote.write_all(b"OK\n").await.unwrap();
        let mut model = vec![0u8; size.trim().parse().unwrap()];
        remote.read_exact(&mut model).await.unwrap();
        model
    }

    #[tokio::test]
    async fn no_aggregation_below_capacity() {
        let ctx = context(2, Arc::new(MemoryStore::new()));
        let aggregator = FakeAggregator::new(Some("global.ckpt"));
        let orchestrator = RoundOrchestrator::new(Arc::clone(&ctx), aggregator.clone());
        let _remote = buffered(&ctx);

        assert!(matches!(
            orchestrator.tick().await,
            RoundOutcome::NotReady { occupancy: 1 }
        ));
        assert_eq!(aggregator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_aggregation_keeps_the_buffer() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(2, store.clone());
        let _r1 = buffered(&ctx);
        let _r2 = buffered(&ctx);

        let orchestrator = RoundOrchestrator::new(Arc::clone(&ctx), FakeAggregator::new(None));
        assert!(matches!(
            orchestrator.tick().await,
            RoundOutcome::Deferred(RoundError::Aggregator(AggregatorError::Empty))
        ));
        assert_eq!(ctx.buffer.len(), 2);

        // the aggregator names a model that does not exist
        let orchestrator =
            RoundOrchestrator::new(Arc::clone(&ctx), FakeAggregator::new(Some("missing.ckpt")));
        assert!(matches!(
            orchestrator.tick().await,
            RoundOutcome::Deferred(RoundError::MissingModel(_))
        ));
        assert_eq!(ctx.buffer.len(), 2);
        assert!(ctx.idle.is_empty().await);
    }

    #[tokio::test]
    async fn completed_round() {
        let store = Arc::new(MemoryStore::new());
        store.put_global_model("global.ckpt", Bytes::from_static(b"weights"));
        let ctx = context(3, store);
        let r1 = buffered(&ctx);
        let r2 = buffered(&ctx);
        drop(buffered(&ctx));

        let clients = tokio::spawn(async move { (expect_model(r1).await, expect_model(r2).await) });
        let orchestrator =
            RoundOrchestrator::new(Arc::clone(&ctx), FakeAggregator::new(Some("global.ckpt")));
        match orchestrator.tick().await {
            RoundOutcome::Completed {
                model,
                delivered,
                dropped,
            } => {
                assert_eq!(model, "global.ckpt");
                assert_eq!(delivered, 2);
                assert_eq!(dropped, 1);
            }
            outcome => panic!("unexpected outcome {:?}", outcome),
        }

        let (m1, m2) = clients.await.unwrap();
        assert_eq!(m1, b"weights");
        assert_eq!(m2, b"weights");
        assert!(ctx.buffer.is_empty());
        assert_eq!(ctx.idle.len().await, 2);
    }
}
