//! The round coordinator.
//!
//! A client connection is owned by exactly one of the following at any time:
//!
//! - the task serving its initial commands ([`dispatch`])
//! - the [`IdlePool`], between rounds
//! - the task waiting for its upload announcement, while it trains
//! - the [`AdmissionQueue`], until its upload is admitted
//! - the upload worker ([`upload`]), during the transfer
//! - the [`AggregationBuffer`], until the round completes
//! - the [`RoundOrchestrator`], while the global model is sent back
//!
//! Connections that fail at any step are dropped, which closes them.
pub mod buffer;
pub mod dispatch;
pub mod idle;
pub mod queue;
pub mod round;
pub mod upload;

pub use self::{
    buffer::{AggregationBuffer, Cohort},
    idle::IdlePool,
    queue::{Admission, AdmissionQueue, QueuedEntry},
    round::{RoundError, RoundOrchestrator, RoundOutcome},
    upload::UploadKind,
};

use std::{future, io, net::SocketAddr, num::NonZeroUsize, sync::Arc, time::Duration};

use tokio::{
    net::TcpListener,
    time::{interval, MissedTickBehavior},
};

use crate::{
    aggregator::Aggregator,
    discovery::DiscoveryResponder,
    protocol::{Connection, TransferOptions},
    settings::Settings,
    storage::Store,
};

/// State shared by the coordinator tasks.
pub struct Context {
    pub idle: IdlePool,
    pub queue: Arc<AdmissionQueue>,
    pub buffer: Arc<AggregationBuffer>,
    pub store: Arc<dyn Store>,
    pub transfer: TransferOptions,
    /// Time a client may take between `RETRAIN` and its upload announcement.
    pub training_timeout: Option<Duration>,
    pub retrain_interval: Duration,
    pub aggregation_interval: Duration,
}

impl Context {
    pub fn new(settings: &Settings, cohort_size: NonZeroUsize, store: Arc<dyn Store>) -> Self {
        Self {
            idle: IdlePool::new(),
            queue: Arc::new(AdmissionQueue::new()),
            buffer: Arc::new(AggregationBuffer::new(cohort_size.get())),
            store,
            transfer: TransferOptions {
                step_timeout: settings.timeouts.step(),
                max_model_size: settings.limits.max_model_size,
            },
            training_timeout: settings.timeouts.training(),
            retrain_interval: settings.rounds.retrain_interval(),
            aggregation_interval: settings.rounds.aggregation_interval(),
        }
    }
}

pub struct Coordinator {
    ctx: Arc<Context>,
    listener: TcpListener,
    discovery: Option<DiscoveryResponder>,
    aggregator: Arc<dyn Aggregator>,
}

impl Coordinator {
    /// Binds the client listener and, if enabled, the discovery responder.
    pub async fn bind(
        settings: &Settings,
        cohort_size: NonZeroUsize,
        store: Arc<dyn Store>,
        aggregator: Arc<dyn Aggregator>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&settings.network.bind_address).await?;
        let port = listener.local_addr()?.port();
        info!("listening for clients on {}", listener.local_addr()?);

        let discovery = if settings.network.discovery_enabled {
            let responder =
                DiscoveryResponder::bind(&settings.network.discovery_address, port).await?;
            info!("answering discovery requests on {}", responder.local_addr()?);
            Some(responder)
        } else {
            None
        };

        Ok(Self {
            ctx: Arc::new(Context::new(settings, cohort_size, store)),
            listener,
            discovery,
            aggregator,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<Context> {
        Arc::clone(&self.ctx)
    }

    /// Runs the coordinator. Dropping the returned future stops the background workers;
    /// client tasks already spawned run until their current step ends.
    pub async fn run(self) {
        let Self {
            ctx,
            listener,
            discovery,
            aggregator,
        } = self;
        info!(
            "starting coordinator with a cohort size of {}",
            ctx.buffer.capacity()
        );
        let orchestrator = RoundOrchestrator::new(Arc::clone(&ctx), aggregator);
        let discovery = async move {
            match discovery {
                Some(responder) => responder.run().await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            _ = accept(&listener, Arc::clone(&ctx)) => {}
            _ = retrain(Arc::clone(&ctx)) => {}
            _ = upload::run_uploads(Arc::clone(&ctx)) => {}
            _ = orchestrator.run() => {}
            _ = discovery => {}
        }
    }
}

async fn accept(listener: &TcpListener, ctx: Arc<Context>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let conn = Connection::from_tcp(stream);
                tokio::spawn(dispatch::serve(Arc::clone(&ctx), conn));
            }
            Err(e) => {
                error!("failed to accept a connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Periodically tells the idle clients to train and waits for their uploads.
async fn retrain(ctx: Arc<Context>) {
    let mut ticks = interval(ctx.retrain_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        for conn in ctx.idle.broadcast_retrain(ctx.transfer.step_timeout).await {
            tokio::spawn(upload::await_announcement(Arc::clone(&ctx), conn));
        }
    }
}
