// src/core/supervisor.rs

//! The coordinator supervisor: restores persisted state, subscribes to the
//! coordination channels and routes each event to the subarray that owns it.
//!
//! Events for one subarray are consumed strictly FIFO by a dedicated worker
//! task, so a RETURN and a REC_END can never interleave mid-transition;
//! workers for different subarrays run in parallel and share only the free
//! pool and the store client.

use crate::config::Config;
use crate::core::analyzer::CircusClient;
use crate::core::client::{KeyValueStore, RedisClient, Subscriber};
use crate::core::context::Context;
use crate::core::events::{ChannelMessage, Event};
use crate::core::fsm::{
    FreeSubState, FreeSubscribedMachine, RecProcMachine, RecProcState, SubarrayData,
};
use crate::core::instance::InstanceSet;
use crate::core::persist::{self, Snapshot};
use crate::core::{CoordinatorError, util};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Queued events per subarray before the sender backpressures.
const WORKER_QUEUE_DEPTH: usize = 64;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// One subarray's machines plus their shared role sets, driven from a FIFO
/// event queue.
pub struct SubarrayWorker {
    array: String,
    ctx: Arc<Context>,
    freesub: FreeSubscribedMachine,
    recproc: RecProcMachine,
    data: SubarrayData,
}

impl SubarrayWorker {
    /// Builds the worker from its persisted snapshot when one exists,
    /// otherwise in (FREE, READY) with the full configured instance set
    /// ready. Restoration runs no entry side effects.
    pub async fn create(array: &str, ctx: Arc<Context>) -> Self {
        match persist::load_snapshot(&*ctx.store, array).await {
            Ok(Some(snap)) => {
                info!("Restoring {array} from snapshot: {snap:?}");
                Self::from_snapshot(array, ctx, &snap)
            }
            Ok(None) => Self::fresh(array, ctx),
            Err(e) => {
                warn!("Could not read snapshot for {array}, starting fresh: {e}");
                Self::fresh(array, ctx)
            }
        }
    }

    fn fresh(array: &str, ctx: Arc<Context>) -> Self {
        let all: InstanceSet = ctx.config.instances().into_iter().collect();
        Self {
            array: array.to_string(),
            freesub: FreeSubscribedMachine::new(array, ctx.clone()),
            recproc: RecProcMachine::new(array, ctx.clone()),
            data: SubarrayData::with_ready(all),
            ctx,
        }
    }

    pub fn from_snapshot(array: &str, ctx: Arc<Context>, snap: &Snapshot) -> Self {
        let freesub_state = snap
            .freesub_state
            .parse::<FreeSubState>()
            .unwrap_or_else(|_| {
                warn!(
                    "Unknown Free/Subscribed state '{}' for {array}, defaulting to FREE",
                    snap.freesub_state
                );
                FreeSubState::Free
            });
        let recproc_state = RecProcState::from_name(&snap.recproc_state).unwrap_or_else(|| {
            warn!(
                "Unknown Rec/Proc state '{}' for {array}, defaulting to READY",
                snap.recproc_state
            );
            RecProcState::Ready
        });
        let data = SubarrayData {
            subscribed: snap.subscribed.iter().cloned().collect(),
            ready: snap.ready.iter().cloned().collect(),
            recording: snap.recording.iter().cloned().collect(),
            processing: snap.processing.iter().cloned().collect(),
        };
        Self {
            array: array.to_string(),
            freesub: FreeSubscribedMachine::restore(array, ctx.clone(), freesub_state),
            recproc: RecProcMachine::restore(array, ctx.clone(), recproc_state),
            data,
            ctx,
        }
    }

    /// Dispatches one event to both machines, then persists the resulting
    /// snapshot. Persistence is best-effort: the in-memory state remains
    /// authoritative.
    pub async fn handle_event(&mut self, event: &Event) {
        self.freesub.handle_event(event, &mut self.data).await;
        self.recproc.handle_event(event, &mut self.data).await;
        self.persist().await;
    }

    pub async fn persist(&self) {
        let snap = self.snapshot();
        util::log_error(
            "persisting subarray state",
            persist::save_snapshot(&*self.ctx.store, &self.array, &snap).await,
        );
        util::log_error(
            "persisting free set",
            persist::save_free(&*self.ctx.store, &self.ctx.pool.snapshot()).await,
        );
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            recproc_state: self.recproc.state_name().to_string(),
            freesub_state: self.freesub.state().to_string(),
            subscribed: self.data.subscribed.iter().cloned().collect(),
            ready: self.data.ready.iter().cloned().collect(),
            recording: self.data.recording.iter().cloned().collect(),
            processing: self.data.processing.iter().cloned().collect(),
        }
    }

    pub fn array(&self) -> &str {
        &self.array
    }

    pub fn data(&self) -> &SubarrayData {
        &self.data
    }

    pub fn freesub_state(&self) -> FreeSubState {
        self.freesub.state()
    }

    pub fn recproc_state_name(&self) -> &'static str {
        self.recproc.state_name()
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(&event).await;
        }
        info!("Worker for {} shutting down.", self.array);
    }
}

/// The supervisor process: builds the shared context, spawns one worker per
/// configured subarray and pumps the subscription connection.
pub struct Supervisor {
    ctx: Arc<Context>,
    senders: DashMap<String, mpsc::Sender<Event>>,
    tasks: JoinSet<()>,
}

impl Supervisor {
    pub async fn start(config: Config) -> Result<Self> {
        let addr = config.redis_addr();
        let store: Arc<dyn KeyValueStore> = Arc::new(RedisClient::connect(&addr).await?);
        let ctx = Context::new(store, Arc::new(config), Arc::new(CircusClient));

        // A run id distinguishes restarts in the logs.
        let mut runid_bytes = [0u8; 20];
        getrandom::fill(&mut runid_bytes)
            .map_err(|e| CoordinatorError::Internal(format!("run id generation failed: {e}")))?;
        info!("Coordinator run ID: {}", hex::encode(runid_bytes));

        // Restore the free pool, or seed it from configuration on a first
        // start.
        match persist::load_free(&*ctx.store).await {
            Ok(Some(free)) => ctx.pool.replace(free),
            Ok(None) => {
                info!("First configuration - no free instance set. Seeding from config file.");
                util::log_error(
                    "seeding free set",
                    persist::save_free(&*ctx.store, &ctx.pool.snapshot()).await,
                );
            }
            Err(e) => warn!("Could not restore free set, using configured instances: {e}"),
        }

        let mut tasks = JoinSet::new();
        let senders = DashMap::new();
        for array in ctx.config.arrays.clone() {
            let worker = SubarrayWorker::create(&array, ctx.clone()).await;
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            tasks.spawn(worker.run(rx));
            senders.insert(array, tx);
        }

        ctx.alerts.alert("starting up").await;

        Ok(Self {
            ctx,
            senders,
            tasks,
        })
    }

    /// Routes one parsed message: RETURNs are broadcast to every Rec/Proc
    /// machine (the one owning the instance consumes it), everything else
    /// goes to its named subarray.
    pub async fn dispatch(&self, message: ChannelMessage) {
        match message.array {
            None => {
                // Collect first so no registry lock is held across an await.
                let targets: Vec<mpsc::Sender<Event>> =
                    self.senders.iter().map(|e| e.value().clone()).collect();
                for tx in targets {
                    if tx.send(message.event.clone()).await.is_err() {
                        warn!("A subarray worker has stopped accepting events");
                    }
                }
            }
            Some(array) => {
                let Some(tx) = self.senders.get(&array).map(|e| e.value().clone()) else {
                    warn!("Ignoring event for unknown subarray: {array}");
                    return;
                };
                if tx.send(message.event).await.is_err() {
                    warn!("Worker for {array} has stopped accepting events");
                }
            }
        }
    }

    /// Pumps the event channels forever, reconnecting with backoff when the
    /// subscription connection drops.
    pub async fn run(self) -> Result<()> {
        let addr = self.ctx.config.redis_addr();
        let channels = self.ctx.config.channels.clone();
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            let mut subscriber = match Subscriber::connect(&addr, &channels).await {
                Ok(subscriber) => {
                    info!("Subscribed to channels: {channels:?}");
                    reconnect_delay = INITIAL_RECONNECT_DELAY;
                    subscriber
                }
                Err(e) => {
                    warn!("Could not subscribe to event channels: {e}. Retrying in {reconnect_delay:?}...");
                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                    continue;
                }
            };

            loop {
                match subscriber.next_message().await {
                    Ok((_channel, payload)) => match payload.parse::<ChannelMessage>() {
                        Ok(message) => self.dispatch(message).await,
                        Err(e) => warn!("{e}"),
                    },
                    Err(e) => {
                        warn!("Event subscription lost: {e}. Reconnecting...");
                        break;
                    }
                }
            }
        }
    }

    /// Aborts all worker tasks; used on shutdown.
    pub async fn shutdown(mut self) {
        self.senders.clear();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Administrative reset: clears the free set and every configured array's
/// snapshot so a restarted coordinator initializes to defaults. The
/// documented way out of the WAITING and ERROR sinks.
pub async fn reset(config: &Config) -> Result<u64> {
    let store = RedisClient::connect(&config.redis_addr()).await?;
    persist::clear(&store, &config.arrays).await
}

/// One-shot operator status summary over the configured fleet.
pub async fn status(config: &Config) -> Result<String> {
    use crate::core::alerts::Alerts;
    use crate::core::gateway::Gateway;
    use crate::core::status::fleet_status;

    let store: Arc<dyn KeyValueStore> = Arc::new(RedisClient::connect(&config.redis_addr()).await?);
    let alerts = Alerts::new(store.clone(), &config.slack_channel, &config.grafana_url);
    let gateway = Gateway::new(store.clone(), alerts, &config.gateway_domain);
    let summary = fleet_status(&*store, &gateway, &config.instances()).await?;
    Ok(summary.render())
}
