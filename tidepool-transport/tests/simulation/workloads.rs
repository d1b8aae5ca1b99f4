//! Workload driver: runs seeded operation batches against memory transports.
//!
//! Operations in one batch touch distinct connections and run concurrently,
//! so connects, closes and sends race on shared links the way independent
//! callers would.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tidepool_transport::{
    ConnectHints, Connection, EndPointAddress, Endpoint, MemoryNetworkProvider, Reliability,
    TokioProviders, Transport, TransportConfig,
};

use super::operations::{OpWeights, TransportOp, pick_operation};
use super::reference_model::TransportRefModel;

type MemoryProviders = TokioProviders<MemoryNetworkProvider>;
type BatchStep<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

/// How long the settle phase waits for the expected events.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shape of one simulation run.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub seed: u64,
    pub transports: usize,
    pub endpoints_per_transport: usize,
    pub operations: usize,
    pub max_batch: usize,
    pub weights: OpWeights,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            transports: 2,
            endpoints_per_transport: 2,
            operations: 150,
            max_batch: 4,
            weights: OpWeights::default(),
        }
    }
}

impl WorkloadConfig {
    /// Same shape, different seed.
    pub fn with_seed(&self, seed: u64) -> Self {
        Self {
            seed,
            ..self.clone()
        }
    }
}

/// An operation resolved against the live connections.
#[derive(Debug)]
enum Step {
    Connect { from: usize, to: usize },
    Send { slot: u64, chunks: Vec<Vec<u8>> },
    Close { slot: u64 },
    CloseLink { from: usize, to: usize },
}

struct Harness {
    endpoints: Vec<Endpoint<MemoryProviders>>,
    model: RefCell<TransportRefModel>,
    slots: RefCell<BTreeMap<u64, Rc<Connection>>>,
    next_slot: Cell<u64>,
}

/// Run one seeded workload and return the model after the run settled.
pub async fn run_workload(config: &WorkloadConfig) -> TransportRefModel {
    let network = MemoryNetworkProvider::new();
    let mut transports = Vec::with_capacity(config.transports);
    for _ in 0..config.transports {
        let transport = Transport::new(
            TokioProviders::with_network(network.clone()),
            TransportConfig::default(),
        )
        .await
        .expect("bind memory transport");
        transports.push(transport);
    }

    let mut endpoints = Vec::new();
    for transport in &transports {
        for _ in 0..config.endpoints_per_transport {
            endpoints.push(transport.new_endpoint().expect("new endpoint"));
        }
    }
    let addresses: Vec<EndPointAddress> = endpoints.iter().map(|e| e.address().clone()).collect();

    let mut harness = Harness {
        endpoints,
        model: RefCell::new(TransportRefModel::new(addresses)),
        slots: RefCell::new(BTreeMap::new()),
        next_slot: Cell::new(0),
    };
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let endpoint_count = harness.endpoints.len();

    let mut remaining = config.operations;
    while remaining > 0 {
        let size = rng.random_range(1..=config.max_batch).min(remaining);
        remaining -= size;

        let ops: Vec<TransportOp> = (0..size)
            .map(|_| pick_operation(&mut rng, endpoint_count, &config.weights))
            .collect();
        let drain = ops.contains(&TransportOp::Drain);
        let steps = harness.plan(ops);
        tracing::debug!("batch: {:?}", steps);

        let mut batch: Vec<BatchStep<'_>> = Vec::with_capacity(steps.len());
        for step in steps {
            batch.push(Box::pin(harness.execute(step)));
        }
        join_all(batch).await;

        if drain {
            harness.drain();
        }
    }

    harness.settle().await;

    let Harness {
        endpoints, model, ..
    } = harness;
    drop(endpoints);
    for transport in &transports {
        transport.close();
    }
    model.into_inner()
}

impl Harness {
    /// Resolve slot picks and drop operations that would race on the same
    /// connection or link within the batch.
    fn plan(&self, ops: Vec<TransportOp>) -> Vec<Step> {
        let model = self.model.borrow();
        let live: Vec<u64> = self.slots.borrow().keys().copied().collect();
        let mut claimed: BTreeSet<u64> = BTreeSet::new();
        let mut connecting: BTreeSet<(usize, usize)> = BTreeSet::new();
        let mut closing_links: BTreeSet<(usize, usize)> = BTreeSet::new();
        let mut steps = Vec::new();

        for op in ops {
            match op {
                TransportOp::Connect { from, to } => {
                    if closing_links.contains(&(from, to)) {
                        continue;
                    }
                    connecting.insert((from, to));
                    steps.push(Step::Connect { from, to });
                }
                TransportOp::Send { pick, chunks } => {
                    if live.is_empty() {
                        continue;
                    }
                    let slot = live[pick % live.len()];
                    if claimed.insert(slot) {
                        steps.push(Step::Send { slot, chunks });
                    }
                }
                TransportOp::Close { pick } => {
                    if live.is_empty() {
                        continue;
                    }
                    let slot = live[pick % live.len()];
                    if claimed.insert(slot) {
                        steps.push(Step::Close { slot });
                    }
                }
                TransportOp::CloseLink { from, to } => {
                    if connecting.contains(&(from, to)) {
                        continue;
                    }
                    let affected = model.open_slots(from, to);
                    if affected.iter().any(|slot| claimed.contains(slot)) {
                        continue;
                    }
                    claimed.extend(affected);
                    closing_links.insert((from, to));
                    steps.push(Step::CloseLink { from, to });
                }
                TransportOp::Drain => {}
            }
        }
        steps
    }

    async fn execute(&self, step: Step) {
        match step {
            Step::Connect { from, to } => {
                let remote = self.model.borrow().addresses[to].clone();
                let result = self.endpoints[from]
                    .connect(&remote, Reliability::ReliableOrdered, ConnectHints::default())
                    .await;
                match result {
                    Ok(connection) => {
                        let slot = self.next_slot.get();
                        self.next_slot.set(slot + 1);
                        self.model.borrow_mut().record_connect(slot, from, to);
                        self.slots.borrow_mut().insert(slot, Rc::new(connection));
                    }
                    Err(e) => self
                        .model
                        .borrow_mut()
                        .record_failure(format!("connect {} -> {}: {}", from, to, e)),
                }
            }
            Step::Send { slot, chunks } => {
                let Some(connection) = self.slots.borrow().get(&slot).cloned() else {
                    return;
                };
                let tag = TransportRefModel::tag(slot);
                let mut pieces: Vec<&[u8]> = vec![tag.as_slice()];
                pieces.extend(chunks.iter().map(Vec::as_slice));

                self.model.borrow_mut().record_send(slot, pieces.concat());
                if let Err(e) = connection.send(&pieces).await {
                    self.model
                        .borrow_mut()
                        .record_failure(format!("send on slot {}: {}", slot, e));
                }
            }
            Step::Close { slot } => {
                let connection = self.slots.borrow_mut().remove(&slot);
                if let Some(connection) = connection {
                    connection.close();
                    self.model.borrow_mut().record_close(slot);
                }
            }
            Step::CloseLink { from, to } => {
                let remote = self.model.borrow().addresses[to].clone();
                self.endpoints[from].close_link(&remote);

                let affected = self.model.borrow().open_slots(from, to);
                for slot in affected {
                    self.slots.borrow_mut().remove(&slot);
                    self.model.borrow_mut().record_close(slot);
                }
            }
        }
    }

    /// Move every queued event into the model.
    fn drain(&mut self) {
        let model = self.model.get_mut();
        for (index, endpoint) in self.endpoints.iter_mut().enumerate() {
            while let Some(event) = endpoint.try_receive() {
                model.observe(index, event);
            }
        }
    }

    /// Drain until every expected event arrived, then once more to catch
    /// anything extra.
    async fn settle(&mut self) {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            self.drain();
            let model = self.model.get_mut();
            if model.events_seen >= model.expected_events() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.drain();
    }
}

/// Poll every future to completion on the current task.
async fn join_all(mut futures: Vec<BatchStep<'_>>) {
    poll_fn(|cx| {
        futures.retain_mut(|future| future.as_mut().poll(cx).is_pending());
        if futures.is_empty() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await
}
