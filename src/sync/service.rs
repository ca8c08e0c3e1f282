// Kestrel
// Copyright (C) 2024  Kestrel contributors
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Background synchronization service.
//!
//! The [`SyncService`] owns the worker pool and the strategies, and runs a
//! background task that ticks every slot: it asks the current strategy for
//! requests, dispatches them, feeds the results back, applies the resulting
//! reputation changes and bans, and switches from the warp strategy to the
//! full strategy when the former reports completion.
//!
//! Inbound network events (handshakes, block announcements, disconnects)
//! are delivered through the `handle_*` methods, which may be called
//! concurrently; they serialize on the same internal lock as the tick.

use super::worker_pool::SyncWorkerPool;
use super::{MetricsSink, NoopMetrics, Strategy};
use crate::chain::BlockState;
use crate::informant::HashDisplay;
use crate::network::{
    BlockAnnounce, BlockAnnounceHandshake, Network, NetworkError, PeerId,
};

use core::pin::Pin;
use futures::channel::oneshot;
use futures::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Default number of workers required before the tick loop starts.
pub const DEFAULT_MIN_PEERS: usize = 1;

/// Default time between two worker-availability checks during startup.
pub const DEFAULT_WAIT_PEERS_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the recently-seen block announcements cache.
const SEEN_BLOCK_REQUESTS_CAPACITY: usize = 100;

/// Configuration for a [`SyncService`].
pub struct Config {
    /// Access to the peer-to-peer machinery.
    pub network: Arc<dyn Network>,

    /// Access to the locally stored chain.
    pub block_state: Arc<dyn BlockState>,

    /// Terminal strategy, always configured.
    pub full_sync: Box<dyn Strategy>,

    /// Optional bootstrap strategy. When set, syncing starts with it and
    /// switches to [`Config::full_sync`] once it reports completion.
    pub warp_sync: Option<Box<dyn Strategy>>,

    /// Time between two ticks.
    pub slot_duration: Duration,

    /// Number of workers required before the tick loop starts. Defaults to
    /// [`DEFAULT_MIN_PEERS`].
    pub min_peers: Option<usize>,

    /// Time between two worker-availability checks during startup. Defaults
    /// to [`DEFAULT_WAIT_PEERS_TIMEOUT`].
    pub wait_peers_timeout: Option<Duration>,

    /// Sink the `is_synced` gauge is exported to. Defaults to a no-op sink.
    pub metrics: Option<Arc<dyn MetricsSink>>,

    /// Number of bytes used to encode block numbers on the wire.
    pub block_number_bytes: usize,

    /// Closure that spawns background tasks.
    pub tasks_executor: Box<dyn FnMut(Pin<Box<dyn Future<Output = ()> + Send>>) + Send>,
}

/// Background task driving the synchronization. See the module
/// documentation.
pub struct SyncService {
    inner: Arc<Inner>,
    /// Closing this channel makes the background task exit at its next wait
    /// point.
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    /// Resolved by the background task right before it exits.
    finished: futures::lock::Mutex<Option<oneshot::Receiver<()>>>,
}

struct Inner {
    network: Arc<dyn Network>,
    block_state: Arc<dyn BlockState>,
    strategies: futures::lock::Mutex<Strategies>,
    worker_pool: SyncWorkerPool,
    metrics: Arc<dyn MetricsSink>,
    block_number_bytes: usize,
    slot_duration: Duration,
    wait_peers_timeout: Duration,
    min_peers: usize,
    /// Recently seen announced blocks, used to drop repeated announcements
    /// of the same block before they reach the strategy.
    seen_block_requests: Mutex<lru::LruCache<[u8; 32], u64, fnv::FnvBuildHasher>>,
}

struct Strategies {
    current: Box<dyn Strategy>,
    /// `Some` while the bootstrap strategy is running; moved into `current`
    /// when it reports completion.
    full: Option<Box<dyn Strategy>>,
}

impl SyncService {
    /// Initializes the service and spawns its background task through
    /// [`Config::tasks_executor`].
    pub fn new(mut config: Config) -> SyncService {
        let (current, full) = match config.warp_sync {
            Some(warp) => (warp, Some(config.full_sync)),
            None => (config.full_sync, None),
        };

        let inner = Arc::new(Inner {
            network: config.network,
            block_state: config.block_state,
            strategies: futures::lock::Mutex::new(Strategies { current, full }),
            worker_pool: SyncWorkerPool::new(),
            metrics: config.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            block_number_bytes: config.block_number_bytes,
            slot_duration: config.slot_duration,
            wait_peers_timeout: config
                .wait_peers_timeout
                .unwrap_or(DEFAULT_WAIT_PEERS_TIMEOUT),
            min_peers: config.min_peers.unwrap_or(DEFAULT_MIN_PEERS),
            seen_block_requests: Mutex::new(lru::LruCache::with_hasher(
                SEEN_BLOCK_REQUESTS_CAPACITY,
                Default::default(),
            )),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        (config.tasks_executor)(Box::pin(run_sync_engine(
            inner.clone(),
            shutdown_rx,
            finished_tx,
        )));

        SyncService {
            inner,
            shutdown: Mutex::new(Some(shutdown_tx)),
            finished: futures::lock::Mutex::new(Some(finished_rx)),
        }
    }

    /// Signals the background task to stop and waits for it to do so.
    ///
    /// In-flight requests are abandoned; their results are discarded when
    /// they arrive.
    pub async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        if let Some(finished) = self.finished.lock().await.take() {
            let _ = finished.await;
        }
    }

    /// Delivers a block-announces handshake received from a peer. The peer
    /// becomes a sync worker.
    pub async fn handle_block_announce_handshake(
        &self,
        who: PeerId,
        handshake: &BlockAnnounceHandshake,
    ) -> Result<(), super::Error> {
        tracing::debug!(peer = %who, "received block announce handshake");
        self.inner.worker_pool.add_worker(&who);

        let mut strategies = self.inner.strategies.lock().await;
        strategies.current.on_block_announce_handshake(who, handshake)
    }

    /// Delivers a block announcement received from a peer, applying any
    /// reputation change the strategy emits.
    ///
    /// Repeated non-best announcements of a recently seen block are dropped
    /// without reaching the strategy.
    pub async fn handle_block_announce(
        &self,
        who: PeerId,
        announce: &BlockAnnounce,
    ) -> Result<(), super::Error> {
        let announce_hash = announce.header.hash(self.inner.block_number_bytes);
        {
            let mut seen = self.inner.seen_block_requests.lock();
            if !announce.is_best && seen.contains(&announce_hash) {
                return Ok(());
            }
            seen.put(announce_hash, announce.header.number);
        }

        let (change, result) = {
            let mut strategies = self.inner.strategies.lock().await;
            strategies.current.on_block_announce(who, announce)
        };

        if let Some(change) = change {
            self.inner.network.report_peer(&change.who, change.rep);
        }

        result
    }

    /// Tells the service that a peer disconnected; it stops being a sync
    /// worker.
    pub fn on_connection_closed(&self, who: &PeerId) {
        tracing::trace!(peer = %who, "removing sync worker");
        self.inner.worker_pool.remove_worker(who);
    }

    /// Returns `true` once the current strategy considers the node caught
    /// up with the head of the chain.
    pub async fn is_synced(&self) -> bool {
        self.inner.strategies.lock().await.current.is_synced()
    }

    /// Number of the local best block, for external reporting.
    pub fn highest_block(&self) -> u64 {
        self.inner.block_state.best_block_number()
    }
}

async fn run_sync_engine(
    inner: Arc<Inner>,
    shutdown: oneshot::Receiver<()>,
    on_finished: oneshot::Sender<()>,
) {
    let mut shutdown = shutdown.fuse();

    // Wait-workers phase: periodically invite peers to open block-announce
    // substreams until enough workers joined.
    loop {
        if inner.worker_pool.total_workers() >= inner.min_peers {
            break;
        }

        let best = inner.block_state.best_block_header();
        match inner.network.block_announce_handshake(&best) {
            Ok(()) | Err(NetworkError::NoPeersConnected) => {}
            Err(err) => {
                tracing::error!(error = %err, "waiting for sync workers");
                break;
            }
        }

        futures::select! {
            _ = futures_timer::Delay::new(inner.wait_peers_timeout).fuse() => {}
            _ = shutdown => {
                let _ = on_finished.send(());
                return;
            }
        }
    }

    tracing::info!("starting sync engine");

    loop {
        futures::select! {
            _ = futures_timer::Delay::new(inner.slot_duration).fuse() => {}
            _ = shutdown => break,
        }

        run_strategy(&inner).await;

        let synced = inner.strategies.lock().await.current.is_synced();
        inner.metrics.set_is_synced(synced);
    }

    let _ = on_finished.send(());
}

async fn run_strategy(inner: &Arc<Inner>) {
    let mut strategies = inner.strategies.lock().await;

    let finalized = inner.block_state.highest_finalized_header();
    let best = inner.block_state.best_block_header();
    tracing::info!(
        peers = inner.network.connected_peers().len(),
        finalized = finalized.number,
        finalized_hash = %HashDisplay(&finalized.hash(inner.block_number_bytes)),
        best = best.number,
        best_hash = %HashDisplay(&best.hash(inner.block_number_bytes)),
        "syncing",
    );

    let tasks = match strategies.current.next_actions() {
        Ok(tasks) => tasks,
        Err(err) => {
            tracing::error!(error = %err, "sync strategy failed to emit requests");
            return;
        }
    };

    tracing::trace!(num_tasks = tasks.len(), "requests to dispatch");
    if tasks.is_empty() {
        return;
    }

    let results = inner.worker_pool.submit_requests(tasks).await;

    let outcome = match strategies.current.process(results) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "sync strategy failed to process results");
            return;
        }
    };

    for change in outcome.reputation_changes {
        inner.network.report_peer(&change.who, change.rep);
    }
    for who in outcome.peers_to_ban {
        inner.worker_pool.ignore_peer(&who);
    }

    strategies.current.show_metrics();

    if outcome.done {
        // Switch to full sync when the bootstrap strategy finishes.
        if let Some(full) = strategies.full.take() {
            tracing::info!("bootstrap strategy finished, switching to full sync");
            strategies.current = full;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, SyncService};
    use crate::chain::{BlockState, ImportError};
    use crate::header::{Digest, Header};
    use crate::network::{
        rep, BlockAnnounce, BlockAnnounceHandshake, BlockData, Network, NetworkError, PeerId,
        ReputationChange, Request, RequestError, RequestMaker, Response,
    };
    use crate::sync::{
        Change, Error, MetricsSink, ProcessOutcome, Strategy, SyncTask, SyncTaskResult,
    };

    use futures::future::BoxFuture;
    use futures::FutureExt as _;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn header(number: u64) -> Header {
        Header {
            parent_hash: [0; 32],
            number,
            state_root: [0; 32],
            extrinsics_root: [0; 32],
            digest: Digest::empty(),
        }
    }

    struct MockNetwork {
        reported: Mutex<Vec<(PeerId, ReputationChange)>>,
    }

    impl MockNetwork {
        fn new() -> MockNetwork {
            MockNetwork {
                reported: Mutex::new(Vec::new()),
            }
        }
    }

    impl Network for MockNetwork {
        fn connected_peers(&self) -> Vec<PeerId> {
            vec![PeerId::from_bytes(&b"peer"[..])]
        }

        fn block_announce_handshake(&self, _best: &Header) -> Result<(), NetworkError> {
            Ok(())
        }

        fn report_peer(&self, who: &PeerId, change: ReputationChange) {
            self.reported.lock().push((who.clone(), change));
        }

        fn gossip_block_announce(&self, _announce: &BlockAnnounce, _excluded: Option<&PeerId>) {}
    }

    struct StaticChain;

    impl BlockState for StaticChain {
        fn best_block_header(&self) -> Header {
            header(0)
        }

        fn highest_finalized_header(&self) -> Header {
            header(0)
        }

        fn header(&self, _hash: &[u8; 32]) -> Option<Header> {
            None
        }

        fn header_by_number(&self, _number: u64) -> Option<Header> {
            None
        }

        fn justification(&self, _hash: &[u8; 32]) -> Option<Vec<u8>> {
            None
        }

        fn compare_and_set_block_data(&self, _block: &BlockData) -> Result<(), ImportError> {
            Ok(())
        }
    }

    struct InstantMaker;

    impl RequestMaker for InstantMaker {
        fn request(
            &self,
            _who: PeerId,
            _request: Request,
        ) -> BoxFuture<'static, Result<Response, RequestError>> {
            async { Ok(Response::Blocks(Vec::new())) }.boxed()
        }
    }

    /// Strategy with a scripted behavior, used to observe the service.
    struct ScriptedStrategy {
        /// Number of times `process` ran.
        processed: Arc<AtomicUsize>,
        /// Reported as `done` by every `process` call.
        done: bool,
        synced: bool,
    }

    impl Strategy for ScriptedStrategy {
        fn on_block_announce(
            &mut self,
            who: PeerId,
            _announce: &BlockAnnounce,
        ) -> (Option<Change>, Result<(), Error>) {
            (
                Some(Change {
                    who,
                    rep: rep::GOSSIP_SUCCESS,
                }),
                Ok(()),
            )
        }

        fn on_block_announce_handshake(
            &mut self,
            _who: PeerId,
            _handshake: &BlockAnnounceHandshake,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn next_actions(&mut self) -> Result<Vec<SyncTask>, Error> {
            Ok(vec![SyncTask {
                request: Request::WarpProof { begin: [0; 32] },
                request_maker: Arc::new(InstantMaker),
            }])
        }

        fn process(&mut self, _results: Vec<SyncTaskResult>) -> Result<ProcessOutcome, Error> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessOutcome {
                done: self.done,
                reputation_changes: Vec::new(),
                peers_to_ban: Vec::new(),
            })
        }

        fn show_metrics(&self) {}

        fn is_synced(&self) -> bool {
            self.synced
        }
    }

    struct LastSynced(AtomicBool);

    impl MetricsSink for LastSynced {
        fn set_is_synced(&self, synced: bool) {
            self.0.store(synced, Ordering::SeqCst);
        }
    }

    fn service(
        network: Arc<MockNetwork>,
        warp_done: bool,
        metrics: Arc<LastSynced>,
        warp_processed: Arc<AtomicUsize>,
        full_processed: Arc<AtomicUsize>,
    ) -> SyncService {
        SyncService::new(Config {
            network,
            block_state: Arc::new(StaticChain),
            full_sync: Box::new(ScriptedStrategy {
                processed: full_processed,
                done: false,
                synced: true,
            }),
            warp_sync: Some(Box::new(ScriptedStrategy {
                processed: warp_processed,
                done: warp_done,
                synced: false,
            })),
            slot_duration: Duration::from_millis(10),
            min_peers: Some(1),
            wait_peers_timeout: Some(Duration::from_millis(10)),
            metrics: Some(metrics),
            block_number_bytes: 4,
            tasks_executor: Box::new(|future| {
                async_std::task::spawn(future);
            }),
        })
    }

    #[async_std::test]
    async fn swaps_to_full_sync_when_done() {
        let network = Arc::new(MockNetwork::new());
        let metrics = Arc::new(LastSynced(AtomicBool::new(false)));
        let warp_processed = Arc::new(AtomicUsize::new(0));
        let full_processed = Arc::new(AtomicUsize::new(0));

        let service = service(
            network,
            true,
            metrics.clone(),
            warp_processed.clone(),
            full_processed.clone(),
        );

        service
            .handle_block_announce_handshake(
                PeerId::from_bytes(&b"peer"[..]),
                &BlockAnnounceHandshake {
                    roles: 1,
                    best_number: 100,
                    best_hash: [1; 32],
                    genesis_hash: [2; 32],
                },
            )
            .await
            .unwrap();

        async_std::task::sleep(Duration::from_millis(500)).await;

        // The warp strategy reported `done` on its first batch, after which
        // the full strategy must have been scheduled.
        assert!(warp_processed.load(Ordering::SeqCst) >= 1);
        assert!(full_processed.load(Ordering::SeqCst) >= 1);
        assert!(service.is_synced().await);
        assert!(metrics.0.load(Ordering::SeqCst));

        service.stop().await;
    }

    #[async_std::test]
    async fn strategy_not_swapped_while_not_done() {
        let network = Arc::new(MockNetwork::new());
        let metrics = Arc::new(LastSynced(AtomicBool::new(true)));
        let warp_processed = Arc::new(AtomicUsize::new(0));
        let full_processed = Arc::new(AtomicUsize::new(0));

        let service = service(
            network,
            false,
            metrics.clone(),
            warp_processed.clone(),
            full_processed.clone(),
        );

        service
            .handle_block_announce_handshake(
                PeerId::from_bytes(&b"peer"[..]),
                &BlockAnnounceHandshake {
                    roles: 1,
                    best_number: 100,
                    best_hash: [1; 32],
                    genesis_hash: [2; 32],
                },
            )
            .await
            .unwrap();

        async_std::task::sleep(Duration::from_millis(300)).await;

        assert!(warp_processed.load(Ordering::SeqCst) >= 1);
        assert_eq!(full_processed.load(Ordering::SeqCst), 0);
        assert!(!service.is_synced().await);
        assert!(!metrics.0.load(Ordering::SeqCst));

        service.stop().await;
    }

    #[async_std::test]
    async fn block_announce_reputation_is_applied() {
        let network = Arc::new(MockNetwork::new());
        let metrics = Arc::new(LastSynced(AtomicBool::new(false)));
        let service = service(
            network.clone(),
            false,
            metrics,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        let peer = PeerId::from_bytes(&b"peer"[..]);
        service
            .handle_block_announce(
                peer.clone(),
                &BlockAnnounce {
                    header: header(5),
                    is_best: true,
                },
            )
            .await
            .unwrap();

        let reported = network.reported.lock().clone();
        assert_eq!(reported, vec![(peer, rep::GOSSIP_SUCCESS)]);

        service.stop().await;
    }

    #[async_std::test]
    async fn repeated_non_best_announce_is_dropped() {
        let network = Arc::new(MockNetwork::new());
        let metrics = Arc::new(LastSynced(AtomicBool::new(false)));
        let service = service(
            network.clone(),
            false,
            metrics,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        let peer = PeerId::from_bytes(&b"peer"[..]);
        let announce = BlockAnnounce {
            header: header(5),
            is_best: false,
        };

        service
            .handle_block_announce(peer.clone(), &announce)
            .await
            .unwrap();
        service
            .handle_block_announce(peer, &announce)
            .await
            .unwrap();

        // Only the first delivery reached the strategy.
        assert_eq!(network.reported.lock().len(), 1);

        service.stop().await;
    }
}
