use std::{future::Future, time::Duration};

use bitcoin::Amount;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{
    engine::Engine,
    error::DriverError,
    traits::{Broadcaster, PoolApi, Reader, Signer, Wallet},
    types::{Obligation, PaymentResult, PaymentStatus},
};

/// This is an alias for the result type returned by the drivers.
pub type DriverResult<T> = Result<T, DriverError>;

/// Backoff after a failed loop iteration.
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Automated-mode settings; see the `[automation]` config section.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// Obligations per engine invocation.
    pub batch_size: usize,
    /// Blocks between payout rounds.
    pub block_period: u64,
    /// How often the trigger conditions are evaluated.
    pub poll_interval: Duration,
    /// Rounds are skipped while the wallet holds less than this.
    pub min_balance: Amount,
}

/// Cumulative counters of one [`AutoDriver`] session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub last_processed_block: u64,
    pub batches_run: u64,
    pub payments_succeeded: u64,
    pub payments_partial: u64,
    pub payments_failed: u64,
    pub total_paid: Amount,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            last_processed_block: 0,
            batches_run: 0,
            payments_succeeded: 0,
            payments_partial: 0,
            payments_failed: 0,
            total_paid: Amount::ZERO,
        }
    }
}

/// Long-running payout loop: every `poll_interval` it checks whether
/// `block_period` blocks have passed since the last round, work is pending
/// and the wallet balance clears the floor, and if so feeds the next
/// `batch_size` obligations to the engine.
pub struct AutoDriver<C, P> {
    engine: Engine<C, P>,
    cfg: AutomationConfig,
    stats: Mutex<SessionStats>,
}

impl<C, P> AutoDriver<C, P>
where
    C: Reader + Wallet + Signer + Broadcaster + Send + Sync,
    P: PoolApi + Send + Sync,
{
    pub fn new(engine: Engine<C, P>, cfg: AutomationConfig) -> Self {
        Self {
            engine,
            cfg,
            stats: Mutex::new(SessionStats::default()),
        }
    }

    /// A snapshot of the session counters.
    pub async fn status(&self) -> SessionStats {
        self.stats.lock().await.clone()
    }

    pub fn engine(&self) -> &Engine<C, P> {
        &self.engine
    }

    /// Runs until `cancel` fires. Iteration failures are logged and retried
    /// after a fixed backoff; only the initial chain probe is fatal.
    pub async fn run(&self, cancel: CancellationToken) -> DriverResult<()> {
        self.prime().await?;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let backoff = match self.iteration(&cancel).await {
                Ok(ran) => {
                    trace!(ran, "Payout iteration finished");
                    self.cfg.poll_interval
                }
                Err(e) => {
                    error!(%e, "Payout iteration failed");
                    ERROR_BACKOFF
                }
            };
            if sleep_or_cancelled(backoff, &cancel).await {
                break;
            }
        }
        info!("Automated payout loop stopped");
        Ok(())
    }

    /// Backdates the trigger so the first iteration fires immediately.
    async fn prime(&self) -> DriverResult<()> {
        let current = self.engine.chain().get_block_count().await?;
        let mut stats = self.stats.lock().await;
        stats.last_processed_block = current.saturating_sub(self.cfg.block_period);
        info!(
            block = current,
            period = self.cfg.block_period,
            batch_size = self.cfg.batch_size,
            "Automated payout loop started"
        );
        Ok(())
    }

    /// One trigger evaluation; returns whether a batch was dispatched.
    async fn iteration(&self, cancel: &CancellationToken) -> DriverResult<bool> {
        let current = self.engine.chain().get_block_count().await?;
        let balance = self.engine.chain().get_balance().await?;
        let pool_id = self.engine.config().pool_id.clone();
        let pending = self.engine.pool().get_pending(&pool_id).await?;

        let last = self.stats.lock().await.last_processed_block;
        let blocks_due = current.saturating_sub(last) >= self.cfg.block_period;
        if !blocks_due || pending.is_empty() || balance < self.cfg.min_balance {
            debug!(
                block = current,
                last_processed = last,
                pending = pending.len(),
                balance = %balance,
                "Payout trigger conditions not met"
            );
            return Ok(false);
        }

        let batch: Vec<Obligation> = pending.into_iter().take(self.cfg.batch_size).collect();
        info!(block = current, batch = batch.len(), "Dispatching payout batch");
        let results = self.engine.run_batch(batch, cancel).await?;

        let mut stats = self.stats.lock().await;
        stats.last_processed_block = current;
        stats.batches_run += 1;
        for result in &results {
            match result.status {
                PaymentStatus::Succeeded => stats.payments_succeeded += 1,
                PaymentStatus::PartiallyPaid => stats.payments_partial += 1,
                PaymentStatus::Failed => stats.payments_failed += 1,
                PaymentStatus::AlreadyCompleted => {}
            }
            stats.total_paid += result.completed_amount;
        }
        info!(
            succeeded = stats.payments_succeeded,
            partial = stats.payments_partial,
            failed = stats.payments_failed,
            total_paid = %stats.total_paid,
            "Payout batch finished"
        );
        Ok(true)
    }
}

/// Chooses which pending obligations to pay. The presentation itself
/// (console listing, prompts) lives with the caller, not the library.
pub trait Selector {
    /// Picks a subset of `pending` by obligation id.
    fn choose(
        &self,
        pending: &[Obligation],
    ) -> impl Future<Output = std::io::Result<Vec<u64>>> + Send;

    /// Final go/no-go on the chosen subset.
    fn confirm(&self, chosen: &[Obligation]) -> impl Future<Output = std::io::Result<bool>> + Send;
}

/// Operator-driven mode: fetch pending work, let a [`Selector`] narrow and
/// confirm it, then run the engine once.
pub struct InteractiveDriver<C, P, S> {
    engine: Engine<C, P>,
    selector: S,
}

impl<C, P, S> InteractiveDriver<C, P, S>
where
    C: Reader + Wallet + Signer + Broadcaster + Send + Sync,
    P: PoolApi + Send + Sync,
    S: Selector + Send + Sync,
{
    pub fn new(engine: Engine<C, P>, selector: S) -> Self {
        Self { engine, selector }
    }

    pub fn engine(&self) -> &Engine<C, P> {
        &self.engine
    }

    /// One fetch-select-confirm-dispatch pass. `None` means there was
    /// nothing to do or the operator declined.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> DriverResult<Option<Vec<PaymentResult>>> {
        let pool_id = self.engine.config().pool_id.clone();
        let pending = self.engine.pool().get_pending(&pool_id).await?;
        if pending.is_empty() {
            info!("No pending payments");
            return Ok(None);
        }

        let chosen_ids = self.selector.choose(&pending).await?;
        let chosen: Vec<Obligation> = pending
            .into_iter()
            .filter(|o| chosen_ids.contains(&o.id))
            .collect();
        if chosen.is_empty() {
            return Ok(None);
        }
        if !self.selector.confirm(&chosen).await? {
            info!("Operator declined the batch");
            return Ok(None);
        }

        let results = self.engine.run_batch(chosen, cancel).await?;
        Ok(Some(results))
    }
}

async fn sleep_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        engine::EngineConfig,
        journal::Journal,
        test_utils::mock_gateways::{obligation, utxo, MockChain, MockPool},
    };

    const COIN: u64 = 100_000_000;

    async fn test_engine(
        chain: MockChain,
        pool: MockPool,
        dir: &TempDir,
    ) -> Engine<MockChain, MockPool> {
        let journal = Journal::open(dir.path().join("journal.jsonl"))
            .await
            .unwrap();
        Engine::new(
            chain,
            pool,
            journal,
            EngineConfig {
                pool_id: "alpha1".to_string(),
                fee_per_byte: Amount::from_sat(850),
                dust_threshold: Amount::from_sat(100_000),
                min_confirmations: 1,
                change_address: Some("uc1qchange".to_string()),
                failed_log_path: dir.path().join("failed-payments.log"),
            },
        )
    }

    fn automation() -> AutomationConfig {
        AutomationConfig {
            batch_size: 10,
            block_period: 10,
            poll_interval: Duration::from_millis(1),
            min_balance: Amount::ZERO,
        }
    }

    #[tokio::test]
    async fn first_iteration_fires_immediately_then_waits_for_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(10 * COIN, vec![utxo(1, 10 * COIN, 3)]);
        chain.set_block_count(1_000);
        let pool = MockPool::new(true);
        pool.set_pending(vec![obligation(1, "uc1qminer", COIN)]);
        let driver = AutoDriver::new(test_engine(chain, pool, &dir).await, automation());
        let cancel = CancellationToken::new();

        driver.prime().await.unwrap();
        assert_eq!(driver.status().await.last_processed_block, 990);

        // immediately due on the first pass
        assert!(driver.iteration(&cancel).await.unwrap());
        let stats = driver.status().await;
        assert_eq!(stats.batches_run, 1);
        assert_eq!(stats.payments_succeeded, 1);
        assert_eq!(stats.last_processed_block, 1_000);
        assert_eq!(stats.total_paid, Amount::from_sat(COIN));

        // the acknowledged payment left the queue; nothing further to do
        assert!(!driver.iteration(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn block_period_gates_successive_batches() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(
            100 * COIN,
            vec![utxo(1, 10 * COIN, 3), utxo(2, 10 * COIN, 3)],
        );
        chain.set_block_count(1_000);
        let pool = MockPool::new(false); // acks refused: work stays queued
        pool.set_pending(vec![obligation(1, "uc1qminer", COIN)]);
        let driver = AutoDriver::new(test_engine(chain, pool, &dir).await, automation());
        let cancel = CancellationToken::new();

        driver.prime().await.unwrap();
        assert!(driver.iteration(&cancel).await.unwrap());

        // the queue still lists the obligation but not enough blocks passed
        driver.engine().chain().set_block_count(1_005);
        assert!(!driver.iteration(&cancel).await.unwrap());

        driver.engine().chain().set_block_count(1_010);
        assert!(driver.iteration(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn minimum_balance_gates_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(COIN / 2, vec![utxo(1, COIN / 2, 3)]);
        let pool = MockPool::new(true);
        pool.set_pending(vec![obligation(1, "uc1qminer", COIN / 4)]);
        let mut cfg = automation();
        cfg.min_balance = Amount::from_sat(COIN);
        let driver = AutoDriver::new(test_engine(chain, pool, &dir).await, cfg);
        let cancel = CancellationToken::new();

        driver.prime().await.unwrap();
        assert!(!driver.iteration(&cancel).await.unwrap());
        assert_eq!(driver.status().await.batches_run, 0);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(10 * COIN, vec![utxo(1, 10 * COIN, 3)]);
        let pool = MockPool::new(true);
        pool.set_pending(vec![obligation(1, "uc1qminer", COIN)]);
        let driver = Arc::new(AutoDriver::new(
            test_engine(chain, pool, &dir).await,
            automation(),
        ));
        let cancel = CancellationToken::new();

        let handle = {
            let driver = Arc::clone(&driver);
            let cancel = cancel.clone();
            tokio::spawn(async move { driver.run(cancel).await })
        };
        // give the loop a moment to pay the pending obligation
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("driver did not stop on cancellation")
            .unwrap()
            .unwrap();

        assert_eq!(driver.status().await.payments_succeeded, 1);
    }

    struct ScriptedSelector {
        pick: Vec<u64>,
        confirm: bool,
    }

    impl Selector for ScriptedSelector {
        async fn choose(&self, _pending: &[Obligation]) -> std::io::Result<Vec<u64>> {
            Ok(self.pick.clone())
        }

        async fn confirm(&self, _chosen: &[Obligation]) -> std::io::Result<bool> {
            Ok(self.confirm)
        }
    }

    #[tokio::test]
    async fn interactive_pays_the_chosen_subset() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(100 * COIN, vec![utxo(1, 50 * COIN, 3)]);
        let pool = MockPool::new(true);
        pool.set_pending(vec![
            obligation(1, "uc1qa", COIN),
            obligation(2, "uc1qb", COIN),
            obligation(3, "uc1qc", COIN),
        ]);
        let driver = InteractiveDriver::new(
            test_engine(chain, pool, &dir).await,
            ScriptedSelector {
                pick: vec![1, 3],
                confirm: true,
            },
        );

        let results = driver
            .run_once(&CancellationToken::new())
            .await
            .unwrap()
            .expect("a batch should have run");
        let ids: Vec<u64> = results.iter().map(|r| r.obligation_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(driver.engine().journal().is_completed(1).await);
        assert!(!driver.engine().journal().is_completed(2).await);
    }

    #[tokio::test]
    async fn interactive_declined_batch_pays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(100 * COIN, vec![utxo(1, 50 * COIN, 3)]);
        let pool = MockPool::new(true);
        pool.set_pending(vec![obligation(1, "uc1qa", COIN)]);
        let driver = InteractiveDriver::new(
            test_engine(chain, pool, &dir).await,
            ScriptedSelector {
                pick: vec![1],
                confirm: false,
            },
        );

        let outcome = driver.run_once(&CancellationToken::new()).await.unwrap();
        assert!(outcome.is_none());
        assert!(driver.engine().chain().broadcasts().is_empty());
    }

    #[tokio::test]
    async fn interactive_with_empty_queue_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(100 * COIN, vec![utxo(1, 50 * COIN, 3)]);
        let pool = MockPool::new(true);
        let driver = InteractiveDriver::new(
            test_engine(chain, pool, &dir).await,
            ScriptedSelector {
                pick: vec![],
                confirm: true,
            },
        );

        let outcome = driver.run_once(&CancellationToken::new()).await.unwrap();
        assert!(outcome.is_none());
    }
}
