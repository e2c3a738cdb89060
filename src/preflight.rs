use bitcoin::Amount;
use tracing::*;

use crate::{
    config::Config,
    error::PreflightError,
    traits::{PoolApi, Reader, Wallet},
};

/// Sequential startup assertions; any failure aborts the process before the
/// engine is ever reached.
///
/// Order matters: the pool is probed first (no point talking to the chain
/// for a pool we cannot reach), then the chain, then the configured wallet's
/// existence, and finally a balance-vs-pending advisory that warns but never
/// fails.
pub async fn run<C, P>(chain: &C, pool: &P, config: &Config) -> Result<(), PreflightError>
where
    C: Reader + Wallet + Sync,
    P: PoolApi + Sync,
{
    if !pool.test_connection().await {
        return Err(PreflightError::PoolUnreachable(
            config.pool.api_base_url.clone(),
        ));
    }
    debug!("Pool api reachable");

    if config.chain.wallet_name.is_empty() {
        return Err(PreflightError::WalletNotConfigured);
    }

    if !chain.test_connection().await {
        return Err(PreflightError::ChainUnreachable(config.chain.rpc_url.clone()));
    }
    debug!("Chain node reachable");

    let available = chain.list_wallets().await?;
    if !available.contains(&config.chain.wallet_name) {
        return Err(PreflightError::WalletNotFound {
            configured: config.chain.wallet_name.clone(),
            available,
        });
    }
    debug!(wallet = %config.chain.wallet_name, "Wallet present on node");

    let balance = chain.get_balance().await?;
    let pending = pool.get_pending(&config.pool.pool_id).await?;
    let owed: u64 = pending.iter().map(|o| o.amount.to_sat()).sum();
    let owed = Amount::from_sat(owed);
    if balance < owed {
        warn!(
            %balance,
            %owed,
            pending = pending.len(),
            "Wallet balance does not cover the pending obligations; payouts will run partially"
        );
    }
    info!(
        %balance,
        pending = pending.len(),
        %owed,
        "Preflight checks passed"
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::{AutomationSection, ChainSection, Config, JournalSection, PoolSection},
        error::PreflightError,
        test_utils::mock_gateways::{obligation, MockChain, MockPool},
    };

    const COIN: u64 = 100_000_000;

    fn config() -> Config {
        Config {
            pool: PoolSection {
                api_base_url: "https://pool.example".to_string(),
                pool_id: "alpha1".to_string(),
                api_key: "secret".to_string(),
                request_timeout_s: 30,
            },
            chain: ChainSection {
                rpc_url: "http://127.0.0.1:8332".to_string(),
                rpc_user: "rpc".to_string(),
                rpc_password: "pass".to_string(),
                rpc_timeout_s: 30,
                wallet_name: "payouts".to_string(),
                change_address: None,
                fee_per_byte: Amount::from_sat(850),
                min_confirmations: 1,
                use_wallet_signing: true,
                dust_threshold: Amount::from_sat(100_000),
            },
            automation: AutomationSection::default(),
            journal: JournalSection::default(),
        }
    }

    #[tokio::test]
    async fn passes_with_everything_reachable() {
        let chain = MockChain::new(10 * COIN, vec![]);
        let pool = MockPool::new(true);
        run(&chain, &pool, &config()).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_pool_fails_first() {
        let chain = MockChain::new(10 * COIN, vec![]);
        let pool = MockPool::new(true);
        pool.set_connected(false);
        let err = run(&chain, &pool, &config()).await.unwrap_err();
        assert!(matches!(err, PreflightError::PoolUnreachable(_)));
        // the chain was never probed
        assert!(chain.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_wallet_name_fails_before_chain_probe() {
        let chain = MockChain::new(10 * COIN, vec![]);
        let pool = MockPool::new(true);
        let mut cfg = config();
        cfg.chain.wallet_name.clear();
        let err = run(&chain, &pool, &cfg).await.unwrap_err();
        assert!(matches!(err, PreflightError::WalletNotConfigured));
        assert!(chain.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_chain_fails() {
        let chain = MockChain::new(10 * COIN, vec![]);
        chain.set_connected(false);
        let pool = MockPool::new(true);
        let err = run(&chain, &pool, &config()).await.unwrap_err();
        assert!(matches!(err, PreflightError::ChainUnreachable(_)));
    }

    #[tokio::test]
    async fn absent_wallet_reports_the_available_list() {
        let chain = MockChain::new(10 * COIN, vec![]);
        chain.set_wallets(vec!["other".to_string(), "cold".to_string()]);
        let pool = MockPool::new(true);
        let err = run(&chain, &pool, &config()).await.unwrap_err();
        match err {
            PreflightError::WalletNotFound {
                configured,
                available,
            } => {
                assert_eq!(configured, "payouts");
                assert_eq!(available, vec!["other".to_string(), "cold".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn low_balance_warns_but_passes() {
        let chain = MockChain::new(COIN, vec![]);
        let pool = MockPool::new(true);
        pool.set_pending(vec![obligation(1, "uc1qminer", 5 * COIN)]);
        run(&chain, &pool, &config()).await.unwrap();
    }
}
