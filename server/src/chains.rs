use std::{sync::Arc, time::Duration};

use redis::aio::ConnectionManager;
use txm_core::{
    chain::AlloyChain, fees::ProviderFeeEstimator, heads::PollingHeadSource,
    signer::LocalKeySigner,
};
use txm_executors::txm::{
    ChainTxManager, EvmTxManager, NullTxManager, ObservedTxManager, RedisTxStore,
    TxManagerRegistry,
};

use crate::config::{ChainConfig, EngineConfig};

pub type EngineChainManager = ChainTxManager<
    RedisTxStore,
    AlloyChain,
    ProviderFeeEstimator,
    LocalKeySigner,
    PollingHeadSource<AlloyChain>,
>;

pub type EngineTxManager = ObservedTxManager<EngineChainManager>;

/// One manager per configured chain, all sharing the redis connection.
pub fn build_registry(
    config: &EngineConfig,
    redis: ConnectionManager,
) -> anyhow::Result<TxManagerRegistry<EngineTxManager>> {
    let mut registry = TxManagerRegistry::new();

    for chain in &config.chains {
        let manager = if chain.enabled {
            ChainTxManager::Enabled(build_chain_manager(
                chain,
                redis.clone(),
                config.redis.namespace.clone(),
            )?)
        } else {
            tracing::info!(chain_id = chain.chain_id, "Chain disabled in configuration");
            ChainTxManager::Disabled(NullTxManager::new(chain.chain_id))
        };

        registry.register(ObservedTxManager::new(manager))?;
    }

    Ok(registry)
}

fn build_chain_manager(
    config: &ChainConfig,
    redis: ConnectionManager,
    namespace: Option<String>,
) -> anyhow::Result<
    EvmTxManager<
        RedisTxStore,
        AlloyChain,
        ProviderFeeEstimator,
        LocalKeySigner,
        PollingHeadSource<AlloyChain>,
    >,
> {
    let chain_id = config.chain_id;
    let chain = Arc::new(AlloyChain::new(chain_id, &config.nodes)?);

    // Fees are quoted from the first node, the others only receive broadcasts
    let fee_node = config
        .nodes
        .first()
        .ok_or_else(|| anyhow::anyhow!("No RPC nodes configured for chain {chain_id}"))?;
    let fees = ProviderFeeEstimator::new(chain_id, &fee_node.url, config.fees.clone())?;

    let signer = LocalKeySigner::from_private_keys(config.private_keys.as_slice())?;
    let mut txm = config.txm.clone();
    if txm.keys.is_empty() {
        txm.keys = signer.addresses();
    }

    let heads = PollingHeadSource::new(chain.clone(), Duration::from_millis(config.head_poll_ms));
    let store = RedisTxStore::new(redis, chain_id, namespace);

    tracing::info!(
        chain_id,
        nodes = config.nodes.len(),
        keys = txm.keys.len(),
        max_bump_depth = txm.max_bump_depth,
        max_in_flight = txm.max_in_flight,
        max_queued = txm.max_queued,
        nonce_sync_tolerance = txm.nonce_sync_tolerance,
        default_gas_limit = txm.default_gas_limit,
        "Building transaction manager"
    );

    Ok(EvmTxManager::new(
        Arc::new(store),
        chain,
        Arc::new(fees),
        Arc::new(signer),
        Arc::new(heads),
        txm,
    )?)
}
