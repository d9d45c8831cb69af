use alloy::{
    eips::BlockNumberOrTag,
    network::ReceiptResponse,
    primitives::{Address, B256, Bytes},
    providers::{Provider, ProviderBuilder, RootProvider},
    transports::http::reqwest::Url,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AlloyRpcErrorToEngineError, EngineError, RpcErrorKind, to_engine_rpc_error_kind},
    heads::Head,
    transaction::TxReceipt,
};

/// Outcome of handing a raw transaction to one node of the pool.
#[derive(Debug, Clone)]
pub struct NodeSendResult {
    pub node: String,
    pub result: Result<(), RpcErrorKind>,
}

/// Submit/query surface of one chain's RPC pool.
///
/// Node selection and failover live behind this trait. `broadcast` reports every node
/// individually so callers can aggregate the outcomes themselves.
pub trait Chain: Send + Sync + 'static {
    fn chain_id(&self) -> u64;

    fn broadcast(&self, raw: &Bytes) -> impl Future<Output = Vec<NodeSendResult>> + Send;

    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<TxReceipt>, EngineError>> + Send;

    /// Pending transaction count of `address`.
    fn transaction_count(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    /// Canonical block hash at `number`, `None` if the node does not know the block yet.
    fn block_hash(&self, number: u64)
    -> impl Future<Output = Result<Option<B256>, EngineError>> + Send;

    fn latest_head(&self) -> impl Future<Output = Result<Head, EngineError>> + Send;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcNodeConfig {
    pub name: String,
    pub url: String,
}

#[derive(Clone)]
struct RpcNode {
    name: String,
    url: Url,
    provider: RootProvider,
}

/// [`Chain`] backed by one alloy provider per configured node.
///
/// Broadcasts fan out to every node concurrently. Queries walk the nodes in configuration
/// order and return the first success.
#[derive(Clone)]
pub struct AlloyChain {
    chain_id: u64,
    nodes: Vec<RpcNode>,
}

impl AlloyChain {
    pub fn new(chain_id: u64, nodes: &[RpcNodeConfig]) -> Result<Self, EngineError> {
        if nodes.is_empty() {
            return Err(EngineError::RpcConfigError {
                message: format!("No RPC nodes configured for chain {chain_id}"),
            });
        }

        let nodes = nodes
            .iter()
            .map(|node| {
                let url = Url::parse(&node.url).map_err(|e| EngineError::RpcConfigError {
                    message: format!("Failed to parse RPC URL for node {}: {e}", node.name),
                })?;

                Ok(RpcNode {
                    name: node.name.clone(),
                    provider: ProviderBuilder::new()
                        .disable_recommended_fillers()
                        .connect_http(url.clone()),
                    url,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(Self { chain_id, nodes })
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.name.as_str())
    }
}

impl Chain for AlloyChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn broadcast(&self, raw: &Bytes) -> Vec<NodeSendResult> {
        let sends = self.nodes.iter().map(|node| async move {
            let result = node
                .provider
                .send_raw_transaction(raw)
                .await
                .map(|_| ())
                .map_err(|e| to_engine_rpc_error_kind(&e));

            if let Err(e) = &result {
                tracing::debug!(node = %node.name, error = %e, "Node rejected raw transaction");
            }

            NodeSendResult {
                node: node.name.clone(),
                result,
            }
        });

        join_all(sends).await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, EngineError> {
        let mut last_error = None;

        for node in &self.nodes {
            match node.provider.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    // Pending receipts carry no block, treat as not yet mined
                    let (Some(block_number), Some(block_hash)) =
                        (receipt.block_number(), receipt.block_hash())
                    else {
                        return Ok(None);
                    };

                    return Ok(Some(TxReceipt {
                        transaction_hash: receipt.transaction_hash(),
                        block_number,
                        block_hash,
                        status: receipt.status(),
                        gas_used: receipt.gas_used(),
                    }));
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    tracing::debug!(node = %node.name, error = %e, %hash, "Receipt query failed, trying next node");
                    last_error = Some(e.to_engine_error(self.chain_id, node.url.as_str()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| self.no_nodes_error()))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, EngineError> {
        let mut last_error = None;

        for node in &self.nodes {
            match node.provider.get_transaction_count(address).pending().await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    tracing::debug!(node = %node.name, error = %e, %address, "Transaction count query failed, trying next node");
                    last_error = Some(e.to_engine_error(self.chain_id, node.url.as_str()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| self.no_nodes_error()))
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>, EngineError> {
        let mut last_error = None;

        for node in &self.nodes {
            match node
                .provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .await
            {
                Ok(block) => return Ok(block.map(|block| block.header.hash)),
                Err(e) => {
                    tracing::debug!(node = %node.name, error = %e, number, "Block query failed, trying next node");
                    last_error = Some(e.to_engine_error(self.chain_id, node.url.as_str()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| self.no_nodes_error()))
    }

    async fn latest_head(&self) -> Result<Head, EngineError> {
        let mut last_error = None;

        for node in &self.nodes {
            match node
                .provider
                .get_block_by_number(BlockNumberOrTag::Latest)
                .await
            {
                Ok(Some(block)) => {
                    return Ok(Head {
                        number: block.header.number,
                        hash: block.header.hash,
                        parent_hash: block.header.parent_hash,
                    });
                }
                Ok(None) => {
                    last_error = Some(EngineError::RpcError {
                        chain_id: self.chain_id,
                        rpc_url: node.url.to_string(),
                        message: "latest block not available".to_string(),
                        kind: RpcErrorKind::NullResp,
                    });
                }
                Err(e) => {
                    tracing::debug!(node = %node.name, error = %e, "Latest block query failed, trying next node");
                    last_error = Some(e.to_engine_error(self.chain_id, node.url.as_str()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| self.no_nodes_error()))
    }
}

impl AlloyChain {
    fn no_nodes_error(&self) -> EngineError {
        EngineError::RpcConfigError {
            message: format!("No RPC nodes configured for chain {}", self.chain_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_node_list() {
        let err = AlloyChain::new(1, &[]).err();
        assert!(matches!(err, Some(EngineError::RpcConfigError { .. })));
    }

    #[test]
    fn rejects_unparseable_node_url() {
        let nodes = vec![RpcNodeConfig {
            name: "primary".to_string(),
            url: "not a url".to_string(),
        }];

        let err = AlloyChain::new(1, &nodes).err();
        assert!(matches!(err, Some(EngineError::RpcConfigError { .. })));
    }

    #[test]
    fn keeps_node_order() {
        let nodes = vec![
            RpcNodeConfig {
                name: "primary".to_string(),
                url: "http://127.0.0.1:8545".to_string(),
            },
            RpcNodeConfig {
                name: "backup".to_string(),
                url: "http://127.0.0.1:8546".to_string(),
            },
        ];

        let chain = AlloyChain::new(31337, &nodes).unwrap();
        assert_eq!(chain.node_names().collect::<Vec<_>>(), vec!["primary", "backup"]);
    }
}
