use std::{sync::Arc, time::Duration};

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chain::Chain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}

/// Delivers chain heads with non-decreasing numbers.
///
/// The same number may be delivered again with a different hash after a reorg.
pub trait HeadSource: Send + Sync + 'static {
    fn subscribe(&self, buffer: usize) -> mpsc::Receiver<Head>;
}

/// Polls `latest_head` on an interval and forwards every new head.
///
/// The poller task ends when the receiver is dropped.
pub struct PollingHeadSource<C: Chain> {
    chain: Arc<C>,
    interval: Duration,
}

impl<C: Chain> PollingHeadSource<C> {
    pub fn new(chain: Arc<C>, interval: Duration) -> Self {
        Self { chain, interval }
    }
}

impl<C: Chain> HeadSource for PollingHeadSource<C> {
    fn subscribe(&self, buffer: usize) -> mpsc::Receiver<Head> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let chain = self.chain.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_delivered: Option<Head> = None;

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                let head = match chain.latest_head().await {
                    Ok(head) => head,
                    Err(e) => {
                        tracing::warn!(chain_id = chain.chain_id(), error = %e, "Failed to poll latest head");
                        continue;
                    }
                };

                let is_new = match &last_delivered {
                    None => true,
                    Some(last) => {
                        head.number > last.number
                            || (head.number == last.number && head.hash != last.hash)
                    }
                };
                if !is_new {
                    continue;
                }

                match tx.try_send(head) {
                    Ok(()) => last_delivered = Some(head),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(
                            chain_id = chain.chain_id(),
                            number = head.number,
                            "Head channel full, retrying on next poll"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        rx
    }
}
