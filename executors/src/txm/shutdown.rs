use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::txm::worker::error::TxmWorkerError;

/// A spawned manager loop
pub struct LoopHandle {
    pub name: String,
    pub join_handle: JoinHandle<Result<(), TxmWorkerError>>,
}

impl LoopHandle {
    pub fn new(name: impl Into<String>, join_handle: JoinHandle<Result<(), TxmWorkerError>>) -> Self {
        Self {
            name: name.into(),
            join_handle,
        }
    }
}

/// Handle for coordinating shutdown of every loop of one manager
pub struct ShutdownHandle {
    token: CancellationToken,
    handles: Vec<LoopHandle>,
}

impl ShutdownHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
        }
    }

    pub fn add_loop(&mut self, handle: LoopHandle) {
        self.handles.push(handle);
    }

    pub fn loop_count(&self) -> usize {
        self.handles.len()
    }

    /// Cancels the shared token and waits for every loop to return.
    ///
    /// Errors are logged, the first one is returned.
    pub async fn shutdown(self) -> Result<(), TxmWorkerError> {
        let loop_count = self.handles.len();
        tracing::info!(loop_count, "Initiating graceful shutdown of manager loops");

        self.token.cancel();

        let (names, join_handles): (Vec<_>, Vec<_>) = self
            .handles
            .into_iter()
            .map(|handle| (handle.name, handle.join_handle))
            .unzip();

        let results = futures::future::join_all(join_handles).await;
        let mut errors = Vec::new();

        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(Ok(())) => {
                    tracing::debug!(loop_name = %name, "Loop shut down gracefully");
                }
                Ok(Err(e)) => {
                    tracing::error!(loop_name = %name, error = %e, "Loop shut down with error");
                    errors.push(e);
                }
                Err(e) => {
                    tracing::error!(loop_name = %name, error = %e, "Loop task panicked during shutdown");
                    errors.push(TxmWorkerError::InternalError {
                        message: format!("loop {name} panicked: {e}"),
                    });
                }
            }
        }

        match errors.into_iter().next() {
            None => {
                tracing::info!(loop_count, "All loops shut down gracefully");
                Ok(())
            }
            Some(first) => Err(first),
        }
    }
}
