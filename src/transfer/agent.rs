//! File transfer agent / 文件传输调度器
//!
//! Files flow through three bounded pools: preprocess (probe, compress,
//! digest, encrypt), network (one job per chunk) and postprocess (finish a
//! download). Each file reports completion on a channel exactly once; the
//! agent waits for all of them before building the result set.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};

use super::meta::{CommandType, ResultStatus, TransferMeta};
use super::request::{CommandExecutor, CommandRefresher, TransferRequest, TransferResponse};
use super::result::TransferResult;
use super::tracker::{ChunkQueue, FatalSlot};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::storage::client::{ClientOptions, StorageClient};
use crate::storage::{
    BackendRegistry, HttpTransport, ProgressCallback, ReqwestTransport, RetryPolicy, StageContext,
    StorageCredential,
};

/// Agent options / 传输选项
#[derive(Clone)]
pub struct TransferOptions {
    /// Network parallelism when the response does not specify one
    pub parallel: usize,
    pub multipart_threshold: u64,
    pub retry_policy: RetryPolicy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub use_s3_regional_url: bool,
    /// `None` probes the bucket once per invocation
    pub use_accelerate_endpoint: Option<bool>,
    pub raise_on_error: bool,
    pub force_overwrite: bool,
    pub skip_upload_on_content_match: bool,
    pub tmp_root: Option<PathBuf>,
    /// Upload this buffer instead of reading the source file
    pub source_stream: Option<Bytes>,
    pub progress: Option<ProgressCallback>,
    /// Custom transport, reqwest when `None`
    pub transport: Option<Arc<dyn HttpTransport>>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for TransferOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            parallel: config.parallel.max(1),
            multipart_threshold: config.multipart_threshold,
            retry_policy: RetryPolicy {
                max_retry: config.max_retry,
                sleep_unit: Duration::from_millis(config.sleep_unit_ms),
                max_sleep_units: config.max_sleep_secs,
                presigned_url_retry_limit: config.presigned_url_retry_limit,
            },
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            use_s3_regional_url: config.use_s3_regional_url,
            use_accelerate_endpoint: config.use_accelerate_endpoint,
            raise_on_error: config.raise_on_error,
            force_overwrite: config.force_overwrite,
            skip_upload_on_content_match: config.skip_upload_on_content_match,
            tmp_root: config.temp_dir.as_ref().map(PathBuf::from),
            source_stream: None,
            progress: None,
            transport: None,
        }
    }
}

/// Shared state of one pipeline run / 流水线共享状态
struct Pipeline {
    command_type: CommandType,
    preprocess: Arc<Semaphore>,
    network: Arc<Semaphore>,
    postprocess: Arc<Semaphore>,
    queue: ChunkQueue,
    fatal: FatalSlot,
    done_tx: mpsc::UnboundedSender<usize>,
}

impl Pipeline {
    fn complete(&self, idx: usize) {
        if self.done_tx.send(idx).is_err() {
            tracing::debug!("Completion channel closed before file {} reported", idx);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a pipeline step, turning a panic into a fatal error / 捕获任务中的panic
async fn guarded<T, F>(fatal: &FatalSlot, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = format!("{} panicked: {}", what, panic_message(payload.as_ref()));
            fatal.raise(message.clone());
            Err(anyhow!(message))
        }
    }
}

pub struct FileTransferAgent {
    registry: BackendRegistry,
    executor: Arc<dyn CommandExecutor>,
    command: String,
    response: TransferResponse,
    options: TransferOptions,
    result: Option<TransferResult>,
}

impl FileTransferAgent {
    pub fn new(
        registry: BackendRegistry,
        executor: Arc<dyn CommandExecutor>,
        command: impl Into<String>,
        response: TransferResponse,
        options: TransferOptions,
    ) -> Self {
        Self {
            registry,
            executor,
            command: command.into(),
            response,
            options,
            result: None,
        }
    }

    /// Result rows of the last run, kept even when `execute` failed / 传输结果
    pub fn result(&self) -> Option<&TransferResult> {
        self.result.as_ref()
    }

    /// Run the transfer / 执行传输
    pub async fn execute(&mut self) -> Result<(), TransferError> {
        let request = TransferRequest::parse(&self.response, self.options.source_stream.clone())?;
        let command_type = request.command_type;
        tracing::info!(
            "{:?} of {} file(s) via {}",
            command_type,
            request.metas.len(),
            request.location_type
        );

        if request.metas.is_empty() {
            self.result = Some(TransferResult::from_metas(command_type, &[]));
            return Ok(());
        }

        let parallel = request.parallel.unwrap_or(self.options.parallel).max(1);
        let clients = self.build_clients(&request, parallel).await?;
        self.apply_accelerate_config(&clients).await;

        let (metas, fatal) = run_pipeline(command_type, clients, parallel).await;

        let result = TransferResult::from_metas(command_type, &metas);
        tracing::info!("Transfer finished: {:?}", result.statuses());
        self.result = Some(result);

        if let Some(fatal) = fatal {
            return Err(fatal);
        }

        if self.options.raise_on_error {
            let failed: Vec<&TransferMeta> = metas.iter()
                .filter(|m| m.result_status() == ResultStatus::Error)
                .collect();
            if let Some(first) = failed.first() {
                return Err(TransferError::FilesFailed {
                    failed: failed.len(),
                    total: metas.len(),
                    first: format!(
                        "{}: {}",
                        first.name,
                        first.error_details.clone().unwrap_or_default()
                    ),
                });
            }
        }
        Ok(())
    }

    async fn build_clients(
        &self,
        request: &TransferRequest,
        parallel: usize,
    ) -> Result<Vec<Arc<StorageClient>>, TransferError> {
        let stage_info = Arc::new(request.stage_info.clone());
        let refresher = Arc::new(CommandRefresher::new(self.executor.clone(), self.command.clone()));
        let credential = Arc::new(StorageCredential::new(stage_info.creds.clone(), Some(refresher)));
        let transport: Arc<dyn HttpTransport> = match &self.options.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(ReqwestTransport::new(
                self.options.connect_timeout,
                self.options.request_timeout,
            )?),
        };
        let client_options = ClientOptions {
            skip_upload_on_content_match: self.options.skip_upload_on_content_match,
            tmp_root: self.options.tmp_root.clone(),
            progress: self.options.progress.clone(),
        };

        let mut clients = Vec::with_capacity(request.metas.len());
        for meta in &request.metas {
            let mut meta = meta.clone();
            meta.overwrite = meta.overwrite || self.options.force_overwrite;
            meta.multipart_threshold = self.options.multipart_threshold;
            meta.parallel = parallel;

            let ctx = StageContext {
                stage_info: stage_info.clone(),
                credential: credential.clone(),
                transport: transport.clone(),
                retry_policy: self.options.retry_policy.clone(),
                command_type: request.command_type,
                use_s3_regional_url: self.options.use_s3_regional_url || stage_info.use_s3_regional_url,
                presigned_url: meta.presigned_url.clone(),
                dst_file_name: meta.dst_file_name.clone(),
                command: self.command.clone(),
                executor: Some(self.executor.clone()),
            };
            let backend = self.registry.create_backend(ctx).await?;
            clients.push(Arc::new(StorageClient::new(
                backend,
                meta,
                request.command_type,
                client_options.clone(),
            )));
        }
        Ok(clients)
    }

    /// Probe acceleration once and share the answer / 探测一次加速配置并共享
    async fn apply_accelerate_config(&self, clients: &[Arc<StorageClient>]) {
        let Some((first, rest)) = clients.split_first() else {
            return;
        };
        let accelerate = match first.backend()
            .transfer_accelerate_config(self.options.use_accelerate_endpoint)
            .await
        {
            Ok(accelerate) => accelerate,
            Err(e) => {
                tracing::warn!("Transfer acceleration probe failed, using the default endpoint: {}", e);
                false
            }
        };
        for client in rest {
            if let Err(e) = client.backend().transfer_accelerate_config(Some(accelerate)).await {
                tracing::warn!("Failed to apply acceleration config to {}: {}", client.name(), e);
            }
        }
    }
}

/// Drive every file through the pipeline / 驱动所有文件完成传输
///
/// Returns the records in input order and the first fatal error, if any.
async fn run_pipeline(
    command_type: CommandType,
    clients: Vec<Arc<StorageClient>>,
    parallel: usize,
) -> (Vec<TransferMeta>, Option<TransferError>) {
    let workers = clients.len().min(num_cpus::get()).max(1);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(Pipeline {
        command_type,
        preprocess: Arc::new(Semaphore::new(workers)),
        network: Arc::new(Semaphore::new(parallel)),
        postprocess: Arc::new(Semaphore::new(workers)),
        queue: ChunkQueue::new(parallel),
        fatal: FatalSlot::new(),
        done_tx,
    });

    for (idx, client) in clients.iter().enumerate() {
        tokio::spawn(process_file(pipeline.clone(), idx, client.clone()));
    }

    let mut remaining = clients.len();
    while remaining > 0 {
        match done_rx.recv().await {
            Some(idx) => {
                tracing::debug!("File {} completed, {} remaining", idx, remaining - 1);
                remaining -= 1;
            }
            None => break,
        }
    }

    let metas = clients.iter()
        .map(|client| {
            let mut meta = client.meta();
            if !meta.is_settled() {
                meta.fail("Transfer did not complete");
            }
            meta
        })
        .collect();
    (metas, pipeline.fatal.take())
}

async fn process_file(pipeline: Arc<Pipeline>, idx: usize, client: Arc<StorageClient>) {
    let name = client.name();

    let prepared = {
        let _permit = match pipeline.preprocess.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                client.note_error(format!("Failed to acquire preprocess slot: {}", e));
                finish_file(pipeline, idx, client).await;
                return;
            }
        };
        if pipeline.fatal.is_cancelled() {
            Err(anyhow!("transfer cancelled"))
        } else {
            guarded(&pipeline.fatal, &format!("preprocess {}", name), async {
                match pipeline.command_type {
                    CommandType::Upload => client.prepare_upload().await,
                    CommandType::Download => client.prepare_download().await,
                }
            })
            .await
        }
    };

    match prepared {
        Err(e) => {
            tracing::warn!("Failed to prepare {}: {}", name, e);
            client.note_error(e.to_string());
            finish_file(pipeline, idx, client).await;
            return;
        }
        Ok(()) if client.is_settled() => {
            client.delete_client_data();
            pipeline.complete(idx);
            return;
        }
        Ok(()) => {}
    }

    let num_chunks = client.num_chunks();
    if num_chunks == 0 {
        finish_file(pipeline, idx, client).await;
        return;
    }

    pipeline.queue.admit(num_chunks as usize).await;
    for chunk_id in 0..num_chunks {
        tokio::spawn(run_chunk(pipeline.clone(), idx, client.clone(), chunk_id));
    }
}

async fn run_chunk(pipeline: Arc<Pipeline>, idx: usize, client: Arc<StorageClient>, chunk_id: u64) {
    let outcome = match pipeline.network.clone().acquire_owned().await {
        Ok(_permit) if pipeline.fatal.is_cancelled() => Err(anyhow!("transfer cancelled")),
        Ok(_permit) => {
            guarded(&pipeline.fatal, &format!("chunk {} of {}", chunk_id, client.name()), async {
                match pipeline.command_type {
                    CommandType::Upload => client.upload_chunk(chunk_id).await,
                    CommandType::Download => client.download_chunk(chunk_id).await,
                }
            })
            .await
        }
        Err(e) => Err(anyhow!("Failed to acquire network slot: {}", e)),
    };
    pipeline.queue.release();

    if !client.record_chunk(chunk_id, &outcome) {
        return;
    }

    match pipeline.command_type {
        CommandType::Upload => finish_file(pipeline, idx, client).await,
        CommandType::Download => {
            tokio::spawn(async move {
                let _permit = pipeline.postprocess.clone().acquire_owned().await.ok();
                finish_file(pipeline, idx, client).await;
            });
        }
    }
}

/// Finish one file, clean up and report completion / 完成单个文件
async fn finish_file(pipeline: Arc<Pipeline>, idx: usize, client: Arc<StorageClient>) {
    let name = client.name();
    let finished = guarded(&pipeline.fatal, &format!("finish {}", name), async {
        match pipeline.command_type {
            CommandType::Upload => client.finish_upload().await,
            CommandType::Download => {
                client.finish_download().await;
                Ok(())
            }
        }
    })
    .await;

    if let Err(e) = finished {
        pipeline.fatal.raise(format!("{}: {}", name, e));
        client.fail(e.to_string());
    }
    client.delete_client_data();
    pipeline.complete(idx);
}
