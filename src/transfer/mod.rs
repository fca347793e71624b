//! Transfer orchestration / 传输调度
//!
//! Parses a transfer response into per-file records, runs them through the
//! pipeline and collects the result rows.

pub mod agent;
pub mod meta;
pub mod request;
pub mod result;
pub mod tracker;

pub use agent::{FileTransferAgent, TransferOptions};
pub use meta::{CommandType, ResultStatus, TransferMeta};
pub use request::{CommandExecutor, CommandRefresher, TransferData, TransferRequest, TransferResponse};
pub use result::{DownloadRow, TransferResult, UploadRow};
