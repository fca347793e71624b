//! Transfer result rows / 传输结果

use serde::Serialize;

use super::meta::{CommandType, TransferMeta};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct UploadRow {
    pub source: String,
    pub target: String,
    pub source_size: u64,
    pub target_size: i64,
    pub source_compression: String,
    pub target_compression: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DownloadRow {
    pub file: String,
    pub size: i64,
    pub status: String,
    pub message: String,
}

/// Result set of one invocation, rows sorted / 一次传输的结果集（已排序）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", content = "rows", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferResult {
    Upload(Vec<UploadRow>),
    Download(Vec<DownloadRow>),
}

fn compression_name(meta_type: Option<&'static crate::compression::CompressionType>) -> String {
    meta_type.map(|t| t.name).unwrap_or("NONE").to_string()
}

impl TransferResult {
    pub fn from_metas(command_type: CommandType, metas: &[TransferMeta]) -> Self {
        match command_type {
            CommandType::Upload => {
                let mut rows: Vec<UploadRow> = metas.iter().map(|m| UploadRow {
                    source: m.name.clone(),
                    target: m.dst_file_name.clone(),
                    source_size: m.src_file_size,
                    target_size: m.dst_file_size,
                    source_compression: compression_name(m.src_compression_type),
                    target_compression: compression_name(m.dst_compression_type),
                    status: m.result_status().to_string(),
                    message: m.error_details.clone().unwrap_or_default(),
                }).collect();
                rows.sort();
                TransferResult::Upload(rows)
            }
            CommandType::Download => {
                let mut rows: Vec<DownloadRow> = metas.iter().map(|m| DownloadRow {
                    file: m.dst_file_name.clone(),
                    size: m.dst_file_size,
                    status: m.result_status().to_string(),
                    message: m.error_details.clone().unwrap_or_default(),
                }).collect();
                rows.sort();
                TransferResult::Download(rows)
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TransferResult::Upload(rows) => rows.len(),
            TransferResult::Download(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status column of every row, in row order / 每行的状态
    pub fn statuses(&self) -> Vec<&str> {
        match self {
            TransferResult::Upload(rows) => rows.iter().map(|r| r.status.as_str()).collect(),
            TransferResult::Download(rows) => rows.iter().map(|r| r.status.as_str()).collect(),
        }
    }

    fn table(&self) -> (Vec<&'static str>, Vec<Vec<String>>) {
        match self {
            TransferResult::Upload(rows) => (
                vec!["source", "target", "source_size", "target_size", "source_compression", "target_compression", "status", "message"],
                rows.iter().map(|r| vec![
                    r.source.clone(),
                    r.target.clone(),
                    r.source_size.to_string(),
                    r.target_size.to_string(),
                    r.source_compression.clone(),
                    r.target_compression.clone(),
                    r.status.clone(),
                    r.message.clone(),
                ]).collect(),
            ),
            TransferResult::Download(rows) => (
                vec!["file", "size", "status", "message"],
                rows.iter().map(|r| vec![
                    r.file.clone(),
                    r.size.to_string(),
                    r.status.clone(),
                    r.message.clone(),
                ]).collect(),
            ),
        }
    }

    /// Render as a plain-text table / 渲染为文本表格
    pub fn render(&self) -> String {
        let (header, rows) = self.table();
        let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }

        let border = {
            let mut s = String::from("+");
            for w in &widths {
                s.push_str(&"-".repeat(w + 2));
                s.push('+');
            }
            s
        };
        let line = |cells: Vec<String>| {
            let mut s = String::from("|");
            for (cell, w) in cells.iter().zip(&widths) {
                s.push_str(&format!(" {:<width$} |", cell, width = w));
            }
            s
        };

        let mut out = Vec::with_capacity(rows.len() + 4);
        out.push(border.clone());
        out.push(line(header.iter().map(|h| h.to_string()).collect()));
        out.push(border.clone());
        for row in rows {
            out.push(line(row));
        }
        out.push(border);
        out.join("\n")
    }
}
