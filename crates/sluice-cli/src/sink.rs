use std::path::PathBuf;

use serde_json::json;
use sluice_core::error::AppError;
use sluice_core::models::{Record, ResourceMeta, WriteDisposition};
use sluice_core::traits::RecordSink;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter, Stdout};

enum Output {
    Stdout(BufWriter<Stdout>),
    File(BufWriter<File>),
    /// Directory mode before the first resource began.
    Closed,
}

/// Writes records as JSON lines.
///
/// Without an output directory every record goes to stdout wrapped with its
/// resource name and write disposition. With one, each resource gets its own
/// `<resource>.jsonl` file, truncated for `replace` resources and appended to
/// for `append` resources.
pub struct JsonLinesSink {
    output_dir: Option<PathBuf>,
    output: Output,
    written: usize,
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self {
            output_dir: None,
            output: Output::Stdout(BufWriter::new(tokio::io::stdout())),
            written: 0,
        }
    }

    pub fn to_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: Some(dir.into()),
            output: Output::Closed,
            written: 0,
        }
    }

    /// Records written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush buffered output; files are synced to disk.
    pub async fn finish(&mut self) -> Result<(), AppError> {
        let flushed = match &mut self.output {
            Output::Stdout(out) => out.flush().await,
            Output::File(out) => match out.flush().await {
                Ok(()) => out.get_ref().sync_data().await,
                Err(e) => Err(e),
            },
            Output::Closed => Ok(()),
        };
        flushed.map_err(|e| AppError::Generic(format!("Failed to flush output: {e}")))
    }
}

impl RecordSink for JsonLinesSink {
    async fn begin(&mut self, resource: &ResourceMeta) -> Result<(), AppError> {
        self.finish().await?;
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };

        let path = dir.join(format!("{}.jsonl", resource.name));
        let io_err = |e: std::io::Error| {
            AppError::Generic(format!("Failed to open {}: {e}", path.display()))
        };
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;

        let mut options = OpenOptions::new();
        options.create(true);
        match resource.write_disposition {
            WriteDisposition::Replace => options.write(true).truncate(true),
            WriteDisposition::Append => options.append(true),
        };
        let file = options.open(&path).await.map_err(io_err)?;

        tracing::debug!(resource = %resource.name, path = %path.display(), "Output file opened");
        self.output = Output::File(BufWriter::new(file));
        Ok(())
    }

    async fn write(&mut self, resource: &ResourceMeta, records: Vec<Record>) -> Result<(), AppError> {
        let count = records.len();
        let mut buf = Vec::new();
        for record in records {
            let line = if self.output_dir.is_some() {
                serde_json::to_vec(&record)?
            } else {
                serde_json::to_vec(&json!({
                    "resource": resource.name,
                    "write_disposition": resource.write_disposition,
                    "data": record,
                }))?
            };
            buf.extend_from_slice(&line);
            buf.push(b'\n');
        }

        let written = match &mut self.output {
            Output::Stdout(out) => out.write_all(&buf).await,
            Output::File(out) => out.write_all(&buf).await,
            Output::Closed => {
                return Err(AppError::Generic(format!(
                    "No output open for {}",
                    resource.name
                )));
            }
        };
        written.map_err(|e| {
            AppError::Generic(format!("Failed to write records for {}: {e}", resource.name))
        })?;
        self.written += count;
        Ok(())
    }

    async fn flush(&mut self, resource: &ResourceMeta) -> Result<(), AppError> {
        self.finish().await?;
        tracing::debug!(resource = %resource.name, written = self.written, "Output flushed");
        Ok(())
    }
}
