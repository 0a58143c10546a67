//! `Transport` over plain HTTP PUT requests.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{ProgressCallback, Transport};
use crate::error::TransferError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Uploads with `ureq` on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(CONNECT_TIMEOUT)
                .build(),
        }
    }

    pub fn with_agent(agent: ureq::Agent) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(
        &self,
        url: &str,
        path: &Path,
        headers: &[(String, String)],
        progress: ProgressCallback,
    ) -> Result<(), TransferError> {
        let agent = self.agent.clone();
        let url = url.to_string();
        let path = path.to_path_buf();
        let headers = headers.to_vec();
        tokio::task::spawn_blocking(move || put_file(&agent, &url, &path, &headers, progress))
            .await
            .map_err(|err| TransferError::Transport(format!("upload task failed: {err}")))?
    }
}

fn put_file(
    agent: &ureq::Agent,
    url: &str,
    path: &Path,
    headers: &[(String, String)],
    progress: ProgressCallback,
) -> Result<(), TransferError> {
    let io = |source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io)?;
    let len = file.metadata().map_err(io)?.len();

    let mut request = agent.put(url).set("Content-Length", &len.to_string());
    for (key, value) in headers {
        request = request.set(key, value);
    }

    let body = ProgressReader {
        inner: BufReader::new(file),
        sent: 0,
        progress,
    };
    match request.send(body) {
        Ok(_) => Ok(()),
        Err(ureq::Error::Status(status, response)) => Err(TransferError::Http {
            status,
            body: response.into_string().unwrap_or_default(),
        }),
        Err(ureq::Error::Transport(err)) => Err(TransferError::Transport(err.to_string())),
    }
}

/// Reports cumulative bytes read to the progress callback.
struct ProgressReader<R> {
    inner: R,
    sent: u64,
    progress: ProgressCallback,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sent += n as u64;
            (self.progress)(self.sent);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn progress_reader_reports_cumulative_bytes() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        let mut reader = ProgressReader {
            inner: &b"hello world"[..],
            sent: 0,
            progress: Arc::new(move |n| sink.store(n, Ordering::SeqCst)),
        };
        let mut buf = [0u8; 4];
        let mut total = Vec::new();
        loop {
            let n = reader.read(&mut buf).expect("read");
            if n == 0 {
                break;
            }
            total.extend_from_slice(&buf[..n]);
        }
        assert_eq!(total, b"hello world");
        assert_eq!(seen.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let transport = HttpTransport::new();
        let err = transport
            .upload(
                "http://127.0.0.1:9/unused",
                &tmp.path().join("missing"),
                &[],
                Arc::new(|_: u64| {}),
            )
            .await
            .expect_err("missing file");
        assert_eq!(err.kind(), "IoError");
    }
}
