//! Stream routine: drain the sample buffer to a client as JSON lines

use crate::settings::Settings;
use stat_shared::SampleBuffer;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Initial capacity of the per-connection batch
const BATCH_CAPACITY: usize = 64 * 1024;

/// How long to wait for samples when the buffer is empty
pub fn backoff(settings: &Settings) -> Duration {
    (settings.interval() / 2).max(Duration::from_micros(1))
}

/// Serve one stream client until it disconnects or the listener closes
pub async fn serve<S>(
    mut sink: S,
    buffer: &SampleBuffer,
    settings: &Settings,
    mut closed: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(BATCH_CAPACITY);

    loop {
        if *closed.borrow() {
            return Ok(());
        }

        batch.clear();
        buffer.dump(&mut batch)?;

        if batch.is_empty() {
            tokio::select! {
                _ = closed.changed() => return Ok(()),
                _ = tokio::time::sleep(backoff(settings)) => continue,
            }
        }

        // a client that stops reading must not hold the listener open
        tokio::select! {
            _ = closed.changed() => return Ok(()),
            written = sink.write_all(&batch) => written?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stat_shared::types::{Memory, Request, Sample, SampleKind, SampleRecord};
    use stat_shared::Strings;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn memory_sample(pid: i32, used: u64) -> Sample {
        Sample {
            request: Request {
                pid,
                ..Request::EMPTY
            },
            elapsed: 0.25,
            memory: Memory { used, peak: used },
            kind: SampleKind::Memory,
        }
    }

    #[tokio::test]
    async fn test_stream_writes_json_lines() {
        let strings = Arc::new(Strings::startup(64 * 1024, &[]).unwrap());
        let buffer = Arc::new(SampleBuffer::startup(8, strings).unwrap());
        let settings = Arc::new(Settings::new(100, false, 0));

        buffer.insert(memory_sample(10, 100));
        buffer.insert(memory_sample(11, 200));

        let (client, server) = tokio::io::duplex(4096);
        let (close, closed) = watch::channel(false);

        let task = {
            let buffer = buffer.clone();
            let settings = settings.clone();
            tokio::spawn(async move { serve(server, &buffer, &settings, closed).await })
        };

        let mut lines = BufReader::new(client).lines();
        let mut pids = Vec::new();
        for _ in 0..2 {
            let line = lines.next_line().await.unwrap().unwrap();
            let record: SampleRecord = serde_json::from_str(&line).unwrap();
            assert_eq!(record.kind, "memory");
            pids.push(record.request.pid);
        }
        pids.sort();
        assert_eq!(pids, vec![10, 11]);
        assert!(buffer.is_empty());

        close.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_write() {
        let strings = Arc::new(Strings::startup(256 * 1024, &[]).unwrap());
        let buffer = Arc::new(SampleBuffer::startup(256, strings).unwrap());
        let settings = Arc::new(Settings::new(100, false, 0));

        for pid in 0..256 {
            buffer.insert(memory_sample(pid, 4096));
        }

        // the client never reads, so the first write fills the pipe and blocks
        let (_client, server) = tokio::io::duplex(64);
        let (close, closed) = watch::channel(false);

        let task = {
            let buffer = buffer.clone();
            let settings = settings.clone();
            tokio::spawn(async move { serve(server, &buffer, &settings, closed).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        close.send_replace(true);

        let served = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("serve should return once closed");
        served.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stream_stops_when_client_leaves() {
        let strings = Arc::new(Strings::startup(64 * 1024, &[]).unwrap());
        let buffer = SampleBuffer::startup(8, strings).unwrap();
        let settings = Settings::new(100, false, 0);

        let (client, server) = tokio::io::duplex(64);
        drop(client);
        buffer.insert(memory_sample(1, 1));

        let (_close, closed) = watch::channel(false);
        assert!(serve(server, &buffer, &settings, closed).await.is_err());
    }
}
