mod common;

use anyhow::Result;
use common::{target, FakeProcess};
use stat_agent::io::Endpoint;
use stat_agent::sampler::RuntimeLayout;
use stat_agent::{Config, RequestInfo, Stat};
use stat_shared::protocol::ControlMessage;
use stat_shared::types::SampleRecord;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn config(dir: &Path) -> Config {
    Config {
        samples: 256,
        interval: 500,
        strings: "1M".to_string(),
        stream: format!("unix://{}", dir.join("stream.sock").display()),
        control: format!("unix://{}", dir.join("control.sock").display()),
        ..Config::default()
    }
}

fn request() -> RequestInfo {
    RequestInfo {
        path: Some("/srv/index.php".to_string()),
        method: Some("GET".to_string()),
        uri: Some("/hello".to_string()),
    }
}

async fn start(config: &Config, process: FakeProcess) -> Result<Stat> {
    let stat = Stat::startup(config, RuntimeLayout::default(), Arc::new(process)).await?;
    Ok(stat.expect("stat should start"))
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_declines_without_consumers() -> Result<()> {
    let config = Config {
        stream: String::new(),
        dump: String::new(),
        ..Config::default()
    };

    let stat = Stat::startup(&config, RuntimeLayout::default(), Arc::new(FakeProcess::new())).await?;
    assert!(stat.is_none());

    Ok(())
}

#[tokio::test]
async fn test_declines_when_stream_cannot_bind() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let control = dir.path().join("control.sock");
    let config = Config {
        stream: format!("unix://{}", dir.path().join("missing/stream.sock").display()),
        control: format!("unix://{}", control.display()),
        dump: String::new(),
        ..config(dir.path())
    };

    let stat = Stat::startup(&config, RuntimeLayout::default(), Arc::new(FakeProcess::new())).await?;
    assert!(stat.is_none());

    // the control listener that did bind is closed again
    assert!(!control.exists());

    Ok(())
}

#[tokio::test]
async fn test_stream_serves_samples() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let stat = start(&config(dir.path()), FakeProcess::idle(1024, 2048)).await?;

    assert!(stat.activate(target(4242), &request())?);

    let endpoint = stat.stream_endpoint().cloned().expect("stream endpoint");
    let mut lines = BufReader::new(endpoint.connect().await?).lines();

    for _ in 0..5 {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await??
            .expect("stream closed early");
        let record: SampleRecord = serde_json::from_str(&line)?;

        assert_eq!(record.kind, "memory");
        assert_eq!(record.request.pid, 4242);
        assert_eq!(record.request.path.as_deref(), Some("/srv/index.php"));
        assert_eq!(record.request.method.as_deref(), Some("GET"));
        assert_eq!(record.request.uri.as_deref(), Some("/hello"));
        assert_eq!(record.memory.used, 1024);
        assert_eq!(record.memory.peak, 2048);
        assert!(record.symbol.is_none());
    }

    stat.shutdown().await?;
    assert!(!dir.path().join("stream.sock").exists());
    assert!(!dir.path().join("control.sock").exists());

    Ok(())
}

#[tokio::test]
async fn test_control_changes_settings() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let stat = start(&config(dir.path()), FakeProcess::idle(0, 0)).await?;
    let settings = stat.settings().clone();

    let endpoint = stat.control_endpoint().cloned().expect("control endpoint");
    let mut connection = endpoint.connect().await?;
    connection
        .write_all(&ControlMessage::interval(2000).to_bytes()?)
        .await?;
    connection
        .write_all(&ControlMessage::arginfo(true).to_bytes()?)
        .await?;

    assert!(wait_for(|| settings.arginfo()).await);
    assert_eq!(settings.interval(), Duration::from_millis(2));

    drop(connection);
    stat.shutdown().await?;

    Ok(())
}

#[tokio::test]
async fn test_dump_at_shutdown() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("stat.dump");
    let config = Config {
        stream: String::new(),
        control: String::new(),
        dump: dump.display().to_string(),
        ..config(dir.path())
    };

    let stat = start(&config, FakeProcess::idle(512, 512)).await?;
    assert!(stat.stream_endpoint().is_none());
    assert!(stat.control_endpoint().is_none());

    stat.activate(target(7), &request())?;
    let buffer = stat.buffer().clone();
    assert!(wait_for(|| buffer.occupancy() >= 3).await);

    let strings = stat.strings().clone();
    stat.shutdown().await?;

    let contents = std::fs::read_to_string(&dump)?;
    let records = contents
        .lines()
        .map(serde_json::from_str::<SampleRecord>)
        .collect::<Result<Vec<_>, _>>()?;

    assert!(records.len() >= 3);
    assert!(records.iter().all(|r| r.request.pid == 7));

    // every request reference went back to the arena
    assert!(buffer.is_empty());
    assert_eq!(strings.temporaries(), 0);

    Ok(())
}

#[tokio::test]
async fn test_activation_rules() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        samplers: 1,
        ..config(dir.path())
    };
    let stat = start(&config, FakeProcess::idle(0, 0)).await?;

    assert!(stat.activate(target(1), &request())?);
    assert!(!stat.activate(target(1), &request())?);
    assert!(stat.is_active(1));

    // limit of one concurrent sampler
    assert!(stat.activate(target(2), &request()).is_err());
    assert!(!stat.is_active(2));

    assert!(stat.deactivate(1));
    assert!(!stat.deactivate(1));
    assert!(stat.activate(target(2), &request())?);

    stat.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_vanished_process_keeps_sampling() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let process = FakeProcess::fail_after(6);
    process.put_idle(4096, 4096);

    let stat = start(&config(dir.path()), process).await?;
    stat.activate(target(99), &request())?;

    let buffer = stat.buffer().clone();
    assert!(wait_for(|| buffer.occupancy() >= 10).await);
    assert!(stat.is_active(99));

    let mut zeroed = 0;
    buffer.consume(buffer.capacity(), |sample| {
        assert_eq!(sample.kind, stat_shared::SampleKind::Memory);
        if sample.memory.used == 0 {
            zeroed += 1;
        }
        std::ops::ControlFlow::Continue(())
    });
    assert!(zeroed > 0);

    stat.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_tcp_stream_endpoint() -> Result<()> {
    let config = Config {
        stream: "tcp://127.0.0.1:0".to_string(),
        control: String::new(),
        ..Config::default()
    };
    let stat = start(&config, FakeProcess::idle(1, 1)).await?;

    let Some(Endpoint::Tcp { port, .. }) = stat.stream_endpoint() else {
        panic!("expected tcp stream endpoint");
    };
    assert_ne!(*port, 0);

    stat.shutdown().await?;
    Ok(())
}
