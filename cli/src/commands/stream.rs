//! Stream command: print samples served by an agent

use crate::output;
use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use stat_agent::io::Endpoint;
use stat_shared::types::SampleRecord;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SampleType {
    Memory,
    Internal,
    User,
}

impl SampleType {
    fn matches(&self, record: &SampleRecord) -> bool {
        let name = match self {
            SampleType::Memory => "memory",
            SampleType::Internal => "internal",
            SampleType::User => "user",
        };
        record.kind == name
    }
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Stream endpoint (unix://path, tcp://host:port, or a socket path)
    #[arg(short, long, default_value = "zend.stat.stream")]
    pub endpoint: String,

    /// Only show samples of this type
    #[arg(short = 't', long = "type", value_enum)]
    pub sample_type: Option<SampleType>,

    /// Stop after this many samples
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Print raw JSON lines instead of a summary
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StreamArgs) -> Result<()> {
    let endpoint = Endpoint::parse(&args.endpoint)?;
    let connection = endpoint
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    debug!("Connected to {}", endpoint);
    output::info(&format!("Streaming samples from {}", endpoint));

    let shown = print_samples(BufReader::new(connection), &args).await?;

    output::success(&format!("{} samples", shown));
    Ok(())
}

/// Print matching records from `reader`; returns how many were shown
async fn print_samples<R>(reader: R, args: &StreamArgs) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut shown = 0;

    while args.count.map_or(true, |count| shown < count) {
        let Some(line) = lines.next_line().await.context("Failed to read stream")? else {
            break;
        };

        let record: SampleRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                output::warning(&format!("Skipping malformed sample: {}", e));
                continue;
            }
        };

        if let Some(sample_type) = args.sample_type {
            if !sample_type.matches(&record) {
                continue;
            }
        }

        if args.json {
            println!("{}", line);
        } else {
            println!("{}", summary(&record));
        }
        shown += 1;
    }

    Ok(shown)
}

/// One-line human readable form of a record
pub fn summary(record: &SampleRecord) -> String {
    let mut line = format!(
        "{:>10.6}s pid {:<7} {:<8} {:>10} B",
        record.elapsed,
        record.request.pid,
        record.kind,
        record.memory.used
    );

    if let Some(symbol) = &record.symbol {
        line.push_str(&format!(" {}", symbol.qualified_name().bold()));
        if let Some(file) = &symbol.file {
            line.push_str(&format!(" {}", file.dimmed()));
            if let Some(number) = record.opline.as_ref().and_then(|o| o.line) {
                line.push_str(&format!(":{}", number).dimmed().to_string());
            }
        }
    }

    if let Some(opcode) = record.opline.as_ref().and_then(|o| o.opcode.as_ref()) {
        line.push_str(&format!(" [{}]", opcode.cyan()));
    }

    if let Some(caller) = &record.caller {
        line.push_str(&format!(" <- {}", caller.qualified_name()));
    }

    if !record.arginfo.is_empty() {
        line.push_str(&format!(" ({})", record.arginfo.join(", ")));
    }

    line
}
