//! JSON lines dump of buffered samples
//!
//! Written once at shutdown: whatever the stream clients have not consumed
//! is drained to a file, one sample record per line.

use anyhow::{Context, Result};
use stat_shared::SampleBuffer;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

/// Drain `buffer` into the file at `path`, replacing it
pub fn write_dump(buffer: &SampleBuffer, path: &Path) -> Result<()> {
    info!("Dumping samples to {}", path.display());

    let file = File::create(path)
        .with_context(|| format!("Failed to create dump file: {}", path.display()))?;

    let mut writer = BufWriter::new(file);

    buffer
        .dump(&mut writer)
        .with_context(|| format!("Failed to write dump file: {}", path.display()))?;

    info!("Dump written to {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stat_shared::types::{Memory, Request, Sample, SampleKind, SampleRecord};
    use stat_shared::Strings;
    use std::sync::Arc;

    #[test]
    fn test_write_dump() {
        let strings = Arc::new(Strings::startup(64 * 1024, &[]).unwrap());
        let buffer = SampleBuffer::startup(4, strings.clone()).unwrap();

        for pid in 1..=3 {
            buffer.insert(Sample {
                request: Request::create(&strings, pid, 0.0, Some("/index.php"), None, None),
                elapsed: 1.0,
                memory: Memory { used: 64, peak: 128 },
                kind: SampleKind::Memory,
            });
        }

        let temp_dir = tempfile::tempdir().unwrap();
        let output_path = temp_dir.path().join("stat.dump");

        write_dump(&buffer, &output_path).unwrap();

        let contents = std::fs::read_to_string(&output_path).unwrap();
        let records: Vec<SampleRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(records.len(), 3);
        assert!(records
            .iter()
            .all(|r| r.request.path.as_deref() == Some("/index.php")));
        assert!(buffer.is_empty());
        assert_eq!(strings.temporaries(), 0);
    }

    #[test]
    fn test_dump_to_missing_directory_fails() {
        let strings = Arc::new(Strings::startup(64 * 1024, &[]).unwrap());
        let buffer = SampleBuffer::startup(4, strings).unwrap();

        let temp_dir = tempfile::tempdir().unwrap();
        let output_path = temp_dir.path().join("missing").join("stat.dump");

        assert!(write_dump(&buffer, &output_path).is_err());
    }
}
