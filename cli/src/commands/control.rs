//! Control command: adjust a running agent

use crate::output;
use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use stat_agent::io::Endpoint;
use stat_shared::protocol::ControlMessage;
use stat_shared::utils::parse_duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
pub enum ControlAction {
    /// Set the sampling interval (e.g. "250us", "1ms"; bare numbers are microseconds)
    Interval { value: String },

    /// Turn argument capture on or off
    Arginfo {
        #[arg(value_enum)]
        state: Switch,
    },
}

#[derive(Args, Debug)]
pub struct ControlArgs {
    /// Control endpoint (unix://path, tcp://host:port, or a socket path)
    #[arg(short, long, default_value = "zend.stat.control")]
    pub endpoint: String,

    #[command(subcommand)]
    pub action: ControlAction,
}

/// Build the wire message for an action
pub fn message(action: &ControlAction) -> Result<ControlMessage> {
    match action {
        ControlAction::Interval { value } => {
            let interval = parse_duration(value).context("Invalid interval")?;
            let micros = u64::try_from(interval.as_micros()).unwrap_or(u64::MAX);
            if micros == 0 {
                anyhow::bail!("Interval must be at least 1us");
            }
            Ok(ControlMessage::interval(micros))
        }
        ControlAction::Arginfo { state } => Ok(ControlMessage::arginfo(*state == Switch::On)),
    }
}

async fn send<W>(sink: &mut W, message: &ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(&message.to_bytes()?)
        .await
        .context("Failed to send control message")?;
    sink.flush().await?;
    Ok(())
}

pub async fn run(args: ControlArgs) -> Result<()> {
    let message = message(&args.action)?;

    let endpoint = Endpoint::parse(&args.endpoint)?;
    let mut connection = endpoint
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    debug!("Sending {:?} to {}", message, endpoint);
    send(&mut connection, &message).await?;

    output::success(&format!("Sent {:?} to {}", args.action, endpoint));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stat_shared::protocol::{ControlCommand, CONTROL_MESSAGE_SIZE};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_interval_message() {
        let action = ControlAction::Interval {
            value: "2ms".to_string(),
        };
        assert_eq!(
            message(&action).unwrap().command(),
            ControlCommand::Interval { micros: 2000 }
        );

        let bare = ControlAction::Interval {
            value: "250".to_string(),
        };
        assert_eq!(
            message(&bare).unwrap().command(),
            ControlCommand::Interval { micros: 250 }
        );

        let zero = ControlAction::Interval {
            value: "0".to_string(),
        };
        assert!(message(&zero).is_err());
    }

    #[test]
    fn test_arginfo_message() {
        let off = ControlAction::Arginfo { state: Switch::Off };
        assert_eq!(
            message(&off).unwrap().command(),
            ControlCommand::Arginfo { enabled: false }
        );
    }

    #[tokio::test]
    async fn test_send_writes_one_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);

        send(&mut client, &ControlMessage::arginfo(true)).await.unwrap();
        drop(client);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();

        assert_eq!(received.len(), CONTROL_MESSAGE_SIZE);
        assert_eq!(&received[..8], &(1i64 << 2).to_le_bytes());
        assert_eq!(&received[8..], &1i64.to_le_bytes());
    }
}
