//! Control routine: apply fixed-size control messages to the settings

use crate::settings::Settings;
use stat_shared::protocol::{ControlCommand, ControlMessage, CONTROL_MESSAGE_SIZE};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, info};

/// Apply one message; unknown kinds are ignored
pub fn apply(settings: &Settings, message: &ControlMessage) {
    match message.command() {
        ControlCommand::Interval { micros } => {
            settings.set_interval_micros(micros);
            info!("Sampling interval set to {:?}", settings.interval());
        }
        ControlCommand::Arginfo { enabled } => {
            settings.set_arginfo(enabled);
            info!("Argument capture {}", if enabled { "enabled" } else { "disabled" });
        }
        ControlCommand::Unknown { kind, param } => {
            debug!("Ignoring control message kind={} param={}", kind, param);
        }
    }
}

/// Read messages from one client until it disconnects or the listener closes
pub async fn serve<S>(
    mut source: S,
    settings: &Settings,
    mut closed: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut frame = [0u8; CONTROL_MESSAGE_SIZE];

    loop {
        if *closed.borrow() {
            return Ok(());
        }

        tokio::select! {
            _ = closed.changed() => return Ok(()),
            read = source.read_exact(&mut frame) => match read {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            },
        }

        let message = ControlMessage::from_bytes(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        apply(settings, &message);
    }
}
