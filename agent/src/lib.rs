//! Sampling agent library
//!
//! [`Stat`] ties the pieces together: a shared string table and sample
//! buffer, one sampler thread per attached target, and optional listeners
//! streaming samples out and taking control messages in. Remaining samples
//! can be dumped to a file at shutdown.

pub mod config;
pub mod io;
pub mod output;
pub mod sampler;
pub mod settings;

pub use config::Config;
pub use settings::Settings;

use anyhow::{Context, Result};
use io::{IoServer, Routine};
use sampler::{RemoteReader, RuntimeLayout, Sampler, SamplerContext, Target};
use stat_shared::types::Request;
use stat_shared::utils::time::Clock;
use stat_shared::{Pid, SampleBuffer, Strings};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Request metadata attached to every sample of a target
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub path: Option<String>,
    pub method: Option<String>,
    pub uri: Option<String>,
}

/// A running profiler instance
pub struct Stat {
    context: Arc<SamplerContext>,
    samplers: Mutex<HashMap<Pid, Sampler>>,
    stream: Option<IoServer>,
    control: Option<IoServer>,
    dump: Option<PathBuf>,
}

impl Stat {
    /// Build the shared state and start listeners
    ///
    /// Returns `Ok(None)` when samples would have nowhere to go: no stream
    /// listener (unconfigured or failed to bind) and no dump file.
    pub async fn startup(
        config: &Config,
        layout: RuntimeLayout,
        reader: Arc<dyn RemoteReader>,
    ) -> Result<Option<Self>> {
        config.validate()?;
        layout.validate()?;

        let stream_endpoint = config.stream_endpoint()?;
        let dump = config.dump_path();

        if stream_endpoint.is_none() && dump.is_none() {
            warn!("No stream endpoint and no dump file configured, not starting");
            return Ok(None);
        }

        let strings = Arc::new(
            Strings::startup(config.strings_budget()?, &layout.opcode_names())
                .context("Failed to map string table")?,
        );
        let buffer = Arc::new(
            SampleBuffer::startup(config.samples, strings.clone())
                .context("Failed to map sample buffer")?,
        );
        let settings = Arc::new(Settings::from_config(config));

        let control = match config.control_endpoint()? {
            Some(endpoint) => {
                let routine = Routine::Control {
                    settings: settings.clone(),
                };
                IoServer::spawn(&endpoint, routine)
                    .await
                    .map_err(|e| warn!("Control listener disabled: {}", e))
                    .ok()
            }
            None => None,
        };

        let stream = match stream_endpoint {
            Some(endpoint) => {
                let routine = Routine::Stream {
                    buffer: buffer.clone(),
                    settings: settings.clone(),
                };
                IoServer::spawn(&endpoint, routine)
                    .await
                    .map_err(|e| warn!("Stream listener disabled: {}", e))
                    .ok()
            }
            None => None,
        };

        if stream.is_none() && dump.is_none() {
            warn!("Stream listener unavailable and no dump file configured, not starting");
            if let Some(control) = control {
                control.shutdown().await;
            }
            return Ok(None);
        }

        info!(
            "stat started: {} sample slots, interval {:?}, arginfo {}",
            buffer.capacity(),
            settings.interval(),
            if settings.arginfo() { "on" } else { "off" }
        );

        Ok(Some(Self {
            context: Arc::new(SamplerContext {
                buffer,
                strings,
                settings,
                layout: Arc::new(layout),
                reader,
                clock: Clock::start(),
            }),
            samplers: Mutex::new(HashMap::new()),
            stream,
            control,
            dump,
        }))
    }

    /// Start sampling a target; `Ok(false)` when it is already sampled
    pub fn activate(&self, target: Target, info: &RequestInfo) -> Result<bool> {
        let mut samplers = self
            .samplers
            .lock()
            .map_err(|_| anyhow::anyhow!("sampler table poisoned"))?;

        if samplers.contains_key(&target.pid) {
            return Ok(false);
        }

        let pid = target.pid;
        let request = Request::create(
            &self.context.strings,
            pid,
            self.context.clock.elapsed(),
            info.path.as_deref(),
            info.method.as_deref(),
            info.uri.as_deref(),
        );

        let sampler = Sampler::activate(target, request, self.context.clone())
            .with_context(|| format!("Failed to activate sampler for pid {}", pid))?;
        samplers.insert(pid, sampler);

        info!("Sampling pid {}", pid);
        Ok(true)
    }

    /// Stop sampling `pid`; `false` when it was not sampled
    pub fn deactivate(&self, pid: Pid) -> bool {
        let sampler = match self.samplers.lock() {
            Ok(mut samplers) => samplers.remove(&pid),
            Err(_) => None,
        };

        match sampler {
            Some(sampler) => {
                sampler.deactivate();
                info!("Stopped sampling pid {}", pid);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, pid: Pid) -> bool {
        self.samplers
            .lock()
            .map(|samplers| samplers.contains_key(&pid))
            .unwrap_or(false)
    }

    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.context.buffer
    }

    pub fn strings(&self) -> &Arc<Strings> {
        &self.context.strings
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.context.settings
    }

    pub fn stream_endpoint(&self) -> Option<&io::Endpoint> {
        self.stream.as_ref().map(IoServer::local_endpoint)
    }

    pub fn control_endpoint(&self) -> Option<&io::Endpoint> {
        self.control.as_ref().map(IoServer::local_endpoint)
    }

    /// Stop every sampler, dump what is left, then close the listeners
    pub async fn shutdown(self) -> Result<()> {
        let samplers: Vec<Sampler> = match self.samplers.lock() {
            Ok(mut samplers) => samplers.drain().map(|(_, sampler)| sampler).collect(),
            Err(_) => Vec::new(),
        };
        for sampler in samplers {
            sampler.deactivate();
        }

        let dumped = match &self.dump {
            Some(path) => output::write_dump(&self.context.buffer, path),
            None => Ok(()),
        };

        if let Some(control) = self.control {
            control.shutdown().await;
        }
        if let Some(stream) = self.stream {
            stream.shutdown().await;
        }

        info!("stat stopped");
        dumped
    }
}
