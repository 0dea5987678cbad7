//! Per-target sampler threads
//!
//! A sampler owns one OS thread that wakes every interval, captures a sample
//! of its target and inserts it into the shared buffer. The interval and
//! argument capture are re-read from [`Settings`] on every tick so control
//! messages apply to running samplers.

pub mod cache;
pub mod capture;
pub mod layout;
pub mod remote;

pub use capture::Capture;
pub use layout::{RuntimeLayout, Target};
pub use remote::{ProcessVmReader, ReadError, RemoteReader};

use crate::settings::Settings;
use stat_shared::types::{Request, Sample};
use stat_shared::utils::time::Clock;
use stat_shared::{SampleBuffer, Strings};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Deadlines further behind than this many intervals are re-anchored
const MAX_LAG_INTERVALS: u32 = 8;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampler limit of {limit} reached")]
    Limit { limit: usize },

    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything samplers share
pub struct SamplerContext {
    pub buffer: Arc<SampleBuffer>,
    pub strings: Arc<Strings>,
    pub settings: Arc<Settings>,
    pub layout: Arc<RuntimeLayout>,
    pub reader: Arc<dyn RemoteReader>,
    pub clock: Clock,
}

#[derive(Default)]
struct Signal {
    closed: Mutex<bool>,
    wake: Condvar,
}

impl Signal {
    fn close(&self) {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
        self.wake.notify_all();
    }

    /// Sleep until `deadline`; `false` once closed
    fn wait_until(&self, deadline: Instant) -> bool {
        let Ok(mut closed) = self.closed.lock() else {
            return false;
        };

        loop {
            if *closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            closed = match self.wake.wait_timeout(closed, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
    }
}

/// A running sampler attached to one target
pub struct Sampler {
    pid: stat_shared::Pid,
    signal: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
    context: Arc<SamplerContext>,
    request: Request,
}

impl Sampler {
    /// Start sampling `target`
    ///
    /// Takes ownership of `request`; on failure its strings are released.
    pub fn activate(
        target: Target,
        request: Request,
        context: Arc<SamplerContext>,
    ) -> Result<Self, SamplerError> {
        if !context.settings.try_add_sampler() {
            request.release(&context.strings);
            return Err(SamplerError::Limit {
                limit: context.settings.sampler_limit(),
            });
        }

        let signal = Arc::new(Signal::default());
        let pid = target.pid;

        let thread = {
            let signal = signal.clone();
            let context = context.clone();
            std::thread::Builder::new()
                .name(format!("stat-sampler-{}", pid))
                .spawn(move || run(target, request, &context, &signal))
        };

        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                context.settings.remove_sampler();
                request.release(&context.strings);
                return Err(SamplerError::Spawn(e));
            }
        };

        debug!("Sampler activated for pid {}", pid);

        Ok(Self {
            pid,
            signal,
            thread: Some(thread),
            context,
            request,
        })
    }

    /// Stop the thread and release the request
    pub fn deactivate(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.signal.close();
        if thread.join().is_err() {
            warn!("Sampler thread for pid {} panicked", self.pid);
        }

        self.context.settings.remove_sampler();
        self.request.release(&self.context.strings);
        debug!("Sampler deactivated for pid {}", self.pid);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(target: Target, request: Request, context: &SamplerContext, signal: &Signal) {
    let mut capture = Capture::new(
        context.reader.clone(),
        context.layout.clone(),
        context.strings.clone(),
        target,
    );
    let mut deadline = Instant::now();
    let mut samples: u64 = 0;

    loop {
        let interval = context.settings.interval();
        deadline += interval;

        let now = Instant::now();
        if now > deadline + interval * MAX_LAG_INTERVALS {
            deadline = now + interval;
        }

        if !signal.wait_until(deadline) {
            break;
        }

        let (memory, kind) = capture.sample(context.settings.arginfo());
        context.buffer.insert(Sample {
            request: request.copy(&context.strings),
            elapsed: context.clock.elapsed(),
            memory,
            kind,
        });
        samples += 1;
    }

    let (functions, strings) = capture.cache().cache_size();
    debug!(
        "Sampler for pid {} stopped after {} samples ({} functions, {} strings cached)",
        target.pid, samples, functions, strings
    );
}
