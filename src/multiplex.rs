//! Steady-state capture loop across every registered device.
//!
//! One worker blocks on a readiness wait over all registered descriptors and
//! processes every ready device in turn. The registry stays share-locked for
//! the whole cycle, so registration and removal wait for it to finish.

use std::convert::Infallible;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::registry::{DeviceHandle, DeviceRegistry};
use crate::sys;
use crate::traits::{CaptureError, DeviceOpener, Readiness, Result};

/// Pause between cycles that found nothing to watch.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(50);

/// What a steady-state failure on one device does to the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Stop the loop and return the error.
    #[default]
    AbortLoop,
    /// Exclude the failing device from later cycles and keep going.
    Isolate,
}

/// Outcome of one multiplex cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Descriptors waited on.
    pub watched: usize,
    /// Descriptors reported ready.
    pub ready: usize,
    /// Frames published.
    pub published: usize,
    /// Devices excluded during this cycle.
    pub faulted: Vec<DeviceHandle>,
}

impl CycleReport {
    /// Whether the cycle had nothing to wait on.
    pub const fn is_idle(&self) -> bool {
        self.watched == 0
    }
}

/// Readiness through `poll(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollReadiness;

impl Readiness for PollReadiness {
    fn wait(&mut self, fds: &[RawFd]) -> io::Result<Vec<bool>> {
        sys::poll_readable(fds)
    }
}

/// Drives the dequeue, publish, re-queue cycle for a registry.
#[derive(Debug)]
pub struct Multiplexer<O: DeviceOpener, R> {
    registry: Arc<DeviceRegistry<O>>,
    readiness: R,
    policy: FaultPolicy,
}

impl<O: DeviceOpener, R: Readiness> Multiplexer<O, R> {
    /// Loop over `registry`, aborting on the first device failure.
    pub const fn new(registry: Arc<DeviceRegistry<O>>, readiness: R) -> Self {
        Self {
            registry,
            readiness,
            policy: FaultPolicy::AbortLoop,
        }
    }

    /// Use `policy` for steady-state failures.
    #[must_use]
    pub const fn with_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Active fault policy.
    pub const fn policy(&self) -> FaultPolicy {
        self.policy
    }

    /// Registry being served.
    pub const fn registry(&self) -> &Arc<DeviceRegistry<O>> {
        &self.registry
    }

    /// Readiness source.
    pub const fn readiness(&self) -> &R {
        &self.readiness
    }

    /// Run one cycle: wait for any watched device, then capture from each
    /// ready one.
    ///
    /// Returns immediately with an idle report when no device is watched.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let snapshot = self.registry.snapshot_for_wait()?;
        let watched: Vec<_> = snapshot
            .iter()
            .filter(|(_, session)| !session.is_faulted())
            .collect();

        let mut report = CycleReport {
            watched: watched.len(),
            ..CycleReport::default()
        };
        if watched.is_empty() {
            return Ok(report);
        }

        let fds: Vec<RawFd> = watched.iter().map(|(_, session)| session.raw_fd()).collect();
        let ready = self.readiness.wait(&fds).map_err(CaptureError::Wait)?;

        for ((handle, session), _) in watched
            .iter()
            .zip(ready)
            .filter(|(_, is_ready)| *is_ready)
        {
            report.ready += 1;
            match session.capture_frame() {
                Ok(meta) => {
                    report.published += 1;
                    trace!("{handle}: published frame {}", meta.updates);
                }
                Err(err) => match self.policy {
                    FaultPolicy::AbortLoop => {
                        error!("{}: capture failed, stopping: {err}", session.name());
                        return Err(err);
                    }
                    FaultPolicy::Isolate => {
                        warn!("{}: capture failed, excluding {handle}: {err}", session.name());
                        session.mark_faulted();
                        report.faulted.push(*handle);
                    }
                },
            }
        }
        Ok(report)
    }

    /// Run cycles until one fails.
    pub fn run(&mut self) -> Result<Infallible> {
        loop {
            let report = self.run_cycle()?;
            if report.is_idle() {
                debug!("no devices to watch, backing off");
                thread::sleep(IDLE_BACKOFF);
            }
        }
    }
}
