//! Scan lifecycle poller.
//!
//! [`ScanMachine`] is the pure part: current state plus an event gives the
//! next state and a list of [`ScanEffect`]s. [`ScanController`] executes those
//! effects against the gateway and owns the single polling task.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::gateway::{Failure, Gateway};
use crate::periodic::{FirstTick, PeriodicTask};
use crate::ports::parse_port_range;
use crate::target::parse_target;
use crate::types::{ScanParams, ScanResults, ScanStatus};

pub const ALREADY_RUNNING: &str = "a scan is already running";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Local mirror of the server's scan job. While `is_scanning` is false the
/// values are the terminal snapshot of the last run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanJob {
    pub scan_id: Option<String>,
    pub is_scanning: bool,
    pub progress: f64,
    pub current_phase: String,
    pub devices_found: u64,
    pub estimated_time_remaining: Option<f64>,
}

impl ScanJob {
    /// Copy the server's numbers verbatim; no interpolation.
    fn mirror(&mut self, status: &ScanStatus) {
        self.is_scanning = status.is_scanning;
        self.progress = status.progress;
        self.current_phase = status.current_phase.clone();
        self.devices_found = status.devices_found;
        self.estimated_time_remaining = status.estimated_time_remaining;
    }
}

/// One-shot operator notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanNotice {
    Started { scan_id: String },
    Completed { devices_found: u64 },
    Stopped,
    StartFailed(String),
    StopFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    StartRequested(ScanParams),
    StartAccepted { scan_id: String },
    StartRejected(Failure),
    /// One-off status read outside polling, e.g. when the console attaches.
    Synced(ScanStatus),
    StatusPolled { epoch: u64, status: ScanStatus },
    StatusFailed { epoch: u64, failure: Failure },
    ResultsFetched { epoch: u64, results: ScanResults },
    ResultsFailed { epoch: u64, failure: Failure },
    StopRequested,
    StopConfirmed,
    StopFailed(Failure),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEffect {
    CallStart(ScanParams),
    CallStop,
    StartPolling { epoch: u64 },
    StopPolling,
    FetchResults { epoch: u64 },
    Notify(ScanNotice),
}

/// Scan lifecycle state. Every polling run gets a fresh epoch; events
/// carrying an older epoch are stale and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanMachine {
    phase: ScanPhase,
    job: ScanJob,
    last_error: Option<Failure>,
    results: Option<ScanResults>,
    epoch: u64,
    awaiting_results: bool,
}

impl Default for ScanMachine {
    fn default() -> Self {
        Self {
            phase: ScanPhase::Idle,
            job: ScanJob::default(),
            last_error: None,
            results: None,
            epoch: 0,
            awaiting_results: false,
        }
    }
}

impl ScanMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn job(&self) -> &ScanJob {
        &self.job
    }

    pub fn last_error(&self) -> Option<&Failure> {
        self.last_error.as_ref()
    }

    /// Final results of the last completed run, once fetched.
    pub fn results(&self) -> Option<&ScanResults> {
        self.results.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// A run completed and its results fetch has not settled yet.
    pub fn is_fetching_results(&self) -> bool {
        self.awaiting_results
    }

    /// Apply one event. Only `StartRequested` can fail, and a failed request
    /// leaves the machine untouched.
    pub fn handle(&mut self, event: ScanEvent) -> Result<Vec<ScanEffect>, Failure> {
        let effects = match event {
            ScanEvent::StartRequested(params) => {
                if self.phase != ScanPhase::Idle {
                    return Err(Failure::Validation(ALREADY_RUNNING.into()));
                }
                validate_params(&params)?;
                self.phase = ScanPhase::Starting;
                self.last_error = None;
                vec![ScanEffect::CallStart(params)]
            }
            ScanEvent::StartAccepted { scan_id } => {
                if self.phase != ScanPhase::Starting {
                    return Ok(Vec::new());
                }
                self.phase = ScanPhase::Running;
                self.epoch += 1;
                self.job = ScanJob {
                    scan_id: Some(scan_id.clone()),
                    is_scanning: true,
                    ..ScanJob::default()
                };
                self.results = None;
                self.awaiting_results = false;
                vec![
                    ScanEffect::StartPolling { epoch: self.epoch },
                    ScanEffect::Notify(ScanNotice::Started { scan_id }),
                ]
            }
            ScanEvent::StartRejected(failure) => {
                if self.phase != ScanPhase::Starting {
                    return Ok(Vec::new());
                }
                self.phase = ScanPhase::Idle;
                let notice = ScanNotice::StartFailed(failure.message().to_string());
                self.last_error = Some(failure);
                vec![ScanEffect::Notify(notice)]
            }
            ScanEvent::Synced(status) => {
                if self.phase != ScanPhase::Idle {
                    return Ok(Vec::new());
                }
                self.job.mirror(&status);
                if status.is_scanning {
                    self.phase = ScanPhase::Running;
                    self.epoch += 1;
                    self.results = None;
                    self.awaiting_results = false;
                    vec![ScanEffect::StartPolling { epoch: self.epoch }]
                } else {
                    Vec::new()
                }
            }
            ScanEvent::StatusPolled { epoch, status } => {
                if epoch != self.epoch || self.phase != ScanPhase::Running {
                    return Ok(Vec::new());
                }
                self.job.mirror(&status);
                if status.is_scanning {
                    Vec::new()
                } else {
                    self.phase = ScanPhase::Idle;
                    self.awaiting_results = true;
                    vec![
                        ScanEffect::StopPolling,
                        ScanEffect::FetchResults { epoch },
                        ScanEffect::Notify(ScanNotice::Completed {
                            devices_found: self.job.devices_found,
                        }),
                    ]
                }
            }
            // Transient: the job keeps running whether or not we can see it.
            ScanEvent::StatusFailed { .. } => Vec::new(),
            ScanEvent::ResultsFetched { epoch, results } => {
                if epoch == self.epoch && self.awaiting_results {
                    self.awaiting_results = false;
                    self.results = Some(results);
                }
                Vec::new()
            }
            ScanEvent::ResultsFailed { epoch, .. } => {
                if epoch == self.epoch {
                    self.awaiting_results = false;
                }
                Vec::new()
            }
            ScanEvent::StopRequested => {
                if self.phase != ScanPhase::Running {
                    return Ok(Vec::new());
                }
                self.phase = ScanPhase::Stopping;
                self.job.is_scanning = false;
                self.epoch += 1;
                vec![ScanEffect::StopPolling, ScanEffect::CallStop]
            }
            ScanEvent::StopConfirmed => {
                if self.phase != ScanPhase::Stopping {
                    return Ok(Vec::new());
                }
                self.phase = ScanPhase::Idle;
                vec![ScanEffect::Notify(ScanNotice::Stopped)]
            }
            ScanEvent::StopFailed(failure) => {
                if self.phase != ScanPhase::Stopping {
                    return Ok(Vec::new());
                }
                // Not confirmed stopped: resume watching, the next poll reconciles.
                self.phase = ScanPhase::Running;
                self.job.is_scanning = true;
                self.epoch += 1;
                let notice = ScanNotice::StopFailed(failure.message().to_string());
                self.last_error = Some(failure);
                vec![
                    ScanEffect::StartPolling { epoch: self.epoch },
                    ScanEffect::Notify(notice),
                ]
            }
        };
        Ok(effects)
    }
}

/// Reject malformed parameters before they reach the network.
pub fn validate_params(params: &ScanParams) -> Result<(), Failure> {
    if let Some(interface) = &params.interface {
        if interface.trim().is_empty() {
            return Err(Failure::Validation("interface must not be empty".into()));
        }
    }
    if let Some(range) = &params.port_range {
        parse_port_range(range)
            .map_err(|e| Failure::Validation(format!("invalid port_range: {e:#}")))?;
    }
    if let Some(target) = &params.target {
        parse_target(target).map_err(|e| Failure::Validation(format!("invalid target: {e:#}")))?;
    }
    Ok(())
}

type SharedMachine = Arc<watch::Sender<ScanMachine>>;

fn fold(state: &SharedMachine, event: ScanEvent) -> Result<Vec<ScanEffect>, Failure> {
    let mut out = Ok(Vec::new());
    state.send_if_modified(|machine| {
        let before = machine.clone();
        out = machine.handle(event);
        *machine != before
    });
    out
}

async fn results_event(gateway: &Gateway, epoch: u64) -> ScanEvent {
    match gateway.scan_results().await {
        Ok(results) => ScanEvent::ResultsFetched { epoch, results },
        Err(failure) => {
            tracing::warn!(error = %failure, "scan finished but results are unavailable");
            ScanEvent::ResultsFailed { epoch, failure }
        }
    }
}

/// What a polling task needs; cloned into each tick.
#[derive(Clone)]
struct PollContext {
    gateway: Gateway,
    state: SharedMachine,
    notices: mpsc::UnboundedSender<ScanNotice>,
}

impl PollContext {
    async fn tick(&self, epoch: u64) -> ControlFlow<()> {
        let event = match self.gateway.scan_status().await {
            Ok(status) => ScanEvent::StatusPolled { epoch, status },
            Err(failure) => {
                tracing::debug!(error = %failure, "status poll failed; retrying next tick");
                ScanEvent::StatusFailed { epoch, failure }
            }
        };
        let mut queue: VecDeque<ScanEffect> = fold(&self.state, event).unwrap_or_default().into();
        let mut flow = ControlFlow::Continue(());
        while let Some(effect) = queue.pop_front() {
            match effect {
                ScanEffect::StopPolling => flow = ControlFlow::Break(()),
                ScanEffect::FetchResults { epoch } => {
                    let event = results_event(&self.gateway, epoch).await;
                    queue.extend(fold(&self.state, event).unwrap_or_default());
                }
                ScanEffect::Notify(notice) => {
                    tracing::info!(?notice, "scan notice");
                    let _ = self.notices.send(notice);
                }
                other => tracing::warn!(?other, "unexpected effect from status poll"),
            }
        }
        flow
    }
}

/// Drives start/stop and owns the one polling task of a session.
pub struct ScanController {
    ctx: PollContext,
    poll_interval: Duration,
    poller: Option<PeriodicTask>,
}

impl ScanController {
    /// Returns the controller and the receiving end of its notices.
    pub fn new(
        gateway: Gateway,
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ScanNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ScanMachine::new());
        let ctx = PollContext {
            gateway,
            state: Arc::new(state),
            notices,
        };
        (
            Self {
                ctx,
                poll_interval,
                poller: None,
            },
            rx,
        )
    }

    pub fn snapshot(&self) -> ScanMachine {
        self.ctx.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanMachine> {
        self.ctx.state.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Start a scan. Rejected without side effects while one is running.
    /// Returns the server's scan id.
    pub async fn start(&mut self, params: ScanParams) -> Result<String, Failure> {
        let effects = fold(&self.ctx.state, ScanEvent::StartRequested(params))?;
        self.execute(effects).await?;
        Ok(self.snapshot().job.scan_id.unwrap_or_default())
    }

    /// Stop the running scan. No-op (and no network call) unless `Running`.
    pub async fn stop(&mut self) -> Result<(), Failure> {
        let effects = fold(&self.ctx.state, ScanEvent::StopRequested)?;
        self.execute(effects).await
    }

    /// Read the server's status once; attach to a scan already in progress.
    pub async fn sync(&mut self) -> Result<ScanMachine, Failure> {
        let status = self.ctx.gateway.scan_status().await?;
        let effects = fold(&self.ctx.state, ScanEvent::Synced(status))?;
        self.execute(effects).await?;
        Ok(self.snapshot())
    }

    async fn execute(&mut self, effects: Vec<ScanEffect>) -> Result<(), Failure> {
        let mut queue: VecDeque<ScanEffect> = effects.into();
        let mut failure = None;
        while let Some(effect) = queue.pop_front() {
            match effect {
                ScanEffect::CallStart(params) => {
                    let event = match self.ctx.gateway.start_scan(&params).await {
                        Ok(started) => {
                            tracing::info!(scan_id = %started.scan_id, mode = %params.mode, "scan started");
                            ScanEvent::StartAccepted {
                                scan_id: started.scan_id,
                            }
                        }
                        Err(f) => {
                            failure = Some(f.clone());
                            ScanEvent::StartRejected(f)
                        }
                    };
                    queue.extend(fold(&self.ctx.state, event)?);
                }
                ScanEffect::CallStop => {
                    let event = match self.ctx.gateway.stop_scan().await {
                        Ok(ack) if ack.stopped => {
                            tracing::info!("scan stopped");
                            ScanEvent::StopConfirmed
                        }
                        Ok(_) => {
                            let f = Failure::Application("Scan was not stopped".into());
                            failure = Some(f.clone());
                            ScanEvent::StopFailed(f)
                        }
                        Err(f) => {
                            failure = Some(f.clone());
                            ScanEvent::StopFailed(f)
                        }
                    };
                    queue.extend(fold(&self.ctx.state, event)?);
                }
                ScanEffect::StartPolling { epoch } => self.spawn_poller(epoch),
                ScanEffect::StopPolling => {
                    if let Some(poller) = self.poller.take() {
                        poller.cancel();
                    }
                }
                ScanEffect::FetchResults { epoch } => {
                    let event = results_event(&self.ctx.gateway, epoch).await;
                    queue.extend(fold(&self.ctx.state, event)?);
                }
                ScanEffect::Notify(notice) => {
                    tracing::info!(?notice, "scan notice");
                    let _ = self.ctx.notices.send(notice);
                }
            }
        }
        match failure {
            Some(f) => Err(f),
            None => Ok(()),
        }
    }

    fn spawn_poller(&mut self, epoch: u64) {
        let ctx = self.ctx.clone();
        // Replacing the handle cancels any previous task.
        self.poller = Some(PeriodicTask::spawn(
            "scan-status",
            self.poll_interval,
            FirstTick::AfterInterval,
            move || {
                let ctx = ctx.clone();
                async move { ctx.tick(epoch).await }
            },
        ));
    }
}
