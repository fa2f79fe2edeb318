use crate::emitter::SessionEmitter;
use crate::error::TraceError;
use crate::geo::GeoLocator;
use crate::runner::{run_batch, validate_target, RunnerEvent, TraceSettings};
use crate::stream::run_streaming;
use chrono::{DateTime, Utc};
use geotrace_model::{Hop, HopFact, Location, TraceEvent, TraceStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// State of one client's trace: its hops, in hop order, and its lifecycle.
#[derive(Debug)]
pub struct TraceSession {
    id: u64,
    target: String,
    status: TraceStatus,
    hops: Vec<Hop>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<TraceError>,
    emitter: SessionEmitter,
}

impl TraceSession {
    /// Accepts a trace request. An invalid target fails the session on the
    /// spot with a single terminal error event.
    pub fn start(target: &str, emitter: SessionEmitter) -> Self {
        let mut session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            target: target.trim().to_string(),
            status: TraceStatus::Idle,
            hops: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            emitter,
        };

        match validate_target(target) {
            Ok(target) => {
                session.target = target;
                session.status = TraceStatus::Running;
                info!(session = session.id, target = %session.target, "trace session started");
                session.emitter.emit(TraceEvent::Started {
                    target: session.target.clone(),
                });
            }
            Err(err) => session.fail(err),
        }
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn status(&self) -> TraceStatus {
        self.status
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn error(&self) -> Option<&TraceError> {
        self.error.as_ref()
    }

    fn is_running(&self) -> bool {
        self.status == TraceStatus::Running
    }

    /// Upserts a hop and announces it. Returns the snapshot to look up when
    /// the hop's address has not been seen in this slot before.
    pub fn apply_fact(&mut self, fact: HopFact) -> Option<Hop> {
        if !self.is_running() {
            return None;
        }

        let (index, fresh) = match self
            .hops
            .binary_search_by_key(&fact.hop_number, |hop| hop.hop_number)
        {
            Ok(index) => {
                let hop = &mut self.hops[index];
                if hop.ip == fact.ip {
                    hop.hostname = fact.hostname;
                    hop.latency_ms = fact.latency_ms;
                    (index, false)
                } else {
                    debug!(hop = fact.hop_number, old = %hop.ip, new = %fact.ip, "hop address changed");
                    *hop = Hop::from_fact(fact);
                    (index, true)
                }
            }
            Err(index) => {
                self.hops.insert(index, Hop::from_fact(fact));
                (index, true)
            }
        };

        let snapshot = self.hops[index].clone();
        self.emitter.emit(TraceEvent::HopDiscovered(snapshot.clone()));
        fresh.then_some(snapshot)
    }

    /// Stores a lookup result if the session is live and the slot still
    /// holds the address that was looked up.
    pub fn apply_location(&mut self, hop_number: u32, ip: &str, location: Location) -> bool {
        if !self.is_running() {
            return false;
        }
        let Ok(index) = self
            .hops
            .binary_search_by_key(&hop_number, |hop| hop.hop_number)
        else {
            return false;
        };

        let hop = &mut self.hops[index];
        if hop.ip != ip || hop.location.is_some() {
            return false;
        }
        hop.location = Some(location);

        let snapshot = hop.clone();
        self.emitter.emit(TraceEvent::HopLocationUpdated(snapshot))
    }

    pub fn diagnostic(&mut self, text: String) {
        if self.is_running() {
            self.emitter.emit(TraceEvent::Diagnostic { text });
        }
    }

    pub fn complete(&mut self) {
        if !self.is_running() {
            return;
        }
        self.status = TraceStatus::Completed;
        self.finished_at = Some(Utc::now());
        info!(session = self.id, hops = self.hops.len(), "trace session completed");
        self.emitter.emit(TraceEvent::Completed {
            hop_count: self.hops.len(),
        });
    }

    pub fn fail(&mut self, error: TraceError) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TraceStatus::Failed;
        self.finished_at = Some(Utc::now());
        warn!(session = self.id, error = %error, "trace session failed");
        self.emitter.emit(TraceEvent::Error {
            error: error.to_string(),
        });
        self.error = Some(error);
    }

    /// The client went away: fail silently.
    pub fn abandon(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TraceStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(TraceError::Cancelled);
        debug!(session = self.id, "trace session abandoned");
    }

    pub fn into_outcome(self) -> TraceOutcome {
        TraceOutcome {
            session_id: self.id,
            target: self.target,
            status: self.status,
            hops: self.hops,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error,
        }
    }
}

#[derive(Debug)]
pub struct TraceOutcome {
    pub session_id: u64,
    pub target: String,
    pub status: TraceStatus,
    pub hops: Vec<Hop>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TraceError>,
}

impl TraceOutcome {
    pub fn into_result(self) -> Result<Vec<Hop>, TraceError> {
        match (self.status, self.error) {
            (TraceStatus::Completed, _) => Ok(self.hops),
            (_, Some(err)) => Err(err),
            (_, None) => Err(TraceError::Interrupted),
        }
    }
}

/// A lookup result addressed to the session and slot that asked for it.
#[derive(Debug)]
struct Enrichment {
    session_id: u64,
    hop_number: u32,
    ip: String,
    location: Option<Location>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Wait for the process, then report everything.
    Batch,
    /// Report each hop as its line arrives.
    Streaming,
}

/// Runs traces: one session per call, nothing shared between calls except
/// configuration and the locator.
#[derive(Clone)]
pub struct Tracer {
    settings: TraceSettings,
    locator: Arc<dyn GeoLocator>,
    settle_timeout: Duration,
}

impl Tracer {
    pub fn new(settings: TraceSettings, locator: Arc<dyn GeoLocator>) -> Self {
        Self {
            settings,
            locator,
            settle_timeout: Duration::from_secs(5),
        }
    }

    /// Bounds how long a finished trace waits for outstanding lookups.
    pub fn with_settle_timeout(mut self, settle_timeout: Duration) -> Self {
        self.settle_timeout = settle_timeout;
        self
    }

    pub fn settings(&self) -> &TraceSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        target: &str,
        mode: TraceMode,
        emitter: SessionEmitter,
        cancel: CancellationToken,
    ) -> TraceOutcome {
        let session = TraceSession::start(target, emitter);
        if !session.is_running() {
            return session.into_outcome();
        }

        let (tx, rx) = mpsc::channel(64);
        let runner_cancel = cancel.child_token();
        // Dropping this future mid-trace must still stop the subprocess.
        let _runner_guard = runner_cancel.clone().drop_guard();
        let target = session.target().to_string();
        let settings = self.settings.clone();
        let runner = {
            let runner_cancel = runner_cancel.clone();
            tokio::spawn(async move {
                match mode {
                    TraceMode::Streaming => {
                        run_streaming(&target, &settings, tx, runner_cancel).await
                    }
                    TraceMode::Batch => {
                        tokio::select! {
                            _ = runner_cancel.cancelled() => {}
                            _ = run_batch(&target, &settings, tx) => {}
                        }
                    }
                }
            })
        };

        let outcome = drive(
            session,
            rx,
            Arc::clone(&self.locator),
            self.settle_timeout,
            cancel,
        )
        .await;

        runner_cancel.cancel();
        if let Err(err) = runner.await {
            debug!(error = %err, "runner task ended abnormally");
        }
        outcome
    }

    /// One-shot trace: the hops once everything is done, or the error.
    pub async fn run_one_shot(&self, target: &str) -> Result<Vec<Hop>, TraceError> {
        self.run(
            target,
            TraceMode::Batch,
            SessionEmitter::detached(),
            CancellationToken::new(),
        )
        .await
        .into_result()
    }
}

/// Feeds runner events into the session and lookups into the background
/// until a terminal event or cancellation.
pub async fn drive(
    mut session: TraceSession,
    mut events: Receiver<RunnerEvent>,
    locator: Arc<dyn GeoLocator>,
    settle_timeout: Duration,
    cancel: CancellationToken,
) -> TraceOutcome {
    let mut lookups: JoinSet<Enrichment> = JoinSet::new();

    while session.is_running() {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                lookups.abort_all();
                session.abandon();
            }
            event = events.recv() => match event {
                Some(RunnerEvent::Hop(fact)) => {
                    if let Some(hop) = session.apply_fact(fact) {
                        spawn_lookup(&mut lookups, session.id(), hop, Arc::clone(&locator));
                    }
                }
                Some(RunnerEvent::Diagnostic(text)) => session.diagnostic(text),
                Some(RunnerEvent::Exited { exit_code, hop_count }) => {
                    debug!(session = session.id(), exit_code, hop_count, "runner exited");
                    if settle(&mut session, &mut lookups, settle_timeout, &cancel).await {
                        session.complete();
                    }
                }
                Some(RunnerEvent::Failed(err)) => {
                    lookups.abort_all();
                    session.fail(err);
                }
                None => {
                    lookups.abort_all();
                    session.fail(TraceError::Interrupted);
                }
            },
            Some(joined) = lookups.join_next(), if !lookups.is_empty() => {
                if let Ok(enrichment) = joined {
                    apply_enrichment(&mut session, enrichment);
                }
            }
        }
    }

    lookups.abort_all();
    session.into_outcome()
}

/// Lets in-flight lookups land before the terminal event. Returns false if
/// the session was cancelled meanwhile.
async fn settle(
    session: &mut TraceSession,
    lookups: &mut JoinSet<Enrichment>,
    settle_timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    let deadline = tokio::time::sleep(settle_timeout);
    tokio::pin!(deadline);

    while !lookups.is_empty() {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                lookups.abort_all();
                session.abandon();
                return false;
            }
            _ = &mut deadline => {
                debug!(session = session.id(), pending = lookups.len(), "lookups still pending at completion");
                lookups.abort_all();
                break;
            }
            Some(joined) = lookups.join_next() => {
                if let Ok(enrichment) = joined {
                    apply_enrichment(session, enrichment);
                }
            }
        }
    }
    true
}

fn spawn_lookup(
    lookups: &mut JoinSet<Enrichment>,
    session_id: u64,
    hop: Hop,
    locator: Arc<dyn GeoLocator>,
) {
    lookups.spawn(async move {
        let location = locator.locate(&hop.ip).await;
        Enrichment {
            session_id,
            hop_number: hop.hop_number,
            ip: hop.ip,
            location,
        }
    });
}

fn apply_enrichment(session: &mut TraceSession, enrichment: Enrichment) {
    if enrichment.session_id != session.id() {
        return;
    }
    match enrichment.location {
        Some(location) => {
            session.apply_location(enrichment.hop_number, &enrichment.ip, location);
        }
        None => debug!(hop = enrichment.hop_number, ip = %enrichment.ip, "no location for hop"),
    }
}
