/*
 * linpama - Package transaction engine for Arch Linux front ends.
 * Copyright (C) 2025  linpama contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The transaction state machine.
//!
//! The supervisor owns every piece of observable transaction state. Worker
//! tasks (child output readers, the progress ticker, the cancellation grace
//! timer) only post [`WorkerMessage`]s; [`Supervisor::pump`] applies them on
//! the owner's task. Each transaction bumps a generation counter and messages
//! carrying an older generation are dropped.

use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Span};

use super::process::{signal_group, spawn_streaming, ProcessSpec, WorkerMessage};
use super::{
    validate_package_name, CredentialResponse, LogBuffer, Phase, ReviewDecision,
    TransactionIntent, TransactionKind, TransactionSnapshot, TransactionState,
};
use crate::aur::{AurCheckout, BuildRecipe, ReviewedCheckout};
use crate::config::{AurConfig, Config, ToolsConfig, TransactionConfig};
use crate::error::{ErrorKind, LinpamaError, LinpamaResult};
use crate::events::Event;
use crate::privilege::{is_rejection_line, ElevationHandle, Session};

/// The child currently under supervision
struct ActiveProcess {
    pgid: u32,
    program: String,
    // Helpers live exactly as long as the child.
    elevation: Option<ElevationHandle>,
    credential_rejected: bool,
}

/// Runs one package transaction at a time
pub struct Supervisor {
    tools: ToolsConfig,
    aur: AurConfig,
    timing: TransactionConfig,
    session: Session,

    state: TransactionState,
    intent: Option<TransactionIntent>,
    phase: Option<Phase>,
    failure: Option<ErrorKind>,
    cancel_requested: bool,
    log: LogBuffer,
    generation: u64,
    span: Span,

    active: Option<ActiveProcess>,
    checkout: Option<AurCheckout>,
    pending_recipe: Option<BuildRecipe>,
    reviewed: Option<ReviewedCheckout>,

    events: mpsc::UnboundedSender<Event>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ticker: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Create an idle supervisor and the receiving end of its event stream
    pub fn new(config: &Config, session: Session) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            tools: config.tools.clone(),
            aur: config.aur.clone(),
            timing: config.transaction.clone(),
            session,
            state: TransactionState::Idle,
            intent: None,
            phase: None,
            failure: None,
            cancel_requested: false,
            log: LogBuffer::new(),
            generation: 0,
            span: Span::none(),
            active: None,
            checkout: None,
            pending_recipe: None,
            reviewed: None,
            events,
            worker_tx,
            worker_rx,
            ticker: None,
            grace_timer: None,
        };

        (supervisor, events_rx)
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn intent(&self) -> Option<&TransactionIntent> {
        self.intent.as_ref()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Recipe awaiting the operator's review, if any
    pub fn pending_recipe(&self) -> Option<&BuildRecipe> {
        self.pending_recipe.as_ref()
    }

    /// Workspace of the current AUR checkout, if one exists
    pub fn checkout_dir(&self) -> Option<&Path> {
        self.checkout
            .as_ref()
            .map(AurCheckout::workspace)
            .or_else(|| self.reviewed.as_ref().map(ReviewedCheckout::workspace))
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            state: self.state,
            intent: self.intent.clone(),
            phase: self.phase,
            failure: self.failure,
            cancel_requested: self.cancel_requested,
        }
    }

    /// Start a transaction. Rejected unless the supervisor is idle.
    pub fn submit(&mut self, intent: TransactionIntent) -> LinpamaResult<()> {
        if self.state != TransactionState::Idle {
            let active = self
                .intent
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| self.state.to_string());
            warn!("rejecting '{}': '{}' is still active", intent, active);
            return Err(LinpamaError::TransactionBusy { active });
        }
        validate_package_name(&intent.package_name)?;

        self.log.clear();
        self.generation += 1;
        self.failure = None;
        self.phase = None;
        self.cancel_requested = false;
        self.span = crate::span_transaction!(intent.kind, intent.package_name);
        let _enter = self.span.clone().entered();

        info!("starting {}", intent);
        let kind = intent.kind;
        self.intent = Some(intent);

        match kind {
            TransactionKind::AurBuild => self.start_fetch(),
            TransactionKind::Install | TransactionKind::Remove => self.proceed_privileged(),
        }
        Ok(())
    }

    /// Answer a [`Event::CredentialRequested`]
    pub fn provide_credential(&mut self, response: CredentialResponse) -> LinpamaResult<()> {
        self.expect_state(TransactionState::AwaitingCredential, "provide a credential")?;
        let _enter = self.span.clone().entered();

        match response {
            CredentialResponse::Cancelled => {
                self.note("Authentication cancelled.");
                self.return_to_idle();
            }
            CredentialResponse::Provided(secret) => {
                let accepted = self.session.credentials_mut().accept(secret).map(|_| ());
                match accepted {
                    Ok(()) => self.launch_main(),
                    Err(e) => self.fail(e),
                }
            }
        }
        Ok(())
    }

    /// Answer a [`Event::ReviewRequested`]
    pub fn review(&mut self, decision: ReviewDecision) -> LinpamaResult<()> {
        self.expect_state(TransactionState::AwaitingReview, "review a build recipe")?;
        let _enter = self.span.clone().entered();

        let checkout = self.checkout.take();
        let recipe = self.pending_recipe.take();

        match decision {
            ReviewDecision::Cancel => {
                if let Some(checkout) = checkout {
                    if let Err(e) = checkout.close() {
                        warn!("{}", e);
                    }
                }
                self.note("Build cancelled at review.");
                self.return_to_idle();
            }
            ReviewDecision::Proceed => match (checkout, recipe) {
                (Some(checkout), Some(recipe)) => {
                    info!("recipe {} approved", recipe.digest());
                    match checkout.approve(&recipe) {
                        Ok(reviewed) => {
                            self.reviewed = Some(reviewed);
                            self.proceed_privileged();
                        }
                        Err(e) => self.fail(e),
                    }
                }
                _ => self.fail(LinpamaError::SourceFetchFailed {
                    package: self.package(),
                    reason: "checkout is no longer available".to_string(),
                }),
            },
        }
        Ok(())
    }

    /// Request cancellation.
    ///
    /// A running child gets SIGINT on its process group; if the grace period
    /// passes with the child alive it gets SIGTERM. Pending prompts are simply
    /// abandoned.
    pub fn cancel(&mut self) -> LinpamaResult<()> {
        let _enter = self.span.clone().entered();

        match self.state {
            TransactionState::Running => {
                self.cancel_requested = true;
                self.state = TransactionState::Cancelling;

                if let Some(active) = &self.active {
                    let (pgid, program) = (active.pgid, active.program.clone());
                    info!("interrupting process group {}", pgid);
                    if !signal_group(pgid, libc::SIGINT) {
                        debug!("process group {} already gone", pgid);
                    }
                    self.note(format!("Cancellation requested, interrupting {}...", program));
                }
                self.start_grace_timer();
                self.emit_state();
                Ok(())
            }
            TransactionState::Cancelling => Ok(()),
            TransactionState::AwaitingCredential => {
                self.provide_credential(CredentialResponse::Cancelled)
            }
            TransactionState::AwaitingReview => self.review(ReviewDecision::Cancel),
            state => Err(LinpamaError::InvalidTransition {
                action: "cancel",
                state: state.to_string(),
            }),
        }
    }

    /// Acknowledge a terminal state, returning to idle
    pub fn acknowledge(&mut self) -> LinpamaResult<()> {
        if !self.state.is_terminal() {
            return Err(LinpamaError::InvalidTransition {
                action: "acknowledge",
                state: self.state.to_string(),
            });
        }
        self.log.clear();
        self.return_to_idle();
        Ok(())
    }

    /// Apply the next worker message, waiting for one if necessary
    pub async fn pump(&mut self) {
        if let Some(message) = self.worker_rx.recv().await {
            self.handle(message);
        }
    }

    /// Pump until no child is running; returns the state reached
    pub async fn run_until_settled(&mut self) -> TransactionState {
        while self.state.has_child() {
            self.pump().await;
        }
        self.state
    }

    fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Tick => {
                if self.state.has_child() {
                    self.emit(Event::ProgressTick);
                }
            }
            WorkerMessage::Output { generation, line } => {
                if self.is_stale(generation) {
                    return;
                }
                if let Some(active) = self.active.as_mut() {
                    if active.elevation.is_some() && is_rejection_line(&line) {
                        active.credential_rejected = true;
                    }
                }
                self.log.push(line.clone());
                self.emit(Event::LogAppended(line));
            }
            WorkerMessage::GraceElapsed { generation } => {
                if self.is_stale(generation) || self.state != TransactionState::Cancelling {
                    return;
                }
                let _enter = self.span.clone().entered();
                if let Some(pgid) = self.active.as_ref().map(|a| a.pgid) {
                    warn!("process group {} ignored SIGINT, sending SIGTERM", pgid);
                    signal_group(pgid, libc::SIGTERM);
                    self.note("Still running after interrupt, terminating.");
                }
            }
            WorkerMessage::Exited { generation, code } => {
                if self.is_stale(generation) {
                    return;
                }
                let _enter = self.span.clone().entered();
                self.on_exit(code);
            }
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        if generation != self.generation {
            debug!(
                "dropping message from transaction #{} (current #{})",
                generation, self.generation
            );
            return true;
        }
        self.active.is_none()
    }

    fn on_exit(&mut self, code: Option<i32>) {
        let (program, credential_rejected) = self
            .active
            .take()
            .map(|a| (a.program, a.credential_rejected))
            .unwrap_or_default();
        self.stop_workers();
        debug!("{} exited with {:?}", program, code);

        match self.phase {
            Some(Phase::Fetch) => self.on_fetch_exit(code),
            _ => {
                // Build directory goes away whatever the outcome.
                self.reviewed = None;
                if code == Some(0) {
                    self.succeed();
                } else if credential_rejected {
                    // A refused password must be asked for again next time.
                    self.session.credentials_mut().clear();
                    self.fail(LinpamaError::auth("password was rejected"));
                } else {
                    self.fail(LinpamaError::NonZeroExit { program, code });
                }
            }
        }
    }

    fn on_fetch_exit(&mut self, code: Option<i32>) {
        let package = self.package();

        if self.cancel_requested {
            self.fail(LinpamaError::SourceFetchFailed {
                package,
                reason: "fetch was cancelled".to_string(),
            });
            return;
        }
        if code != Some(0) {
            let reason = match code {
                Some(code) => format!("git exited with code {}", code),
                None => "git was terminated by a signal".to_string(),
            };
            self.fail(LinpamaError::SourceFetchFailed { package, reason });
            return;
        }

        let loaded = match &self.checkout {
            Some(checkout) => checkout.load_recipe(),
            None => Err(LinpamaError::SourceFetchFailed {
                package,
                reason: "checkout is no longer available".to_string(),
            }),
        };

        match loaded {
            Ok(recipe) => {
                info!(
                    "fetched recipe {} ({} finding(s))",
                    recipe.digest(),
                    recipe.findings().len()
                );
                self.state = TransactionState::AwaitingReview;
                self.phase = None;
                self.pending_recipe = Some(recipe.clone());
                self.emit_state();
                self.emit(Event::ReviewRequested { recipe });
            }
            Err(e) => self.fail(e),
        }
    }

    fn start_fetch(&mut self) {
        let package = self.package();
        let checkout = match AurCheckout::create(&package, self.aur.build_root.as_deref()) {
            Ok(checkout) => checkout,
            Err(e) => return self.fail(e),
        };

        let spec = checkout.clone_spec(&self.tools.git, &self.aur.clone_url(&package));
        self.checkout = Some(checkout);
        self.start_child(spec, Phase::Fetch, None);
    }

    /// Ask for the credential if the intent needs one that is not cached yet
    fn proceed_privileged(&mut self) {
        let needs_prompt = self
            .intent
            .as_ref()
            .map(|i| i.requires_privilege)
            .unwrap_or(false)
            && !self.session.credentials().is_cached();

        if needs_prompt {
            self.state = TransactionState::AwaitingCredential;
            self.phase = None;
            self.emit_state();
            self.emit(Event::CredentialRequested {
                package: self.package(),
            });
        } else {
            self.launch_main();
        }
    }

    /// Start the pacman or makepkg stage of the current intent
    fn launch_main(&mut self) {
        let Some(intent) = self.intent.clone() else {
            return;
        };
        let package = intent.package_name.as_str();

        let planned = match intent.kind {
            TransactionKind::Install => Some((
                ProcessSpec::from_prefix(&self.tools.pacman, ["-S", "--noconfirm", "--needed", package]),
                Phase::Package,
            )),
            TransactionKind::Remove => Some((
                ProcessSpec::from_prefix(&self.tools.pacman, ["-Rns", "--noconfirm", package]),
                Phase::Package,
            )),
            TransactionKind::AurBuild => self.reviewed.as_ref().map(|reviewed| {
                (
                    reviewed.build_spec(&self.tools.makepkg, &self.aur.makepkg_args),
                    Phase::Build,
                )
            }),
        };
        let Some((spec, phase)) = planned else {
            return self.fail(LinpamaError::ReviewRejected {
                package: package.to_string(),
            });
        };

        self.note(format!("==> {}", spec.command_line()));

        if !intent.requires_privilege {
            return self.start_child(spec, phase, None);
        }

        let elevation = match self.session.elevate() {
            Ok(handle) => handle,
            Err(e) => return self.fail(e),
        };
        let spec = match intent.kind {
            // makepkg refuses to run as root; it elevates pacman itself.
            TransactionKind::AurBuild => elevation.with_askpass(spec),
            _ => elevation.wrap(spec),
        };
        self.start_child(spec, phase, Some(elevation));
    }

    fn start_child(&mut self, spec: ProcessSpec, phase: Phase, elevation: Option<ElevationHandle>) {
        match spawn_streaming(&spec, self.generation, self.worker_tx.clone()) {
            Ok(pgid) => {
                self.active = Some(ActiveProcess {
                    pgid,
                    program: spec.program().to_string(),
                    elevation,
                    credential_rejected: false,
                });
                self.state = TransactionState::Running;
                self.phase = Some(phase);
                self.start_ticker();
                self.emit_state();
            }
            Err(e) => self.fail(e),
        }
    }

    fn start_ticker(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let tx = self.worker_tx.clone();
        let period = self.timing.tick();

        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tx.send(WorkerMessage::Tick).is_err() {
                    break;
                }
            }
        }));
    }

    fn start_grace_timer(&mut self) {
        let Some(grace) = self.timing.cancel_grace() else {
            return;
        };
        let tx = self.worker_tx.clone();
        let generation = self.generation;

        self.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(WorkerMessage::GraceElapsed { generation });
        }));
    }

    fn stop_workers(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }

    fn succeed(&mut self) {
        info!("transaction succeeded");
        self.state = TransactionState::Succeeded;
        self.note("Transaction completed successfully.");
        self.emit_state();
        self.emit(Event::TransactionCompleted {
            success: true,
            package: self.package(),
        });
    }

    /// Move to Failed. Always leaves a final line in the log.
    fn fail(&mut self, err: LinpamaError) {
        error!("transaction failed: {}", err);
        self.stop_workers();
        self.active = None;
        self.checkout = None;
        self.pending_recipe = None;
        self.reviewed = None;

        self.state = TransactionState::Failed;
        self.failure = Some(err.kind());
        let suffix = if self.cancel_requested {
            " (cancelled by user)"
        } else {
            ""
        };
        self.note(format!("Transaction failed: {}{}", err, suffix));
        self.emit_state();
        self.emit(Event::TransactionCompleted {
            success: false,
            package: self.package(),
        });
    }

    fn return_to_idle(&mut self) {
        self.stop_workers();
        self.active = None;
        self.checkout = None;
        self.pending_recipe = None;
        self.reviewed = None;

        self.state = TransactionState::Idle;
        self.intent = None;
        self.phase = None;
        self.failure = None;
        self.cancel_requested = false;
        self.emit_state();
        self.span = Span::none();
    }

    fn expect_state(&self, expected: TransactionState, action: &'static str) -> LinpamaResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(LinpamaError::InvalidTransition {
                action,
                state: self.state.to_string(),
            })
        }
    }

    fn package(&self) -> String {
        self.intent
            .as_ref()
            .map(|i| i.package_name.clone())
            .unwrap_or_default()
    }

    /// Append a supervisor line to the log
    fn note(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.log.push(text.clone());
        self.emit(Event::LogAppended(text));
    }

    fn emit_state(&self) {
        self.emit(Event::TransactionStateChanged(self.snapshot()));
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_workers();
        if let Some(active) = &self.active {
            signal_group(active.pgid, libc::SIGTERM);
        }
    }
}
