// ── Session supervisor ──
//
// Owns the agent's lifetime. Opens the store session, loads topology,
// starts the watch pump and the switch acceptor, then follows session
// events through a pure state machine:
//
//   CONNECTED ──lost──▶ DISCONNECTED ──back──▶ CONNECTED (resync)
//                            │
//                 grace elapsed / EXPIRED ──▶ terminate
//
// The grace timer only posts an event back onto the loop; every decision
// is taken by `SessionMachine::handle`. Termination is reported to the
// caller as `SupervisorExit::Terminated`, after background tasks have
// stopped and the store session is closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vrn_proto::{SessionEvent, TopologyStore};

use crate::acceptor::ConnectionAcceptor;
use crate::config::AgentConfig;
use crate::error::CoreError;
use crate::sim::{PortServiceRegistry, SimulationEngine};
use crate::store::{TopologyCache, TopologyPaths};

// ── State machine ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Session(SessionEvent),
    /// The grace timer armed for `epoch` fired.
    GraceElapsed { epoch: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TerminationReason {
    /// The session stayed disconnected for the whole grace period.
    GraceExpired,
    /// The store expired the session.
    SessionExpired,
}

/// Side effects requested by the state machine, executed by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ArmGrace { epoch: u64 },
    CancelGrace,
    /// Reload topology and re-arm every watch.
    Resync,
    Terminate(TerminationReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMachine {
    state: SessionState,
    /// Bumped each time a grace timer is armed; stale timers carry an old
    /// epoch and are ignored.
    epoch: u64,
    grace_armed: bool,
    terminated: Option<TerminationReason>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    /// A machine for a freshly opened session.
    pub fn new() -> Self {
        Self {
            state: SessionState::Connected,
            epoch: 0,
            grace_armed: false,
            terminated: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn terminated(&self) -> Option<TerminationReason> {
        self.terminated
    }

    pub fn handle(&mut self, event: AgentEvent) -> Vec<Effect> {
        if self.terminated.is_some() {
            return Vec::new();
        }
        match (self.state, event) {
            (SessionState::Connected, AgentEvent::Session(SessionEvent::Disconnected)) => {
                self.state = SessionState::Disconnected;
                self.epoch += 1;
                self.grace_armed = true;
                vec![Effect::ArmGrace { epoch: self.epoch }]
            }
            (SessionState::Disconnected, AgentEvent::Session(SessionEvent::Connected)) => {
                self.state = SessionState::Connected;
                self.grace_armed = false;
                vec![Effect::CancelGrace, Effect::Resync]
            }
            (_, AgentEvent::Session(SessionEvent::Expired)) => {
                self.state = SessionState::Expired;
                let mut effects = Vec::with_capacity(2);
                if std::mem::take(&mut self.grace_armed) {
                    effects.push(Effect::CancelGrace);
                }
                effects.push(self.terminate(TerminationReason::SessionExpired));
                effects
            }
            (SessionState::Disconnected, AgentEvent::GraceElapsed { epoch })
                if self.grace_armed && epoch == self.epoch =>
            {
                self.grace_armed = false;
                vec![self.terminate(TerminationReason::GraceExpired)]
            }
            _ => Vec::new(),
        }
    }

    fn terminate(&mut self, reason: TerminationReason) -> Effect {
        self.terminated = Some(reason);
        Effect::Terminate(reason)
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The caller asked us to stop.
    Shutdown,
    /// The store session was lost for good.
    Terminated(TerminationReason),
}

pub struct SessionSupervisor {
    config: AgentConfig,
    store: Arc<dyn TopologyStore>,
    registry: Arc<PortServiceRegistry>,
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("host_id", &self.config.host_id)
            .finish_non_exhaustive()
    }
}

/// Everything started by the supervisor that must be stopped on exit.
struct Running {
    children: CancellationToken,
    tasks: JoinSet<()>,
    grace: Option<JoinHandle<()>>,
}

impl Running {
    fn cancel_grace(&mut self) {
        if let Some(timer) = self.grace.take() {
            timer.abort();
        }
    }

    async fn stop(mut self) {
        self.cancel_grace();
        self.children.cancel();
        while let Some(done) = self.tasks.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "background task failed");
            }
        }
    }
}

impl SessionSupervisor {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn TopologyStore>,
        registry: Arc<PortServiceRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    /// Run the agent until `shutdown` fires or the session is lost for
    /// good. Background tasks are stopped and the store session closed on
    /// every exit path.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SupervisorExit, CoreError> {
        let mut sessions = self.store.subscribe_session();
        self.store.open()?;
        info!(host = %self.config.host_id, "store session opened");

        let mut running = Running {
            children: CancellationToken::new(),
            tasks: JoinSet::new(),
            grace: None,
        };
        let outcome = self.supervise(&mut sessions, &shutdown, &mut running).await;

        running.stop().await;
        self.store.close();
        match &outcome {
            Ok(SupervisorExit::Shutdown) => info!("agent stopped"),
            Ok(SupervisorExit::Terminated(reason)) => error!(%reason, "agent terminated"),
            Err(e) => error!(error = %e, "agent failed"),
        }
        outcome
    }

    async fn supervise(
        &self,
        sessions: &mut broadcast::Receiver<SessionEvent>,
        shutdown: &CancellationToken,
        running: &mut Running,
    ) -> Result<SupervisorExit, CoreError> {
        let cache = Arc::new(TopologyCache::new(
            Arc::clone(&self.store),
            TopologyPaths::new(self.config.store.root_path.as_str()),
        ));
        cache.resync()?;
        running
            .tasks
            .spawn(Arc::clone(&cache).run(running.children.clone()));

        let engine = Arc::new(SimulationEngine::new(
            self.config.host_id,
            Arc::clone(&self.registry),
        ));
        let acceptor = ConnectionAcceptor::bind(
            self.config.switch.clone(),
            self.config.external_id_key.as_str(),
            Arc::clone(&cache),
            engine,
        )
        .await?;
        running.tasks.spawn(acceptor.run(running.children.clone()));

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut machine = SessionMachine::new();

        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("shutdown requested");
                    return Ok(SupervisorExit::Shutdown);
                }
                received = sessions.recv() => match received {
                    Ok(event) => AgentEvent::Session(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "session events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        warn!("session event source closed, treating the session as expired");
                        AgentEvent::Session(SessionEvent::Expired)
                    }
                },
                Some(event) = timer_rx.recv() => event,
            };
            debug!(?event, state = %machine.state(), "session event");

            for effect in machine.handle(event) {
                match effect {
                    Effect::ArmGrace { epoch } => {
                        warn!(
                            grace_secs = self.config.disconnected_grace.as_secs(),
                            "store session lost, waiting for it to return"
                        );
                        running.cancel_grace();
                        running.grace = Some(spawn_grace_timer(
                            timer_tx.clone(),
                            epoch,
                            self.config.disconnected_grace,
                        ));
                    }
                    Effect::CancelGrace => running.cancel_grace(),
                    Effect::Resync => {
                        info!("store session restored, reloading topology");
                        if let Err(e) = cache.resync() {
                            warn!(error = %e, "topology reload failed, keeping cached snapshot");
                        }
                    }
                    Effect::Terminate(reason) => return Ok(SupervisorExit::Terminated(reason)),
                }
            }
        }
    }
}

/// Post `GraceElapsed { epoch }` after `grace`.
fn spawn_grace_timer(
    tx: mpsc::UnboundedSender<AgentEvent>,
    epoch: u64,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let _ = tx.send(AgentEvent::GraceElapsed { epoch });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session(event: SessionEvent) -> AgentEvent {
        AgentEvent::Session(event)
    }

    #[test]
    fn loss_arms_one_grace_timer() {
        let mut machine = SessionMachine::new();
        assert_eq!(
            machine.handle(session(SessionEvent::Disconnected)),
            vec![Effect::ArmGrace { epoch: 1 }]
        );
        assert_eq!(machine.state(), SessionState::Disconnected);
        // A repeated loss does not re-arm.
        assert!(machine.handle(session(SessionEvent::Disconnected)).is_empty());
    }

    #[test]
    fn reconnect_cancels_grace_and_resyncs() {
        let mut machine = SessionMachine::new();
        machine.handle(session(SessionEvent::Disconnected));
        assert_eq!(
            machine.handle(session(SessionEvent::Connected)),
            vec![Effect::CancelGrace, Effect::Resync]
        );
        assert_eq!(machine.state(), SessionState::Connected);
        // The old timer firing late changes nothing.
        assert!(machine.handle(AgentEvent::GraceElapsed { epoch: 1 }).is_empty());
        assert_eq!(machine.terminated(), None);
    }

    #[test]
    fn stale_epoch_is_ignored_after_second_loss() {
        let mut machine = SessionMachine::new();
        machine.handle(session(SessionEvent::Disconnected));
        machine.handle(session(SessionEvent::Connected));
        assert_eq!(
            machine.handle(session(SessionEvent::Disconnected)),
            vec![Effect::ArmGrace { epoch: 2 }]
        );
        assert!(machine.handle(AgentEvent::GraceElapsed { epoch: 1 }).is_empty());
        assert_eq!(
            machine.handle(AgentEvent::GraceElapsed { epoch: 2 }),
            vec![Effect::Terminate(TerminationReason::GraceExpired)]
        );
    }

    #[test]
    fn grace_expiry_terminates_exactly_once() {
        let mut machine = SessionMachine::new();
        machine.handle(session(SessionEvent::Disconnected));
        let first = machine.handle(AgentEvent::GraceElapsed { epoch: 1 });
        assert_eq!(first, vec![Effect::Terminate(TerminationReason::GraceExpired)]);

        assert!(machine.handle(AgentEvent::GraceElapsed { epoch: 1 }).is_empty());
        assert!(machine.handle(session(SessionEvent::Expired)).is_empty());
        assert!(machine.handle(session(SessionEvent::Connected)).is_empty());
        assert_eq!(machine.terminated(), Some(TerminationReason::GraceExpired));
    }

    #[test]
    fn expired_terminates_from_connected() {
        let mut machine = SessionMachine::new();
        assert_eq!(
            machine.handle(session(SessionEvent::Expired)),
            vec![Effect::Terminate(TerminationReason::SessionExpired)]
        );
        assert_eq!(machine.state(), SessionState::Expired);
    }

    #[test]
    fn expired_while_disconnected_cancels_grace() {
        let mut machine = SessionMachine::new();
        machine.handle(session(SessionEvent::Disconnected));
        assert_eq!(
            machine.handle(session(SessionEvent::Expired)),
            vec![
                Effect::CancelGrace,
                Effect::Terminate(TerminationReason::SessionExpired)
            ]
        );
    }

    #[test]
    fn connected_while_connected_is_a_no_op() {
        let mut machine = SessionMachine::new();
        assert!(machine.handle(session(SessionEvent::Connected)).is_empty());
        assert!(machine.handle(AgentEvent::GraceElapsed { epoch: 0 }).is_empty());
    }
}
