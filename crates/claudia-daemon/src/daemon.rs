//! Daemon lifecycle.
//!
//! Startup order: scheduler, health endpoint, tool server. Shutdown runs in
//! reverse on SIGINT/SIGTERM or end of stdin: stop accepting tool requests,
//! drain the one in flight, stop the scheduler, checkpoint and close the
//! store. Each component walks Unstarted → Starting → Running → Stopping →
//! Stopped, and transitions are logged.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::health;
use crate::scheduler::Scheduler;
use crate::server::ToolServer;

/// Lifecycle states of one daemon component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ComponentState {
    /// Whether `next` is a legal transition out of `self`.
    pub fn can_transition_to(&self, next: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, next),
            (Unstarted, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// A named component with a watchable state
pub struct Component {
    name: &'static str,
    state: watch::Sender<ComponentState>,
}

impl Component {
    pub fn new(name: &'static str) -> Self {
        let (state, _) = watch::channel(ComponentState::Unstarted);
        Self { name, state }
    }

    pub fn state(&self) -> ComponentState {
        *self.state.borrow()
    }

    /// Move to `next`, logging the transition. Illegal transitions are
    /// logged and ignored rather than panicking mid-shutdown.
    pub fn transition(&self, next: ComponentState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(
                component = self.name,
                "illegal state transition {:?} -> {:?} ignored", current, next
            );
            return;
        }
        info!(component = self.name, "{:?} -> {:?}", current, next);
        let _ = self.state.send(next);
    }
}

/// Run the full daemon: scheduler + health endpoint + tool server on stdio.
pub async fn run(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_component = Component::new("scheduler");
    let health_component = Component::new("health");
    let server_component = Component::new("tool_server");

    // Scheduler
    scheduler_component.transition(ComponentState::Starting);
    let scheduler = Scheduler::new(ctx.consolidate.clone());
    scheduler.spawn(shutdown_rx.clone()).await;
    let scheduler_status = scheduler.status();
    scheduler_component.transition(ComponentState::Running);

    // Health endpoint (background)
    health_component.transition(ComponentState::Starting);
    let health_task = tokio::spawn(health::serve(
        ctx.clone(),
        scheduler_status.clone(),
        ctx.config.health_port,
        shutdown_rx.clone(),
    ));
    health_component.transition(ComponentState::Running);

    // Signal handling flips the shared shutdown flag
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    // Tool server runs in the foreground until EOF or shutdown
    server_component.transition(ComponentState::Starting);
    let server = ToolServer::new(ctx.clone(), scheduler_status);
    server_component.transition(ComponentState::Running);
    let served = server.run_stdio(shutdown_rx.clone()).await;

    // Teardown in reverse order
    server_component.transition(ComponentState::Stopping);
    let _ = shutdown_tx.send(true);
    server_component.transition(ComponentState::Stopped);

    health_component.transition(ComponentState::Stopping);
    let _ = health_task.await;
    health_component.transition(ComponentState::Stopped);

    scheduler_component.transition(ComponentState::Stopping);
    scheduler_component.transition(ComponentState::Stopped);

    if let Err(e) = ctx.store.close() {
        warn!("store close: {}", e);
    }
    info!("daemon stopped");

    served?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_are_ordered() {
        use ComponentState::*;
        assert!(Unstarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        // Failing during startup skips straight to Stopping
        assert!(Starting.can_transition_to(Stopping));

        assert!(!Unstarted.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Unstarted));
    }

    #[test]
    fn component_ignores_illegal_transitions() {
        let component = Component::new("test");
        component.transition(ComponentState::Running);
        assert_eq!(component.state(), ComponentState::Unstarted);

        component.transition(ComponentState::Starting);
        component.transition(ComponentState::Running);
        assert_eq!(component.state(), ComponentState::Running);
    }
}
