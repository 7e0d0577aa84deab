//! Process identity and leadership lifecycle.
//!
//! Leader election itself happens elsewhere; this module only records the
//! outcome and fans it out to background services that care.
//!
//! ```text
//! ┌──────────────────┐  take_over_leadership  ┌──────────────────┐
//! │ election / admin │───────────────────────>│ ClusterLifecycle │
//! │ signal handling  │  step_down / shutdown  │ (role + handlers)│
//! └──────────────────┘                        └────────┬─────────┘
//!                                                      │ on_leader_takeover
//!                                                      v on_leader_stepdown
//!                                             ┌──────────────────┐ on_shutdown
//!                                             │ LifecycleHandler │
//!                                             └──────────────────┘
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::RwLock;

use crate::config::{InstanceConfig, InstanceRole, InstanceType};

/// Type and current role of this process.
#[derive(Debug)]
pub struct InstanceSettings {
    instance_type: InstanceType,
    role: RwLock<InstanceRole>,
}

impl InstanceSettings {
    pub fn new(instance_type: InstanceType, role: InstanceRole) -> Self {
        Self {
            instance_type,
            role: RwLock::new(role),
        }
    }

    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::new(config.instance_type, config.role)
    }

    pub fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    pub fn role(&self) -> InstanceRole {
        *self.role.read()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == InstanceRole::Leader
    }

    /// Replace the role, returning the previous one.
    fn set_role(&self, role: InstanceRole) -> InstanceRole {
        std::mem::replace(&mut *self.role.write(), role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    LeaderTakeover,
    LeaderStepdown,
    Shutdown,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::LeaderTakeover => "leader_takeover",
            LifecycleEvent::LeaderStepdown => "leader_stepdown",
            LifecycleEvent::Shutdown => "shutdown",
        }
    }
}

/// A service reacting to leadership changes.
///
/// Handlers are called synchronously from the thread announcing the change,
/// so they must not block; spawn work instead.
pub trait LifecycleHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn on_leader_takeover(&self);

    fn on_leader_stepdown(&self);

    fn on_shutdown(&self);
}

/// Records role transitions and delivers each one to every registered
/// handler exactly once.
pub struct ClusterLifecycle {
    settings: Arc<InstanceSettings>,
    handlers: RwLock<Vec<Arc<dyn LifecycleHandler>>>,
    shutting_down: AtomicBool,
}

impl ClusterLifecycle {
    pub fn new(settings: Arc<InstanceSettings>) -> Self {
        Self {
            settings,
            handlers: RwLock::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &Arc<InstanceSettings> {
        &self.settings
    }

    pub fn register(&self, handler: Arc<dyn LifecycleHandler>) {
        tracing::debug!(handler = handler.name(), "Registered lifecycle handler");
        self.handlers.write().push(handler);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// This instance has become leader.
    ///
    /// Ignored when already leader or shutting down.
    pub fn take_over_leadership(&self) {
        if self.is_shutting_down() {
            tracing::debug!("Ignoring leadership takeover during shutdown");
            return;
        }
        let previous = self.settings.set_role(InstanceRole::Leader);
        if previous == InstanceRole::Leader {
            return;
        }
        tracing::info!(previous = %previous, "Instance became leader");
        self.dispatch(LifecycleEvent::LeaderTakeover);
    }

    /// This instance has lost leadership.
    ///
    /// Ignored when not currently leader.
    pub fn step_down(&self) {
        {
            let mut role = self.settings.role.write();
            if *role != InstanceRole::Leader {
                return;
            }
            *role = InstanceRole::Follower;
        }
        tracing::info!("Instance stepped down from leadership");
        self.dispatch(LifecycleEvent::LeaderStepdown);
    }

    /// The process is stopping. Irreversible; later calls are ignored.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Instance shutting down");
        self.dispatch(LifecycleEvent::Shutdown);
    }

    fn dispatch(&self, event: LifecycleEvent) {
        // Handlers may register others or query the lifecycle, so never call
        // them under the lock.
        let handlers: Vec<_> = self.handlers.read().iter().cloned().collect();
        for handler in handlers {
            tracing::debug!(
                handler = handler.name(),
                event = event.as_str(),
                "Delivering lifecycle event"
            );
            match event {
                LifecycleEvent::LeaderTakeover => handler.on_leader_takeover(),
                LifecycleEvent::LeaderStepdown => handler.on_leader_stepdown(),
                LifecycleEvent::Shutdown => handler.on_shutdown(),
            }
        }
    }
}
