//! Process lifecycle orchestration.
//!
//! Covers the process registry, the termination protocol, the restart
//! engine and the resource governor that throttles all three.
//! [`Orchestrator`] wires them together from a [`GlobalConfig`].

pub mod events;
pub mod governor;
pub mod observer;
pub mod registry;
pub mod restart;
pub mod termination;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::GlobalConfig;
use crate::host::{ProcessHost, ResourceSampler};
use crate::Result;

use self::governor::ResourceGovernor;
use self::observer::TransitionObserver;
use self::registry::ProcessRegistry;
use self::restart::{RestartEngine, StateHooks};
use self::termination::TerminationProtocol;

/// Every orchestration component, built from one configuration.
#[derive(Clone)]
pub struct Orchestrator {
    /// Resource governor; its reader feeds every other component.
    pub governor: Arc<ResourceGovernor>,
    /// Process registry.
    pub registry: ProcessRegistry,
    /// Termination protocol.
    pub termination: TerminationProtocol,
    /// Restart engine.
    pub restart: RestartEngine,
}

impl Orchestrator {
    /// Build all components. Nothing runs until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the classification table is invalid.
    pub fn new(
        config: &GlobalConfig,
        host: Arc<dyn ProcessHost>,
        sampler: Arc<dyn ResourceSampler>,
        hooks: Arc<dyn StateHooks>,
        observer: Arc<dyn TransitionObserver>,
    ) -> Result<Self> {
        let rules = config.classification.build_rule()?;

        let governor = Arc::new(ResourceGovernor::new(
            sampler,
            config.governor_settings(),
            Arc::clone(&observer),
        ));
        let registry = ProcessRegistry::new(
            Arc::clone(&host),
            rules,
            governor.throttle(),
            config.registry_settings(),
        );
        let termination = TerminationProtocol::new(
            registry.clone(),
            Arc::clone(&host),
            governor.throttle(),
            config.termination_settings(),
            Arc::clone(&observer),
        );
        let restart = RestartEngine::new(
            registry.clone(),
            termination.clone(),
            host,
            hooks,
            config.restart_settings(),
            observer,
        );

        Ok(Self {
            governor,
            registry,
            termination,
            restart,
        })
    }

    /// Start the governor loop and the registry's notification and
    /// reconciliation loop. Both stop when `cancel` fires.
    #[must_use]
    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        info!("starting orchestrator background tasks");
        vec![
            self.governor.spawn(cancel.clone()),
            self.registry.spawn(cancel.clone()),
        ]
    }
}
