//! Engine builder: wires stores, runtime, trigger engine, dispatcher and job
//! executor together.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use super::config::{EngineConfig, TriggerMode};
use super::error::EngineError;
use super::ProcessEngine;
use crate::correlation::{ExactCorrelationKey, ReferenceKeyStrategy};
use crate::defaults::{
    FileJobStore, InMemoryJobStore, InMemoryProcessRuntime, InMemorySubscriptionStore,
    JsonEventDecoder,
};
use crate::dispatch::EventDispatcher;
use crate::jobs::{AdvanceJobHandler, JobExecutor, JobQueue, TriggerJobHandler};
use crate::registry::EventRegistry;
use crate::traits::{
    ActivityBehavior, EventDecoder, JobHandler, JobStore, ProcessLifecycle, SubscriptionStore,
};
use crate::trigger::{DeferredTrigger, ImmediateTrigger, TriggerEngine, TriggerInvoker};

/// Builder for assembling the [`ProcessEngine`].
///
/// Every collaborator is optional; [`build()`](EngineBuilder::build) fills
/// the gaps with the in-process defaults.
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<EventRegistry>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    lifecycle: Option<Arc<dyn ProcessLifecycle>>,
    job_store: Option<Arc<dyn JobStore>>,
    job_store_dir: Option<PathBuf>,
    decoder: Option<Arc<dyn EventDecoder>>,
    reference_keys: Option<Arc<dyn ReferenceKeyStrategy>>,
    behaviors: Vec<(String, Arc<dyn ActivityBehavior>)>,
    job_handlers: Vec<Arc<dyn JobHandler>>,
}

impl EngineBuilder {
    pub(super) fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: None,
            subscriptions: None,
            lifecycle: None,
            job_store: None,
            job_store_dir: None,
            decoder: None,
            reference_keys: None,
            behaviors: Vec::new(),
            job_handlers: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how matched execution subscriptions are triggered.
    pub fn trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.config.trigger_mode = mode;
        self
    }

    /// Share an event registry with other components (e.g. a custom
    /// decoder). Default: a fresh, empty registry.
    pub fn registry(mut self, registry: EventRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the subscription store. Default: [`InMemorySubscriptionStore`].
    ///
    /// A custom [`lifecycle`](Self::lifecycle) must write to this same store.
    pub fn subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = Some(store);
        self
    }

    /// Set the process runtime. Default: [`InMemoryProcessRuntime`] over the
    /// subscription store.
    pub fn lifecycle(mut self, lifecycle: Arc<dyn ProcessLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Set the job store. Default: [`InMemoryJobStore`].
    pub fn job_store(mut self, store: impl JobStore + 'static) -> Self {
        self.job_store = Some(Arc::new(store));
        self
    }

    /// Persist jobs as files under `dir` ([`FileJobStore`]). Ignored when a
    /// job store is set explicitly.
    pub fn job_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.job_store_dir = Some(dir.into());
        self
    }

    /// Set the inbound decoder. Default: [`JsonEventDecoder`] over the
    /// engine's registry.
    pub fn decoder(mut self, decoder: impl EventDecoder + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Set the single-instance reference key strategy. Default:
    /// [`ExactCorrelationKey`].
    pub fn reference_keys(mut self, strategy: impl ReferenceKeyStrategy + 'static) -> Self {
        self.reference_keys = Some(Arc::new(strategy));
        self
    }

    /// Register a service task behavior with the default runtime.
    pub fn behavior(mut self, name: &str, behavior: impl ActivityBehavior + 'static) -> Self {
        self.behaviors.push((name.to_string(), Arc::new(behavior)));
        self
    }

    /// Register an additional job handler. Replaces a built-in handler of
    /// the same job type.
    pub fn job_handler(mut self, handler: impl JobHandler + 'static) -> Self {
        self.job_handlers.push(Arc::new(handler));
        self
    }

    /// Assemble the engine. The job executor is not started; call
    /// [`ProcessEngine::start_job_executor`] or pump jobs with
    /// [`ProcessEngine::run_due_jobs`].
    pub fn build(self) -> Result<ProcessEngine, EngineError> {
        self.config
            .validate()
            .map_err(|message| EngineError::Build { message })?;
        let registry = self.registry.unwrap_or_default();

        let subscriptions: Arc<dyn SubscriptionStore> = self
            .subscriptions
            .unwrap_or_else(|| Arc::new(InMemorySubscriptionStore::new()));

        let lifecycle: Arc<dyn ProcessLifecycle> = match self.lifecycle {
            Some(lifecycle) => {
                if !self.behaviors.is_empty() {
                    return Err(EngineError::Build {
                        message: "behaviors can only be registered with the default runtime".into(),
                    });
                }
                lifecycle
            }
            None => {
                let runtime = InMemoryProcessRuntime::new(Arc::clone(&subscriptions));
                for (name, behavior) in self.behaviors {
                    runtime.register_behavior(name, behavior);
                }
                Arc::new(runtime)
            }
        };

        let job_store: Arc<dyn JobStore> = match (self.job_store, self.job_store_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileJobStore::new(dir)?),
            (None, None) => Arc::new(InMemoryJobStore::new()),
        };
        let jobs = JobQueue::new(Arc::clone(&job_store));

        let triggers = Arc::new(TriggerEngine::new(
            Arc::clone(&lifecycle),
            Arc::clone(&subscriptions),
            jobs.clone(),
        ));

        let invoker: Arc<dyn TriggerInvoker> = match self.config.trigger_mode {
            TriggerMode::Sync => Arc::new(ImmediateTrigger::new(Arc::clone(&triggers))),
            TriggerMode::Async => Arc::new(DeferredTrigger::new(Arc::clone(&triggers))),
        };

        let decoder: Arc<dyn EventDecoder> = self.decoder.unwrap_or_else(|| {
            Arc::new(JsonEventDecoder::new(
                registry.clone(),
                self.config.decoder.clone(),
            ))
        });
        let reference_keys: Arc<dyn ReferenceKeyStrategy> = self
            .reference_keys
            .unwrap_or_else(|| Arc::new(ExactCorrelationKey));

        let dispatcher = Arc::new(EventDispatcher::new(
            decoder,
            registry.clone(),
            Arc::clone(&subscriptions),
            Arc::clone(&lifecycle),
            invoker,
            reference_keys,
        ));

        let mut executor = JobExecutor::new(
            Arc::clone(&job_store),
            self.config.retry.clone(),
            self.config.job_executor.clone(),
        )
        .with_handler(Arc::new(TriggerJobHandler::new(Arc::clone(&triggers))))
        .with_handler(Arc::new(AdvanceJobHandler::new(Arc::clone(&triggers))));
        for handler in self.job_handlers {
            executor = executor.with_handler(handler);
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(trigger_mode = ?self.config.trigger_mode, "process engine built");

        Ok(ProcessEngine {
            config: self.config,
            registry,
            subscriptions,
            lifecycle,
            jobs,
            triggers,
            dispatcher,
            executor: Arc::new(executor),
            executor_handle: Mutex::new(None),
            shutdown_tx,
            channel_handles: Mutex::new(Vec::new()),
        })
    }
}
