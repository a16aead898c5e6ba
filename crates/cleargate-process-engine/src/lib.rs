//! Event correlation, trigger and async job core of a process engine.
//!
//! Inbound events are decoded, matched against live subscriptions and either
//! start new process instances (event-based starts, optionally limited to one
//! running instance per correlation key) or resume paused executions. Resuming
//! runs inline through the [`TriggerEngine`] or deferred through durable,
//! retrying jobs executed by the [`JobExecutor`].
//!
//! The crate is designed to be embedded: every collaborator is a trait with an
//! in-process default, assembled by [`ProcessEngine::builder()`].

pub mod correlation;
pub mod defaults;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod registry;
pub mod traits;
pub mod trigger;
pub mod types;

// Re-export public types at the crate level.

// correlation
pub use correlation::{ExactCorrelationKey, ReferenceKeyStrategy};

// defaults
pub use defaults::{
    DecoderConfig, FileJobStore, InMemoryJobStore, InMemoryProcessRuntime,
    InMemorySubscriptionStore, JsonEventDecoder,
};

// dispatch
pub use dispatch::{
    DispatchError, DispatchResult, EventDispatcher, InboundChannel, MatchOutcome, MatchReport,
};

// engine
pub use engine::{EngineBuilder, EngineConfig, EngineError, ProcessEngine, TriggerMode};

// errors
pub use errors::{
    BehaviorError, DecodeError, JobFailure, JobStoreError, LifecycleError, RegistryError,
    SubscriptionStoreError,
};

// jobs
pub use jobs::{
    AdvanceJobHandler, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobOutcome, JobQueue,
    JobRunSummary, TriggerJobHandler, TriggerJobPayload,
};

// registry
pub use registry::EventRegistry;

// traits
pub use traits::{
    ActivityBehavior, EventDecoder, JobHandler, JobStore, ProcessLifecycle, SubscriptionStore,
};

// trigger
pub use trigger::{
    DeferredTrigger, ImmediateTrigger, InvokeOutcome, TriggerAck, TriggerEngine, TriggerError,
    TriggerInvoker, TriggerRequest, TriggerResult,
};

// types
pub use types::{
    variables, ActivityContext, AdvanceOutcome, CorrelationKey, CorrelationSource, DeadLetterJob,
    EventDefinition, EventListenerDef, EventParameter, EventSubscription, EventValue,
    EventValueType, ExecutionSnapshot, InboundEvent, InstanceReference, InstanceState, Job,
    JobRetryPolicy, JobType, NewSubscription, ProcessDefinition, ProcessInstanceRecord,
    ScopeType, StartPolicy, SubscriptionConfig, SubscriptionOwner, VariableMapping, Variables,
    WaitNodeKind, REFERENCE_TYPE_EVENT_PROCESS,
};
