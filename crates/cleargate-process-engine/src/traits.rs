//! Collaborator trait interfaces for the trigger core.
//!
//! Every pluggable component is an async trait (the decoder is a plain
//! trait; decoding is pure). Default implementations live in
//! [`defaults`](crate::defaults). Adding a method to any trait requires a
//! default implementation to preserve backward compatibility.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::errors::*;
use super::types::*;

// ---------------------------------------------------------------------------
// SubscriptionStore
// ---------------------------------------------------------------------------

/// Owns the lifecycle of event subscriptions.
///
/// Reads return a consistent snapshot: a unit of work never observes a
/// subscription half-created or half-deleted by a concurrent one.
/// [`consume()`](Self::consume) is the atomic delete-on-consume primitive
/// that serializes competing deliveries for one execution.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Create a subscription. Fails with
    /// [`SubscriptionStoreError::Duplicate`] if an execution-owned
    /// subscription with the same owner, event type and correlation exists.
    async fn create(&self, new: NewSubscription) -> Result<EventSubscription, SubscriptionStoreError>;

    async fn get(&self, id: &str) -> Result<Option<EventSubscription>, SubscriptionStoreError>;

    async fn find_by_event_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<EventSubscription>, SubscriptionStoreError>;

    async fn find_by_owner_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<EventSubscription>, SubscriptionStoreError>;

    async fn find_by_process_definition(
        &self,
        process_definition_id: &str,
    ) -> Result<Vec<EventSubscription>, SubscriptionStoreError>;

    /// Atomically remove and return a subscription. `None` means another
    /// unit of work consumed it first.
    async fn consume(&self, id: &str) -> Result<Option<EventSubscription>, SubscriptionStoreError>;

    /// Remove every subscription owned by an execution. Idempotent.
    async fn delete_by_owner_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<EventSubscription>, SubscriptionStoreError>;

    /// Remove every subscription owned by a process definition. Returns the
    /// number removed.
    async fn delete_by_process_definition(
        &self,
        process_definition_id: &str,
    ) -> Result<usize, SubscriptionStoreError>;

    /// Put back subscriptions removed by a unit of work that failed.
    /// Existing ids are left untouched.
    async fn restore(&self, subscriptions: Vec<EventSubscription>) -> Result<(), SubscriptionStoreError>;

    async fn count(&self) -> Result<usize, SubscriptionStoreError>;
}

// ---------------------------------------------------------------------------
// EventDecoder
// ---------------------------------------------------------------------------

/// Turns raw inbound bytes into a typed event.
pub trait EventDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<InboundEvent, DecodeError>;
}

// ---------------------------------------------------------------------------
// ProcessLifecycle
// ---------------------------------------------------------------------------

/// The process runtime the trigger core drives.
///
/// Implementations own the graph semantics. `advance` and `start_instance`
/// must be atomic: on error, no variable, node position or subscription
/// change may be observable. Implementations create subscriptions when an
/// execution enters a wait state and delete them when it leaves one.
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Deploy a definition, registering its event-based start if any.
    /// Returns the new process definition id.
    async fn deploy(&self, definition: ProcessDefinition) -> Result<String, LifecycleError>;

    /// Remove a definition and its start subscriptions.
    async fn undeploy(&self, process_definition_id: &str) -> Result<(), LifecycleError>;

    /// Latest deployed definition id for a process key.
    async fn latest_definition_id(&self, key: &str) -> Result<Option<String>, LifecycleError>;

    async fn process_definition(
        &self,
        process_definition_id: &str,
    ) -> Result<Option<ProcessDefinition>, LifecycleError>;

    /// Start a new instance. Fails with
    /// [`LifecycleError::DuplicateReference`] if `reference` is set and a
    /// running instance of the same definition already carries it.
    async fn start_instance(
        &self,
        process_definition_id: &str,
        variables: Variables,
        reference: Option<InstanceReference>,
    ) -> Result<String, LifecycleError>;

    /// Merge `variables` and move the execution past its current wait node.
    async fn advance(
        &self,
        execution_id: &str,
        variables: Variables,
        transition_hint: Option<&str>,
    ) -> Result<AdvanceOutcome, LifecycleError>;

    /// Running instance of a definition started with `reference_id`.
    async fn find_instance_by_reference(
        &self,
        process_definition_id: &str,
        reference_id: &str,
    ) -> Result<Option<String>, LifecycleError>;

    async fn execution(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, LifecycleError>;

    async fn instance(&self, instance_id: &str) -> Result<Option<ProcessInstanceRecord>, LifecycleError>;

    /// Running instances, optionally restricted to one definition.
    async fn running_instances(
        &self,
        process_definition_id: Option<&str>,
    ) -> Result<Vec<ProcessInstanceRecord>, LifecycleError>;

    /// Terminate an instance and delete its subscriptions.
    async fn cancel_instance(&self, instance_id: &str, reason: &str) -> Result<(), LifecycleError>;
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Durable storage for deferred jobs.
///
/// Claiming is exclusive: a claimed job carries a lease (`lock_owner`,
/// `lock_expires_at`) and is invisible to other claimers until the lease
/// expires. A job whose worker crashed becomes claimable again once its
/// lease runs out. Outcomes are recorded by the lease holder only; any
/// other owner gets [`JobStoreError::LeaseLost`].
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    /// Lease up to `limit` jobs due at `now`, oldest due time first.
    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Push the lease `owner` holds out to `lock_until`. Returns `false` if
    /// the job is gone or leased by someone else.
    ///
    /// The default only checks ownership and leaves the expiry as claimed.
    async fn extend_lease(
        &self,
        id: &str,
        owner: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let _ = lock_until;
        Ok(self
            .get(id)
            .await?
            .is_some_and(|job| job.lock_owner.as_deref() == Some(owner)))
    }

    /// Delete a finished job. Returns `false` if it no longer exists.
    async fn complete(&self, id: &str, owner: &str) -> Result<bool, JobStoreError>;

    /// Release the lease and schedule the next attempt.
    async fn reschedule(
        &self,
        id: &str,
        owner: &str,
        retry_count: u32,
        due_time: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError>;

    /// Move a job out of the queue into the dead-letter set.
    async fn dead_letter(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        permanent: bool,
    ) -> Result<(), JobStoreError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetterJob>, JobStoreError>;

    /// Move a dead letter back into the queue with its retries reset.
    async fn retry_dead_letter(&self, id: &str) -> Result<Job, JobStoreError>;

    /// Jobs still queued (leased or not).
    async fn pending(&self) -> Result<Vec<Job>, JobStoreError>;
}

// ---------------------------------------------------------------------------
// JobHandler
// ---------------------------------------------------------------------------

/// Executes one type of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(&self, job: &Job) -> Result<(), JobFailure>;
}

// ---------------------------------------------------------------------------
// ActivityBehavior
// ---------------------------------------------------------------------------

/// Custom logic of a service task in the reference runtime.
///
/// [`execute()`](Self::execute) runs when the task is entered. For a
/// triggerable task, [`trigger()`](Self::trigger) runs when the waiting task
/// is resumed, after the trigger variables have been merged. An error aborts
/// the whole advance and leaves the instance unchanged.
#[async_trait]
pub trait ActivityBehavior: Send + Sync {
    async fn execute(&self, ctx: &mut ActivityContext) -> Result<(), BehaviorError>;

    async fn trigger(&self, _ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
        Ok(())
    }
}
