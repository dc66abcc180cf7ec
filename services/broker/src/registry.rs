//! Staged-rollout registration protocol
//!
//! A gateway's live graph is the list of active [`ServiceEntry`] values in the
//! store. Registrations are classified against it:
//!
//! - same name and hash as an active entry: another instance, counter only
//! - new version, non-breaking: swapped in immediately
//! - new version, breaking: parked in triage until the active version drains,
//!   then promoted by the deregistration of its last instance
//! - new name, breaking: rejected, there is nothing to roll back to
//!
//! Every structural change happens under the gateway's lease lock and is
//! decided against a fresh read taken after the lock was acquired.

use std::sync::Arc;
use std::time::Duration;

use rungate::schema::parse_sdl;
use rungate::{
    CompatibilityReport, DeregisterRequest, DeregistrationOutcome, LockLease, RegisterRequest,
    RegistrationOutcome, RetryPolicy, SchemaError, SchemaStore, ServiceEntry, StoreError,
    check_compatibility, keys, merge_schemas,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::introspect::{IntrospectionError, Introspector};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Gateway {0} is locked by another mutation")]
    Locked(String),
    #[error("Introspection failed: {0}")]
    Downstream(#[from] IntrospectionError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
}

/// Result of a deregistration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deregistration {
    pub outcome: DeregistrationOutcome,
    /// Hash that went live in place of the deregistered one.
    pub promoted: Option<String>,
}

impl Deregistration {
    fn new(outcome: DeregistrationOutcome) -> Self {
        Self {
            outcome,
            promoted: None,
        }
    }
}

pub struct Registry {
    store: Arc<dyn SchemaStore>,
    introspector: Arc<dyn Introspector>,
    lock_ttl: Duration,
    lock_retry: RetryPolicy,
}

impl Registry {
    pub fn new(store: Arc<dyn SchemaStore>, introspector: Arc<dyn Introspector>) -> Self {
        Self {
            store,
            introspector,
            lock_ttl: Duration::from_secs(10),
            lock_retry: RetryPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, ttl: Duration, retry: RetryPolicy) -> Self {
        self.lock_ttl = ttl;
        self.lock_retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn SchemaStore> {
        &self.store
    }

    pub async fn register(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegistrationOutcome, RegistryError> {
        validate_gateway(&request.gateway)?;
        require("name", &request.name)?;
        require("url", &request.url)?;
        validate_hash(&request.hash)?;

        let gateway = request.gateway.as_str();
        let active = self.store.load_registry(gateway).await?;

        if let Some(services) = &active
            && services
                .iter()
                .any(|s| s.name == request.name && s.hash == request.hash)
        {
            let count = self.store.incr_instances(gateway, &request.hash).await?;
            info!(
                "Instance {} of {} ({}) joined gateway {}",
                count, request.name, request.hash, gateway
            );
            return Ok(RegistrationOutcome::InstanceAdded);
        }

        // A staged version needs no fresh introspection
        let schema = match self.store.get_triage(gateway, &request.hash).await? {
            Some(pending) => pending.schema,
            None => self.fetch_schema(&request.name, &request.url).await?,
        };
        let incoming = ServiceEntry::new(&request.name, &request.url, &request.hash, schema);

        let lease = self.lock(gateway, "register").await?;
        let result = self.register_locked(gateway, incoming).await;
        self.unlock(&lease, "register").await;

        if let Err(e) = &result {
            warn!(
                "Registration of {} ({}) on gateway {} failed: {}",
                request.name, request.hash, gateway, e
            );
        }
        result
    }

    async fn fetch_schema(&self, name: &str, url: &str) -> Result<String, RegistryError> {
        let sdl = self.introspector.introspect(url).await?;
        parse_sdl(name, &sdl).map_err(IntrospectionError::from)?;
        Ok(sdl)
    }

    async fn register_locked(
        &self,
        gateway: &str,
        incoming: ServiceEntry,
    ) -> Result<RegistrationOutcome, RegistryError> {
        let Some(mut services) = self.store.load_registry(gateway).await? else {
            if !self
                .store
                .create_registry(gateway, std::slice::from_ref(&incoming))
                .await?
            {
                return Err(RegistryError::Conflict(format!(
                    "gateway {} was created concurrently",
                    gateway
                )));
            }
            self.store.incr_instances(gateway, &incoming.hash).await?;
            info!(
                "Bootstrapped gateway {} with {} ({})",
                gateway, incoming.name, incoming.hash
            );
            return Ok(RegistrationOutcome::Bootstrapped);
        };

        if let Some(entry) = services.iter().find(|s| s.hash == incoming.hash) {
            if entry.name != incoming.name {
                return Err(RegistryError::Conflict(format!(
                    "hash {} is already registered by {}",
                    incoming.hash, entry.name
                )));
            }
            self.store.incr_instances(gateway, &incoming.hash).await?;
            return Ok(RegistrationOutcome::InstanceAdded);
        }

        if let Some(pending) = self.store.get_triage(gateway, &incoming.hash).await? {
            if pending.name != incoming.name {
                return Err(RegistryError::Conflict(format!(
                    "hash {} is already staged for {}",
                    incoming.hash, pending.name
                )));
            }
            let count = self.store.incr_instances(gateway, &incoming.hash).await?;
            info!(
                "Instance {} of staged {} ({}) joined gateway {}",
                count, incoming.name, incoming.hash, gateway
            );
            return Ok(RegistrationOutcome::InstanceAdded);
        }

        let existing = services.iter().position(|s| s.name == incoming.name);

        if existing.is_none()
            && let Some(other) = services.iter().find(|s| s.url == incoming.url)
        {
            return Err(RegistryError::Conflict(format!(
                "{} is already served by {}",
                incoming.url, other.name
            )));
        }

        if let Some(index) = existing {
            self.ensure_no_pending_rollout(gateway, &services[index])
                .await?;
        }

        let report = compatibility(&services, &incoming)?;
        let breaking = report.is_breaking();

        match existing {
            None if breaking => Err(RegistryError::Conflict(format!(
                "new service {} breaks gateway {}: {}",
                incoming.name,
                gateway,
                summarize(&report)
            ))),
            None => {
                info!(
                    "Added {} ({}) to gateway {}",
                    incoming.name, incoming.hash, gateway
                );
                let hash = incoming.hash.clone();
                services.push(incoming);
                self.store.save_registry(gateway, &services).await?;
                self.store.incr_instances(gateway, &hash).await?;
                Ok(RegistrationOutcome::Added)
            }
            Some(index) if !breaking => {
                let hash = incoming.hash.clone();
                let superseded = std::mem::replace(&mut services[index], incoming);
                self.store.save_registry(gateway, &services).await?;
                self.store.incr_instances(gateway, &hash).await?;
                // Instances still running the old version deregister as no-ops
                self.store
                    .delete_instances(gateway, &superseded.hash)
                    .await?;
                info!(
                    "Swapped {} from {} to {} on gateway {} ({} dangerous changes)",
                    superseded.name,
                    superseded.hash,
                    hash,
                    gateway,
                    report.dangerous().count()
                );
                Ok(RegistrationOutcome::Swapped)
            }
            Some(index) => {
                let parent = services[index].hash.clone();
                let staged = incoming.with_parent(&parent);
                self.store.put_triage(gateway, &staged).await?;
                self.store
                    .set_triage_pointer(gateway, &parent, &staged.hash)
                    .await?;
                self.store.incr_instances(gateway, &staged.hash).await?;
                info!(
                    "Staged {} ({}) on gateway {} until {} drains: {}",
                    staged.name,
                    staged.hash,
                    gateway,
                    parent,
                    summarize(&report)
                );
                Ok(RegistrationOutcome::Triaged)
            }
        }
    }

    /// One staged successor per active version. A pointer whose entry is gone
    /// is stale and cleared.
    async fn ensure_no_pending_rollout(
        &self,
        gateway: &str,
        active: &ServiceEntry,
    ) -> Result<(), RegistryError> {
        let Some(child) = self.store.get_triage_pointer(gateway, &active.hash).await? else {
            return Ok(());
        };

        if self.store.get_triage(gateway, &child).await?.is_some() {
            return Err(RegistryError::Conflict(format!(
                "{} already has a pending rollout from {} to {}",
                active.name, active.hash, child
            )));
        }

        warn!(
            "Clearing stale triage pointer {} -> {} on gateway {}",
            active.hash, child, gateway
        );
        self.store
            .delete_triage_pointer(gateway, &active.hash)
            .await?;
        Ok(())
    }

    pub async fn deregister(
        &self,
        request: &DeregisterRequest,
    ) -> Result<Deregistration, RegistryError> {
        validate_gateway(&request.gateway)?;
        require("name", &request.name)?;
        validate_hash(&request.hash)?;

        let gateway = request.gateway.as_str();
        let hash = request.hash.as_str();

        let Some(services) = self.store.load_registry(gateway).await? else {
            return Err(RegistryError::NotFound(format!("gateway {}", gateway)));
        };

        let active = services.iter().find(|s| s.hash == hash);
        if let Some(entry) = active
            && entry.name != request.name
        {
            return Err(RegistryError::Conflict(format!(
                "hash {} belongs to {}, not {}",
                hash, entry.name, request.name
            )));
        }

        let staged = match active {
            Some(_) => None,
            None => self.store.get_triage(gateway, hash).await?,
        };
        if let Some(pending) = &staged
            && pending.name != request.name
        {
            return Err(RegistryError::Conflict(format!(
                "staged hash {} belongs to {}, not {}",
                hash, pending.name, request.name
            )));
        }

        let remaining = self.store.decr_instances(gateway, hash).await?;

        if active.is_some() {
            if remaining > 0 {
                info!(
                    "{} ({}) left gateway {}, {} instances remain",
                    request.name, hash, gateway, remaining
                );
                return Ok(Deregistration::new(DeregistrationOutcome::InstanceRemoved));
            }
            let lease = self.lock(gateway, "deregister").await?;
            let result = self.retire_locked(gateway, hash).await;
            self.unlock(&lease, "deregister").await;
            return result;
        }

        if staged.is_none() {
            info!(
                "{} ({}) is not tracked on gateway {}",
                request.name, hash, gateway
            );
            return Ok(Deregistration::new(DeregistrationOutcome::Untracked));
        }

        let lease = self.lock(gateway, "deregister").await?;
        let result = self.withdraw_locked(gateway, hash, remaining).await;
        self.unlock(&lease, "deregister").await;
        result
    }

    /// An instance of a staged version exited: the rollout is withdrawn at once,
    /// whatever instances of it remain.
    async fn withdraw_locked(
        &self,
        gateway: &str,
        hash: &str,
        remaining: i64,
    ) -> Result<Deregistration, RegistryError> {
        let Some(entry) = self.store.take_triage(gateway, hash).await? else {
            return Ok(Deregistration::new(DeregistrationOutcome::Untracked));
        };

        if let Some(parent) = &entry.parent_hash
            && self.store.get_triage_pointer(gateway, parent).await?.as_deref() == Some(hash)
        {
            self.store.delete_triage_pointer(gateway, parent).await?;
        }
        // Nothing references the hash any more
        self.store.delete_instances(gateway, hash).await?;

        info!(
            "Withdrew staged {} ({}) from gateway {}, {} instances orphaned",
            entry.name, hash, gateway, remaining
        );
        Ok(Deregistration::new(DeregistrationOutcome::TriageWithdrawn))
    }

    /// Last instance of an active version exited: promote its successor or remove it.
    async fn retire_locked(
        &self,
        gateway: &str,
        hash: &str,
    ) -> Result<Deregistration, RegistryError> {
        if self.store.instance_count(gateway, hash).await? > 0 {
            return Ok(Deregistration::new(DeregistrationOutcome::InstanceRemoved));
        }

        let Some(mut services) = self.store.load_registry(gateway).await? else {
            return Err(RegistryError::NotFound(format!("gateway {}", gateway)));
        };
        let Some(index) = services.iter().position(|s| s.hash == hash) else {
            return Ok(Deregistration::new(DeregistrationOutcome::Untracked));
        };

        let successor = match self.store.get_triage_pointer(gateway, hash).await? {
            Some(child) => self.store.get_triage(gateway, &child).await?,
            None => None,
        };

        match successor {
            Some(mut entry) => {
                entry.parent_hash = None;
                let promoted = entry.hash.clone();
                let retired = std::mem::replace(&mut services[index], entry);
                self.store.save_registry(gateway, &services).await?;
                self.store.delete_triage(gateway, &promoted).await?;
                self.store.delete_triage_pointer(gateway, hash).await?;
                info!(
                    "Promoted {} from {} to {} on gateway {}",
                    retired.name, hash, promoted, gateway
                );
                Ok(Deregistration {
                    outcome: DeregistrationOutcome::Promoted,
                    promoted: Some(promoted),
                })
            }
            None => {
                let retired = services.remove(index);
                self.store.save_registry(gateway, &services).await?;
                self.store.delete_triage_pointer(gateway, hash).await?;
                info!(
                    "Removed {} ({}) from gateway {}",
                    retired.name, hash, gateway
                );
                Ok(Deregistration::new(DeregistrationOutcome::Removed))
            }
        }
    }

    async fn lock(&self, gateway: &str, operation: &str) -> Result<LockLease, RegistryError> {
        let lease = LockLease::new(gateway);
        let mut attempt = 0;
        loop {
            match self.store.acquire_lock(&lease, self.lock_ttl).await {
                Ok(true) => return Ok(lease),
                Ok(false) => {}
                Err(e) => {
                    error!(
                        "Failed to acquire lock on gateway {} for {}: {}",
                        gateway, operation, e
                    );
                    return Err(e.into());
                }
            }

            if !self.lock_retry.allows(attempt) {
                warn!(
                    "Gave up on lock for gateway {} ({}) after {} retries",
                    gateway, operation, attempt
                );
                return Err(RegistryError::Locked(gateway.to_string()));
            }
            tokio::time::sleep(self.lock_retry.delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn unlock(&self, lease: &LockLease, operation: &str) {
        match self.store.release_lock(lease).await {
            Ok(true) => {}
            Ok(false) => warn!(
                "Lease on gateway {} expired before {} finished",
                lease.gateway, operation
            ),
            Err(e) => error!(
                "Failed to release lock on gateway {} after {}: {}",
                lease.gateway, operation, e
            ),
        }
    }
}

/// Compare the live graph against the graph with `incoming` in place of its namesake.
fn compatibility(
    services: &[ServiceEntry],
    incoming: &ServiceEntry,
) -> Result<CompatibilityReport, RegistryError> {
    let previous = merge_schemas(services.iter().map(|s| (s.name.as_str(), s.schema.as_str())))?;
    let candidate = merge_schemas(
        services
            .iter()
            .filter(|s| s.name != incoming.name)
            .chain(std::iter::once(incoming))
            .map(|s| (s.name.as_str(), s.schema.as_str())),
    )
    .map_err(|e| {
        RegistryError::Conflict(format!("{} does not merge into the graph: {}", incoming.name, e))
    })?;
    Ok(check_compatibility(previous.document(), candidate.document()))
}

fn summarize(report: &CompatibilityReport) -> String {
    report
        .breaking()
        .map(|c| c.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

fn require(field: &str, value: &str) -> Result<(), RegistryError> {
    if value.is_empty() {
        return Err(RegistryError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

fn validate_gateway(gateway: &str) -> Result<(), RegistryError> {
    require("gateway", gateway)?;
    if !keys::is_valid_gateway(gateway) {
        return Err(RegistryError::Validation(format!(
            "invalid gateway name {:?}",
            gateway
        )));
    }
    Ok(())
}

fn validate_hash(hash: &str) -> Result<(), RegistryError> {
    require("hash", hash)?;
    if hash.contains(':') {
        return Err(RegistryError::Validation(format!("invalid hash {:?}", hash)));
    }
    Ok(())
}
