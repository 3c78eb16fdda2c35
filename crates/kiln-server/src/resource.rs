//! Scoped acquisition and release of process-wide resources.

use crate::state::SharedState;
use crate::{ResourceError, ServerError, StateView};
use async_trait::async_trait;
use kiln_config::ProcessConfig;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What a provider gets to work with while the server is starting.
#[derive(Debug, Clone)]
pub struct StartupContext {
    /// Resolved process configuration.
    pub config: Arc<ProcessConfig>,
    /// Read access to the server state.
    pub state: StateView,
}

/// Acquires one named resource during server startup.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Resource name used in logs and startup failures.
    fn name(&self) -> &str;

    /// Acquires the resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be obtained. Startup stops and
    /// every resource acquired before this one is released.
    async fn acquire(&self, ctx: &StartupContext) -> Result<Box<dyn Resource>, ResourceError>;
}

/// A held resource. Consumed on release, so it can be released only once.
#[async_trait]
pub trait Resource: Send {
    /// Resource name used in logs.
    fn name(&self) -> &str;

    /// Releases the resource.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup failed. The failure is logged and the
    /// remaining resources are still released.
    async fn release(self: Box<Self>) -> Result<(), ResourceError>;

    /// Releases the resource without awaiting.
    ///
    /// Used when the server is dropped before its orderly release, such as
    /// when the process grace period runs out mid-drain. Does nothing by
    /// default.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup failed.
    fn release_now(self: Box<Self>) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Resources held by a running server, in acquisition order.
pub(crate) struct ResourceStack {
    held: Vec<Box<dyn Resource>>,
    state: SharedState,
}

impl ResourceStack {
    pub(crate) const fn new(state: SharedState) -> Self {
        Self {
            held: Vec::new(),
            state,
        }
    }

    /// Acquires every provider in order.
    ///
    /// On the first failure the resources acquired so far are released in
    /// reverse order before the error is returned.
    pub(crate) async fn acquire_all(
        state: SharedState,
        providers: &[Box<dyn ResourceProvider>],
        ctx: &StartupContext,
    ) -> Result<Self, ServerError> {
        let mut stack = Self::new(state);
        for provider in providers {
            match provider.acquire(ctx).await {
                Ok(resource) => {
                    debug!(resource = provider.name(), "acquired resource");
                    stack.state.write().resource_acquired(provider.name());
                    stack.held.push(resource);
                }
                Err(e) => {
                    error!(resource = provider.name(), error = %e, "resource acquisition failed");
                    stack.release_all().await;
                    return Err(ServerError::Startup {
                        resource: provider.name().to_string(),
                        source: e,
                    });
                }
            }
        }
        Ok(stack)
    }

    /// Releases every held resource in reverse acquisition order.
    pub(crate) async fn release_all(&mut self) {
        while let Some(resource) = self.held.pop() {
            let name = resource.name().to_string();
            match resource.release().await {
                Ok(()) => debug!(resource = %name, "released resource"),
                Err(e) => warn!(resource = %name, error = %e, "resource release failed"),
            }
            self.state.write().resource_released(&name);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.held.len()
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        warn!(count = self.held.len(), "resources still held, releasing synchronously");
        while let Some(resource) = self.held.pop() {
            let name = resource.name().to_string();
            match resource.release_now() {
                Ok(()) => debug!(resource = %name, "released resource"),
                Err(e) => warn!(resource = %name, error = %e, "resource release failed"),
            }
            self.state.write().resource_released(&name);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Tracked;
    use super::*;
    use kiln_types::Profile;
    use std::sync::Mutex;

    fn ctx(state: &SharedState) -> StartupContext {
        StartupContext {
            config: Arc::new(ProcessConfig::with_data_dir("/tmp/kiln-test")),
            state: state.view(),
        }
    }

    #[tokio::test]
    async fn test_release_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let state = SharedState::new(Profile::Production);
        let providers: Vec<Box<dyn ResourceProvider>> = vec![
            Box::new(Tracked::new("a", &log)),
            Box::new(Tracked::new("b", &log)),
            Box::new(Tracked::new("c", &log)),
        ];

        let mut stack = ResourceStack::acquire_all(state.clone(), &providers, &ctx(&state))
            .await
            .unwrap();
        assert_eq!(stack.len(), 3);
        assert_eq!(state.view().snapshot().resources, ["a", "b", "c"]);

        stack.release_all().await;
        stack.release_all().await;

        assert_eq!(
            *log.lock().unwrap(),
            ["acquire a", "acquire b", "acquire c", "release c", "release b", "release a"]
        );
        assert!(state.view().snapshot().resources.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stack_releases_what_it_holds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let state = SharedState::new(Profile::Production);
        let providers: Vec<Box<dyn ResourceProvider>> = vec![
            Box::new(Tracked::new("a", &log)),
            Box::new(Tracked::new("b", &log)),
        ];

        let stack = ResourceStack::acquire_all(state.clone(), &providers, &ctx(&state))
            .await
            .unwrap();
        drop(stack);

        assert_eq!(
            *log.lock().unwrap(),
            ["acquire a", "acquire b", "release b", "release a"]
        );
        assert!(state.view().snapshot().resources.is_empty());
    }

    #[tokio::test]
    async fn test_later_failure_rolls_back_earlier_resources() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let state = SharedState::new(Profile::Production);
        let providers: Vec<Box<dyn ResourceProvider>> = vec![
            Box::new(Tracked::new("a", &log)),
            Box::new(Tracked::new("b", &log)),
            Box::new(Tracked::failing("c", &log)),
            Box::new(Tracked::new("d", &log)),
        ];

        let result = ResourceStack::acquire_all(state.clone(), &providers, &ctx(&state)).await;

        let Err(ServerError::Startup { resource, .. }) = result else {
            panic!("expected a startup failure");
        };
        assert_eq!(resource, "c");
        assert_eq!(
            *log.lock().unwrap(),
            ["acquire a", "acquire b", "release b", "release a"]
        );
        assert!(state.view().snapshot().resources.is_empty());
    }
}
