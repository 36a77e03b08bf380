//! Tower services that execute calls as commands.

use crate::config::CommandConfig;
use crate::executor::CommandExecutor;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};
use tower_command_core::{CommandError, ExecutionOutcome};

pub(crate) type FallbackFn<Req, Res, Err> =
    dyn Fn(Req, ExecutionOutcome) -> BoxFuture<'static, Result<Res, Err>> + Send + Sync;
pub(crate) type SharedFallback<Req, Res, Err> = Arc<FallbackFn<Req, Res, Err>>;

/// A service whose calls run through a [`CommandExecutor`].
///
/// Every call clones the inner service and drives it to completion with
/// `oneshot`, so the inner service's readiness is awaited inside the command's
/// deadline and pool slot.
#[derive(Clone)]
pub struct Command<S> {
    inner: S,
    executor: CommandExecutor,
    config: Arc<CommandConfig>,
}

impl<S> Command<S> {
    pub(crate) fn new(inner: S, executor: CommandExecutor, config: Arc<CommandConfig>) -> Self {
        Self {
            inner,
            executor,
            config,
        }
    }

    /// The command's configuration.
    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// The executor running this service's calls.
    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Attaches a fallback invoked with the original request and the outcome
    /// that triggered it.
    pub fn with_fallback<Req, Res, Err, F>(self, fallback: F) -> CommandWithFallback<S, Req, Res, Err>
    where
        F: Fn(Req, ExecutionOutcome) -> BoxFuture<'static, Result<Res, Err>>
            + Send
            + Sync
            + 'static,
    {
        CommandWithFallback {
            command: self,
            fallback: Arc::new(fallback),
        }
    }
}

impl<S> fmt::Debug for Command<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("command_key", &self.config.command_key)
            .finish()
    }
}

impl<S, Req> Service<Req> for Command<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = CommandError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let executor = self.executor.clone();
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            executor
                .execute_without_fallback(&config, move |_| inner.oneshot(req))
                .await
                .into_result()
        })
    }
}

/// A [`Command`] with a fallback.
pub struct CommandWithFallback<S, Req, Res, Err> {
    command: Command<S>,
    fallback: SharedFallback<Req, Res, Err>,
}

impl<S: Clone, Req, Res, Err> Clone for CommandWithFallback<S, Req, Res, Err> {
    fn clone(&self) -> Self {
        Self {
            command: self.command.clone(),
            fallback: Arc::clone(&self.fallback),
        }
    }
}

impl<S, Req, Res, Err> fmt::Debug for CommandWithFallback<S, Req, Res, Err> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandWithFallback")
            .field("command_key", &self.command.config.command_key)
            .finish()
    }
}

impl<S, Req> Service<Req> for CommandWithFallback<S, Req, S::Response, S::Error>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = CommandError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.command.inner.clone();
        let executor = self.command.executor.clone();
        let config = Arc::clone(&self.command.config);
        let fallback = Arc::clone(&self.fallback);
        let fallback_req = req.clone();

        Box::pin(async move {
            executor
                .execute(
                    &config,
                    move |_| inner.oneshot(req),
                    move |trigger| fallback(fallback_req, trigger),
                )
                .await
                .into_result()
        })
    }
}
