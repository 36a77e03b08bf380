use crate::config::CommandConfig;
use crate::executor::CommandExecutor;
use crate::service::Command;
use std::sync::Arc;
use tower::Layer;

/// A Tower Layer that runs every call of the inner service as a command.
///
/// ```rust
/// use tower::{ServiceBuilder, service_fn};
/// use tower_command::{CommandConfig, CommandExecutor, CommandLayer};
/// use std::time::Duration;
///
/// let config = CommandConfig::builder("getUser")
///     .timeout(Duration::from_millis(110))
///     .build()
///     .unwrap();
///
/// let service = ServiceBuilder::new()
///     .layer(CommandLayer::new(CommandExecutor::new(), config))
///     .service(service_fn(|id: u64| async move { Ok::<_, std::io::Error>(id) }));
/// ```
#[derive(Clone, Debug)]
pub struct CommandLayer {
    executor: CommandExecutor,
    config: Arc<CommandConfig>,
}

impl CommandLayer {
    /// Creates a layer that executes calls as the command `config` describes.
    pub fn new(executor: CommandExecutor, config: CommandConfig) -> Self {
        Self {
            executor,
            config: Arc::new(config),
        }
    }

    /// Wraps the given service, returning the concrete [`Command`] service.
    ///
    /// Use this to attach a fallback with [`Command::with_fallback`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use tower_command::{CommandConfig, CommandExecutor, CommandLayer};
    /// use tower::service_fn;
    /// use futures::future::BoxFuture;
    ///
    /// let layer = CommandLayer::new(
    ///     CommandExecutor::new(),
    ///     CommandConfig::builder("getUser").build().unwrap(),
    /// );
    ///
    /// let svc = service_fn(|id: u64| async move { Ok::<_, std::io::Error>(id) });
    /// let service = layer.layer_fn(svc).with_fallback(
    ///     |_id: u64, _trigger| -> BoxFuture<'static, Result<u64, std::io::Error>> {
    ///         Box::pin(async { Ok(0) })
    ///     },
    /// );
    /// ```
    pub fn layer_fn<S>(&self, service: S) -> Command<S> {
        Command::new(service, self.executor.clone(), Arc::clone(&self.config))
    }
}

impl<S> Layer<S> for CommandLayer {
    type Service = Command<S>;

    fn layer(&self, service: S) -> Self::Service {
        self.layer_fn(service)
    }
}
