//! Tower layer integration.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tower::{Layer, Service, ServiceBuilder, ServiceExt, service_fn};
use tower_command::{
    CommandConfig, CommandError, CommandExecutor, CommandLayer, ExecutionOutcome, RequestLog,
};

#[derive(Debug, Clone, PartialEq)]
struct User {
    id: u64,
    name: String,
}

async fn get_user(id: u64) -> Result<User, std::io::Error> {
    Ok(User {
        id,
        name: format!("name: {}", id),
    })
}

#[tokio::test]
async fn layered_service_runs_as_command() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("MainUserService.getUser")
        .group_key("UserGroupKey")
        .pool_key("Test")
        .build()
        .unwrap();

    let mut service = ServiceBuilder::new()
        .layer(CommandLayer::new(executor.clone(), config))
        .service(service_fn(get_user));

    let user = service.ready().await.unwrap().call(1).await.unwrap();
    assert_eq!(user.name, "name: 1");

    let events = executor
        .registry()
        .execution_events("MainUserService.getUser")
        .unwrap();
    assert_eq!(events.get(ExecutionOutcome::Success), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_surfaces_as_command_error() {
    let layer = CommandLayer::new(
        CommandExecutor::new(),
        CommandConfig::builder("slow")
            .timeout(Duration::from_millis(110))
            .build()
            .unwrap(),
    );
    let mut service = layer.layer(service_fn(|_: ()| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, std::io::Error>(())
    }));

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(
        err,
        CommandError::Timeout { timeout, .. } if timeout == Duration::from_millis(110)
    ));
}

#[tokio::test]
async fn fallback_receives_the_request() {
    let executor = CommandExecutor::new();
    let layer = CommandLayer::new(
        executor.clone(),
        CommandConfig::builder("unavailable").build().unwrap(),
    );
    let failing = service_fn(|_: u64| async { Err::<User, _>(std::io::Error::other("down")) });

    let mut service = layer.layer_fn(failing).with_fallback(
        |id: u64, trigger| -> BoxFuture<'static, Result<User, std::io::Error>> {
            assert_eq!(trigger, ExecutionOutcome::Failure);
            Box::pin(async move {
                Ok(User {
                    id,
                    name: String::new(),
                })
            })
        },
    );

    let user = service.ready().await.unwrap().call(9).await.unwrap();
    assert_eq!(
        user,
        User {
            id: 9,
            name: String::new()
        }
    );
}

#[tokio::test]
async fn concurrent_calls_share_the_pool() {
    let executor = CommandExecutor::new();
    let layer = CommandLayer::new(
        executor.clone(),
        CommandConfig::builder("guarded").core_size(2).build().unwrap(),
    );
    let release = Arc::new(Notify::new());
    let started = Arc::new(AtomicUsize::new(0));

    let svc = {
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        service_fn(move |_: ()| {
            let release = Arc::clone(&release);
            started.fetch_add(1, Ordering::SeqCst);
            async move {
                release.notified().await;
                Ok::<_, std::io::Error>(())
            }
        })
    };
    let service = layer.layer(svc);

    let running: Vec<_> = (0..2)
        .map(|_| tokio::spawn(service.clone().oneshot(())))
        .collect();
    while started.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }

    let err = service.clone().oneshot(()).await.unwrap_err();
    assert!(err.is_rejected());

    for handle in running {
        while !handle.is_finished() {
            release.notify_one();
            tokio::task::yield_now().await;
        }
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn layered_calls_appear_in_request_log() {
    let layer = CommandLayer::new(
        CommandExecutor::new(),
        CommandConfig::builder("logged").build().unwrap(),
    );
    let service = layer.layer(service_fn(get_user));
    let log = RequestLog::new();

    log.scope(async {
        service.clone().oneshot(1).await.unwrap();
        service.clone().oneshot(2).await.unwrap();
    })
    .await;

    assert_eq!(log.len(), 2);
    assert!(
        log.all_executed_commands()
            .iter()
            .all(|c| c.command_key == "logged" && c.has_event(ExecutionOutcome::Success))
    );
}
