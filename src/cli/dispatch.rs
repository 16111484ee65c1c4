use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use agent_loop::AgentLoop;
use bridge_transport::{BridgeTransport, ControllerMessage, InlineBridge, SocketFactory, TcpSocket};
use cdp_driver::{ChromiumDriver, ChromiumTransport};
use core_types::SessionId;
use routing_fabric::{RouteTarget, Router};
use session_controller::{FileStore, MemoryStore, PersistentStore, SessionController};

use super::args::{CliArgs, Commands, StartArgs};
use crate::config::AppConfig;
use crate::metrics;
use crate::resolver::SingleTabResolver;

pub async fn dispatch(cli: &CliArgs, config: &AppConfig) -> Result<()> {
    match &cli.command {
        Commands::Start(args) => cmd_start(args, config).await,
        Commands::Stop => cmd_stop(config).await,
        Commands::Status => cmd_status(config).await,
    }
}

fn build_store(config: &AppConfig) -> Arc<dyn PersistentStore> {
    match &config.session_record_path {
        Some(path) => Arc::new(FileStore::new(path.clone())),
        None => Arc::new(MemoryStore::default()),
    }
}

fn socket_factory(addr: String) -> SocketFactory {
    Arc::new(move || {
        let addr = addr.clone();
        Box::pin(async move {
            TcpSocket::connect(&addr)
                .await
                .map(|s| Box::new(s) as Box<dyn bridge_transport::Socket>)
        })
    })
}

async fn cmd_start(args: &StartArgs, config: &AppConfig) -> Result<()> {
    let router = Router::new();
    let driver = Arc::new(ChromiumDriver::new(
        ChromiumTransport::new(config.cdp.clone()),
        config.cdp.clone(),
        router.clone(),
    ));
    let store = build_store(config);
    let resolver = Arc::new(SingleTabResolver::default());
    let controller = Arc::new(SessionController::new(driver.clone(), store, resolver));

    controller
        .reconcile_on_startup()
        .await
        .context("reconciling a previous incarnation's session record")?;

    let detach_controller = controller.clone();
    let mut detach_sub = router.subscribe(RouteTarget::Controller);
    let detach_task = tokio::spawn(async move {
        while let Some(message) = detach_sub.recv().await {
            if message.kind != "target_detached" {
                continue;
            }
            let Some(tab) = message.payload["tab"].as_u64().map(core_types::TabHandle) else {
                continue;
            };
            if let Err(err) = detach_controller.handle_external_detach(tab).await {
                warn!(?err, tab = tab.0, "failed to react to host-initiated detach");
            }
        }
    });

    let session_id = SessionId::new();
    let tab = controller
        .start(session_id.clone(), None)
        .await
        .context("starting session")?;
    metrics::record_session_started();
    metrics::set_sessions_active(1);

    let bridge = Arc::new(InlineBridge::spawn(socket_factory(config.policy_server_addr.clone())));
    bridge
        .send(ControllerMessage::StartSession {
            goal: args.goal.clone(),
            model: "default".to_string(),
        })
        .await
        .context("sending start_session to the policy server")?;

    let mut loop_config = config.agent_loop.clone();
    if let Some(max_steps) = args.max_steps {
        loop_config.max_steps = max_steps;
    }
    let agent_loop = AgentLoop::new(driver.clone(), bridge.clone(), loop_config);

    let stopped = Arc::new(AtomicBool::new(false));
    let ctrlc_stopped = stopped.clone();
    let ctrlc_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrlc_stopped.store(true, Ordering::SeqCst);
        }
    });

    let outcome = agent_loop.run(tab, session_id, args.goal.clone(), stopped).await;
    ctrlc_task.abort();
    detach_task.abort();

    let _ = controller.stop().await;
    metrics::set_sessions_active(0);

    match outcome {
        Ok(outcome) => {
            info!(
                completed = outcome.completed,
                steps = outcome.steps_taken,
                summary = outcome.summary.as_deref().unwrap_or(""),
                "session finished"
            );
            Ok(())
        }
        Err(err) => Err(anyhow::anyhow!(err)).context("agent loop failed"),
    }
}

async fn cmd_stop(config: &AppConfig) -> Result<()> {
    let driver = Arc::new(ChromiumDriver::new(
        ChromiumTransport::new(config.cdp.clone()),
        config.cdp.clone(),
        Router::new(),
    ));
    let store = build_store(config);
    let resolver = Arc::new(SingleTabResolver::default());
    let controller = SessionController::new(driver, store, resolver);

    controller.stop().await.context("stopping session")?;
    info!("session stopped");
    Ok(())
}

async fn cmd_status(config: &AppConfig) -> Result<()> {
    let store = build_store(config);
    let record = store.load().await.map_err(|err| anyhow::anyhow!(err))?;
    if record.is_active {
        info!(
            tab = ?record.active_tab,
            session_id = ?record.session_id,
            "session is active"
        );
    } else if record.active_tab.is_some() {
        warn!(tab = ?record.active_tab, "no active session, but a tab was left attached by a previous incarnation");
    } else {
        info!("no active session");
    }
    Ok(())
}
