//! redline - HTTP Server Entry Point
//!
//! Wires the engine's collaborators from configuration and serves the API.

use std::sync::Arc;

use redline::{
    api,
    audit::TracingAudit,
    config::Config,
    context::{ContextBuilder, InMemoryMemory, NmapDiscovery},
    engine::{Collaborators, Engine, FileTaskStore},
    exec::{CommandRunner, ShellRunner},
    llm::OpenRouterClient,
    planner::LlmPlanner,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    // Larger worker stacks for deep async chains in the task driver
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(8 * 1024 * 1024)
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redline=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, state_dir={}",
        config.default_model,
        config.state_dir.display()
    );

    let llm = Arc::new(OpenRouterClient::new(config.api_key.clone()));
    let planner = LlmPlanner::new(llm, config.default_model.clone())
        .with_timeout(config.engine.planner_timeout)
        .with_max_tokens(config.engine.planner_max_tokens)
        .with_max_steps(config.engine.max_steps);

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new(config.working_dir.clone()));
    let store = FileTaskStore::new(config.state_dir.join("tasks"))
        .await
        .map_err(anyhow::Error::msg)?;

    let mut context = ContextBuilder::new().with_memory(Arc::new(InMemoryMemory::new()));
    if let Some(range) = &config.discovery_range {
        info!("Host discovery enabled for {}", range);
        context = context.with_discovery(Arc::new(NmapDiscovery::new(
            runner.clone(),
            range.clone(),
            config.engine.exec_timeout,
        )));
    }

    let engine = Engine::new(
        config.engine.clone(),
        Collaborators {
            planner: Arc::new(planner),
            runner,
            store: Arc::new(store),
            audit: Arc::new(TracingAudit),
            context,
        },
    )?;

    let recovered = engine.recover().await?;
    if recovered > 0 {
        info!("Recovered {} tasks", recovered);
    }

    info!("Starting server on {}:{}", config.host, config.port);
    api::serve(config, engine).await?;

    Ok(())
}
