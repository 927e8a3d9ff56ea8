//! Main Entrypoint for the NFZ Voice API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the tool catalog (built-in tools plus an optional MCP server).
//! 3. Initializing the model client and the shared agent.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use nfz_voice_api::{config::Config, router::create_router, state::AppState};
use nfz_voice_core::{
    agent::Agent,
    llm_client::{LLMClient, OpenAICompatibleClient},
    nfz::NfzApiClient,
    resolver::LocalityResolver,
    tools::{
        ToolRegistry, clock::CurrentDateTime, mcp::spawn_mcp_tools, province::ResolveProvince,
        visits::FindVisits,
    },
};
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)
        .with_context(|| format!("Cannot read prompts directory {}", prompts_path.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

async fn build_tools(config: &Config) -> anyhow::Result<ToolRegistry> {
    let nfz = Arc::new(NfzApiClient::new(
        config.nfz_api_base.clone(),
        config.nfz_api_version.clone(),
    ));
    let resolver =
        Arc::new(LocalityResolver::new(nfz.clone()).with_timeout(config.region_lookup_timeout));

    let mut tools = ToolRegistry::new()
        .with(Arc::new(CurrentDateTime))
        .with(Arc::new(ResolveProvince::new(resolver)))
        .with(Arc::new(FindVisits::new(nfz)));

    if let Some(command) = &config.mcp_server_command {
        let remote = spawn_mcp_tools(command)
            .await
            .with_context(|| format!("Failed to start MCP server `{command}`"))?;
        info!(count = remote.len(), "Loaded tools from MCP server.");
        for tool in remote {
            tools.register(tool);
        }
    }
    Ok(tools)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 2. Build the Tool Catalog ---
    let tools = build_tools(&config).await?;
    info!(tools = tools.len(), "Tool catalog ready.");

    // --- 3. Initialize Shared Services ---
    let prompts = load_prompts(&config.prompts_path)?;
    let system_prompt = prompts
        .get("system_prompt")
        .context("system_prompt.md not found in prompts directory")?
        .clone();

    info!(provider = ?config.provider, "Using model provider.");
    let api_key = config
        .api_key()
        .context("No API key configured for the selected provider")?;
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(config.provider.api_base());
    let llm_client: Arc<dyn LLMClient> = Arc::new(OpenAICompatibleClient::new(
        openai_config,
        config.chat_model.clone(),
    ));

    let agent = Arc::new(Agent::new(llm_client, Arc::new(tools), system_prompt));
    let app_state = Arc::new(AppState {
        agent,
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
