// Gantry API server
// Decision: The API creates runs and reads state; all execution happens in
//           gantry-worker processes sharing the same store

mod common;
mod connections;
mod node_types;
mod runs;
mod webhooks;
mod workers;
mod workflows;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use gantry_core::{EngineConfig, NodeRegistry};
use gantry_engine::{RunCoordinator, WebhookDispatcher};
use gantry_storage::{EngineStore, PostgresEngineStore};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::list_workflows,
        workflows::create_workflow,
        workflows::get_workflow,
        workflows::update_workflow,
        workflows::delete_workflow,
        workflows::get_draft,
        workflows::put_draft,
        workflows::list_versions,
        workflows::create_version,
        workflows::deploy_version,
        workflows::execute_workflow,
        workflows::test_draft_node,
        runs::list_runs,
        runs::get_run,
        runs::list_steps,
        runs::cancel_run,
        node_types::list_node_types,
        node_types::parameter_options,
        workers::list_workers,
        workers::register_worker,
        workers::deregister_worker,
        connections::list_connections,
        connections::create_connection,
        connections::get_connection,
        connections::delete_connection,
        webhooks::handle_webhook,
    ),
    components(
        schemas(
            workflows::Workflow,
            workflows::WorkflowVersion,
            workflows::Draft,
            workflows::CreateWorkflowRequest,
            workflows::UpdateWorkflowRequest,
            workflows::PutDraftRequest,
            workflows::ExecuteRequest,
            workflows::ExecuteResponse,
            workflows::TestNodeRequest,
            workflows::TestNodeResponse,
            runs::Run,
            runs::Step,
            runs::ListRunsParams,
            workers::Worker,
            workers::RegisterWorkerRequest,
            connections::Connection,
            connections::CreateConnectionRequest,
            common::ErrorResponse,
        )
    ),
    tags(
        (name = "workflows", description = "Workflow, draft, and version management"),
        (name = "runs", description = "Run and step inspection"),
        (name = "node-types", description = "Node registry introspection"),
        (name = "workers", description = "Worker registration"),
        (name = "connections", description = "Credential instances"),
        (name = "webhooks", description = "Webhook ingestion")
    ),
    info(
        title = "Gantry API",
        version = "0.2.0",
        description = "Durable execution engine for workflow graphs",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

/// Exit codes: 0 normal, 1 startup failure, 130 interrupt
fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("gantry-api starting...");

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            return 1;
        }
    };

    let store = match PostgresEngineStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("failed to connect to database: {}", e);
            return 1;
        }
    };
    if let Err(e) = store.migrate().await {
        tracing::error!("migration failed: {}", e);
        return 1;
    }
    let store: Arc<dyn EngineStore> = Arc::new(store);
    tracing::info!("connected to database");

    let mut registry = NodeRegistry::new();
    if let Err(e) = gantry_nodes::register_builtins(&mut registry) {
        tracing::error!("node registration failed: {}", e);
        return 1;
    }
    let registry = match registry.install() {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("registry installation failed: {}", e);
            return 1;
        }
    };
    tracing::info!(node_types = registry.len(), "node registry installed");

    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        registry.clone(),
        config.clone(),
    ));
    let dispatcher = Arc::new(WebhookDispatcher::new(store.clone(), coordinator.clone()));

    // Create module-specific states
    let workflows_state = workflows::AppState {
        store: store.clone(),
        coordinator: coordinator.clone(),
        registry: registry.clone(),
    };
    let runs_state = runs::AppState {
        store: store.clone(),
        coordinator: coordinator.clone(),
    };
    let node_types_state = node_types::AppState {
        registry: registry.clone(),
    };
    let workers_state = workers::AppState {
        store: store.clone(),
        worker_token: config.worker_token.clone(),
    };
    let connections_state = connections::AppState {
        store: store.clone(),
    };
    let webhooks_state = webhooks::AppState {
        dispatcher: dispatcher.clone(),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .merge(workflows::routes(workflows_state))
        .merge(runs::routes(runs_state))
        .merge(node_types::routes(node_types_state))
        .merge(workers::routes(workers_state))
        .merge(connections::routes(connections_state))
        .merge(webhooks::routes(webhooks_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {}: {}", config.listen_addr, e);
            return 1;
        }
    };
    tracing::info!("listening on {}", config.listen_addr);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received");
    });

    if let Err(e) = server.await {
        tracing::error!("server error: {}", e);
        return 2;
    }

    tracing::info!("gantry-api stopped");
    130
}
