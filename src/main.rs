use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deletion_gate::api::{self, AppState};
use deletion_gate::config::{self, Config};
use deletion_gate::deletion::{
    ApprovalCoordinator, ApproverDirectory, ApproverNotifier, CoordinatorSettings, DeletionReport,
    TracingAuditSink,
};
use deletion_gate::jobs::sweeper;
use deletion_gate::middleware::audit::PgAuditSink;
use deletion_gate::middleware::auth::{Claims, JwtAuthenticator};
use deletion_gate::middleware::metrics::DeletionMetrics;
use deletion_gate::models::deletion::Resource;
use deletion_gate::notification::webhook::{LogNotifier, WebhookNotifier};
use deletion_gate::store::postgres::PgStore;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource as OtelResource};

    // OTLP export only when an endpoint is configured.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(OtelResource::new(vec![
                KeyValue::new("service.name", "deletion-gate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "deletion_gate=debug,delgate=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Request { command }) => {
            let (coordinator, db) = build_coordinator(&cfg, false).await?;
            handle_request_command(&coordinator, &db, &cfg, command).await
        }
        Some(cli::Commands::Environment { command }) => {
            let (coordinator, _) = build_coordinator(&cfg, false).await?;
            handle_environment_command(&coordinator, command).await
        }
        Some(cli::Commands::Sweep) => {
            let (coordinator, _) = build_coordinator(&cfg, false).await?;
            let report = sweeper::sweep_once(&coordinator, retention(&cfg)).await;
            println!(
                "expired: {}  completed: {}  purged: {}",
                report.expired, report.completed, report.purged
            );
            Ok(())
        }
        Some(cli::Commands::IssueToken {
            subject,
            project_id,
            environment_id,
            scopes,
            ttl,
        }) => {
            let claims = Claims {
                sub: subject,
                project_id,
                environment_id,
                scopes,
                exp: chrono::Utc::now().timestamp() + ttl,
            };
            println!("{}", JwtAuthenticator::new(&cfg.jwt_secret).issue(&claims)?);
            Ok(())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn retention(cfg: &Config) -> chrono::Duration {
    chrono::Duration::days(i64::from(cfg.retention_days))
}

/// Wire the coordinator to Postgres. `persist_audit` selects the database
/// audit sink; CLI commands log audit events instead.
async fn build_coordinator(
    cfg: &Config,
    persist_audit: bool,
) -> anyhow::Result<(Arc<ApprovalCoordinator>, Arc<PgStore>)> {
    tracing::info!("Connecting to database...");
    let db = Arc::new(
        PgStore::connect(&cfg.database_url, cfg.store_timeout())
            .await?
            .with_erase_timeout(cfg.erase_timeout()),
    );

    let notifier: Arc<dyn ApproverNotifier> = if cfg.webhook_urls.is_empty() {
        tracing::warn!("DELGATE_WEBHOOK_URLS is empty; confirmation codes will not be delivered");
        Arc::new(LogNotifier)
    } else {
        Arc::new(WebhookNotifier::new(
            cfg.webhook_urls.clone(),
            cfg.webhook_secret.clone(),
        )?)
    };

    let audit: Arc<dyn deletion_gate::deletion::AuditSink> = if persist_audit {
        Arc::new(PgAuditSink::new(db.pool().clone()))
    } else {
        Arc::new(TracingAuditSink)
    };

    let coordinator = ApprovalCoordinator::new(
        db.clone(),
        db.clone(),
        db.clone(),
        notifier,
        audit,
        Arc::new(DeletionMetrics::new()?),
    )
    .with_settings(CoordinatorSettings::from_config(cfg));

    Ok((Arc::new(coordinator), db))
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let (coordinator, db) = build_coordinator(&cfg, true).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    let state = Arc::new(AppState {
        coordinator: coordinator.clone(),
        auth: Arc::new(JwtAuthenticator::new(&cfg.jwt_secret)),
        directory: db.clone(),
        default_backoff: Duration::from_secs(cfg.default_backoff_secs),
    });

    sweeper::spawn(coordinator, cfg.sweep_interval(), retention(&cfg));
    tracing::info!(
        interval_secs = cfg.sweep_interval_secs,
        "Background deletion sweeper started"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("deletion gate listening on {}", addr);
    axum::serve(listener, api::app(state)).await?;

    Ok(())
}

fn print_report(report: &DeletionReport) {
    match report.id {
        Some(id) => println!("Request:   {}", id),
        None => println!("Request:   (none, deleted without approval)"),
    }
    println!("Resource:  {} {}", report.resource_kind, report.resource_id);
    println!("State:     {}", report.state);
    if let Some(expires_at) = report.expires_at {
        println!("Expires:   {}", expires_at);
    }
    println!("Confirmed: {}/{}", report.confirmed, report.total);
    if !report.pending_approvers.is_empty() {
        println!("Waiting:   {}", report.pending_approvers.join(", "));
    }
}

async fn handle_request_command(
    coordinator: &ApprovalCoordinator,
    directory: &PgStore,
    cfg: &Config,
    cmd: cli::RequestCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::RequestCommands::Create {
            project_id,
            environment_id,
            approvers,
            backoff_secs,
            actor,
        } => {
            let resource = Resource::environment(project_id, environment_id);
            let approvers = match approvers {
                Some(a) => a,
                None => directory.approvers_for(&resource).await?,
            };
            let backoff = Duration::from_secs(backoff_secs.unwrap_or(cfg.default_backoff_secs));
            let created = coordinator
                .create_deletion_request(&actor, &resource, approvers, backoff)
                .await?;
            print_report(&created.report);
            if !created.undelivered_approvers.is_empty() {
                println!(
                    "Undelivered: {}",
                    created.undelivered_approvers.join(", ")
                );
            }
        }
        cli::RequestCommands::Get {
            project_id,
            environment_id,
            request_id,
        } => {
            let id = uuid::Uuid::parse_str(&request_id).context("Invalid request id")?;
            let scope = Resource::environment(project_id, environment_id).scope();
            print_report(&coordinator.get_deletion_request(&scope, id).await?);
        }
        cli::RequestCommands::Approve {
            project_id,
            environment_id,
            actor,
            request_id,
            code,
        } => {
            let id = uuid::Uuid::parse_str(&request_id).context("Invalid request id")?;
            let scope = Resource::environment(project_id, environment_id).scope();
            let result = coordinator
                .approve_deletion_confirmation(&actor, &scope, id, &code)
                .await?;
            println!("Status:    {:?}", result.status);
            print_report(&result.report);
        }
        cli::RequestCommands::Reject {
            project_id,
            environment_id,
            actor,
            request_id,
            code,
        } => {
            let id = uuid::Uuid::parse_str(&request_id).context("Invalid request id")?;
            let scope = Resource::environment(project_id, environment_id).scope();
            print_report(
                &coordinator
                    .reject_deletion_confirmation(&actor, &scope, id, &code)
                    .await?,
            );
        }
    }
    Ok(())
}

async fn handle_environment_command(
    coordinator: &ApprovalCoordinator,
    cmd: cli::EnvironmentCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::EnvironmentCommands::Delete {
            project_id,
            environment_id,
            actor,
        } => {
            let resource = Resource::environment(project_id, environment_id);
            print_report(&coordinator.delete_environment(&actor, &resource).await?);
        }
    }
    Ok(())
}
