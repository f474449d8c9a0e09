//! anzu-director: daemon plus operator CLI.
//!
//! `run` starts the tick loop, the replenishment loop and the control
//! API; every other subcommand talks to a running daemon through the
//! control client. Exit codes: 0 success, 1 validation error, 2 resource
//! unavailable, 64 internal error.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use anzu_director::{
    run_control_server, ControlClient, ControlRequest, ControlResponse, Director, DirectorArgs,
    DirectorCommand,
};
use anzu_logging::{init_logging, LogConfig};
use anzu_protocol::{AnzuConfig, ErrorKind};

fn main() -> ExitCode {
    let args = DirectorArgs::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "anzu-director",
        verbose: args.verbose,
    }) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(64);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::from(64);
        }
    };

    let mut config = AnzuConfig::from_env();
    if let Some(db_url) = args.db_url.clone() {
        config.db_url = db_url;
    }
    if let Some(addr) = args.control_addr.clone() {
        config.control_addr = addr;
    }

    match args.command.unwrap_or(DirectorCommand::Run { enabled: false }) {
        DirectorCommand::Run { enabled } => runtime.block_on(run_daemon(config, enabled)),
        command => runtime.block_on(run_operator_command(config, args.token, command)),
    }
}

async fn run_daemon(config: AnzuConfig, enabled: bool) -> ExitCode {
    let director = match Director::new(config).await {
        Ok(director) => director,
        Err(e) => {
            error!("Failed to construct director: {:#}", e);
            return ExitCode::from(64);
        }
    };
    if let Some(migration_error) = &director.migration_error {
        error!(
            "Starting degraded: bootstrap migration failed: {}",
            migration_error
        );
    }

    director.enable(enabled);
    director.start();

    let control_addr = director.config.control_addr.clone();
    let server = tokio::spawn(run_control_server(director.clone(), control_addr));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received"),
        Err(e) => error!("Signal listener failed: {}", e),
    }
    director.shutdown();
    let _ = server.await;
    ExitCode::SUCCESS
}

async fn run_operator_command(
    config: AnzuConfig,
    token: Option<String>,
    command: DirectorCommand,
) -> ExitCode {
    let request = match build_request(command) {
        Some(request) => request,
        None => return ExitCode::SUCCESS,
    };

    match send(&config.control_addr, token, request).await {
        Ok(response) => print_response(response),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn build_request(command: DirectorCommand) -> Option<ControlRequest> {
    Some(match command {
        DirectorCommand::Run { .. } => return None,
        DirectorCommand::Toggle { enabled } => ControlRequest::Toggle { enabled },
        DirectorCommand::Init {
            project_id,
            training_target,
        } => ControlRequest::Initialize {
            project_id,
            training_target,
        },
        DirectorCommand::Tick => ControlRequest::Tick,
        DirectorCommand::Pipeline { project_id } => ControlRequest::Pipeline { project_id },
        DirectorCommand::Summary { project_id } => ControlRequest::Summary { project_id },
        DirectorCommand::Override {
            entity_type,
            entity_id,
            phase,
            action,
        } => ControlRequest::Override {
            entity_type,
            entity_id,
            phase,
            action,
        },
        DirectorCommand::TrainingTarget { target } => {
            ControlRequest::SetTrainingTarget { target }
        }
        DirectorCommand::Replenishment => ControlRequest::ReplenishmentStatus,
        DirectorCommand::Learning => ControlRequest::LearningStats,
        DirectorCommand::Suggest { character_slug } => {
            ControlRequest::SuggestParams { character_slug }
        }
        DirectorCommand::Gates => ControlRequest::ListGates,
        DirectorCommand::SetGate {
            name,
            threshold,
            active,
        } => ControlRequest::SetGate {
            name,
            threshold,
            active,
        },
        DirectorCommand::Correction => ControlRequest::CorrectionStats,
        DirectorCommand::Events => ControlRequest::EventStats,
        DirectorCommand::Gpu => ControlRequest::GpuStatus,
        DirectorCommand::Health => ControlRequest::Health,
    })
}

async fn send(
    addr: &str,
    token: Option<String>,
    request: ControlRequest,
) -> Result<ControlResponse> {
    let mut client = ControlClient::connect(addr, token).await?;
    client.request(request).await
}

fn print_response(response: ControlResponse) -> ExitCode {
    match response {
        ControlResponse::Pong => {
            println!("pong");
            ExitCode::SUCCESS
        }
        ControlResponse::Summary(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        ControlResponse::Health {
            healthy,
            migration_error,
            orchestrator_enabled,
            replenishment_enabled,
            correction_enabled,
        } => {
            println!(
                "healthy: {}\norchestrator: {}\nreplenishment: {}\ncorrection: {}",
                healthy, orchestrator_enabled, replenishment_enabled, correction_enabled
            );
            if let Some(migration_error) = migration_error {
                println!("migration error: {}", migration_error);
            }
            if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        ControlResponse::Json(value) => {
            match serde_json::to_string_pretty(&value) {
                Ok(pretty) => println!("{}", pretty),
                Err(_) => println!("{}", value),
            }
            ExitCode::SUCCESS
        }
        ControlResponse::Error {
            error_kind,
            message,
            ..
        } => {
            eprintln!("error ({}): {}", error_kind, message);
            match error_kind {
                ErrorKind::Validation => ExitCode::from(1),
                ErrorKind::ResourceExhausted | ErrorKind::Transient => ExitCode::from(2),
                _ => ExitCode::from(64),
            }
        }
    }
}
