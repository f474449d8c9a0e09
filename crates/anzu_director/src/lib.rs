//! Anzu director library.
//!
//! Exposes the root context, the orchestrator, the loops and the control
//! surface for the daemon binary and for tests.

#![allow(clippy::too_many_arguments)]

pub mod collab;
pub mod context;
pub mod control;
pub mod control_client;
pub mod correction;
pub mod orchestrator;
pub mod recommender;
pub mod replenishment;
pub mod workers;

pub use context::{Director, ReplenishmentConfig};
pub use control::{
    handle_control_request, run_control_server, ControlEnvelope, ControlRequest, ControlResponse,
};
pub use control_client::ControlClient;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "anzu-director", about = "Anzu production pipeline director")]
pub struct DirectorArgs {
    /// Database URL (sqlite:... | postgres://...)
    #[arg(long, env = "ANZU_DB_URL")]
    pub db_url: Option<String>,

    /// Control API address (ZMQ REP/REQ)
    #[arg(long, env = "ANZU_CONTROL_ADDR")]
    pub control_addr: Option<String>,

    /// Verbose console logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Bearer token for operator subcommands
    #[arg(long, env = "ANZU_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Option<DirectorCommand>,
}

#[derive(Subcommand, Debug)]
pub enum DirectorCommand {
    /// Run the daemon (default)
    Run {
        /// Start with the orchestrator enabled
        #[arg(long)]
        enabled: bool,
    },
    /// Enable or disable the orchestrator on a running daemon
    Toggle {
        #[arg(long)]
        enabled: bool,
    },
    /// Bootstrap pipeline rows for a project
    Init {
        project_id: i64,
        #[arg(long)]
        training_target: Option<i64>,
    },
    /// One synchronous orchestrator pass
    Tick,
    /// Pipeline snapshot for a project
    Pipeline { project_id: i64 },
    /// Human-readable pipeline summary
    Summary { project_id: i64 },
    /// Force a phase to skip / reset / complete
    Override {
        entity_type: String,
        entity_id: String,
        phase: String,
        action: String,
    },
    /// Set the approved-image target for training_data
    TrainingTarget { target: i64 },
    /// Replenishment status
    Replenishment,
    /// Learning statistics
    Learning,
    /// Parameter suggestion for a character
    Suggest { character_slug: String },
    /// Quality gate listing
    Gates,
    /// Update a quality gate
    SetGate {
        name: String,
        threshold: f64,
        #[arg(long, default_value_t = true)]
        active: bool,
    },
    /// Correction statistics
    Correction,
    /// Event bus statistics
    Events,
    /// Full GPU/backends snapshot
    Gpu,
    /// Daemon health
    Health,
}
