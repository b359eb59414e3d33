use clap::{Parser, Subcommand};

/// delgate: approval-gated environment deletion
#[derive(Parser)]
#[command(name = "delgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the admin API server and the maintenance sweeper
    Serve {
        /// Port to bind (defaults to DELGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage deletion requests
    Request {
        #[command(subcommand)]
        command: RequestCommands,
    },

    /// Manage environments
    Environment {
        #[command(subcommand)]
        command: EnvironmentCommands,
    },

    /// Run one maintenance sweep (expire, complete, purge) and exit
    Sweep,

    /// Mint an admin bearer token signed with DELGATE_JWT_SECRET
    IssueToken {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        project_id: String,
        /// Bind the token to a single environment
        #[arg(long)]
        environment_id: Option<String>,
        #[arg(long, value_delimiter = ',', default_value = "deletion:read,deletion:write")]
        scopes: Vec<String>,
        /// Lifetime in seconds
        #[arg(long, default_value = "3600")]
        ttl: i64,
    },
}

#[derive(Subcommand)]
pub enum RequestCommands {
    /// Request deletion of an environment
    Create {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        environment_id: String,
        /// Approver ids; defaults to the environment's members
        #[arg(long, value_delimiter = ',')]
        approvers: Option<Vec<String>>,
        /// Backoff interval in seconds
        #[arg(long)]
        backoff_secs: Option<u64>,
        /// Actor recorded in the audit log
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Show the status of a deletion request
    Get {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        environment_id: String,
        request_id: String,
    },
    /// Confirm a deletion request with a code
    Approve {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        environment_id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
        request_id: String,
        code: String,
    },
    /// Veto a deletion request with a code
    Reject {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        environment_id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
        request_id: String,
        code: String,
    },
}

#[derive(Subcommand)]
pub enum EnvironmentCommands {
    /// Delete an environment that is empty or has an approved request
    Delete {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        environment_id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
}
