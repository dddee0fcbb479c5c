//! CLI command definitions.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API, scheduler and alert watcher
    Serve {
        /// Apply database migrations before starting
        #[arg(long)]
        migrate: bool,
    },

    /// Apply database migrations
    Migrate,

    /// Show an account's balance
    Balance {
        account_id: String,
    },

    /// List an account's transactions, newest first
    History {
        account_id: String,

        #[arg(short, long, default_value_t = 50)]
        limit: u32,

        #[arg(short, long, default_value_t = 0)]
        offset: u32,

        /// Only this transaction type (purchase, usage, grant, ...)
        #[arg(short = 't', long = "type")]
        tx_type: Option<String>,
    },

    /// Reconcile one account, or every account when none is given
    Reconcile {
        account_id: Option<String>,
    },

    /// Background jobs
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Run a job once (usage-flush, reconcile-sweep, alert-sweep, free-renewal)
    Run { name: String },
    /// List jobs and their schedules
    List,
}
