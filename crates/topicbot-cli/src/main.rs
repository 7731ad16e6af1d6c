mod jobs;
mod run;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "topicbot", about = "Scheduled messages for Telegram forum topics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler service
    Run,
    /// Register a new scheduled message
    Add {
        /// Destination chat id (defaults to config)
        #[arg(long)]
        chat: Option<i64>,

        /// Forum topic id within the chat (defaults to config)
        #[arg(long)]
        topic: Option<i64>,

        /// Message text
        #[arg(long)]
        text: String,

        /// Parse mode ("Markdown", "HTML")
        #[arg(long)]
        parse_mode: Option<String>,

        /// Job id (auto-generated if not provided)
        #[arg(long)]
        id: Option<String>,

        /// Register a spaced-repetition series instead of a single job:
        /// one-shot reminders with geometrically growing gaps
        #[arg(long)]
        spaced: bool,

        /// Gap growth factor for --spaced, between 1 and 5
        #[arg(long, default_value_t = 2.0)]
        base: f64,

        #[command(flatten)]
        schedule: jobs::ScheduleArgs,
    },
    /// List jobs, optionally filtered by state
    List {
        /// Filter: active, paused, exhausted, cancelled
        #[arg(long)]
        state: Option<String>,
    },
    /// Show one job in full
    Show { id: String },
    /// Pause an active job
    Pause { id: String },
    /// Resume a paused job
    Resume { id: String },
    /// Cancel a job (record kept until deleted)
    Cancel { id: String },
    /// Delete a job record
    Delete { id: String },
    /// Replace a job's message text
    Edit {
        id: String,

        #[arg(long)]
        text: String,

        #[arg(long)]
        parse_mode: Option<String>,
    },
    /// Replace a job's schedule and reactivate it
    Reschedule {
        id: String,

        #[command(flatten)]
        schedule: jobs::ScheduleArgs,
    },
    /// Send a job's message immediately, regardless of its schedule
    Fire { id: String },
    /// Discover chat and topic ids from recent bot updates
    ChatId {
        /// Long-poll timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: i64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Run => rt.block_on(run::run_service())?,
        Commands::Add {
            chat,
            topic,
            text,
            parse_mode,
            id,
            spaced,
            base,
            schedule,
        } => rt.block_on(jobs::run_add(
            chat, topic, text, parse_mode, id, spaced, base, schedule,
        ))?,
        Commands::List { state } => rt.block_on(jobs::run_list(state))?,
        Commands::Show { id } => rt.block_on(jobs::run_show(id))?,
        Commands::Pause { id } => rt.block_on(jobs::run_pause(id))?,
        Commands::Resume { id } => rt.block_on(jobs::run_resume(id))?,
        Commands::Cancel { id } => rt.block_on(jobs::run_cancel(id))?,
        Commands::Delete { id } => rt.block_on(jobs::run_delete(id))?,
        Commands::Edit {
            id,
            text,
            parse_mode,
        } => rt.block_on(jobs::run_edit(id, text, parse_mode))?,
        Commands::Reschedule { id, schedule } => {
            rt.block_on(jobs::run_reschedule(id, schedule))?
        }
        Commands::Fire { id } => rt.block_on(jobs::run_fire(id))?,
        Commands::ChatId { timeout } => rt.block_on(jobs::run_chat_id(timeout))?,
    }

    Ok(())
}
