#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use clap::{Parser, Subcommand};

/// td -- local-first issue tracker with multi-client sync.
#[derive(Parser)]
#[command(name = "td", version, about)]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(short = 'C', long, global = true)]
    dir: Option<String>,

    /// Output JSON where supported.
    #[arg(short = 'j', long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a td project in the current directory.
    Init,

    /// Create a new issue.
    Create {
        title: String,
        /// Issue type (bug, feature, task, epic, chore).
        #[arg(short = 't', long, default_value = "task")]
        issue_type: String,
        /// Priority (p0..p4).
        #[arg(short = 'p', long, default_value = "p2")]
        priority: String,
        #[arg(long)]
        description: Option<String>,
        /// Labels (repeatable).
        #[arg(short = 'l', long = "label")]
        labels: Vec<String>,
        #[arg(long)]
        points: Option<i64>,
        #[arg(long)]
        parent: Option<String>,
        /// Due window anchor (YYYY-MM-DD).
        #[arg(long)]
        due: Option<String>,
        /// Flag as minor (bypasses review policy).
        #[arg(long, default_value_t = false)]
        minor: bool,
    },

    /// List issues with filters.
    List {
        /// Comma-separated status set (open,in_progress,...).
        #[arg(short = 's', long)]
        status: Option<String>,
        /// Comma-separated type set.
        #[arg(short = 't', long = "type")]
        issue_type: Option<String>,
        /// Labels that must all be present (repeatable).
        #[arg(short = 'l', long = "label")]
        labels: Vec<String>,
        /// Text search over titles, descriptions, logs, and handoffs.
        #[arg(short = 'q', long)]
        text: Option<String>,
        /// Points filter: N, >=N, <=N, or N-M.
        #[arg(long)]
        points: Option<String>,
        /// Due window: after:D, before:D, D1..D2, or D.
        #[arg(long)]
        due: Option<String>,
        /// Defer window, same grammar as --due.
        #[arg(long)]
        defer: Option<String>,
        /// Include soft-deleted issues.
        #[arg(long, default_value_t = false)]
        deleted: bool,
    },

    /// Show one issue with its logs, latest handoff, and files.
    Show { id: String },

    /// Start working an issue (open/blocked -> in_progress).
    Start {
        id: String,
        #[arg(short = 'f', long, default_value_t = false)]
        force: bool,
    },

    /// Mark an issue blocked.
    Block { id: String },

    /// Unblock an issue back to open.
    Unblock {
        id: String,
        #[arg(short = 'f', long, default_value_t = false)]
        force: bool,
    },

    /// Send an issue to review.
    Review { id: String },

    /// Approve a reviewed issue (closes it, review policy permitting).
    Approve {
        id: String,
        /// Required for creator-exception approvals.
        #[arg(short = 'r', long)]
        reason: Option<String>,
    },

    /// Reject a review back to in_progress.
    Reject { id: String },

    /// Close an issue directly.
    Close {
        id: String,
        #[arg(short = 'f', long, default_value_t = false)]
        force: bool,
    },

    /// Reopen a closed issue.
    Reopen { id: String },

    /// Soft-delete an issue (hard with --hard).
    Delete {
        id: String,
        #[arg(long, default_value_t = false)]
        hard: bool,
    },

    /// Undo this session's last action.
    Undo,

    /// Comment on an issue.
    Comment { id: String, text: String },

    /// Record a log line, optionally attached to an issue.
    Log {
        message: String,
        #[arg(short = 'i', long)]
        issue: Option<String>,
        /// progress, decision, blocker, hypothesis, tried, result.
        #[arg(short = 't', long = "type", default_value = "progress")]
        log_type: String,
    },

    /// Write a structured handoff for an issue.
    Handoff {
        id: String,
        #[arg(long = "done")]
        done: Vec<String>,
        #[arg(long = "remaining")]
        remaining: Vec<String>,
        #[arg(long = "decision")]
        decisions: Vec<String>,
        #[arg(long = "uncertain")]
        uncertain: Vec<String>,
    },

    /// Link a file to an issue.
    File {
        id: String,
        path: String,
        /// implementation, test, reference, or config.
        #[arg(short = 'r', long, default_value = "implementation")]
        role: String,
    },

    /// Defer an issue until a date (YYYY-MM-DD).
    Defer { id: String, until: String },

    /// Link a dependency between issues.
    Link {
        from: String,
        to: String,
        /// blocks or depends_on.
        #[arg(short = 'k', long, default_value = "blocks")]
        kind: String,
    },

    /// Issues transitively blocked by the given issue.
    Blocked { id: String },

    /// Issues ranked by how many others they transitively block.
    Critical,

    /// Issues the current session may approve.
    Reviewable {
        /// Use the strict policy instead of balanced.
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// Board commands.
    Board {
        #[command(subcommand)]
        command: BoardCommands,
    },

    /// Work-session commands.
    Work {
        #[command(subcommand)]
        command: WorkCommands,
    },

    /// Status roll-up for the project.
    Status,

    /// Sync commands.
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },

    /// Run the HTTP server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short = 'p', long)]
        port: Option<u16>,
        /// Bearer token required on every request.
        #[arg(long)]
        token: Option<String>,
    },

    /// Deliver a webhook payload file (spawned internally, fire-and-forget).
    #[command(hide = true)]
    WebhookSend {
        #[arg(long)]
        file: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        secret: Option<String>,
    },
}

#[derive(Subcommand)]
enum BoardCommands {
    /// Create a board.
    Create {
        name: String,
        #[arg(short = 'q', long)]
        query: Option<String>,
    },
    /// List boards.
    List,
    /// Place an issue on a board.
    Add {
        board: String,
        issue: String,
        #[arg(long)]
        position: Option<i64>,
    },
    /// Show a board's issues in order.
    Show { board: String },
}

#[derive(Subcommand)]
enum WorkCommands {
    /// Start a named work session.
    Start {
        name: String,
        #[arg(long)]
        sha: Option<String>,
    },
    /// End the active work session.
    End {
        #[arg(long)]
        sha: Option<String>,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Push then pull (the default).
    Now,
    /// Show watermarks and pending count.
    Status,
    /// Verification pull of the full event history.
    PullAll,
}

/// Stable command name for the startup-sync allow-list.
fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Init => "init",
        Commands::Create { .. } => "create",
        Commands::List { .. } => "list",
        Commands::Show { .. } => "show",
        Commands::Start { .. } => "start",
        Commands::Block { .. } => "block",
        Commands::Unblock { .. } => "unblock",
        Commands::Review { .. } => "review",
        Commands::Approve { .. } => "approve",
        Commands::Reject { .. } => "reject",
        Commands::Close { .. } => "close",
        Commands::Reopen { .. } => "reopen",
        Commands::Delete { .. } => "delete",
        Commands::Undo => "undo",
        Commands::Comment { .. } => "comment",
        Commands::Log { .. } => "log",
        Commands::Handoff { .. } => "handoff",
        Commands::File { .. } => "file",
        Commands::Defer { .. } => "defer",
        Commands::Link { .. } => "link",
        Commands::Blocked { .. } => "blocked",
        Commands::Critical => "critical",
        Commands::Reviewable { .. } => "reviewable",
        Commands::Board { .. } => "board",
        Commands::Work { .. } => "work",
        Commands::Status => "status",
        Commands::Sync { .. } => "sync",
        Commands::Serve { .. } => "serve",
        Commands::WebhookSend { .. } => "webhook-send",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let dir = commands::project_dir(cli.dir.as_deref())?;

    commands::startup_auto_sync(&dir, command_name(&cli.command)).await;

    match cli.command {
        Commands::Init => commands::issue::init(&dir).await,
        Commands::Create {
            title,
            issue_type,
            priority,
            description,
            labels,
            points,
            parent,
            due,
            minor,
        } => {
            commands::issue::create(
                &dir,
                commands::issue::CreateArgs {
                    title,
                    issue_type,
                    priority,
                    description,
                    labels,
                    points,
                    parent,
                    due,
                    minor,
                },
                cli.json,
            )
            .await
        }
        Commands::List { status, issue_type, labels, text, points, due, defer, deleted } => {
            commands::issue::list(
                &dir,
                commands::issue::ListArgs { status, issue_type, labels, text, points, due, defer, deleted },
                cli.json,
            )
            .await
        }
        Commands::Show { id } => commands::issue::show(&dir, &id, cli.json).await,
        Commands::Start { id, force } => {
            commands::transition::start(&dir, &id, force).await
        }
        Commands::Block { id } => commands::transition::block(&dir, &id).await,
        Commands::Unblock { id, force } => commands::transition::unblock(&dir, &id, force).await,
        Commands::Review { id } => commands::transition::review(&dir, &id).await,
        Commands::Approve { id, reason } => commands::transition::approve(&dir, &id, reason).await,
        Commands::Reject { id } => commands::transition::reject(&dir, &id).await,
        Commands::Close { id, force } => commands::transition::close(&dir, &id, force).await,
        Commands::Reopen { id } => commands::transition::reopen(&dir, &id).await,
        Commands::Delete { id, hard } => commands::issue::delete(&dir, &id, hard).await,
        Commands::Undo => commands::issue::undo(&dir).await,
        Commands::Comment { id, text } => commands::notes::comment(&dir, &id, &text).await,
        Commands::Log { message, issue, log_type } => {
            commands::notes::log(&dir, &message, issue.as_deref(), &log_type).await
        }
        Commands::Handoff { id, done, remaining, decisions, uncertain } => {
            commands::notes::handoff(&dir, &id, done, remaining, decisions, uncertain).await
        }
        Commands::File { id, path, role } => commands::notes::file_link(&dir, &id, &path, &role).await,
        Commands::Defer { id, until } => commands::issue::defer(&dir, &id, &until).await,
        Commands::Link { from, to, kind } => commands::notes::link(&dir, &from, &to, &kind).await,
        Commands::Blocked { id } => commands::notes::blocked(&dir, &id, cli.json).await,
        Commands::Critical => commands::notes::critical(&dir, cli.json).await,
        Commands::Reviewable { strict } => commands::issue::reviewable(&dir, strict, cli.json).await,
        Commands::Board { command } => match command {
            BoardCommands::Create { name, query } => commands::notes::board_create(&dir, &name, query).await,
            BoardCommands::List => commands::notes::board_list(&dir, cli.json).await,
            BoardCommands::Add { board, issue, position } => {
                commands::notes::board_add(&dir, &board, &issue, position).await
            }
            BoardCommands::Show { board } => commands::notes::board_show(&dir, &board, cli.json).await,
        },
        Commands::Work { command } => match command {
            WorkCommands::Start { name, sha } => commands::notes::work_start(&dir, &name, sha).await,
            WorkCommands::End { sha } => commands::notes::work_end(&dir, sha).await,
        },
        Commands::Status => commands::issue::status(&dir, cli.json).await,
        Commands::Sync { command } => match command.unwrap_or(SyncCommands::Now) {
            SyncCommands::Now => commands::sync_cmd::now(&dir).await,
            SyncCommands::Status => commands::sync_cmd::status(&dir, cli.json).await,
            SyncCommands::PullAll => commands::sync_cmd::pull_all(&dir).await,
        },
        Commands::Serve { host, port, token } => commands::sync_cmd::serve(&dir, host, port, token).await,
        Commands::WebhookSend { file, url, secret } => {
            commands::sync_cmd::webhook_send(&file, &url, secret.as_deref()).await
        }
    }
}
