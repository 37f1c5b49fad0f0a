mod assignment_cmds;
mod config;
mod group_cmd;
mod job_spec;
mod namespace_cmds;
mod run_cmd;
mod status_cmd;

use clap::{CommandFactory, Parser, Subcommand};

use foreman_core::store::PgStore;
use foreman_db::models::NewJob;
use foreman_db::pool;

use config::ForemanConfig;
use group_cmd::AppendTarget;

#[derive(Parser)]
#[command(name = "foreman", about = "Reactive scheduler and supervisor for coding-agent work")]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/foreman")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the foreman database
    DbInit,
    /// Namespace management
    Namespace {
        #[command(subcommand)]
        command: NamespaceCommands,
    },
    /// Assignment management
    Assignment {
        #[command(subcommand)]
        command: AssignmentCommands,
    },
    /// Job group management
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },
    /// Run the scheduler and supervisor for one namespace
    Run {
        /// Namespace to run
        #[arg(long)]
        namespace: String,
        /// Per-job timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show namespace status (omit --namespace to list all)
    Status {
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum NamespaceCommands {
    /// Create a namespace
    Create {
        name: String,
        /// Working directory for agents launched in this namespace
        #[arg(long)]
        project_path: Option<String>,
    },
    /// List namespaces with assignment counts
    List,
}

#[derive(Subcommand)]
pub enum AssignmentCommands {
    /// Create an assignment with its head job group
    Create {
        #[arg(long)]
        namespace: String,
        /// The objective, in free text
        #[arg(long)]
        north_star: String,
        /// Run alongside other assignments instead of exclusively
        #[arg(long)]
        independent: bool,
        /// Lower runs first
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        /// Head group job, as type:harness[:context] (repeatable)
        #[arg(long = "job", value_name = "TYPE:HARNESS[:CONTEXT]", required = true, value_parser = job_spec::job_spec_arg)]
        jobs: Vec<NewJob>,
    },
    /// Show an assignment and its chain
    Show { id: String },
    /// List assignments in a namespace
    List {
        #[arg(long)]
        namespace: String,
    },
    /// Block an assignment; running jobs are not interrupted
    Block {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Release a blocked assignment
    Unblock { id: String },
}

#[derive(Subcommand)]
pub enum GroupCommands {
    /// Append a group of parallel jobs to an assignment's chain
    Append {
        /// Append at the tail of this assignment's chain
        #[arg(long, conflicts_with = "after_current", required_unless_present = "after_current")]
        assignment: Option<String>,
        /// Insert right after the calling agent's own group (agent mode)
        #[arg(long)]
        after_current: bool,
        /// Job, as type:harness[:context] (repeatable)
        #[arg(long = "job", value_name = "TYPE:HARNESS[:CONTEXT]", required = true, value_parser = job_spec::job_spec_arg)]
        jobs: Vec<NewJob>,
    },
}

/// Execute the `foreman init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        ..Default::default()
    };
    let path = config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `foreman db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `foreman db-init` command: create database and run migrations.
async fn cmd_db_init(resolved: &ForemanConfig) -> anyhow::Result<()> {
    println!("Initializing foreman database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("foreman db-init complete.");
    Ok(())
}

async fn connect(resolved: &ForemanConfig) -> anyhow::Result<PgStore> {
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    Ok(PgStore::new(db_pool))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "foreman", &mut std::io::stdout());
        }
        Commands::DbInit => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            cmd_db_init(&resolved).await?;
        }
        Commands::Namespace { command } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let store = connect(&resolved).await?;
            let result = namespace_cmds::run_namespace_command(command, &store).await;
            store.pool().close().await;
            result?;
        }
        Commands::Assignment { command } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let store = connect(&resolved).await?;
            let result = assignment_cmds::run_assignment_command(command, &store).await;
            store.pool().close().await;
            result?;
        }
        Commands::Group {
            command:
                GroupCommands::Append {
                    assignment,
                    after_current,
                    jobs,
                },
        } => {
            let target = AppendTarget::from_args(assignment.as_deref(), after_current, |var| {
                std::env::var(var).ok()
            })?;
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let store = connect(&resolved).await?;
            let result = group_cmd::append_group(&store, target, &jobs).await;
            store.pool().close().await;
            let (group, jobs) = result?;
            println!("Appended group {} with {} job(s):", group.id, jobs.len());
            for job in &jobs {
                println!("  {} {} via {}", job.id, job.job_type, job.harness);
            }
        }
        Commands::Run { namespace, timeout } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let store = connect(&resolved).await?;
            let pool = store.pool().clone();
            let result = run_cmd::run_namespace(store, &namespace, resolved, timeout).await;
            pool.close().await;
            result?;
        }
        Commands::Status { namespace } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let store = connect(&resolved).await?;
            let result = status_cmd::run_status(&store, namespace.as_deref()).await;
            store.pool().close().await;
            result?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that mutate process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn group_append_needs_a_target() {
        let err = Cli::try_parse_from(["foreman", "group", "append", "--job", "pm:codex"]);
        assert!(err.is_err());

        let both = Cli::try_parse_from([
            "foreman",
            "group",
            "append",
            "--assignment",
            "x",
            "--after-current",
            "--job",
            "pm:codex",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn repeated_jobs_parse_into_specs() {
        let cli = Cli::try_parse_from([
            "foreman",
            "assignment",
            "create",
            "--namespace",
            "web",
            "--north-star",
            "ship it",
            "--priority",
            "-1",
            "--job",
            "implement:codex:frontend",
            "--job",
            "implement:claude-code:backend",
        ])
        .unwrap();
        let Commands::Assignment {
            command: AssignmentCommands::Create { jobs, priority, .. },
        } = cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(priority, -1);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].harness, "claude-code");
        assert_eq!(jobs[0].context.as_deref(), Some("frontend"));
    }

    #[test]
    fn bad_job_spec_is_a_usage_error() {
        let err = Cli::try_parse_from([
            "foreman",
            "group",
            "append",
            "--after-current",
            "--job",
            "deploy:codex",
        ])
        .err()
        .expect("should fail");
        assert!(err.to_string().contains("deploy"));
    }
}
