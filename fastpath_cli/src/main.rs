use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use fastpath_core::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "fastpath")]
#[command(about = "Intermittent fasting tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new fast
    Start,

    /// Stop the fast in progress
    Stop,

    /// Show the current fast (default)
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded fasts, newest first
    History {
        /// Show at most this many fasts
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete a recorded fast
    Delete {
        /// Id of the fast, as shown by `history`
        id: Uuid,
    },

    /// Manage the fasting goal
    Goal {
        #[command(subcommand)]
        command: GoalCommands,
    },

    /// Follow the fast in progress, printing a line per tick
    Watch {
        /// Do not mirror the fast to the live status file
        #[arg(long)]
        no_live: bool,

        /// Exit after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
    },

    /// Export all fasts to a CSV file
    Export {
        /// Destination file
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum GoalCommands {
    /// List available goals
    List,

    /// Select a goal by name
    Set { name: String },

    /// Define and select a custom goal
    Custom {
        /// Target duration in hours (1-168)
        hours: u64,

        /// Name for the goal
        #[arg(long)]
        name: Option<String>,
    },

    /// Clear the selected goal
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    fastpath_core::logging::init();

    let cli = Cli::parse();

    // Determine data directory
    let config = Config::load()?;
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| config.data.data_dir.clone());

    // Default to "status" command
    let command = cli.command.unwrap_or(Commands::Status { json: false });

    // Only `watch` stays around long enough to keep a live mirror current
    let live = matches!(command, Commands::Watch { no_live: false, .. });

    let handle = open_runtime(&data_dir, &config, live).await?;
    let result = match command {
        Commands::Start => cmd_start(&handle).await,
        Commands::Stop => cmd_stop(&handle).await,
        Commands::Status { json } => cmd_status(&handle, json),
        Commands::History { limit } => cmd_history(&handle, limit),
        Commands::Delete { id } => cmd_delete(&handle, id).await,
        Commands::Goal { command } => cmd_goal(&handle, command).await,
        Commands::Watch { ticks, .. } => cmd_watch(&handle, ticks).await,
        Commands::Export { path } => cmd_export(&handle, &path),
    };
    handle.shutdown().await?;
    result
}

/// Spawn the runtime over the data directory and wait for the initial load
async fn open_runtime(data_dir: &Path, config: &Config, live: bool) -> Result<FastingHandle> {
    std::fs::create_dir_all(data_dir)?;

    let store: Arc<dyn RecordStore> = Arc::new(JsonStore::open_in(data_dir));
    let publisher: Box<dyn LiveStatusPublisher> = if live {
        Box::new(StatusFilePublisher::new(config.live_status_path(data_dir)))
    } else {
        Box::new(NoopPublisher)
    };

    let mut runtime_config = RuntimeConfig::from_config(config);
    runtime_config.live_enabled = live && config.live.enabled;

    let handle = FastingRuntime::spawn(store, publisher, Arc::new(SystemClock), runtime_config)?;
    handle.dispatch(Action::LoadInitialState)?;
    let state = handle.settled().await?;
    if let Some(error) = state.last_error {
        handle.shutdown().await?;
        return Err(Error::Other(error));
    }

    tracing::debug!("Loaded {} fasts from {:?}", state.history.len(), data_dir);
    Ok(handle)
}

/// Dispatch `action`, wait for its store operations, and turn a surfaced
/// error into a failure
async fn apply(handle: &FastingHandle, action: Action) -> Result<FastingState> {
    handle.dispatch(action)?;
    let state = handle.settled().await?;
    match state.last_error {
        Some(error) => Err(Error::Other(error)),
        None => Ok(state),
    }
}

async fn cmd_start(handle: &FastingHandle) -> Result<()> {
    if let Some(active) = &handle.state().active_record {
        println!(
            "A fast is already in progress (started {}).",
            format_time(active.start_time)
        );
        return Ok(());
    }

    let state = apply(handle, Action::StartFast).await?;
    if let Some(active) = &state.active_record {
        println!("✓ Fast started at {}", format_time(active.start_time));
    }
    if let Some(goal) = &state.selected_goal {
        println!(
            "  Goal: {} ({})",
            goal.name,
            format_hms(goal.target_duration_secs)
        );
    }
    Ok(())
}

async fn cmd_stop(handle: &FastingHandle) -> Result<()> {
    let before = handle.state();
    let Some(active) = &before.active_record else {
        println!("No fast in progress.");
        return Ok(());
    };

    let state = apply(handle, Action::StopFast).await?;
    let secs = state
        .history
        .iter()
        .find(|r| r.id == active.id)
        .and_then(|r| r.duration())
        .map(|d| d.num_seconds().max(0) as u64)
        .unwrap_or(0);
    println!("✓ Fast stopped after {}", format_hms(secs));

    if let Some(goal) = &before.selected_goal {
        if secs >= goal.target_duration_secs {
            println!("  Goal reached: {}", goal.name);
        } else {
            println!(
                "  {} short of {}",
                format_hms(goal.remaining_after(secs)),
                goal.name
            );
        }
    }
    Ok(())
}

fn cmd_status(handle: &FastingHandle, json: bool) -> Result<()> {
    let state = handle.state();
    if json {
        let report = serde_json::json!({
            "status": state.status(),
            "active_record": state.active_record,
            "elapsed_secs": state.current_elapsed_secs,
            "goal": state.selected_goal,
            "remaining_secs": state.remaining_secs(),
            "goal_reached": state.goal_reached(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    display_status(&state);
    Ok(())
}

fn cmd_history(handle: &FastingHandle, limit: Option<usize>) -> Result<()> {
    let state = handle.state();
    if state.history.is_empty() {
        println!("No fasts recorded yet.");
        return Ok(());
    }

    let shown = limit.unwrap_or(state.history.len());
    for record in state.history.iter().take(shown) {
        let end = record
            .end_time
            .map(format_time)
            .unwrap_or_else(|| "in progress".to_string());
        let duration = record
            .duration()
            .map(|d| format_hms(d.num_seconds().max(0) as u64))
            .unwrap_or_else(|| format_hms(state.current_elapsed_secs));
        println!(
            "{}  {}  →  {}  ({})",
            record.id,
            format_time(record.start_time),
            end,
            duration
        );
    }
    Ok(())
}

async fn cmd_delete(handle: &FastingHandle, id: Uuid) -> Result<()> {
    if !handle.state().history.iter().any(|r| r.id == id) {
        return Err(Error::RecordNotFound(id));
    }
    apply(handle, Action::DeleteRecord(id)).await?;
    println!("✓ Deleted fast {}", id);
    Ok(())
}

async fn cmd_goal(handle: &FastingHandle, command: GoalCommands) -> Result<()> {
    match command {
        GoalCommands::List => {
            let state = handle.state();
            let selected = state.selected_goal.as_ref().map(|g| g.name.as_str());
            for goal in &state.available_goals {
                let marker = if selected == Some(goal.name.as_str()) { "*" } else { " " };
                print!(
                    "{} {} ({})",
                    marker,
                    goal.name,
                    format_hms(goal.target_duration_secs)
                );
                match &goal.description {
                    Some(description) => println!(" - {}", description),
                    None => println!(),
                }
            }
        }

        GoalCommands::Set { name } => {
            let goal = handle
                .state()
                .available_goals
                .iter()
                .find(|g| g.name.eq_ignore_ascii_case(&name))
                .cloned()
                .ok_or(Error::GoalNotFound(name))?;
            let name = goal.name.clone();
            apply(handle, Action::SelectGoal(goal)).await?;
            println!("✓ Goal set to {}", name);
        }

        GoalCommands::Custom { hours, name } => {
            let state = apply(handle, Action::SetCustomGoal { hours, name }).await?;
            if let Some(goal) = &state.selected_goal {
                println!("✓ Goal set to {}", goal.name);
            }
        }

        GoalCommands::Clear => {
            apply(handle, Action::ClearGoal).await?;
            println!("✓ Goal cleared");
        }
    }
    Ok(())
}

/// Print a status line for every state update until the fast ends, the
/// tick limit is hit or Ctrl-C is pressed
async fn cmd_watch(handle: &FastingHandle, ticks: Option<u64>) -> Result<()> {
    let mut updates = handle.subscribe();
    let Some(session) = updates.borrow_and_update().active_record.as_ref().map(|r| r.id) else {
        println!("No fast in progress.");
        return Ok(());
    };

    let mut seen: u64 = 0;
    let mut announced_goal = false;
    loop {
        let state = updates.borrow_and_update().clone();
        if state.active_record.as_ref().map(|r| r.id) != Some(session) {
            println!("Fast ended.");
            return Ok(());
        }

        println!("{}", status_line(&state));
        if state.goal_reached() && !announced_goal {
            announced_goal = true;
            println!("✓ Goal reached!");
        }
        if ticks.is_some_and(|limit| seen >= limit) {
            return Ok(());
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                return Ok(());
            }
        }
        seen += 1;
    }
}

fn cmd_export(handle: &FastingHandle, path: &Path) -> Result<()> {
    let state = handle.state();
    let count = export_history_csv(&state.history, path)?;
    println!("✓ Exported {} fasts to {}", count, path.display());
    Ok(())
}

fn display_status(state: &FastingState) {
    match &state.active_record {
        Some(active) => {
            println!("Fasting since {}", format_time(active.start_time));
            println!("  Elapsed:   {}", format_hms(state.current_elapsed_secs));
        }
        None => println!("Not fasting."),
    }

    match &state.selected_goal {
        Some(goal) => {
            println!(
                "  Goal:      {} ({})",
                goal.name,
                format_hms(goal.target_duration_secs)
            );
            if let Some(remaining) = state.remaining_secs() {
                if state.goal_reached() {
                    println!("  ✓ Goal reached!");
                } else {
                    println!("  Remaining: {}", format_hms(remaining));
                }
            }
        }
        None => println!("  No goal selected"),
    }
}

fn status_line(state: &FastingState) -> String {
    let mut line = format!("Elapsed {}", format_hms(state.current_elapsed_secs));
    if let Some(remaining) = state.remaining_secs() {
        line.push_str(&format!(" | Remaining {}", format_hms(remaining)));
    }
    line
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
