//! CLI for tether terminal sessions.

mod attach;

use std::sync::Arc;

use eyre::WrapErr as _;
use tether_terminal::{Backend, Manager, Session};

#[derive(clap::Parser)]
#[command(name = "tether", about = "Drive shells and agents in tmux or pty sessions")]
struct Args {
    /// Enable debug logging to ~/.tether/logs/
    #[arg(long, global = true)]
    debug: bool,

    /// Session backend (defaults to tmux, or pty on Windows).
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BackendArg {
    Tmux,
    Pty,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Create a session running a command (the default shell if none given).
    New {
        name: String,
        /// Working directory (defaults to the current directory).
        #[arg(short = 'C', long)]
        dir: Option<std::path::PathBuf>,
        /// Command and arguments to run.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Open a session in the interactive overlay, creating it if needed.
    Attach {
        name: String,
        /// Working directory used if the session has to be created.
        #[arg(short = 'C', long)]
        dir: Option<std::path::PathBuf>,
        /// Command used if the session has to be created.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List live sessions.
    List {
        /// Only sessions whose name starts with this.
        #[arg(short, long, default_value = "")]
        prefix: String,
        /// Print JSON instead of one name per line.
        #[arg(long)]
        json: bool,
    },
    /// Kill a session.
    Kill { name: String },
    /// Print a session's screen and scrollback.
    Capture {
        name: String,
        /// Scrollback lines to include (defaults to `scrollback_lines` from config).
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
    /// Send keys to a session.
    Send {
        name: String,
        /// Send the arguments as text instead of key names.
        #[arg(short, long)]
        literal: bool,
        /// Key names such as `Enter`, `C-c`, `Up`, or text with --literal.
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Print the cursor position.
    Cursor { name: String },
    /// Print the pane size.
    Size { name: String },
    /// Set the scrollback retained for a session.
    HistoryLimit { name: String, lines: usize },
    /// Check that the backend is usable.
    Doctor,
}

#[derive(serde::Serialize)]
struct SessionEntry {
    name: String,
    pane_id: Option<String>,
}

fn make_manager(backend: Option<BackendArg>) -> Arc<dyn Manager> {
    match backend {
        Some(BackendArg::Tmux) => Arc::new(tether_terminal::tmux::TmuxManager::new()),
        Some(BackendArg::Pty) => Arc::new(tether_terminal::pty::PtyManager::new()),
        None => tether_terminal::new_manager(),
    }
}

fn ensure_available(manager: &dyn Manager) -> eyre::Result<()> {
    if manager.is_available() {
        return Ok(());
    }
    eyre::bail!(
        "{} backend is not available\n  install: {}",
        manager.backend(),
        manager.install_instructions()
    )
}

fn require_session(manager: &dyn Manager, name: &str) -> eyre::Result<Arc<dyn Session>> {
    manager
        .get_session(name)
        .ok_or_else(|| tether_terminal::Error::SessionNotFound(name.to_string()).into())
}

fn work_dir(dir: Option<std::path::PathBuf>) -> eyre::Result<std::path::PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().wrap_err("failed to read current directory"),
    }
}

fn create_session(
    manager: &dyn Manager,
    config: &tether_config::Config,
    name: &str,
    dir: Option<std::path::PathBuf>,
    command: &[String],
) -> eyre::Result<Arc<dyn Session>> {
    let dir = work_dir(dir)?;
    let (cmd, args) = match command.split_first() {
        Some((cmd, args)) => (cmd.as_str(), args),
        None => ("", &[][..]),
    };
    let session = manager
        .create_session(name, &dir, cmd, args)
        .wrap_err_with(|| format!("failed to create session '{name}'"))?;
    if let Err(e) = manager.set_history_limit(name, config.history_limit) {
        tracing::warn!("failed to set history limit for {name}: {e}");
    }
    Ok(session)
}

fn init_logging(debug: bool, attaching: bool) -> eyre::Result<()> {
    if debug {
        let log_dir = dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".tether")
            .join("logs");
        std::fs::create_dir_all(&log_dir)?;

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let log_path = log_dir.join(format!("{timestamp}.log"));
        let log_file = std::fs::File::create(&log_path)?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .init();

        eprintln!("debug log: {}", log_path.display());
    } else if !attaching {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }
    // Attaching without --debug logs nowhere: stderr belongs to the fullscreen view.
    Ok(())
}

async fn run_attach(
    manager: Arc<dyn Manager>,
    config: &tether_config::Config,
    name: &str,
    dir: Option<std::path::PathBuf>,
    command: &[String],
) -> eyre::Result<()> {
    let session = match manager.get_session(name) {
        Some(session) => session,
        None => create_session(manager.as_ref(), config, name, dir, command)?,
    };

    let outcome = attach::run(session, manager.backend(), config).await?;
    tracing::debug!("attach to {name} ended: {outcome:?}");

    match (outcome, manager.backend()) {
        (attach::Outcome::AttachRequested, Backend::Tmux) => {
            // Hand the terminal to tmux itself.
            let status = tokio::process::Command::new("tmux")
                .args(["attach-session", "-t", &format!("={name}")])
                .status()
                .await
                .wrap_err("failed to run tmux attach-session")?;
            if !status.success() {
                eyre::bail!("tmux attach-session exited with {status}");
            }
        }
        (attach::Outcome::AttachRequested, Backend::Pty) => {
            eprintln!("full attach is only available with the tmux backend");
        }
        (attach::Outcome::Exited, _) => {
            if !manager.has_session(name) {
                eprintln!("\x1b[2m[session {name} ended]\x1b[0m");
            }
        }
    }
    Ok(())
}

fn run_doctor(manager: &dyn Manager) {
    let config_path = tether_config::config_path();
    println!("backend:   {}", manager.backend());
    if manager.is_available() {
        println!("available: yes");
    } else {
        println!("available: no");
        println!("install:   {}", manager.install_instructions());
    }
    match tether_config::load() {
        Ok(_) if config_path.exists() => println!("config:    {} (ok)", config_path.display()),
        Ok(_) => println!("config:    {} (not found, using defaults)", config_path.display()),
        Err(e) => println!("config:    {} ({e})", config_path.display()),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = <Args as clap::Parser>::parse();
    init_logging(args.debug, matches!(args.command, Command::Attach { .. }))?;

    let manager = make_manager(args.backend);
    if let Command::Doctor = args.command {
        run_doctor(manager.as_ref());
        return Ok(());
    }

    ensure_available(manager.as_ref())?;
    let config = tether_config::load().wrap_err("failed to load tether configuration")?;

    match args.command {
        Command::New { name, dir, command } => {
            create_session(manager.as_ref(), &config, &name, dir, &command)?;
            println!("{name}");
        }
        Command::Attach { name, dir, command } => {
            run_attach(manager, &config, &name, dir, &command).await?;
        }
        Command::List { prefix, json } => {
            let names = manager.list_sessions(&prefix)?;
            if json {
                let entries: Vec<SessionEntry> = names
                    .into_iter()
                    .map(|name| SessionEntry {
                        pane_id: manager.pane_id(&name),
                        name,
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if names.is_empty() {
                println!("No active sessions");
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        Command::Kill { name } => {
            manager.kill_session(&name).wrap_err_with(|| format!("failed to kill '{name}'"))?;
        }
        Command::Capture { name, lines } => {
            let session = require_session(manager.as_ref(), &name)?;
            let output = session.capture_output(lines.unwrap_or(config.scrollback_lines))?;
            print!("{output}");
        }
        Command::Send { name, literal, keys } => {
            let session = require_session(manager.as_ref(), &name)?;
            if literal {
                session.send_literal(&keys.join(" "))?;
            } else {
                for key in &keys {
                    session.send_key(key).wrap_err_with(|| format!("failed to send {key:?}"))?;
                }
            }
        }
        Command::Cursor { name } => {
            let session = require_session(manager.as_ref(), &name)?;
            let cursor = session
                .query_cursor()
                .ok_or_else(|| eyre::eyre!("cursor query for '{name}' failed"))?;
            let visibility = if cursor.visible { "visible" } else { "hidden" };
            println!("Row: {}, Col: {} ({visibility})", cursor.row, cursor.col);
        }
        Command::Size { name } => {
            let (width, height) = manager
                .query_pane_size(&name)
                .ok_or_else(|| eyre::eyre!("size query for '{name}' failed"))?;
            println!("{width}x{height}");
        }
        Command::HistoryLimit { name, lines } => {
            manager.set_history_limit(&name, lines)?;
        }
        Command::Doctor => {}
    }

    Ok(())
}
