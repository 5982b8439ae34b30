// ============================================
// veyon-installer - main.rs
// ============================================
// This is the entry point of the application.
//
// The program flow is:
// 1. Parse the command line (teacher | student | uninstall | list)
// 2. Load veyon-installer.toml from next to the EXE (optional)
// 3. Start the per-run log file in logs\
// 4. Check once whether we are running as administrator
// 5. Run the chosen workflow and exit non-zero if it failed
// ============================================

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

// Our modules
mod config; // Config file + well-known folders
mod context; // Per-run shared state
mod distribute; // Student: import the staged keys
mod download; // HTTP, streaming download, SHA-256
mod elevation; // Admin check + UAC launches
mod error; // DeployError
mod fsops; // Copy/delete helpers + robocopy/PowerShell commands
mod installer; // Run the Veyon installer
mod keys; // Teacher: create + stage the key pair
mod logging; // Console + log file
mod process; // Start and wait for external programs
mod prompt; // Yes/no questions
mod release; // GitHub latest release lookup
mod retry; // Retry + elevated fallback policy
mod uninstall; // Remove Veyon
mod workflow; // teacher / student / uninstall

#[cfg(test)]
mod testing;

use config::{Config, Paths, CONFIG_FILE_NAME};
use context::RunContext;
use download::HttpTransport;
use elevation::Privilege;
use keys::VeyonCli;
use logging::RunLog;
use process::SystemLauncher;
use prompt::ConsolePrompt;
use workflow::{Services, Workflow, WORKFLOWS};

// ============================================
// COMMAND LINE
// ============================================

/// Install Veyon on teacher and student machines and hand out its keys.
#[derive(Debug, Parser)]
#[command(name = "veyon-installer", version, about)]
struct Cli {
    /// Folder for keys\, logs\ and temp\ (default: next to the EXE)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Config file (default: <root>\veyon-installer.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install Veyon Master and stage the key pair
    Teacher,
    /// Install the Veyon service and import the staged keys
    Student,
    /// Uninstall Veyon (asks before deleting its data)
    Uninstall,
    /// Show the available workflows
    List,
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> ExitCode {
    match real_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn real_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let workflow = match cli.command {
        Command::List => {
            for info in WORKFLOWS {
                println!("  {:<10} {}", info.name, info.description);
            }
            return Ok(());
        }
        Command::Teacher => Workflow::Teacher,
        Command::Student => Workflow::Student,
        Command::Uninstall => Workflow::Uninstall,
    };

    let root = cli.root.unwrap_or_else(config::app_directory);
    let config_path = cli.config.unwrap_or_else(|| root.join(CONFIG_FILE_NAME));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let paths = Paths::from_env(root, &config);
    let log = RunLog::init(&paths.logs_dir(), &config::host_name())
        .context("starting the log file")?;

    info!("veyon-installer v{}", env!("CARGO_PKG_VERSION"));
    info!("Root folder: {}", paths.root.display());
    info!("Log file: {}", log.log_file().display());

    let privilege = Privilege::detect();
    if privilege.is_elevated() {
        info!("Running as administrator");
    } else {
        info!("Not running as administrator - UAC prompts will appear when needed");
    }

    let ctx = RunContext::new(config, paths, privilege).with_log_file(log.log_file().to_path_buf());

    let transport = HttpTransport::new(&ctx.config)?;
    let launcher = SystemLauncher::new(ctx.config.fire_and_forget_wait());
    let cli_tool = VeyonCli::new(&ctx, &launcher);
    let mut prompt = ConsolePrompt;
    let mut services = Services {
        transport: &transport,
        launcher: &launcher,
        cli: &cli_tool,
        prompt: &mut prompt,
    };

    workflow::run(workflow, &ctx, &mut services)
        .with_context(|| format!("{} workflow failed", workflow.name()))?;
    Ok(())
}
