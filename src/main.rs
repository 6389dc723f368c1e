use clap::{Parser, Subcommand};

use frpc::commands;

#[derive(Parser)]
#[command(
    name = "frpc",
    version,
    about = "Fleet remote execution and deploy orchestration"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scripts on a set of devices.
    Script(commands::script::ScriptArgs),
    /// Orchestrate a deploy campaign.
    Deploy(commands::deploy::DeployArgs),
}

fn main() {
    // 130 mirrors the shell convention for SIGINT, and a half-finished
    // campaign stays resumable from its state file.
    ctrlc::set_handler(|| {
        eprintln!("[frpc] interrupted");
        std::process::exit(130);
    })
    .ok();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Script(args) => commands::script::run(&args),
        Commands::Deploy(args) => commands::deploy::run(&args),
    };

    match result {
        Ok(code) => std::process::exit(i32::from(code)),
        Err(err) => {
            eprintln!("[frpc] error ({}): {}", err.code(), err);
            std::process::exit(1);
        }
    }
}
