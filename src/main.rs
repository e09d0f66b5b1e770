// Rebound - main entry point
use clap::Parser;
use rebound::cli::Cli;
use std::io::IsTerminal;
use std::process;

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.run() {
        Ok(code) => code,
        Err(e) => {
            let use_colors = cli.color.as_deref() != Some("never") && std::io::stderr().is_terminal();
            eprintln!("{}", e.user_message(use_colors));
            e.exit_code()
        }
    };

    process::exit(exit_code);
}
