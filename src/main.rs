// langhost - Main entry point
use clap::Parser;
use langhost::cli::Cli;
use std::io::IsTerminal;
use std::process;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.user_message(std::io::stderr().is_terminal()));
            e.exit_code()
        }
    };

    process::exit(exit_code);
}
