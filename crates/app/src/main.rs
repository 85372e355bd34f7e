mod cli;
mod process;
mod state;

use clap::{Parser, Subcommand};
use cli::{
    args::Args,
    op::{ExitStatus, Op},
    Client, GenId, Relay, Sockstest, Trustee, Version,
};

command_enum! {
    (GenId, GenId),
    (Relay, Relay),
    (Client, Client),
    (Trustee, Trustee),
    (Sockstest, Sockstest),
    (Version, Version),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let ctx = cli::op::OpContext::new(args.config_path);

    match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
