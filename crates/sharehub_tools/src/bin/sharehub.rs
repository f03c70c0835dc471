#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};

use sharehub_os::{ClientCore, SharehubConfig};
use sharehub_tools::cli::{
    execute_chat_command, execute_errors_command, execute_session_command,
    execute_storage_command, SessionArgs,
};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: sharehub <errors <ls|clear> | storage <usage|keys|clear-volatile|clear> | chat <ls|clear> | session <status|sign-in|sign-up|sign-out> [email] [name]>";

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let area = args.first().ok_or_else(|| USAGE.to_string())?.as_str();
    let subcommand = args.get(1).ok_or_else(|| USAGE.to_string())?.as_str();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start runtime: {e}"))?;
    let core = ClientCore::from_config(SharehubConfig::from_env());
    core.install_traps();

    let output = match area {
        "errors" => execute_errors_command(core.reporter(), subcommand)?,
        "storage" => execute_storage_command(core.store(), subcommand)?,
        "chat" => execute_chat_command(core.store(), subcommand)?,
        "session" => {
            let email = args.get(2).map(String::as_str);
            let name = args.get(3).map(String::as_str);
            let password = match subcommand {
                "sign-in" | "sign-up" => {
                    let email = email.ok_or_else(|| {
                        format!("usage: sharehub session {subcommand} <email> [name]")
                    })?;
                    Some(read_password(email)?)
                }
                _ => None,
            };
            let session_args = SessionArgs {
                email,
                password: password.as_deref(),
                name,
            };
            runtime.block_on(async {
                core.start().await;
                let out = execute_session_command(core.session(), subcommand, session_args).await;
                core.shutdown();
                out
            })?
        }
        _ => return Err(USAGE.to_string()),
    };
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn read_password(email: &str) -> Result<String, String> {
    let password = if io::stdin().is_terminal() {
        rpassword::prompt_password(format!("Password for {email}:")).map_err(|e| e.to_string())?
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        input.trim_end_matches(['\r', '\n']).to_string()
    };
    if password.is_empty() {
        return Err("password must not be empty".to_string());
    }
    Ok(password)
}
