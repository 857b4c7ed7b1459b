//! Command line front-end: argument parsing, daemon commands, output.

use std::collections::HashMap;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::config;
use crate::daemon::proto::{Cmd, CmdKind, Resp};
use crate::daemon::{self, Paths};
use crate::error::Error;
use crate::tunnel::TunnelDesc;

/// How long a client waits for the daemon to come up.
const ENSURE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "boring", about = "A simple SSH tunnel manager", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open tunnels by name
    Open {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Close running tunnels
    Close {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List tunnels and their status
    #[command(alias = "ls")]
    List,
}

/// Run the parsed command. Returns whether every named tunnel succeeded;
/// the caller maps this to the exit code.
pub async fn run(cli: Cli, paths: &Paths) -> Result<bool, Error> {
    daemon::ensure(paths, ENSURE_DEADLINE).await?;

    match cli.command {
        Command::Open { names } => open(paths, &names).await,
        Command::Close { names } => close(paths, &names).await,
        Command::List => {
            list(paths).await?;
            Ok(true)
        }
    }
}

async fn open(paths: &Paths, names: &[String]) -> Result<bool, Error> {
    let tunnels = config::load()?;
    let mut ok = true;

    for name in names {
        let Some(desc) = tunnels.iter().find(|t| &t.name == name) else {
            eprintln!("{} no tunnel named '{name}' in configuration", "error:".red());
            ok = false;
            continue;
        };
        let resp = send(
            paths,
            &Cmd {
                kind: CmdKind::Open,
                tunnel: Some(desc.clone()),
            },
        )
        .await?;
        if resp.success {
            println!("{} tunnel '{name}' ({})", "opened".green(), desc.forward_desc());
        } else {
            eprintln!("{} could not open '{name}': {}", "error:".red(), resp.error);
            ok = false;
        }
    }
    Ok(ok)
}

async fn close(paths: &Paths, names: &[String]) -> Result<bool, Error> {
    let mut ok = true;
    for name in names {
        let desc = TunnelDesc {
            name: name.clone(),
            mode: Default::default(),
            local: None,
            remote: None,
            host: String::new(),
            user: None,
            identity: None,
        };
        let resp = send(
            paths,
            &Cmd {
                kind: CmdKind::Close,
                tunnel: Some(desc),
            },
        )
        .await?;
        if resp.success {
            println!("{} tunnel '{name}'", "closed".green());
        } else {
            eprintln!("{} could not close '{name}': {}", "error:".red(), resp.error);
            ok = false;
        }
    }
    Ok(ok)
}

async fn list(paths: &Paths) -> Result<(), Error> {
    let running = send(
        paths,
        &Cmd {
            kind: CmdKind::List,
            tunnel: None,
        },
    )
    .await?
    .tunnels;

    // Configured tunnels first, then anything running that the current
    // config no longer mentions.
    let mut tunnels = config::load().unwrap_or_default();
    for (name, desc) in &running {
        if !tunnels.iter().any(|t| &t.name == name) {
            tunnels.push(desc.clone());
        }
    }

    if tunnels.is_empty() {
        println!("{}", "No tunnels configured.".yellow());
        println!("Add [[tunnels]] entries to {}.", config::path()?.display());
        return Ok(());
    }

    print_table(&tunnels, &running);
    Ok(())
}

fn print_table(tunnels: &[TunnelDesc], running: &HashMap<String, TunnelDesc>) {
    let name_width = tunnels
        .iter()
        .map(|t| t.name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    // Pad before coloring: escape codes would otherwise count against the
    // column width.
    let header = format!(
        "{:<name_width$}  {:<8}  {:<12}  {:<24}  {}",
        "NAME", "STATUS", "MODE", "FORWARD", "HOST",
    );
    println!("{}", header.bold());
    for t in tunnels {
        let status = if running.contains_key(&t.name) {
            format!("{:<8}", "up").green()
        } else {
            format!("{:<8}", "-").dimmed()
        };
        println!(
            "{:<name_width$}  {}  {:<12}  {:<24}  {}",
            t.name,
            status,
            t.mode.to_string(),
            t.forward_desc(),
            t.host,
        );
    }
}

async fn send(paths: &Paths, cmd: &Cmd) -> Result<Resp, Error> {
    let mut stream = daemon::connect(paths)
        .await
        .map_err(|e| Error::Network(format!("could not reach daemon: {e}")))?;
    daemon::proto::write_frame(&mut stream, cmd).await?;
    daemon::proto::read_frame(&mut stream).await
}
