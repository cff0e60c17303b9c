#![forbid(unsafe_code)]

mod cli;
mod commands;
mod ctl_client;
mod shutdown;
mod startup;

use std::path::Path;

use anyhow::Result;

use cli::{Command, DaemonCommand, DefenseCommand, DestCommand, ServiceCommand, TimeoutsCommand};
use ctl_client::ControlClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();
    let output = cli.output;

    // No subcommand = run the daemon
    let Some(command) = cli.command.as_ref() else {
        return startup::run(&cli).await;
    };

    let socket = Path::new(&cli.socket);
    if let Command::Version = command {
        // The daemon part is best effort: the client version prints anyway.
        let mut client = ControlClient::connect(socket).await.ok();
        return commands::cmd_version(client.as_mut(), output).await;
    }

    let mut client = ControlClient::connect(socket).await?;
    run_client_command(&mut client, command, output).await
}

async fn run_client_command(
    client: &mut ControlClient,
    command: &Command,
    output: cli::OutputFormat,
) -> Result<()> {
    match command {
        Command::Version => commands::cmd_version(Some(client), output).await,
        Command::Info => commands::cmd_info(client, output).await,
        Command::List { dests } => commands::cmd_list(client, *dests, output).await,

        Command::Service(cmd) => match cmd {
            ServiceCommand::Add(args) => commands::cmd_service_add(client, args).await,
            ServiceCommand::Edit(args) => commands::cmd_service_edit(client, args).await,
            ServiceCommand::Del {
                selector,
                mark_protocol,
            } => commands::cmd_service_del(client, selector, *mark_protocol).await,
        },

        Command::Dest(cmd) => match cmd {
            DestCommand::Add(args) => commands::cmd_dest_add(client, args).await,
            DestCommand::Edit(args) => commands::cmd_dest_edit(client, args).await,
            DestCommand::Del {
                selector,
                mark_protocol,
                real_server,
            } => commands::cmd_dest_del(client, selector, *mark_protocol, *real_server).await,
        },

        Command::Flush => commands::cmd_flush(client).await,
        Command::Zero {
            selector,
            mark_protocol,
        } => commands::cmd_zero(client, selector, *mark_protocol).await,

        Command::Timeouts(cmd) => match cmd {
            TimeoutsCommand::Get => commands::cmd_timeouts_get(client, output).await,
            TimeoutsCommand::Set { tcp, tcp_fin, udp } => {
                commands::cmd_timeouts_set(client, *tcp, *tcp_fin, *udp).await
            }
        },

        Command::Daemon(cmd) => match cmd {
            DaemonCommand::Start {
                role,
                mcast_interface,
                syncid,
            } => commands::cmd_daemon_start(client, *role, mcast_interface, *syncid).await,
            DaemonCommand::Stop => commands::cmd_daemon_stop(client).await,
            DaemonCommand::Status => commands::cmd_daemon_status(client, output).await,
        },

        Command::Defense(cmd) => match cmd {
            DefenseCommand::Get => commands::cmd_defense_get(client, output).await,
            DefenseCommand::Set(args) => commands::cmd_defense_set(client, args).await,
        },
    }
}
