//! # murmur-node
//!
//! Headless Murmur peer. Runs the messaging engine over TCP and exposes a
//! small stdin console:
//! - peer addresses come from `MURMUR_PEERS_FILE` (`<hex key> <host:port>`)
//!   and from `add` commands
//! - incoming messages and status changes are printed as they happen

mod console;

use std::sync::Arc;

use anyhow::Context;
use murmur_core::{ContactDraft, EngineConfig, MessagingEvent, MessagingService};
use murmur_net::{AddressBook, TcpConnector};
use murmur_shared::{Message, PublicKey};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::console::{Command, HELP};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    murmur_core::init_tracing();
    info!("Starting Murmur node v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();
    info!(?config, "Loaded configuration");

    let book = config
        .peers_file
        .as_deref()
        .map(AddressBook::load)
        .unwrap_or_default();
    let connector = TcpConnector::new(book);

    let service = MessagingService::start(config.clone(), Arc::new(connector.clone()))
        .await
        .context("failed to start messaging service")?;
    let bound = service
        .listen_tcp(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    println!("murmur node {}", service.local_key());
    println!("listening on {bound}; type `help` for commands");

    let printer = tokio::spawn(print_events(service.clone()));

    tokio::select! {
        result = run_console(&service, &connector) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "console failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    service.shutdown().await;
    printer.abort();
    Ok(())
}

async fn run_console(service: &MessagingService, connector: &TcpConnector) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("error: {e}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(e) = execute(service, connector, command).await {
            println!("error: {e:#}");
        }
    }
    Ok(())
}

async fn execute(
    service: &MessagingService,
    connector: &TcpConnector,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Contacts => {
            let contacts = service.load_contacts().await?;
            if contacts.is_empty() {
                println!("no contacts");
            }
            for contact in contacts {
                let state = service.channel_state(&contact.public_key).await;
                let addr = connector
                    .address_of(&contact.public_key)
                    .await
                    .map_or_else(|| "-".to_string(), |addr| addr.to_string());
                println!("{:<16} {} {addr} [{state}]", contact.name, contact.public_key);
            }
        }
        Command::Add { name, key, addr } => {
            if let Some(addr) = addr {
                connector.add_peer(key, addr).await;
            }
            let contact = service.save_contact(ContactDraft::new(name, key)).await?;
            println!("saved {} ({})", contact.name, contact.public_key.short());
        }
        Command::Forget(key) => {
            let contact = service
                .load_contacts()
                .await?
                .into_iter()
                .find(|contact| contact.public_key == key)
                .with_context(|| format!("no contact with key {}", key.short()))?;
            service.delete_contact(contact.id).await?;
            connector.remove_peer(&key).await;
            println!("forgot {} ({})", contact.name, key.short());
        }
        Command::Send { key, text } => {
            let message = service.send_message(&text, &key).await?;
            println!("-> {} #{} [{}]", key.short(), message.sequence, message.status);
        }
        Command::History(peer) => {
            let history = service
                .filter_conversation(&service.local_key(), &peer)
                .to_vec()
                .await?;
            for message in &history {
                print_message(&service.local_key(), message);
            }
            println!("{} message(s)", history.len());
        }
        Command::Read(peer) => {
            let history = service.open_conversation(&peer).await?.to_vec().await?;
            println!("{} message(s) with {}", history.len(), peer.short());
        }
        Command::WhoAmI => println!("{}", service.local_key()),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn print_message(local: &PublicKey, message: &Message) {
    let arrow = if message.is_outbound(local) { "->" } else { "<-" };
    println!(
        "{} {arrow} {} [{}] {}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        message.peer_of(local).short(),
        message.status,
        preview(message),
    );
}

fn preview(message: &Message) -> String {
    if message.kind.is_media() {
        format!("<{} attachment>", message.kind)
    } else {
        message.content.clone()
    }
}

async fn print_events(service: MessagingService) {
    let mut events = service.subscribe();
    let local = service.local_key();
    loop {
        match events.recv().await {
            Ok(MessagingEvent::MessageReceived {
                message,
                known_contact,
            }) => {
                if !known_contact {
                    println!("(from unknown peer {})", message.sender_id);
                }
                print_message(&local, &message);
            }
            Ok(MessagingEvent::StatusChanged {
                message_id,
                peer,
                status,
            }) => println!("   {} {message_id} is {status}", peer.short()),
            Ok(MessagingEvent::DeliveryDeferred { peer, reason, .. }) => {
                println!("   {} unreachable ({reason}); will retry", peer.short())
            }
            Ok(MessagingEvent::PeerConnection { peer, connected }) => {
                println!("   {} {}", peer.short(), if connected { "online" } else { "offline" })
            }
            Ok(MessagingEvent::MessageAdded(_)) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
