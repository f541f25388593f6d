use anyhow::{bail, Result};
use clap::Parser;
use client_core::{ChatClient, ClientEvent, ClientTuning, MessageDraft};
use shared::domain::{ConversationId, GroupId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    user_id: String,
    /// Chat with this user.
    #[arg(long, conflicts_with = "group")]
    peer: Option<String>,
    /// Chat in this group.
    #[arg(long)]
    group: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .init();
    let args = Args::parse();

    let conversation = match (args.peer, args.group) {
        (Some(peer), None) => ConversationId::Direct(UserId::new(peer)),
        (None, Some(group)) => ConversationId::Group(GroupId::new(group)),
        _ => bail!("pass exactly one of --peer or --group"),
    };

    let client = ChatClient::new(
        UserId::new(args.user_id),
        &args.server_url,
        ClientTuning::default(),
    )?;
    client.connect().await;

    let mut events = client.subscribe_events();
    let printer = {
        let client = client.clone();
        let conversation = conversation.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ClientEvent::Connection(state) => println!("* connection: {state:?}"),
                    ClientEvent::ConversationUpdated(updated) if updated == conversation => {
                        for message in client.messages(&conversation).await {
                            let body = message.text.as_deref().unwrap_or("<media>");
                            println!(
                                "  [{:?}] {}: {body}",
                                message.status,
                                message.sender_id.as_str()
                            );
                        }
                    }
                    ClientEvent::SendFailed { message_id, .. } => {
                        println!("* send failed: {}", message_id.as_str());
                    }
                    ClientEvent::Mentioned {
                        sender_name,
                        group_name,
                        ..
                    } => println!("* {sender_name} mentioned you in {group_name}"),
                    ClientEvent::Error(message) => println!("* error: {message}"),
                    _ => {}
                }
            }
        })
    };

    client.open_conversation(Some(conversation.clone())).await;
    println!("connected; type a message and press enter (ctrl-d to quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let draft = MessageDraft {
            text: Some(text.to_string()),
            ..MessageDraft::default()
        };
        if let Err(err) = client.send_message(conversation.clone(), draft).await {
            println!("* not sent: {err}");
        }
    }

    printer.abort();
    client.shutdown().await;
    Ok(())
}
