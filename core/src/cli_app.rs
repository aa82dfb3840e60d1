use crate::auth::{CredentialProvider, StaticCredentials};
use crate::config::Config;
use crate::notify::{ChannelNotifier, Notification, NotificationLevel, Notifier, TracingNotifier};
use crate::session::SessionManager;
use crate::types::{ConversationId, UserId};
use crate::ws::WsConnector;
use colored::*;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

/// Time to let the server echo a sent message before closing the channel
const SEND_GRACE: Duration = Duration::from_millis(750);

/// Prints notifications to stderr as they happen
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notification: Notification) {
        eprintln!("{}", render_notification(&notification));
    }
}

/// Console output on a terminal, the log otherwise
fn default_notifier() -> Arc<dyn Notifier> {
    if std::io::stderr().is_terminal() {
        Arc::new(ConsoleNotifier)
    } else {
        Arc::new(TracingNotifier)
    }
}

fn render_notification(n: &Notification) -> String {
    match n.level {
        NotificationLevel::Info => format!("{} {}", "•".cyan(), n.text),
        NotificationLevel::Success => format!("{} {}", "✓".green(), n.text.green()),
        NotificationLevel::Error => format!("{} {}", "✗".red().bold(), n.text.red()),
    }
}

/// CLI entry: `pdv-chat [--api-url URL] [--socket-url URL] <command> [args]`
pub async fn run(mut args: Vec<String>) -> anyhow::Result<()> {
    let bin = if args.is_empty() {
        "pdv-chat".to_string()
    } else {
        args.remove(0)
    };
    let config = Config::from_args(&mut args)?;

    let Some(command) = args.first().cloned() else {
        print_usage(&bin);
        return Ok(());
    };
    let operands = &args[1..];
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials::from_env());

    match command.as_str() {
        "conversations" | "ls" => {
            let session = SessionManager::with_http(config, credentials, default_notifier());
            list_conversations(&session).await?;
        }
        "open" => {
            let Some(id) = operands.first() else {
                eprintln!("{}", format!("Usage: {} open <conversation_id>", bin).yellow());
                return Ok(());
            };
            let session = SessionManager::with_http(config, credentials, default_notifier());
            open_conversation(&session, &ConversationId::new(id.as_str())).await?;
        }
        "create" => {
            let Some(recipient) = operands.first() else {
                eprintln!("{}", format!("Usage: {} create <recipient_id>", bin).yellow());
                return Ok(());
            };
            let session = SessionManager::with_http(config, credentials, default_notifier());
            let conv = session
                .create_conversation(&UserId::new(recipient.as_str()))
                .await?;
            println!(
                "{} conversation {} with {}",
                "✓".green(),
                conv.id.to_string().cyan(),
                conv.counterpart_name()
            );
        }
        "send" => {
            if operands.len() < 2 {
                eprintln!("{}", format!("Usage: {} send <recipient_id> <message>", bin).yellow());
                return Ok(());
            }
            let recipient = UserId::new(operands[0].as_str());
            let body = operands[1..].join(" ");
            let session = SessionManager::with_http(config, credentials, default_notifier());
            send_message(&session, &recipient, &body).await?;
        }
        "watch" => {
            let (notifier, rx) = ChannelNotifier::new();
            let session = SessionManager::with_http(config, credentials, Arc::new(notifier));
            let open = operands.first().map(|id| ConversationId::new(id.as_str()));
            watch(&session, open, rx).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "PDV Chat CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--api-url URL] [--socket-url URL] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                     List conversations, most recent first", "conversations".cyan());
    println!("  {} <conversation_id>            Show messages and mark them read", "open".cyan());
    println!("  {} <recipient_id>             Start a conversation", "create".cyan());
    println!("  {} <recipient_id> <message>     Send a message", "send".cyan());
    println!("  {} [conversation_id]           Stay connected and print activity", "watch".cyan());
    println!();
    println!("{}", "Environment:".bright_white().bold());
    println!("  PDV_TOKEN, PDV_USER_ID, PDV_USER_NAME, PDV_API_URL, PDV_SOCKET_URL");
}

async fn list_conversations(session: &SessionManager) -> anyhow::Result<()> {
    session.load_conversations().await?;
    let conversations = session.conversations().await;
    if conversations.is_empty() {
        println!("{}", "No conversations found".dimmed());
        return Ok(());
    }

    let now = chrono::Utc::now();
    for conv in conversations {
        let badge = if conv.unread_count > 0 {
            format!(" ({})", conv.unread_count).yellow().bold().to_string()
        } else {
            String::new()
        };
        println!(
            "{} {}{}  {}",
            conv.id.to_string().cyan(),
            conv.counterpart_name().bold(),
            badge,
            conv.last_activity_label(now).dimmed()
        );
        println!(
            "    {}",
            conv.last_message_text.as_deref().unwrap_or("No messages").dimmed()
        );
    }
    println!("{} unread", session.total_unread().await);
    Ok(())
}

async fn open_conversation(session: &SessionManager, id: &ConversationId) -> anyhow::Result<()> {
    // The list only adds counterpart details; opening works without it
    let _ = session.load_conversations().await;
    session.select_conversation_by_id(id).await?;

    let conv = session.selected_conversation().await;
    let title = conv
        .as_ref()
        .map(|c| c.counterpart_name().to_string())
        .unwrap_or_default();
    println!("{} {}", "Conversation with".bright_white(), title.bold());

    for msg in session.messages().await {
        let time = msg
            .sent_at
            .map(|t| t.format("%d/%m %H:%M").to_string())
            .unwrap_or_default();
        let who = if session.is_own_message(&msg) {
            "you".green().to_string()
        } else if session.is_third_party_message(&msg).await {
            format!("{} (staff)", msg.sender_name()).magenta().to_string()
        } else {
            msg.sender_name().cyan().to_string()
        };
        println!("{} {}: {}", time.dimmed(), who, msg.body);
    }
    Ok(())
}

async fn send_message(session: &Arc<SessionManager>, recipient: &UserId, body: &str) -> anyhow::Result<()> {
    if !session.connect(&WsConnector).await? {
        anyhow::bail!("Set PDV_TOKEN and PDV_USER_ID to connect");
    }
    session.send_message(body, recipient).await?;
    tokio::time::sleep(SEND_GRACE).await;
    session.disconnect().await;
    println!("{} Message sent to {}", "✓".green(), recipient.to_string().cyan());
    Ok(())
}

async fn watch(
    session: &Arc<SessionManager>,
    open: Option<ConversationId>,
    mut notifications: tokio::sync::mpsc::UnboundedReceiver<Notification>,
) -> anyhow::Result<()> {
    let _ = session.load_conversations().await;
    if !session.connect(&WsConnector).await? {
        anyhow::bail!("Set PDV_TOKEN and PDV_USER_ID to connect");
    }
    if let Some(id) = open {
        let _ = session.select_conversation_by_id(&id).await;
    }
    println!("{}", "Watching for messages, Ctrl+C to stop".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            n = notifications.recv() => match n {
                Some(n) => eprintln!("{}", render_notification(&n)),
                None => break,
            },
        }
    }

    session.disconnect().await;
    println!("{} unread", session.total_unread().await);
    Ok(())
}
