use anyhow::Result;
use chat_client::ClientConfig;
use chat_sync::Session;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod cli;

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Terminal client for the chat server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to <config dir>/chat)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a conversation; each stdin line is sent as a message
    Tail(TailArgs),

    /// List the user's conversations
    Conversations(ConversationsArgs),
}

#[derive(Args)]
struct SessionArgs {
    /// Id of the signed-in user
    #[arg(long)]
    user_id: String,

    /// Display name (defaults to the user id)
    #[arg(long)]
    name: Option<String>,

    /// Bearer token for the websocket and REST API
    #[arg(long, env = "CHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl SessionArgs {
    fn into_session(self) -> Session {
        let name = self.name.unwrap_or_else(|| self.user_id.clone());
        let session = Session::new(self.user_id, name);
        match self.token {
            Some(token) => session.with_token(token),
            None => session,
        }
    }
}

#[derive(Parser)]
struct TailArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Conversation to follow
    #[arg(short, long)]
    conversation: String,
}

#[derive(Parser)]
struct ConversationsArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "chat=debug,chat_sync=debug,chat_client=debug,warn"
    } else {
        "chat=info,chat_sync=info,chat_client=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = ClientConfig::load(cli.config_dir)?;
    debug!(ws_url = %config.transport.ws_url, api_url = %config.transport.api_url, "Resolved server");

    match cli.command {
        Commands::Tail(args) => {
            cli::tail_command(&config, args.session.into_session(), args.conversation.into()).await
        }
        Commands::Conversations(args) => {
            cli::conversations_command(&config, args.session.into_session(), args.json).await
        }
    }
}
