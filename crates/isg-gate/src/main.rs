use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use isg_core::{
    extract_inbound, parse_command, parse_session_key, GateConfig, InboundEvent, UserCommand,
    VerifierConfig, VerifyMode,
};
use isg_resolver::{Resolver, VerifyDisposition, VerifyOutcome};
use isg_storage::{MessageRole, StorageError, StoreHandle};
use isg_verifier::TokenVerifier;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "isg-gate", about = "Identity scope gate for multi-channel agent hosts")]
struct Args {
    /// Path to the identity database.
    #[arg(long, env = "ISG_DB", default_value = "isg.db")]
    db: PathBuf,
    /// Verification strategy: local-signature or remote-endpoint.
    #[arg(long, env = "ISG_MODE")]
    mode: Option<VerifyMode>,
    /// Shared secret for local-signature verification.
    #[arg(long, env = "ISG_SECRET")]
    secret: Option<String>,
    /// Verification URL for remote-endpoint verification.
    #[arg(long, env = "ISG_VERIFY_URL")]
    verify_url: Option<String>,
    #[arg(long, env = "ISG_ISSUER")]
    issuer: Option<String>,
    #[arg(long, env = "ISG_AUDIENCE")]
    audience: Option<String>,
    #[arg(long, env = "ISG_VERIFY_TIMEOUT_MS", default_value_t = 3000)]
    verify_timeout_ms: u64,
    /// Withhold scope blocks until the identity is verified.
    #[arg(long, env = "ISG_REQUIRE_VERIFIED", default_value_t = false)]
    require_verified: bool,
    /// Notice rendered inside gated blocks.
    #[arg(long, env = "ISG_GATING_MESSAGE")]
    gating_message: Option<String>,
    #[command(subcommand)]
    command: GateCommand,
}

#[derive(Subcommand, Debug)]
enum GateCommand {
    /// Resolve a (channel, peer) pair without creating state.
    Lookup { channel: String, peer: String },
    /// Register a peer, or update its names if already registered.
    Register {
        channel: String,
        peer: String,
        first_name: String,
        last_name: Option<String>,
    },
    /// Verify a credential for a peer and apply the state transition.
    Verify {
        channel: String,
        peer: String,
        credential: String,
    },
    /// Print the scope/context block for a peer.
    Scope { channel: String, peer: String },
    /// Run the host pre-processing flow for one inbound payload: extract
    /// the message, resolve the sender, apply any /register or /verify
    /// command, otherwise record the message and print the scope block.
    Route {
        /// Inbound event payload as JSON.
        payload: String,
    },
    /// Record one logical message against a session key.
    Record {
        session_key: String,
        role: String,
        content: String,
        /// Optional metadata carried as JSON.
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List conversations with their message counters.
    Conversations,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let verifier_config = VerifierConfig {
        mode: args.mode,
        secret: args.secret.clone(),
        endpoint_url: args.verify_url.clone(),
        issuer: args.issuer.clone(),
        audience: args.audience.clone(),
        timeout_ms: args.verify_timeout_ms,
    };
    let verifier = TokenVerifier::from_config(&verifier_config)?;
    let resolver = Resolver::new(
        StoreHandle::new(&args.db),
        verifier,
        GateConfig {
            require_verified: args.require_verified,
            gating_notice: args.gating_message.clone(),
        },
    );

    match run(&resolver, args.command).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if is_unavailable(&err) {
                debug!(error = %err, "degraded: identity store unavailable");
                eprintln!("identity service unavailable; try again shortly");
                std::process::exit(2);
            }
            Err(err)
        }
    }
}

async fn run(resolver: &Resolver, command: GateCommand) -> anyhow::Result<()> {
    match command {
        GateCommand::Lookup { channel, peer } => {
            match resolver.lookup(&channel, &peer).await? {
                Some(identity) => {
                    println!("user_id: {}", identity.user_id);
                    if let Some(external_id) = &identity.external_id {
                        println!("external_id: {external_id}");
                    }
                    println!("verified: {}", identity.verified);
                    println!("scope_key: {}", identity.scope_key());
                }
                None => println!("unregistered"),
            }
        }
        GateCommand::Register {
            channel,
            peer,
            first_name,
            last_name,
        } => {
            let identity = resolver
                .register(&channel, &peer, &first_name, last_name.as_deref())
                .await?;
            println!("registered {} on {channel}", identity.user_id);
        }
        GateCommand::Verify {
            channel,
            peer,
            credential,
        } => match resolver.verify(&channel, &peer, &credential).await? {
            VerifyOutcome::Verified {
                identity,
                disposition,
            } => {
                let what = match disposition {
                    VerifyDisposition::AlreadyVerified => "already verified",
                    VerifyDisposition::Merged => "verified; linked to existing identity",
                    VerifyDisposition::Upgraded => "verified; identity upgraded",
                    VerifyDisposition::Created => "verified; new identity created",
                };
                println!("{what}");
                println!("scope_key: {}", identity.scope_key());
            }
            VerifyOutcome::NotVerified => println!("not verified"),
        },
        GateCommand::Scope { channel, peer } => match resolver.scope(&channel, &peer).await? {
            Some(block) => println!("{}", block.render()),
            None => println!("unregistered"),
        },
        GateCommand::Route { payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            route_inbound(resolver, &payload).await?;
        }
        GateCommand::Record {
            session_key,
            role,
            content,
            metadata,
        } => {
            let role = MessageRole::parse(&role)
                .ok_or_else(|| anyhow!("role must be 'user' or 'assistant'"))?;
            let metadata = metadata
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .context("metadata must be valid JSON")?;
            let session = parse_session_key(&session_key);

            let store = resolver.store().acquire().await?;
            let mut store = store.lock().await;
            let message = store.record_message(
                &session_key,
                &session.channel,
                role,
                &content,
                metadata.as_ref(),
                Utc::now(),
            )?;
            let conversation = store
                .conversation(&session_key)?
                .ok_or_else(|| anyhow!("conversation row missing after insert"))?;
            println!(
                "recorded message {} (conversation {}, {} messages)",
                message.id, conversation.id, conversation.message_count
            );
        }
        GateCommand::Conversations => {
            let store = resolver.store().acquire().await?;
            let store = store.lock().await;
            for conversation in store.conversations()? {
                println!(
                    "{}\t{}\t{} messages",
                    conversation.session_key, conversation.channel, conversation.message_count
                );
            }
        }
    }
    Ok(())
}

async fn route_inbound(resolver: &Resolver, payload: &serde_json::Value) -> anyhow::Result<()> {
    let InboundEvent::Message { session_key, text } = extract_inbound(payload) else {
        println!("ignored: unrecognized payload shape");
        return Ok(());
    };
    let Some(session_key) = session_key else {
        println!("ignored: payload carries no session key");
        return Ok(());
    };
    let session = parse_session_key(&session_key);
    let Some(peer) = session.peer_id.clone() else {
        println!("shared session; no sender identity");
        return Ok(());
    };

    match parse_command(&text) {
        UserCommand::Register {
            first_name,
            last_name,
        } => {
            let identity = resolver
                .register(&session.channel, &peer, &first_name, last_name.as_deref())
                .await?;
            println!("registered {} on {}", identity.user_id, session.channel);
        }
        UserCommand::Verify { credential } => {
            match resolver.verify(&session.channel, &peer, &credential).await? {
                VerifyOutcome::Verified { identity, .. } => {
                    println!("verified; scope_key: {}", identity.scope_key());
                }
                VerifyOutcome::NotVerified => println!("not verified"),
            }
        }
        UserCommand::Content(content) => {
            // Exactly one persisted row per inbound message: this is the
            // single observation point for the user direction.
            let store = resolver.store().acquire().await?;
            {
                let mut store = store.lock().await;
                store.record_message(
                    &session_key,
                    &session.channel,
                    MessageRole::User,
                    &content,
                    None,
                    Utc::now(),
                )?;
            }
            match resolver.scope(&session.channel, &peer).await? {
                Some(block) => println!("{}", block.render()),
                None => println!("unregistered"),
            }
        }
    }
    Ok(())
}

fn is_unavailable(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::Unavailable(_))
    ) || matches!(
        err.downcast_ref::<isg_resolver::ResolveError>(),
        Some(isg_resolver::ResolveError::Storage(StorageError::Unavailable(_)))
    )
}
