use anyhow::{Context, bail};
use beach_bottle::config::Config;
use beach_bottle::crypto::{KeyMaterial, SharedKey};
use beach_bottle::error::BottleError;
use beach_bottle::protocol::ChatMessage;
use beach_bottle::session::{ChatSession, SessionEvent, SessionEvents, SessionState};
use beach_bottle::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use time::macros::format_description;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "beach-bottle",
    about = "🍾 Encrypted peer-to-peer chat over WebRTC with copy/paste signaling",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(flatten)]
    peer: PeerArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "BEACH_BOTTLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "BEACH_BOTTLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct PeerArgs {
    #[arg(
        long,
        global = true,
        env = "BEACH_BOTTLE_KEY",
        hide_env_values = true,
        conflicts_with = "passphrase",
        help = "Shared key (base64 or 64 hex characters)"
    )]
    key: Option<String>,

    #[arg(
        long,
        global = true,
        env = "BEACH_BOTTLE_PASSPHRASE",
        hide_env_values = true,
        help = "Derive the shared key from a passphrase instead"
    )]
    passphrase: Option<String>,

    #[arg(
        long,
        global = true,
        env = "BEACH_BOTTLE_NICKNAME",
        default_value = "anonymous",
        help = "Name shown next to your messages"
    )]
    nickname: String,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        global = true,
        help = "STUN/TURN server URL; repeat for several"
    )]
    ice_servers: Vec<String>,

    #[arg(
        long,
        global = true,
        help = "Skip STUN and use loopback candidates (both peers on this host)"
    )]
    localhost_only: bool,

    #[arg(
        long = "gather-timeout",
        value_name = "SECS",
        global = true,
        help = "Give up on candidate gathering after this many seconds"
    )]
    gather_timeout: Option<u64>,
}

impl PeerArgs {
    fn key_material(&self) -> anyhow::Result<KeyMaterial> {
        match (&self.key, &self.passphrase) {
            (Some(key), _) => Ok(KeyMaterial::Encoded(key.clone())),
            (None, Some(passphrase)) => Ok(KeyMaterial::Passphrase(passphrase.clone())),
            (None, None) => bail!("a shared key is required: pass --key or --passphrase"),
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::from_env();
        if !self.ice_servers.is_empty() {
            config = config.with_ice_servers(self.ice_servers.clone());
        }
        if self.localhost_only {
            config = config.with_ice_servers(Vec::new()).with_loopback(true);
        }
        if let Some(secs) = self.gather_timeout.filter(|secs| *secs > 0) {
            config = config.with_gather_timeout(Some(Duration::from_secs(secs)));
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh random key to share with your peer
    Keygen,
    /// Start the chat: print an offer, then paste the peer's answer
    Offer,
    /// Join a chat: paste the peer's offer, then send back the printed answer
    Answer,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Keygen => {
            println!("{}", SharedKey::generate().to_base64());
            Ok(())
        }
        Command::Offer => handle_offer(&cli.peer).await,
        Command::Answer => handle_answer(&cli.peer).await,
    }
}

async fn handle_offer(peer: &PeerArgs) -> anyhow::Result<()> {
    let key = peer.key_material()?;
    let (session, events) = ChatSession::new(peer.config())
        .await
        .context("failed to create peer connection")?;
    info!(session_id = %session.id(), "starting as initiator");

    eprintln!("⏳ gathering candidates...");
    let offer = session
        .start_as_initiator(&key)
        .await
        .context("failed to produce offer")?;
    eprintln!("📤 send this offer to your peer:");
    println!("{offer}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("📥 paste the answer and press enter:");
    let answer = read_descriptor(&mut lines).await?;
    accept_with_retry(&session, answer, &key, &mut lines)
        .await
        .context("failed to apply answer")?;

    chat(&session, events, &mut lines, &peer.nickname).await
}

async fn handle_answer(peer: &PeerArgs) -> anyhow::Result<()> {
    let key = peer.key_material()?;
    let (session, events) = ChatSession::new(peer.config())
        .await
        .context("failed to create peer connection")?;
    info!(session_id = %session.id(), "starting as responder");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("📥 paste the offer and press enter:");
    let offer = read_descriptor(&mut lines).await?;
    eprintln!("⏳ gathering candidates...");
    let answer = accept_with_retry(&session, offer, &key, &mut lines)
        .await
        .context("failed to apply offer")?
        .context("session did not produce an answer")?;
    eprintln!("📤 send this answer back to your peer:");
    println!("{answer}");

    chat(&session, events, &mut lines, &peer.nickname).await
}

/// Applies a pasted descriptor, asking for it again while the paste does not
/// decode. Every other error is returned to the caller.
async fn accept_with_retry<R: AsyncBufRead + Unpin>(
    session: &ChatSession,
    mut pasted: String,
    key: &KeyMaterial,
    lines: &mut Lines<R>,
) -> anyhow::Result<Option<String>> {
    loop {
        match session.accept_remote(&pasted, key).await {
            Err(BottleError::DescriptorFormat(reason)) => {
                warn!(%reason, "rejected pasted descriptor");
                eprintln!("⚠️  that does not look like a descriptor ({reason}); paste it again:");
                pasted = read_descriptor(lines).await?;
            }
            result => return Ok(result?),
        }
    }
}

async fn read_descriptor<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>) -> anyhow::Result<String> {
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    bail!("stdin closed before a descriptor was pasted")
}

async fn chat<R: AsyncBufRead + Unpin>(
    session: &ChatSession,
    mut events: SessionEvents,
    lines: &mut Lines<R>,
    nickname: &str,
) -> anyhow::Result<()> {
    eprintln!("💬 waiting for the chat channel; type /quit to leave");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    debug!("stdin closed");
                    break;
                };
                let text = line.trim_end();
                if text == "/quit" {
                    break;
                }
                if text.is_empty() {
                    continue;
                }
                match session.send(text, nickname).await {
                    Ok(sent) => println!("{}", render(&sent)),
                    Err(BottleError::NotConnected) => {
                        eprintln!("⚠️  not connected yet ({:?}); message not sent", session.state());
                    }
                    Err(err) => eprintln!("⚠️  send failed: {err}"),
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Message(message) => println!("{}", render(&message)),
                    SessionEvent::DecryptError(err) => {
                        eprintln!("⚠️  dropped an unreadable message: {err}");
                    }
                    SessionEvent::StateChanged(SessionState::Connected) => {
                        eprintln!("✅ connected");
                    }
                    SessionEvent::StateChanged(state) if state.is_terminal() => {
                        eprintln!("🔌 connection ended ({state:?})");
                        break;
                    }
                    SessionEvent::StateChanged(state) => debug!(?state, "session state changed"),
                }
            }
        }
    }
    session.close().await.context("failed to close session")?;
    Ok(())
}

fn render(message: &ChatMessage) -> String {
    let clock = message
        .timestamp
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| "--:--:--".to_string());
    format!("[{clock}] {}: {}", message.nickname, message.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn peer_args(args: &[&str]) -> PeerArgs {
        let mut argv = vec!["beach-bottle"];
        argv.extend_from_slice(args);
        argv.push("offer");
        Cli::try_parse_from(argv).expect("parse").peer
    }

    #[test]
    fn render_shows_clock_and_nickname() {
        let message = ChatMessage {
            text: "hi".into(),
            nickname: "Alice".into(),
            timestamp: datetime!(2024-05-01 09:08:07 UTC),
        };
        assert_eq!(render(&message), "[09:08:07] Alice: hi");
    }

    #[test]
    fn key_and_passphrase_conflict() {
        let result = Cli::try_parse_from([
            "beach-bottle",
            "--key",
            "abc",
            "--passphrase",
            "pw",
            "offer",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn key_material_prefers_explicit_flags() {
        let args = peer_args(&["--passphrase", "correct horse"]);
        assert!(matches!(
            args.key_material().unwrap(),
            KeyMaterial::Passphrase(p) if p == "correct horse"
        ));
    }

    #[test]
    fn localhost_only_drops_ice_servers() {
        let args = peer_args(&["--localhost-only", "--ice-server", "stun:a.example.org:3478"]);
        let config = args.config();
        assert!(config.ice_servers.is_empty());
        assert!(config.include_loopback);
    }

    #[test]
    fn ice_server_flags_replace_defaults() {
        let args = peer_args(&[
            "--ice-server",
            "stun:a.example.org:3478",
            "--ice-server",
            "stun:b.example.org:3478",
        ]);
        let urls: Vec<_> = args
            .config()
            .ice_servers
            .into_iter()
            .flat_map(|server| server.urls)
            .collect();
        assert_eq!(urls, vec!["stun:a.example.org:3478", "stun:b.example.org:3478"]);
    }

    #[test]
    fn gather_timeout_flag_bounds_the_wait() {
        let config = peer_args(&["--gather-timeout", "5"]).config();
        assert_eq!(config.gather_timeout, Some(Duration::from_secs(5)));
        let config = peer_args(&["--gather-timeout", "0"]).config();
        assert_eq!(config.gather_timeout, None);
    }

    async fn localhost_session() -> Option<ChatSession> {
        match ChatSession::new(Config::localhost()).await {
            Ok((session, _events)) => Some(session),
            Err(err) => {
                eprintln!("skipping: peer connection unavailable: {err}");
                None
            }
        }
    }

    #[tokio::test]
    async fn bad_pastes_are_asked_for_again_until_input_ends() {
        let Some(session) = localhost_session().await else { return };
        let key = KeyMaterial::Encoded(SharedKey::generate().to_base64());
        let mut lines = BufReader::new(&b"still not it\n\n%%%\n"[..]).lines();

        let err = accept_with_retry(&session, "garbage".into(), &key, &mut lines)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stdin closed"));
        assert!(lines.next_line().await.unwrap().is_none());
        assert_eq!(session.state(), SessionState::New);
        assert_eq!(session.role(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn valid_paste_after_a_typo_is_accepted() {
        let (Some(initiator), Some(responder)) =
            (localhost_session().await, localhost_session().await)
        else {
            return;
        };
        let key = KeyMaterial::Encoded(SharedKey::generate().to_base64());
        let offer = tokio::time::timeout(Duration::from_secs(20), initiator.start_as_initiator(&key))
            .await
            .expect("offer gathering timed out")
            .expect("offer");

        let input = format!("{}\n", offer);
        let mut lines = BufReader::new(input.as_bytes()).lines();
        let answer = tokio::time::timeout(
            Duration::from_secs(20),
            accept_with_retry(&responder, "half an offer".into(), &key, &mut lines),
        )
        .await
        .expect("answer gathering timed out")
        .expect("accept");
        assert!(answer.is_some());
        assert_eq!(
            responder.role(),
            Some(beach_bottle::session::PeerRole::Responder)
        );
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let Some(session) = localhost_session().await else { return };
        let empty = KeyMaterial::Encoded(String::new());
        let mut lines = BufReader::new(&b"never read\n"[..]).lines();
        let err = accept_with_retry(&session, "garbage".into(), &empty, &mut lines)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BottleError>(),
            Some(BottleError::KeyImport(_))
        ));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("never read"));
    }
}
