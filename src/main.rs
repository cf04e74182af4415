use anyhow::{Context, bail};
use chrono::Utc;
use clap::Parser;
use jingle_rust::calls::{CallManager, CallManagerConfig, EndUserStateChanged};
use jingle_rust::jinglecore::address::Address;
use jingle_rust::jinglecore::media::{MediaKind, MediaSet};
use jingle_rust::jinglecore::state::EndUserState;
use jingle_rust::jinglecore::verification::IdentityKey;
use jingle_rust::loopback::{
    FakeMediaOptions, KeyDirectory, LoopbackCrypto, LoopbackEndpoint, StaticRoster, Switchboard,
};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// This is a demo of a call between two in-process accounts.
//
// Usage:
//   cargo run                       # audio call
//   cargo run -- --video            # audio and video
//   cargo run -- --upgrade          # audio call upgraded to video
//   cargo run -- --verbose          # debug logging

#[derive(Parser, Debug)]
#[command(about = "Place a loopback Jingle call between two accounts")]
struct Args {
    /// Propose video in addition to audio.
    #[arg(long)]
    video: bool,
    /// Add video once the audio call is connected.
    #[arg(long)]
    upgrade: bool,
    /// Seconds an unanswered call rings.
    #[arg(long, default_value_t = 30)]
    ring_timeout_secs: u64,
    /// Seconds the call stays up before hanging up.
    #[arg(long, default_value_t = 2)]
    duration_secs: u64,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(args))
}

struct Party {
    address: Address,
    manager: Arc<CallManager>,
    endpoint: LoopbackEndpoint,
}

fn join(
    board: &Arc<Switchboard>,
    directory: &Arc<KeyDirectory>,
    address: &str,
    device_id: u32,
    contact: &str,
    config: &CallManagerConfig,
) -> anyhow::Result<Party> {
    let address: Address = address.parse()?;
    let contact: Address = contact.parse()?;
    directory.register(&address, device_id, IdentityKey::new(vec![device_id as u8; 33]));
    let (services, endpoint) = LoopbackEndpoint::services(
        board.transport(address.clone()),
        StaticRoster::new([contact]),
        LoopbackCrypto::new(&address, directory.clone()),
        FakeMediaOptions {
            emit_candidates: true,
            auto_connect: true,
            fail_creation: false,
        },
    );
    let config = CallManagerConfig {
        own_device_id: Some(device_id),
        ..config.clone()
    };
    let manager = CallManager::new(services, config);
    board.attach(&address, &manager);
    Ok(Party {
        address,
        manager,
        endpoint,
    })
}

async fn wait_for(
    events: &mut broadcast::Receiver<Arc<EndUserStateChanged>>,
    wanted: EndUserState,
) -> anyhow::Result<Arc<EndUserStateChanged>> {
    let deadline = Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        loop {
            let event = events.recv().await?;
            if event.state == wanted {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    })
    .await
    .with_context(|| format!("Timed out waiting for {wanted:?}"))?
}

async fn run(args: Args) -> anyhow::Result<()> {
    let board = Switchboard::new(Duration::from_secs(5));
    let directory = KeyDirectory::new();
    let config = CallManagerConfig {
        ring_timeout: Duration::from_secs(args.ring_timeout_secs),
        ..Default::default()
    };
    let alice = join(&board, &directory, "alice@example.org/laptop", 1, "bob@example.org", &config)?;
    let bob = join(&board, &directory, "bob@example.org/phone", 2, "alice@example.org", &config)?;

    let mut alice_events = alice.manager.events().end_user_state.subscribe();
    let mut bob_events = bob.manager.events().end_user_state.subscribe();

    let media: MediaSet = if args.video {
        MediaKind::set_of(&[MediaKind::Audio, MediaKind::Video])
    } else {
        MediaKind::set_of(&[MediaKind::Audio])
    };
    let session_id = alice.manager.propose(&bob.address.bare(), media).await?;
    info!("Alice proposed call {}", session_id);

    let incoming = wait_for(&mut bob_events, EndUserState::IncomingCall).await?;
    let Some(session) = bob
        .manager
        .find_session(&incoming.session_id)
        .await
    else {
        bail!("Bob has no session for {}", incoming.session_id);
    };
    info!("Bob answers call from {}", incoming.peer);
    session.accept_call().await?;

    wait_for(&mut alice_events, EndUserState::Connected).await?;
    info!("Call connected");

    if args.upgrade && !args.video {
        let Some(caller) = alice.manager.find_session(&session_id).await else {
            bail!("Alice lost session {}", session_id);
        };
        caller.add_media(MediaKind::Video).await?;
        wait_for(&mut bob_events, EndUserState::IncomingContentAdd).await?;
        if let Some(addition) = session.pending_content_addition().await {
            info!("Bob accepts {}", addition.summary);
            session.accept_content_add(&addition.summary).await?;
        }
        wait_for(&mut alice_events, EndUserState::Connected).await?;
        info!("Call upgraded to {:?}", caller.media().await);
    }

    tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;
    session.end_call().await?;
    wait_for(&mut alice_events, EndUserState::Ended).await?;

    for party in [&alice, &bob] {
        for entry in party.endpoint.call_log.entries() {
            info!(
                "{}: {:?} call with {} {:?}",
                party.address, entry.direction, entry.peer, entry.outcome
            );
        }
        if party.manager.is_busy().await {
            warn!("{} still has an active call", party.address);
        }
    }
    Ok(())
}
