//! # watchroom-sim
//!
//! Runs a whole watch room in one process: N members, each with its own voice
//! session, a synthetic microphone and scripted direct links, all talking
//! through an in-memory room server.
//!
//! ```text
//! watchroom-sim --members 3 --fail 0-1 --fail 0-2 --duration-secs 10
//! ```
//!
//! Member 0 loses both of its direct links and falls back to the relay while
//! members 1 and 2 keep talking directly.

use anyhow::Context;
use clap::Parser;
use futures_util::future::join_all;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use watchroom_common::Member;
use watchroom_common::config::VoiceStrategy;
use watchroom_voice::sim::{
    LinkScript, RecordingPlayback, SimBus, SimCaptureDevice, SimTransportFactory, TokioAudioClock,
};
use watchroom_voice::{VoiceBackends, VoiceHandle, VoiceSession};

#[derive(Debug, Parser)]
#[command(name = "watchroom-sim", version, about = "Simulate a watch room's voice mesh")]
struct Args {
    /// Number of members in the room.
    #[arg(long, default_value_t = 3, env = "WATCHROOM_SIM_MEMBERS")]
    members: usize,

    /// Direct link between two members (by index) that fails, e.g. `0-1`.
    #[arg(long = "fail", value_name = "A-B")]
    failing: Vec<MemberPair>,

    /// Direct link that connects, then drops for good after two seconds.
    #[arg(long = "flap", value_name = "A-B")]
    flapping: Vec<MemberPair>,

    /// How long the room runs before everyone leaves.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Skip direct links entirely and relay all audio through the server.
    #[arg(long)]
    server_only: bool,

    /// Members whose microphone stays off (listen only), by index.
    #[arg(long = "listen-only", value_name = "INDEX")]
    listen_only: Vec<usize>,

    /// Print each member's final snapshot as JSON.
    #[arg(long)]
    dump: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy)]
struct MemberPair(usize, usize);

impl FromStr for MemberPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('-')
            .ok_or_else(|| format!("expected A-B, got `{s}`"))?;
        let a = a.trim().parse().map_err(|_| format!("bad member index `{a}`"))?;
        let b = b.trim().parse().map_err(|_| format!("bad member index `{b}`"))?;
        if a == b {
            return Err("a member has no link to itself".into());
        }
        Ok(Self(a, b))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = watchroom_common::config::init()?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log.filter.as_str().into());
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }

    anyhow::ensure!(args.members >= 1, "a room needs at least one member");
    for MemberPair(a, b) in args.failing.iter().chain(&args.flapping) {
        anyhow::ensure!(
            *a < args.members && *b < args.members,
            "link {a}-{b} refers to a member outside 0..{}",
            args.members
        );
    }

    let mut voice = config.voice.clone();
    if args.server_only {
        voice.strategy = VoiceStrategy::ServerOnly;
    }

    tracing::info!("🎧 Starting watchroom-sim v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        members = args.members,
        strategy = ?voice.strategy,
        failing = args.failing.len(),
        flapping = args.flapping.len(),
        "   Room configuration"
    );

    // === Room ===
    let room_id = Uuid::new_v4();
    let ids: Vec<Uuid> = (0..args.members).map(|_| Uuid::new_v4()).collect();
    let roster: Vec<Member> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| Member::new(*id, format!("member-{i}"), false))
        .collect();
    let bus = SimBus::new();

    // === Direct links ===
    let factories: Vec<Arc<SimTransportFactory>> = ids
        .iter()
        .map(|_| Arc::new(SimTransportFactory::new(LinkScript::connect())))
        .collect();
    for MemberPair(a, b) in &args.failing {
        factories[*a].script(ids[*b], LinkScript::fail());
        factories[*b].script(ids[*a], LinkScript::fail());
    }
    let flap = LinkScript::Flap {
        connect_after: Duration::from_millis(150),
        drop_after: Duration::from_secs(2),
        outage: None,
    };
    for MemberPair(a, b) in &args.flapping {
        factories[*a].script(ids[*b], flap);
        factories[*b].script(ids[*a], flap);
    }

    // === Sessions ===
    let clocks: Vec<Arc<TokioAudioClock>> =
        ids.iter().map(|_| Arc::new(TokioAudioClock::new())).collect();
    let handles: Vec<VoiceHandle> = ids
        .iter()
        .zip(&factories)
        .zip(&clocks)
        .enumerate()
        .map(|(i, ((id, factory), clock))| {
            let handle = VoiceSession::spawn(
                voice.clone(),
                *id,
                room_id,
                roster.clone(),
                VoiceBackends {
                    signaling: bus.channel(*id),
                    capture: Arc::new(SimCaptureDevice::tone(
                        48_000,
                        220.0 + 110.0 * i as f32,
                        0.3,
                    )),
                    transports: factory.clone(),
                    clock: clock.clone(),
                    playback: Arc::new(RecordingPlayback::new()),
                },
            );
            bus.attach(handle.clone());
            handle
        })
        .collect();

    for (i, handle) in handles.iter().enumerate() {
        let mut status = handle.watch_status();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = status.borrow_and_update().clone();
                tracing::info!(member = i, status = current.label(), "Status");
            }
        });
    }

    // === Microphones ===
    let speaking: Vec<&VoiceHandle> = handles
        .iter()
        .enumerate()
        .filter(|(i, _)| !args.listen_only.contains(i))
        .map(|(_, handle)| handle)
        .collect();
    let results = join_all(speaking.iter().map(|h| h.set_mic_enabled(true))).await;
    for (handle, result) in speaking.iter().zip(results) {
        if let Err(e) = result {
            tracing::error!(member = %handle.self_id(), error = %e, "Microphone failed");
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    // === Report ===
    for (i, (handle, clock)) in handles.iter().zip(&clocks).enumerate() {
        let snapshot = handle
            .snapshot()
            .await
            .with_context(|| format!("member {i} stopped early"))?;
        let direct = snapshot
            .links
            .iter()
            .filter(|l| l.transport_open)
            .count();
        let relay_frames = snapshot.relay_stats.map(|s| s.frames_sent).unwrap_or(0);
        let relay_played: u64 = snapshot.queues.iter().map(|q| q.played).sum();
        let relay_dropped: u64 = snapshot.queues.iter().map(|q| q.dropped).sum();
        tracing::info!(
            member = i,
            status = snapshot.status.label(),
            direct_links = direct,
            fallbacks = snapshot.fallbacks,
            relay_frames,
            relay_played,
            relay_dropped,
            output_buffers = clock.buffers(),
            output_samples = clock.samples(),
            "Final state"
        );
        if args.dump {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    for handle in &handles {
        handle.leave().await?;
        bus.detach(&handle.self_id());
    }
    tracing::info!(
        delivered = bus.delivered(),
        dropped = bus.dropped(),
        "Room closed"
    );

    Ok(())
}
