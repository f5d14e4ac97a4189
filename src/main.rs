use gossipkv::node::service::GossipNode;
use gossipkv::node::types::{GossipConfig, GossipEvent};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --bind <addr:port> [options]", args[0]);
        eprintln!("Options:");
        eprintln!("  --seed <addr:port>     seed peer, repeatable");
        eprintln!("  --network <key>        shared key enabling wire encryption");
        eprintln!("  --interval <ms>        gossip and heartbeat interval");
        eprintln!("  --no-udp               disable the datagram channel");
        eprintln!("Example: {} --bind 127.0.0.1:9001", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:9002 --seed 127.0.0.1:9001",
            args[0]
        );
        std::process::exit(1);
    }

    let mut config = GossipConfig::default();
    let mut bind: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind = Some(args[i + 1].clone());
                i += 2;
            }
            "--seed" => {
                config.seeds.push(args[i + 1].clone());
                i += 2;
            }
            "--network" => {
                config.network_key = Some(args[i + 1].clone());
                i += 2;
            }
            "--interval" => {
                let ms: u64 = args[i + 1].parse()?;
                config.gossip_interval = Duration::from_millis(ms);
                config.heartbeat_interval = Duration::from_millis(ms);
                i += 2;
            }
            "--no-udp" => {
                config.udp = false;
                i += 1;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind = bind.expect("--bind is required");
    let (address, port) = gossipkv::state::types::parse_peer_name(&bind)?;
    config.address = address;
    config.port = port;

    let node = GossipNode::new(config)?;
    tracing::info!("Starting node {}", node.peer_name());

    // Log everything the node observes.
    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(GossipEvent::PeerNew { peer }) => tracing::info!("peer:new {}", peer),
                Ok(GossipEvent::PeerAlive { peer }) => tracing::info!("peer:start {}", peer),
                Ok(GossipEvent::PeerFailed { peer }) => tracing::info!("peer:stop {}", peer),
                Ok(GossipEvent::Expire { peer, key, .. }) => {
                    tracing::info!("key:expire {} on {}", key, peer)
                }
                Ok(GossipEvent::Set { peer, key, value, .. }) => {
                    tracing::info!("set {} = {} (from {})", key, value, peer)
                }
                Ok(GossipEvent::Say { event, value, peer }) => {
                    tracing::info!("say:{} {} (from {})", event, value, peer)
                }
                Ok(GossipEvent::Start) => tracing::info!("started"),
                Ok(GossipEvent::Stop) | Err(_) => break,
            }
        }
    });

    node.start().await?;

    // Periodic cluster stats, alongside the gossip traffic.
    let stats = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            tracing::info!(
                "Known peers: {} ({} live, {} dead)",
                stats.known_peers().len(),
                stats.live_peers().len(),
                stats.dead_peers().len()
            );
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    node.stop();

    Ok(())
}
