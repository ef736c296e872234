//! Simple echo server.
//!
//! Run:
//! - cargo run -p udplink --example server
//! - cargo run -p udplink --example server -- 9050 secret

use std::{env, time::Duration};

use udplink::{Config, DeliveryMethod, Event, Manager};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(9050);
    let key = args.next().unwrap_or_default();

    let mut config = Config::default();
    config.max_connections = 32;
    config.passcode_key = key;
    config.enable_reliable_unordered = true;
    config.enable_simple = true;

    let mut server = Manager::new(config);
    server.start(port)?;
    println!("echo server listening on {}", server.local_addr()?);

    loop {
        server.run(Duration::from_millis(15));

        while let Some(event) = server.poll_event() {
            match event {
                Event::PeerConnected(peer) => {
                    println!("[connect] {} (id {:x})", peer.addr, peer.connection_id);
                }
                Event::Receive { peer, delivery, channel, payload } => {
                    println!(
                        "[packet] from={} channel={} delivery={:?} len={}",
                        peer.addr,
                        channel,
                        delivery,
                        payload.len()
                    );
                    // Echo back with the same delivery method and channel.
                    if let Err(e) = server.send(&peer, &payload, delivery, channel) {
                        eprintln!("failed to queue echo: {}", e);
                    }
                }
                Event::PeerDisconnected { peer, reason, .. } => {
                    println!("[disconnect] {} ({:?})", peer.addr, reason);
                }
                Event::ConnectionRequest { addr, .. } => {
                    println!("[request] {}", addr);
                    server.accept_connection(addr);
                }
                Event::LatencyUpdated { peer, latency } => {
                    println!("[latency] {} {:?}", peer.addr, latency);
                }
                other => println!("[event] {:?}", other),
            }
        }
    }
}
