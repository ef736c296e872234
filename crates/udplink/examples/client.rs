//! Chatty client: connects, sends a line on each delivery method, prints
//! echoes.
//!
//! Run:
//! - cargo run -p udplink --example client -- 127.0.0.1:9050 secret

use std::{env, net::SocketAddr, time::Duration};

use udplink::{Config, DeliveryMethod, Event, Manager};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let server: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:9050".into())
        .parse()?;
    let key = args.next().unwrap_or_default();

    let mut config = Config::default();
    config.enable_reliable_unordered = true;
    config.enable_simple = true;

    let mut client = Manager::new(config);
    client.start(0)?;
    client.connect(server, key.as_bytes());
    println!("connecting to {}", server);

    loop {
        client.run(Duration::from_millis(15));

        while let Some(event) = client.poll_event() {
            match event {
                Event::PeerConnected(peer) => {
                    println!("[connected] {}", peer.addr);
                    client.send(&peer, b"ordered hello", DeliveryMethod::ReliableOrdered, 0)?;
                    client.send(&peer, b"unordered hello", DeliveryMethod::ReliableUnordered, 0)?;
                    client.send(&peer, b"sequenced hello", DeliveryMethod::Sequenced, 0)?;
                    client.send(&peer, b"plain hello", DeliveryMethod::Unreliable, 0)?;
                }
                Event::Receive { payload, delivery, .. } => {
                    println!("[echo] {:?}: {}", delivery, String::from_utf8_lossy(&payload));
                }
                Event::PeerDisconnected { reason, .. } => {
                    println!("[disconnected] {:?}", reason);
                    return Ok(());
                }
                other => println!("[event] {:?}", other),
            }
        }
    }
}
