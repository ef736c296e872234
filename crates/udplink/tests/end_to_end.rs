//! End-to-end loopback tests driving real sockets through the public API.

use std::{
    net::SocketAddr,
    thread,
    time::{Duration, Instant},
};

use udplink::{Config, DeliveryMethod, DisconnectReason, Event, Manager, RemotePeer};

fn base_config() -> Config {
    let mut config = Config::default();
    config.enable_reliable_unordered = true;
    config.enable_simple = true;
    config.reconnect_delay = Duration::from_millis(50);
    config
}

fn poll_all(managers: &mut [&mut Manager]) {
    for manager in managers.iter_mut() {
        manager.manual_poll(Instant::now());
    }
    thread::sleep(Duration::from_millis(5));
}

/// Connects `client` to `server` (which uses `key` as its passcode) and
/// returns both handles once each side reports the connection.
fn establish(server: &mut Manager, client: &mut Manager, key: &[u8]) -> (RemotePeer, RemotePeer) {
    let server_addr = server.local_addr().unwrap();
    client.connect(server_addr, key).expect("connect accepted");

    let mut server_side = None;
    let mut client_side = None;
    for _ in 0..100 {
        poll_all(&mut [&mut *server, &mut *client]);
        while let Some(event) = server.poll_event() {
            if let Event::PeerConnected(peer) = event {
                server_side = Some(peer);
            }
        }
        while let Some(event) = client.poll_event() {
            if let Event::PeerConnected(peer) = event {
                client_side = Some(peer);
            }
        }
        if server_side.is_some() && client_side.is_some() {
            break;
        }
    }
    (
        server_side.expect("server saw the connection"),
        client_side.expect("client saw the connection"),
    )
}

#[test]
fn ipv4_connect_with_passcode() {
    let mut server_config = base_config();
    server_config.max_connections = 1;
    server_config.passcode_key = "k".into();
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();

    let mut client = Manager::new(base_config());
    client.start(0).unwrap();

    establish(&mut server, &mut client, b"k");
    assert_eq!(server.peers_count(), 1);
    assert_eq!(client.peers_count(), 1);
}

#[test]
fn wrong_passcode_fails_the_handshake() {
    let mut server_config = base_config();
    server_config.passcode_key = "secret".into();
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut client_config = base_config();
    client_config.max_connect_attempts = 3;
    let mut client = Manager::new(client_config);
    client.start(0).unwrap();
    client.connect(server_addr, b"wrong").unwrap();

    let mut failed = false;
    for _ in 0..100 {
        poll_all(&mut [&mut server, &mut client]);
        while let Some(event) = client.poll_event() {
            if let Event::PeerDisconnected { reason, .. } = event {
                assert_eq!(reason, DisconnectReason::ConnectionFailed);
                failed = true;
            }
        }
        if failed {
            break;
        }
    }
    assert!(failed, "client must give up after max connect attempts");
    assert_eq!(server.peers_count(), 0);
}

#[test]
fn explicit_accept_flow_without_passcode() {
    let mut server = Manager::new(base_config());
    server.start(0).unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut client = Manager::new(base_config());
    client.start(0).unwrap();
    client.connect(server_addr, b"hello-key").unwrap();

    let mut connected = false;
    for _ in 0..100 {
        poll_all(&mut [&mut server, &mut client]);
        while let Some(event) = server.poll_event() {
            if let Event::ConnectionRequest { addr, key, .. } = event {
                assert_eq!(key, b"hello-key");
                server.accept_connection(addr);
            }
        }
        while let Some(event) = client.poll_event() {
            if matches!(event, Event::PeerConnected(_)) {
                connected = true;
            }
        }
        if connected {
            break;
        }
    }
    assert!(connected);
    assert_eq!(server.peers_count(), 1);
}

#[test]
fn disconnect_carries_additional_payload() {
    let mut server_config = base_config();
    server_config.passcode_key = "k".into();
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();
    let mut client = Manager::new(base_config());
    client.start(0).unwrap();

    let (server_peer, _) = establish(&mut server, &mut client, b"k");
    server.disconnect_peer(&server_peer, &[1, 2, 3, 4]);

    let mut closed = false;
    for _ in 0..100 {
        poll_all(&mut [&mut server, &mut client]);
        while let Some(event) = client.poll_event() {
            if let Event::PeerDisconnected { reason, data, .. } = event {
                assert_eq!(reason, DisconnectReason::RemoteConnectionClose);
                assert_eq!(data, vec![1, 2, 3, 4]);
                closed = true;
            }
        }
        if closed {
            break;
        }
    }
    assert!(closed);
    assert_eq!(client.peers_count(), 0);
}

#[test]
fn ipv6_connect() {
    let mut server_config = base_config();
    server_config.enable_ipv6 = true;
    server_config.passcode_key = "k".into();
    let mut server = Manager::new(server_config);
    if server.start(0).is_err() {
        // Host without IPv6 support.
        return;
    }
    let port = server.local_addr().unwrap().port();

    let mut client_config = base_config();
    client_config.enable_ipv6 = true;
    let mut client = Manager::new(client_config);
    client.start(0).unwrap();

    let server_addr: SocketAddr = format!("[::1]:{}", port).parse().unwrap();
    client.connect(server_addr, b"k").unwrap();
    let mut connected = false;
    for _ in 0..100 {
        poll_all(&mut [&mut server, &mut client]);
        while let Some(event) = client.poll_event() {
            if matches!(event, Event::PeerConnected(_)) {
                connected = true;
            }
        }
        if connected {
            break;
        }
    }
    assert!(connected);
    assert_eq!(server.peers_count(), 1);
}

#[test]
fn discovery_fan_out_then_connect() {
    let mut server_config = base_config();
    server_config.discovery_enabled = true;
    server_config.passcode_key = "k".into();
    server_config.max_connections = 16;
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut clients: Vec<Manager> = (0..10)
        .map(|_| {
            let mut config = base_config();
            config.discovery_enabled = true;
            let mut client = Manager::new(config);
            client.start(0).unwrap();
            client.send_discovery_request_to(server_addr, b"anyone?").unwrap();
            client
        })
        .collect();

    for _ in 0..200 {
        server.manual_poll(Instant::now());
        while let Some(event) = server.poll_event() {
            if let Event::ReceiveUnconnected { addr, kind, payload } = event {
                assert_eq!(kind, udplink::UnconnectedKind::DiscoveryRequest);
                assert_eq!(payload, b"anyone?");
                server.send_discovery_response(addr, b"over here").unwrap();
            }
        }
        for client in clients.iter_mut() {
            client.manual_poll(Instant::now());
            while let Some(event) = client.poll_event() {
                if let Event::ReceiveUnconnected { addr, kind, .. } = event {
                    assert_eq!(kind, udplink::UnconnectedKind::DiscoveryResponse);
                    client.connect(addr, b"k");
                }
            }
        }
        if server.peers_count() == 10
            && clients.iter().all(|client| client.peers_count() == 1)
        {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(server.peers_count(), 10);
    for client in &clients {
        assert_eq!(client.peers_count(), 1);
    }
}

#[test]
fn broadcast_reaches_every_client_exactly_once() {
    let mut server_config = base_config();
    server_config.passcode_key = "k".into();
    server_config.max_connections = 16;
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();

    let mut clients: Vec<Manager> = (0..10)
        .map(|_| {
            let mut client = Manager::new(base_config());
            client.start(0).unwrap();
            client
        })
        .collect();
    for client in clients.iter_mut() {
        establish(&mut server, client, b"k");
    }
    assert_eq!(server.peers_count(), 10);

    server.send_to_all(b"TextForTest", DeliveryMethod::ReliableUnordered, 0, None);

    let mut received = vec![0usize; clients.len()];
    for _ in 0..200 {
        server.manual_poll(Instant::now());
        for (i, client) in clients.iter_mut().enumerate() {
            client.manual_poll(Instant::now());
            while let Some(event) = client.poll_event() {
                if let Event::Receive { payload, delivery, .. } = event {
                    assert_eq!(payload, b"TextForTest");
                    assert_eq!(delivery, DeliveryMethod::ReliableUnordered);
                    received[i] += 1;
                }
            }
        }
        if received.iter().all(|&count| count >= 1) {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    // A few extra ticks to catch any duplicate deliveries.
    for _ in 0..20 {
        server.manual_poll(Instant::now());
        for (i, client) in clients.iter_mut().enumerate() {
            client.manual_poll(Instant::now());
            while let Some(event) = client.poll_event() {
                if matches!(event, Event::Receive { .. }) {
                    received[i] += 1;
                }
            }
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(received, vec![1; clients.len()]);
}

#[test]
fn fragmented_reliable_ordered_round_trip() {
    let mut server_config = base_config();
    server_config.passcode_key = "k".into();
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();
    let mut client = Manager::new(base_config());
    client.start(0).unwrap();

    let (_, client_peer) = establish(&mut server, &mut client, b"k");

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    client
        .send(&client_peer, &payload, DeliveryMethod::ReliableOrdered, 3)
        .unwrap();

    let mut received = None;
    for _ in 0..400 {
        poll_all(&mut [&mut server, &mut client]);
        while let Some(event) = server.poll_event() {
            if let Event::Receive { payload, channel, delivery, .. } = event {
                assert_eq!(channel, 3);
                assert_eq!(delivery, DeliveryMethod::ReliableOrdered);
                received = Some(payload);
            }
        }
        if received.is_some() {
            break;
        }
    }
    assert_eq!(received.expect("payload reassembled"), payload);
}

#[test]
fn reliable_ordered_preserves_send_order() {
    let mut server_config = base_config();
    server_config.passcode_key = "k".into();
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();
    let mut client = Manager::new(base_config());
    client.start(0).unwrap();

    let (_, client_peer) = establish(&mut server, &mut client, b"k");

    let count = 50u8;
    for i in 0..count {
        client
            .send(&client_peer, &[i], DeliveryMethod::ReliableOrdered, 0)
            .unwrap();
    }

    let mut surfaced = Vec::new();
    for _ in 0..200 {
        poll_all(&mut [&mut server, &mut client]);
        while let Some(event) = server.poll_event() {
            if let Event::Receive { payload, .. } = event {
                surfaced.extend(payload);
            }
        }
        if surfaced.len() >= count as usize {
            break;
        }
    }
    let expected: Vec<u8> = (0..count).collect();
    assert_eq!(surfaced, expected);
}

#[test]
fn idle_peer_times_out() {
    let mut server_config = base_config();
    server_config.passcode_key = "k".into();
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();

    let mut client_config = base_config();
    client_config.disconnect_timeout = Duration::from_millis(300);
    client_config.ping_interval = Duration::from_millis(100);
    let mut client = Manager::new(client_config);
    client.start(0).unwrap();

    establish(&mut server, &mut client, b"k");

    // The server goes silent (alive but never polled); the client must
    // notice within the timeout. Closing the socket instead would surface
    // ICMP-driven send errors rather than a timeout.
    let mut timed_out = false;
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        client.manual_poll(Instant::now());
        while let Some(event) = client.poll_event() {
            if let Event::PeerDisconnected { reason, .. } = event {
                assert_eq!(reason, DisconnectReason::Timeout);
                timed_out = true;
            }
        }
        if timed_out {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(timed_out);
    assert_eq!(client.peers_count(), 0);
}

#[test]
fn unconnected_messages_round_trip() {
    let mut config_a = base_config();
    config_a.unconnected_messages_enabled = true;
    let mut a = Manager::new(config_a);
    a.start(0).unwrap();

    let mut config_b = base_config();
    config_b.unconnected_messages_enabled = true;
    let mut b = Manager::new(config_b);
    b.start(0).unwrap();
    let b_addr = b.local_addr().unwrap();

    a.send_unconnected_message(b_addr, b"no handshake needed").unwrap();

    let mut seen = false;
    for _ in 0..100 {
        poll_all(&mut [&mut a, &mut b]);
        while let Some(event) = b.poll_event() {
            if let Event::ReceiveUnconnected { kind, payload, .. } = event {
                assert_eq!(kind, udplink::UnconnectedKind::Basic);
                assert_eq!(payload, b"no handshake needed");
                seen = true;
            }
        }
        if seen {
            break;
        }
    }
    assert!(seen);
}

#[test]
fn latency_events_flow_after_connect() {
    let mut server_config = base_config();
    server_config.passcode_key = "k".into();
    server_config.ping_interval = Duration::from_millis(50);
    let mut server = Manager::new(server_config);
    server.start(0).unwrap();

    let mut client_config = base_config();
    client_config.ping_interval = Duration::from_millis(50);
    let mut client = Manager::new(client_config);
    client.start(0).unwrap();

    establish(&mut server, &mut client, b"k");

    let mut updated = false;
    for _ in 0..200 {
        poll_all(&mut [&mut server, &mut client]);
        while let Some(event) = client.poll_event() {
            if matches!(event, Event::LatencyUpdated { .. }) {
                updated = true;
            }
        }
        if updated {
            break;
        }
    }
    assert!(updated, "ping/pong must produce latency updates");
}

#[test]
fn delivery_on_disabled_channel_is_rejected() {
    let mut config = base_config();
    config.enable_simple = false;
    config.passcode_key = "k".into();
    let mut server = Manager::new(config.clone());
    server.start(0).unwrap();
    let mut client = Manager::new(config);
    client.start(0).unwrap();

    let (_, client_peer) = establish(&mut server, &mut client, b"k");
    let result = client.send(&client_peer, b"x", DeliveryMethod::Unreliable, 0);
    assert!(matches!(result, Err(udplink::ErrorKind::UnsupportedDelivery)));
}
