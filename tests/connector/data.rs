use dimpl_connector::{CloseReason, Error, Output};

use crate::common::*;

#[test]
fn application_data_both_ways() {
    let mut pair = Pair::psk();
    pair.connect();

    pair.send_from_client(b"ping");
    pair.send_from_server(b"pong");
    pair.send_from_client(b"ping again");

    assert_eq!(
        received(&pair.server_events),
        vec![b"ping".to_vec(), b"ping again".to_vec()]
    );
    assert_eq!(received(&pair.client_events), vec![b"pong".to_vec()]);

    let last = pair.delivered.last().unwrap();
    assert_eq!(last.0, Direction::ToServer);
    assert_eq!(parse_records(&last.1)[0].ctype, CONTENT_APPLICATION_DATA);
    assert_eq!(parse_records(&last.1)[0].epoch, 1);
}

#[test]
fn data_before_handshake_is_deferred() {
    let mut pair = Pair::psk();

    // Sending to an unknown server connects first.
    let out = pair
        .client
        .send(pair.now, pair.server_addr, b"early".to_vec())
        .unwrap();
    let datagrams = transmits(&out);
    assert_eq!(datagrams.len(), 1);
    assert_eq!(first_handshake_type(&datagrams[0]), Some(CLIENT_HELLO));

    let more = pair
        .client
        .send(pair.now, pair.server_addr, b"also early".to_vec())
        .unwrap();
    assert!(transmits(&more).is_empty());

    pair.pump(out, Direction::ToServer);

    assert_eq!(pair.client_connected(), Some(false));
    assert_eq!(
        received(&pair.server_events),
        vec![b"early".to_vec(), b"also early".to_vec()]
    );
}

#[test]
fn deferred_overflow_drops_oldest() {
    let mut pair = Pair::new(
        psk_client(|p| p.max_deferred_outbound_messages = 2),
        psk_server(|_| {}),
    );

    let out = pair
        .client
        .send(pair.now, pair.server_addr, b"one".to_vec())
        .unwrap();
    pair.client
        .send(pair.now, pair.server_addr, b"two".to_vec())
        .unwrap();
    let overflow = pair
        .client
        .send(pair.now, pair.server_addr, b"three".to_vec())
        .unwrap();

    assert_eq!(
        overflow,
        vec![Output::DeferredDropped {
            peer: pair.server_addr,
            data: b"one".to_vec()
        }]
    );
    assert_eq!(pair.client.stats().deferred_dropped, 1);

    pair.pump(out, Direction::ToServer);
    assert_eq!(
        received(&pair.server_events),
        vec![b"two".to_vec(), b"three".to_vec()]
    );
}

#[test]
fn close_notifies_peer() {
    let mut pair = Pair::psk();
    pair.connect();

    let out = pair.client.close(pair.now, pair.server_addr).unwrap();
    assert_eq!(transmits(&out).len(), 1);
    pair.pump(out, Direction::ToServer);

    assert_eq!(closed(&pair.client_events), Some(CloseReason::LocalClose));
    assert_eq!(closed(&pair.server_events), Some(CloseReason::PeerClosed));
    assert_eq!(pair.client.stats().connections, 0);
    assert_eq!(pair.server.stats().connections, 0);

    assert!(matches!(
        pair.client.close(pair.now, pair.server_addr),
        Err(Error::UnknownPeer)
    ));
}

#[test]
fn server_cannot_send_to_unknown_peer() {
    let pair = Pair::psk();
    assert!(matches!(
        pair.server.send(pair.now, pair.client_addr, b"hello?".to_vec()),
        Err(Error::NotConnected)
    ));
}

#[test]
fn oversized_message_is_refused() {
    let mut pair = Pair::psk();
    pair.connect();

    let big = vec![0x55; 2000];
    assert!(matches!(
        pair.client.send(pair.now, pair.server_addr, big),
        Err(Error::MessageTooLarge(2000))
    ));

    // Smaller messages still pass.
    pair.send_from_client(&[0x55; 1000]);
    assert_eq!(received(&pair.server_events).len(), 1);
}

#[test]
fn record_size_limit_applies_per_direction() {
    let mut pair = Pair::new(
        psk_client(|p| p.record_size_limit = Some(512)),
        psk_server(|p| p.record_size_limit = Some(256)),
    );
    pair.connect();

    let client_session = pair.client.session(pair.server_addr).unwrap();
    let server_session = pair.server.session(pair.client_addr).unwrap();
    assert_eq!(client_session.peer_record_size_limit(), Some(256));
    assert_eq!(server_session.peer_record_size_limit(), Some(512));

    assert!(matches!(
        pair.client.send(pair.now, pair.server_addr, vec![1; 300]),
        Err(Error::MessageTooLarge(300))
    ));
    pair.send_from_client(&[1; 200]);
    pair.send_from_server(&[2; 400]);

    assert_eq!(received(&pair.server_events), vec![vec![1; 200]]);
    assert_eq!(received(&pair.client_events), vec![vec![2; 400]]);
}

#[test]
fn record_size_limit_needs_both_sides() {
    let mut pair = Pair::new(
        psk_client(|p| p.record_size_limit = Some(512)),
        psk_server(|_| {}),
    );
    pair.connect();

    let client_session = pair.client.session(pair.server_addr).unwrap();
    assert_eq!(client_session.peer_record_size_limit(), None);
}

#[test]
fn replayed_record_is_dropped() {
    let mut pair = Pair::psk();
    pair.connect();
    pair.send_from_client(b"only once");

    let (direction, datagram) = pair.delivered.last().cloned().unwrap();
    assert_eq!(direction, Direction::ToServer);

    let dropped_before = pair.server.stats().records_dropped;
    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &datagram);
    assert!(out.is_empty());
    assert_eq!(pair.server.stats().records_dropped, dropped_before + 1);
    assert_eq!(received(&pair.server_events).len(), 1);
}

#[test]
fn replay_filter_can_be_disabled() {
    let mut pair = Pair::new(
        psk_client(|_| {}),
        psk_server(|p| p.use_anti_replay_filter = false),
    );
    pair.connect();
    pair.send_from_client(b"twice");

    let (_, datagram) = pair.delivered.last().cloned().unwrap();
    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &datagram);
    assert_eq!(received(&out), vec![b"twice".to_vec()]);
}

#[test]
fn early_data_waits_for_abbreviated_handshake() {
    let mut pair = Pair::psk();
    pair.connect();

    // Resume, and queue data while the handshake runs.
    let out = pair.client.connect(pair.now, pair.server_addr).unwrap();
    pair.client
        .send(pair.now, pair.server_addr, b"resumed data".to_vec())
        .unwrap();

    // Hold back the client's ChangeCipherSpec and Finished, so its data
    // overtakes them.
    let mut held = Vec::new();
    pair.pump_filtered(out, Direction::ToServer, |direction, datagram| {
        let finishing = direction == Direction::ToServer
            && parse_records(datagram).iter().any(|r| r.ctype == 20);
        if finishing {
            held.push(datagram.to_vec());
        }
        !finishing
    });
    assert_eq!(pair.client_connected(), Some(true));
    assert_eq!(held.len(), 1);
    assert!(received(&pair.server_events).is_empty());

    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &held[0]);
    let connected = out
        .iter()
        .position(|o| matches!(o, Output::Connected { resumed: true, .. }));
    let data = out
        .iter()
        .position(|o| matches!(o, Output::ApplicationData { .. }));
    assert!(connected.is_some());
    assert!(data > connected, "{:?}", out);
    assert_eq!(received(&out), vec![b"resumed data".to_vec()]);
}
