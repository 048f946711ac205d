use std::time::Duration;

use dimpl_connector::{CloseReason, HandshakeState, Output};

use crate::common::*;

fn has_epoch_1(datagram: &[u8]) -> bool {
    parse_records(datagram).iter().any(|r| r.epoch == 1)
}

/// A plaintext record with one handshake fragment starting at offset 0.
fn forged_handshake(record_seq: u64, msg_type: u8, message_seq: u16, length: u32, body: &[u8]) -> Vec<u8> {
    let mut fragment = vec![msg_type];
    fragment.extend_from_slice(&length.to_be_bytes()[1..]);
    fragment.extend_from_slice(&message_seq.to_be_bytes());
    fragment.extend_from_slice(&[0, 0, 0]);
    fragment.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    fragment.extend_from_slice(body);

    let mut record = vec![CONTENT_HANDSHAKE, 0xFE, 0xFD, 0, 0];
    record.extend_from_slice(&record_seq.to_be_bytes()[2..]);
    record.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
    record.extend_from_slice(&fragment);
    record
}

/// Run a PSK handshake up to the server's second flight, which is returned
/// undelivered.
fn until_server_flight(pair: &mut Pair) -> Vec<Vec<u8>> {
    let now = pair.now;
    let out = pair.client.connect(now, pair.server_addr).unwrap();
    let out = pair.server.handle_datagram(now, pair.client_addr, &transmits(&out)[0]);
    let out = pair.client.handle_datagram(now, pair.server_addr, &transmits(&out)[0]);
    let out = pair.server.handle_datagram(now, pair.client_addr, &transmits(&out)[0]);
    let flight = transmits(&out);
    assert_eq!(first_handshake_type(&flight[0]), Some(SERVER_HELLO));
    flight
}

/// Let 200 seconds pass without delivering anything. Returns how many
/// datagrams each side sent, client first.
fn silence(pair: &mut Pair) -> (usize, usize) {
    let (mut to_server, mut to_client) = (0, 0);
    for _ in 0..200 {
        pair.advance_filtered(Duration::from_secs(1), |direction, _| {
            match direction {
                Direction::ToServer => to_server += 1,
                Direction::ToClient => to_client += 1,
            }
            false
        });
    }
    (to_server, to_client)
}

#[test]
fn lost_server_flight_is_recovered() {
    let mut pair = Pair::psk();

    // Drop everything the server sends after the HelloVerifyRequest.
    let out = pair.client.connect(pair.now, pair.server_addr).unwrap();
    pair.pump_filtered(out, Direction::ToServer, |direction, datagram| {
        direction == Direction::ToServer || first_handshake_type(datagram) == Some(HELLO_VERIFY_REQUEST)
    });
    assert_eq!(pair.client_connected(), None);
    assert_eq!(
        pair.server.handshake_state(pair.client_addr),
        Some(HandshakeState::WaitFlight)
    );

    pair.advance(Duration::from_secs(2));

    assert_eq!(pair.client_connected(), Some(false));
    assert_eq!(pair.server_connected(), Some(false));
    assert!(pair.client.stats().retransmissions >= 1);
    assert_eq!(pair.server.stats().hello_verify_requests, 1);
}

#[test]
fn retransmissions_exhausted() {
    let mut pair = Pair::psk();
    let out = pair.client.connect(pair.now, pair.server_addr).unwrap();
    let mut hellos = transmits(&out).len();

    for _ in 0..70 {
        pair.advance_filtered(Duration::from_secs(1), |direction, _| {
            if direction == Direction::ToServer {
                hellos += 1;
            }
            false
        });
    }

    // The first transmission and four retransmissions.
    assert_eq!(hellos, 5);
    assert_eq!(
        closed(&pair.client_events),
        Some(CloseReason::RetransmissionsExhausted)
    );
    assert_eq!(pair.client.stats().connections, 0);
    assert_eq!(pair.client.stats().handshakes_failed, 1);
    assert_eq!(pair.client.poll_timeout(), None);
}

#[test]
fn lost_final_flight_is_resent() {
    let mut pair = Pair::psk();

    let out = pair.client.connect(pair.now, pair.server_addr).unwrap();
    pair.pump_filtered(out, Direction::ToServer, |direction, datagram| {
        !(direction == Direction::ToClient && has_epoch_1(datagram))
    });

    // The server is done, the client still waits for its Finished.
    assert_eq!(pair.server_connected(), Some(false));
    assert_eq!(pair.client_connected(), None);
    let resent_before = pair.server.stats().retransmissions;

    pair.advance(Duration::from_secs(2));

    assert_eq!(pair.client_connected(), Some(false));
    assert_eq!(pair.server.stats().retransmissions, resent_before + 1);

    pair.send_from_server(b"made it");
    assert_eq!(received(&pair.client_events), vec![b"made it".to_vec()]);
}

#[test]
fn back_off_splits_flight() {
    let mut pair = Pair::psk();
    let now = pair.now;

    let out = pair.client.connect(now, pair.server_addr).unwrap();
    let out = pair.server.handle_datagram(now, pair.client_addr, &transmits(&out)[0]);
    let out = pair.client.handle_datagram(now, pair.server_addr, &transmits(&out)[0]);
    let out = pair.server.handle_datagram(now, pair.client_addr, &transmits(&out)[0]);

    // ServerHello and ServerHelloDone share one datagram.
    let flight = transmits(&out);
    assert_eq!(flight.len(), 1);
    assert_eq!(first_handshake_type(&flight[0]), Some(SERVER_HELLO));
    assert!(parse_records(&flight[0]).len() >= 2);

    let mut sizes = Vec::new();
    for _ in 0..2 {
        let at = pair.server.poll_timeout().unwrap();
        let out = pair.server.handle_timeout(at);
        sizes.push(transmits(&out).len());
    }

    // The first retransmission is packed like the first transmission, from the second
    // on every record travels alone.
    assert_eq!(sizes[0], 1);
    assert!(sizes[1] >= 2, "{:?}", sizes);
    let out = pair.server.handle_timeout(pair.server.poll_timeout().unwrap());
    assert!(transmits(&out).iter().all(|d| parse_records(d).len() == 1));
    assert_eq!(
        pair.server.handshake_state(pair.client_addr),
        Some(HandshakeState::Retransmit)
    );
}

#[test]
fn timers_are_rescheduled_not_duplicated() {
    let mut pair = Pair::psk();
    let out = pair.client.connect(pair.now, pair.server_addr).unwrap();
    let first = pair.client.poll_timeout().unwrap();

    // The HelloVerifyRequest restarts the flight timer.
    pair.now += Duration::from_millis(500);
    let hello = transmits(&out);
    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &hello[0]);
    let out = pair.client.handle_datagram(pair.now, pair.server_addr, &transmits(&out)[0]);
    assert_eq!(transmits(&out).len(), 1);

    // The stale entry of the first flight does nothing.
    assert!(pair.client.handle_timeout(first).is_empty());
    assert_eq!(pair.client.stats().retransmissions, 0);

    let second = pair.client.poll_timeout().unwrap();
    assert_eq!(second, first + Duration::from_millis(500));

    let out = pair.client.handle_timeout(second);
    assert_eq!(transmits(&out).len(), 1);
    assert_eq!(pair.client.stats().retransmissions, 1);
}

#[test]
fn bad_client_key_exchange_keeps_server_retransmitting() {
    // A complete message that does not parse, and the start of one that never completes.
    for length in [3, 40] {
        let mut pair = Pair::psk();
        until_server_flight(&mut pair);

        let forged = forged_handshake(50, CLIENT_KEY_EXCHANGE, 2, length, &[0xff; 3]);
        let out = pair.server.handle_datagram(pair.now, pair.client_addr, &forged);
        assert!(transmits(&out).is_empty());
        assert_eq!(
            pair.server.handshake_state(pair.client_addr),
            Some(HandshakeState::WaitFlight)
        );

        let (_, to_client) = silence(&mut pair);
        assert!(to_client >= 4, "length {}: {} datagrams", length, to_client);
        assert_eq!(pair.server.stats().retransmissions, 4);
        assert_eq!(
            closed(&pair.server_events),
            Some(CloseReason::RetransmissionsExhausted)
        );
        assert_eq!(pair.server.stats().connections, 0);
    }
}

#[test]
fn bad_server_hello_keeps_client_retransmitting() {
    for length in [3, 40] {
        let mut pair = Pair::psk();
        until_server_flight(&mut pair);

        let forged = forged_handshake(50, SERVER_HELLO, 1, length, &[0xff; 3]);
        let out = pair.client.handle_datagram(pair.now, pair.server_addr, &forged);
        assert!(transmits(&out).is_empty());

        // Only the second ClientHello goes out again.
        let (to_server, _) = silence(&mut pair);
        assert_eq!(to_server, 4, "length {}", length);
        assert_eq!(
            closed(&pair.client_events),
            Some(CloseReason::RetransmissionsExhausted)
        );
        assert_eq!(pair.client.stats().connections, 0);
    }
}

#[test]
fn out_of_order_plaintext_message_is_dropped() {
    let mut pair = Pair::psk();
    let flight = until_server_flight(&mut pair);

    // A Finished in plaintext where the ClientKeyExchange belongs.
    let forged = forged_handshake(50, 20, 2, 12, &[0; 12]);
    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &forged);
    assert!(out.is_empty());
    assert_eq!(
        pair.server.handshake_state(pair.client_addr),
        Some(HandshakeState::WaitFlight)
    );

    let out = flight
        .into_iter()
        .map(|datagram| Output::Transmit {
            peer: pair.client_addr,
            datagram,
        })
        .collect();
    pair.pump(out, Direction::ToClient);
    assert_eq!(pair.client_connected(), Some(false));
    assert_eq!(pair.server_connected(), Some(false));
}
