use dimpl_connector::Output;

use crate::common::*;

fn cid_pair(deprecated: bool) -> Pair {
    let mut pair = Pair::new(
        psk_client(|p| {
            p.connection_id_length = Some(4);
            p.use_deprecated_cid = deprecated;
        }),
        psk_server(|p| {
            p.connection_id_length = Some(6);
            p.use_deprecated_cid = deprecated;
        }),
    );
    pair.connect();
    assert_eq!(pair.client_connected(), Some(false));
    pair
}

fn client_datagram(pair: &Pair, data: &[u8]) -> Vec<u8> {
    let out = pair.client.send(pair.now, pair.server_addr, data.to_vec()).unwrap();
    let datagrams = transmits(&out);
    assert_eq!(datagrams.len(), 1);
    datagrams.into_iter().next().unwrap()
}

fn application_data(out: &[Output]) -> Vec<(std::net::SocketAddr, Vec<u8>)> {
    out.iter()
        .filter_map(|o| match o {
            Output::ApplicationData { peer, data } => Some((*peer, data.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn records_carry_connection_id() {
    let pair = cid_pair(false);
    let datagram = client_datagram(&pair, b"with cid");
    assert_eq!(datagram[0], CONTENT_TLS12_CID);

    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &datagram);
    assert_eq!(
        application_data(&out),
        vec![(pair.client_addr, b"with cid".to_vec())]
    );
}

#[test]
fn newer_record_moves_connection() {
    let pair = cid_pair(false);
    let moved = addr("10.0.0.99:41000");

    let datagram = client_datagram(&pair, b"after nat rebinding");
    let out = pair.server.handle_datagram(pair.now, moved, &datagram);
    assert_eq!(
        application_data(&out),
        vec![(moved, b"after nat rebinding".to_vec())]
    );

    assert!(pair.server.session(moved).is_some());
    assert!(pair.server.session(pair.client_addr).is_none());

    // Replies go to the new address.
    let out = pair.server.send(pair.now, moved, b"found you".to_vec()).unwrap();
    assert!(out
        .iter()
        .all(|o| matches!(o, Output::Transmit { peer, .. } if *peer == moved)));
}

#[test]
fn older_record_does_not_move_connection() {
    let pair = cid_pair(false);
    let second_addr = addr("10.0.0.50:42000");
    let third_addr = addr("10.0.0.51:43000");

    let older = client_datagram(&pair, b"older");
    let newer = client_datagram(&pair, b"newer");

    let out = pair.server.handle_datagram(pair.now, second_addr, &newer);
    assert_eq!(application_data(&out), vec![(second_addr, b"newer".to_vec())]);

    // Still inside the replay window, so delivered, but it must not redirect.
    let out = pair.server.handle_datagram(pair.now, third_addr, &older);
    assert_eq!(application_data(&out), vec![(second_addr, b"older".to_vec())]);

    assert!(pair.server.session(second_addr).is_some());
    assert!(pair.server.session(third_addr).is_none());
}

#[test]
fn address_updates_can_be_disabled() {
    let mut pair = Pair::new(
        psk_client(|p| p.connection_id_length = Some(4)),
        psk_server(|p| {
            p.connection_id_length = Some(4);
            p.update_address_using_cid_on_newer_records = false;
        }),
    );
    pair.connect();
    let moved = addr("10.0.0.99:41000");

    let datagram = client_datagram(&pair, b"stay");
    let out = pair.server.handle_datagram(pair.now, moved, &datagram);
    assert_eq!(application_data(&out), vec![(pair.client_addr, b"stay".to_vec())]);
    assert!(pair.server.session(pair.client_addr).is_some());
}

#[test]
fn deprecated_code_point() {
    let mut pair = cid_pair(true);
    pair.send_from_client(b"legacy");
    pair.send_from_server(b"legacy reply");

    assert_eq!(received(&pair.server_events), vec![b"legacy".to_vec()]);
    assert_eq!(received(&pair.client_events), vec![b"legacy reply".to_vec()]);
}

#[test]
fn unknown_connection_id_is_dropped() {
    let pair = cid_pair(false);
    let mut datagram = client_datagram(&pair, b"tampered");

    // Flip a byte of the connection id. No connection matches it.
    datagram[11] ^= 0xff;
    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &datagram);
    assert!(application_data(&out).is_empty());
}
