use std::sync::Arc;
use std::time::Duration;

use dimpl_connector::{Driver, Output};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::common::*;

async fn next_output(rx: &mut mpsc::Receiver<Output>, want: impl Fn(&Output) -> bool) -> Output {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let output = rx.recv().await.expect("driver stopped");
            if want(&output) {
                return output;
            }
        }
    })
    .await
    .expect("timed out waiting for output")
}

#[tokio::test]
async fn handshake_and_data_over_udp() {
    init_log();

    let client_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let server_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let server_addr = server_socket.local_addr().unwrap();
    let client_addr = client_socket.local_addr().unwrap();

    let client = Arc::new(connector(psk_client(|p| p.worker_count = 2)));
    let server = Arc::new(connector(psk_server(|p| p.worker_count = 2)));

    let (client_driver, mut client_rx) = Driver::spawn(client, client_socket);
    let (server_driver, mut server_rx) = Driver::spawn(server, server_socket);

    client_driver.connect(server_addr).await.unwrap();

    let connected = next_output(&mut client_rx, |o| matches!(o, Output::Connected { .. })).await;
    assert_eq!(connected.peer(), server_addr);
    let connected = next_output(&mut server_rx, |o| matches!(o, Output::Connected { .. })).await;
    assert_eq!(connected.peer(), client_addr);

    client_driver.send(server_addr, b"over udp".to_vec()).await.unwrap();
    let data = next_output(&mut server_rx, |o| matches!(o, Output::ApplicationData { .. })).await;
    assert_eq!(
        data,
        Output::ApplicationData {
            peer: client_addr,
            data: b"over udp".to_vec()
        }
    );

    server_driver.send(client_addr, b"and back".to_vec()).await.unwrap();
    let data = next_output(&mut client_rx, |o| matches!(o, Output::ApplicationData { .. })).await;
    assert_eq!(data.peer(), server_addr);

    client_driver.close(server_addr).await.unwrap();
    next_output(&mut server_rx, |o| matches!(o, Output::Closed { .. })).await;
    assert_eq!(server_driver.connector().stats().connections, 0);
}
