//! Runs a [`Connector`] on a tokio UDP socket.
//!
//! Receiver tasks read datagrams and hand each to one worker, chosen by the
//! peer address so one peer is always served by the same worker. A single
//! timer task sleeps until the connector's next deadline. Outputs other than
//! datagrams go to the application channel returned by [`Driver::spawn`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::connector::Connector;
use crate::error::Error;
use crate::event::Output;

/// Datagrams queued per worker before new ones are dropped.
const WORKER_QUEUE: usize = 1024;

/// Outputs queued for the application.
const APPLICATION_QUEUE: usize = 1024;

const MAX_DATAGRAM: usize = 65535;

struct Shared {
    connector: Arc<Connector>,
    socket: Arc<UdpSocket>,
    app_tx: mpsc::Sender<Output>,
    /// Wakes the timer task when a deadline may have moved closer.
    timers_changed: Notify,
}

impl Shared {
    async fn dispatch(&self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Transmit { peer, datagram } => {
                    if let Err(e) = self.socket.send_to(&datagram, peer).await {
                        debug!("Send to {} failed: {}", peer, e);
                    }
                }
                other => {
                    if self.app_tx.send(other).await.is_err() {
                        trace!("Application channel closed");
                    }
                }
            }
        }
        self.timers_changed.notify_one();
    }
}

/// Background tasks serving one connector. Dropping the driver stops them.
pub struct Driver {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Driver {
    /// Spawn receivers, workers and the timer task on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(connector: Arc<Connector>, socket: Arc<UdpSocket>) -> (Driver, mpsc::Receiver<Output>) {
        let (app_tx, app_rx) = mpsc::channel(APPLICATION_QUEUE);
        let config = connector.config().clone();
        let shared = Arc::new(Shared {
            connector,
            socket,
            app_tx,
            timers_changed: Notify::new(),
        });

        let mut tasks = Vec::new();

        let worker_count = config.worker_count().max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            workers.push(tx);
            tasks.push(tokio::spawn(worker(index, shared.clone(), rx)));
        }
        let workers: Arc<[mpsc::Sender<(SocketAddr, Vec<u8>)>]> = workers.into();

        for index in 0..config.receiver_count().max(1) {
            tasks.push(tokio::spawn(receiver(index, shared.clone(), workers.clone())));
        }

        tasks.push(tokio::spawn(timer(shared.clone())));

        debug!(
            "Driver started with {} receivers and {} workers",
            config.receiver_count().max(1),
            worker_count
        );

        (Driver { shared, tasks }, app_rx)
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.shared.connector
    }

    pub async fn connect(&self, peer: SocketAddr) -> Result<(), Error> {
        let outputs = self.shared.connector.connect(Instant::now(), peer)?;
        self.shared.dispatch(outputs).await;
        Ok(())
    }

    pub async fn send(&self, peer: SocketAddr, data: Vec<u8>) -> Result<(), Error> {
        let outputs = self.shared.connector.send(Instant::now(), peer, data)?;
        self.shared.dispatch(outputs).await;
        Ok(())
    }

    pub async fn close(&self, peer: SocketAddr) -> Result<(), Error> {
        let outputs = self.shared.connector.close(Instant::now(), peer)?;
        self.shared.dispatch(outputs).await;
        Ok(())
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn worker_for(peer: &SocketAddr, count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    peer.hash(&mut hasher);
    (hasher.finish() % count as u64) as usize
}

async fn receiver(index: usize, shared: Arc<Shared>, workers: Arc<[mpsc::Sender<(SocketAddr, Vec<u8>)>]>) {
    let mut buf = vec![0; MAX_DATAGRAM];
    loop {
        let (len, peer) = match shared.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                // ICMP errors surface here on some platforms, keep receiving.
                debug!("Receiver {}: {}", index, e);
                continue;
            }
        };
        let worker = &workers[worker_for(&peer, workers.len())];
        match worker.try_send((peer, buf[..len].to_vec())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Worker queue full, drop datagram from {}", peer);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

async fn worker(index: usize, shared: Arc<Shared>, mut rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>) {
    while let Some((peer, datagram)) = rx.recv().await {
        let outputs = shared.connector.handle_datagram(Instant::now(), peer, &datagram);
        shared.dispatch(outputs).await;
    }
    trace!("Worker {} stopped", index);
}

async fn timer(shared: Arc<Shared>) {
    loop {
        match shared.connector.poll_timeout() {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                    _ = shared.timers_changed.notified() => continue,
                }
            }
            None => {
                shared.timers_changed.notified().await;
                continue;
            }
        }
        let outputs = shared.connector.handle_timeout(Instant::now());
        shared.dispatch(outputs).await;
    }
}
