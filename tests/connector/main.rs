mod cid;
mod common;
mod data;
mod driver;
mod handshake;
mod retransmit;
