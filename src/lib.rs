pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod gateway;
pub mod packetizer;
pub mod stream;
pub mod streamer;
pub mod tls;
