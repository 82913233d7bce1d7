use std::{
	net::{Ipv4Addr, SocketAddr, SocketAddrV4},
	sync::{atomic::{AtomicBool, AtomicU32, Ordering}, Mutex, OnceLock},
	time::Duration,
};

use crypto_secretbox::{aead::{Aead, KeyInit}, Key, Nonce, XSalsa20Poly1305};
use tokio::net::UdpSocket;

use crate::{error::StreamError, packetizer::PacketSealer};

/// Size of the IP discovery request and reply.
pub const DISCOVERY_PACKET_SIZE: usize = 74;

const DISCOVERY_REQUEST: u16 = 1;
const DISCOVERY_REPLY: u16 = 2;

/// Offset of the NUL terminated address in a discovery reply.
const DISCOVERY_ADDRESS_OFFSET: usize = 8;

const NONCE_SIZE: usize = 24;
pub const SECRET_KEY_SIZE: usize = 32;

/// Synchronization sources assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ssrcs {
	pub audio: u32,
	pub video: u32,
	pub rtx: u32,
}

impl Ssrcs {
	pub fn from_audio(ssrc: u32) -> Self {
		Self {
			audio: ssrc,
			video: ssrc.wrapping_add(1),
			rtx: ssrc.wrapping_add(2),
		}
	}
}

/// Encrypted UDP media transport for a single connection.
pub struct UdpTransport {
	socket: UdpSocket,
	ssrcs: Ssrcs,

	/// Our address and port as seen by the media server, known after discovery.
	external_address: Mutex<Option<SocketAddrV4>>,

	/// Published once when the session description arrives.
	cipher: OnceLock<XSalsa20Poly1305>,

	nonce: AtomicU32,
	ready: AtomicBool,
}

impl UdpTransport {
	/// Create a transport that sends to the media server at `remote`.
	pub async fn connect(remote: SocketAddr, ssrcs: Ssrcs) -> Result<Self, StreamError> {
		let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
		socket.connect(remote).await?;

		tracing::debug!("Sending media from {} to {remote}.", socket.local_addr()?);

		Ok(Self {
			socket,
			ssrcs,
			external_address: Mutex::new(None),
			cipher: OnceLock::new(),
			nonce: AtomicU32::new(0),
			ready: AtomicBool::new(false),
		})
	}

	pub fn ssrcs(&self) -> Ssrcs {
		self.ssrcs
	}

	/// Ask the media server which address and port it sees us on.
	pub async fn discover(&self, timeout: Duration) -> Result<SocketAddrV4, StreamError> {
		self.socket.send(&discovery_request(self.ssrcs.audio)).await?;

		let mut buffer = [0u8; DISCOVERY_PACKET_SIZE];
		let len = tokio::time::timeout(timeout, self.socket.recv(&mut buffer)).await
			.map_err(|_| StreamError::Protocol("timed out waiting for IP discovery reply".to_string()))??;

		let address = parse_discovery_reply(&buffer[..len])?;
		tracing::debug!("Discovered external address {address}.");

		if let Ok(mut external_address) = self.external_address.lock() {
			*external_address = Some(address);
		}

		Ok(address)
	}

	pub fn external_address(&self) -> Option<SocketAddrV4> {
		self.external_address.lock().ok().and_then(|address| *address)
	}

	/// Install the secret key from the session description. A key can only be installed once.
	pub fn install_key(&self, key: &[u8]) -> Result<(), StreamError> {
		if key.len() != SECRET_KEY_SIZE {
			return Err(StreamError::Protocol(format!("expected a {SECRET_KEY_SIZE} byte secret key, got {} bytes", key.len())));
		}

		if self.cipher.set(XSalsa20Poly1305::new(Key::from_slice(key))).is_err() {
			tracing::warn!("Ignoring secret key, this transport already has one.");
		}

		Ok(())
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Acquire)
	}

	/// Allow or block sending media. A transport without a key can't be made ready.
	pub fn set_ready(&self, ready: bool) -> Result<(), StreamError> {
		if ready && self.cipher.get().is_none() {
			return Err(StreamError::MissingKeys);
		}

		self.ready.store(ready, Ordering::Release);
		Ok(())
	}

	/// Returns a fresh nonce, the first four bytes hold the big-endian counter.
	pub fn next_nonce(&self) -> [u8; NONCE_SIZE] {
		let counter = self.nonce.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

		let mut nonce = [0u8; NONCE_SIZE];
		nonce[..4].copy_from_slice(&counter.to_be_bytes());
		nonce
	}

	pub async fn send(&self, packet: &[u8]) -> Result<(), StreamError> {
		self.socket.send(packet).await?;
		Ok(())
	}

	pub fn stop(&self) {
		self.ready.store(false, Ordering::Release);
	}
}

impl PacketSealer for UdpTransport {
	fn seal(&self, packet: &mut Vec<u8>, payload: &[u8]) -> Result<(), StreamError> {
		let cipher = self.cipher.get().ok_or(StreamError::MissingKeys)?;

		let nonce = self.next_nonce();
		let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), payload)
			.map_err(|e| StreamError::Protocol(format!("failed to encrypt packet: {e}")))?;

		packet.extend(ciphertext);
		packet.extend_from_slice(&nonce[..4]);
		Ok(())
	}
}

fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
	let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
	packet[0..2].copy_from_slice(&DISCOVERY_REQUEST.to_be_bytes());
	packet[2..4].copy_from_slice(&((DISCOVERY_PACKET_SIZE - 4) as u16).to_be_bytes());
	packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
	packet
}

fn parse_discovery_reply(reply: &[u8]) -> Result<SocketAddrV4, StreamError> {
	if reply.len() < DISCOVERY_ADDRESS_OFFSET + 2 {
		return Err(StreamError::Protocol(format!("IP discovery reply is too short ({} bytes)", reply.len())));
	}

	let reply_type = u16::from_be_bytes([reply[0], reply[1]]);
	if reply_type != DISCOVERY_REPLY {
		return Err(StreamError::Protocol(format!("unexpected IP discovery reply type {reply_type}")));
	}

	let port = u16::from_be_bytes([reply[reply.len() - 2], reply[reply.len() - 1]]);
	let address = &reply[DISCOVERY_ADDRESS_OFFSET..reply.len() - 2];
	let address = &address[..address.iter().position(|&b| b == 0).unwrap_or(address.len())];

	let address: Ipv4Addr = std::str::from_utf8(address)
		.ok()
		.and_then(|address| address.parse().ok())
		.ok_or_else(|| StreamError::Protocol(format!(
			"IP discovery reply contains an invalid IPv4 address: {:?}",
			String::from_utf8_lossy(address),
		)))?;

	Ok(SocketAddrV4::new(address, port))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn discovery_reply(reply_type: u16, address: &str, port: u16) -> Vec<u8> {
		let mut reply = vec![0u8; DISCOVERY_PACKET_SIZE];
		reply[0..2].copy_from_slice(&reply_type.to_be_bytes());
		reply[2..4].copy_from_slice(&70u16.to_be_bytes());
		reply[8..8 + address.len()].copy_from_slice(address.as_bytes());
		reply[DISCOVERY_PACKET_SIZE - 2..].copy_from_slice(&port.to_be_bytes());
		reply
	}

	async fn media_server() -> (UdpSocket, SocketAddr) {
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let address = server.local_addr().unwrap();
		(server, address)
	}

	#[test]
	fn request_layout() {
		let request = discovery_request(0x01020304);
		assert_eq!(request.len(), 74);
		assert_eq!(&request[..8], &[0, 1, 0, 70, 1, 2, 3, 4]);
		assert!(request[8..].iter().all(|&b| b == 0));
	}

	#[test]
	fn parse_reply() {
		let address = parse_discovery_reply(&discovery_reply(2, "203.0.113.7", 50004)).unwrap();
		assert_eq!(address, SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 50004));
	}

	#[test]
	fn reject_bad_replies() {
		assert!(matches!(parse_discovery_reply(&discovery_reply(1, "203.0.113.7", 1)), Err(StreamError::Protocol(_))));
		assert!(matches!(parse_discovery_reply(&discovery_reply(2, "2001:db8::1", 1)), Err(StreamError::Protocol(_))));
		assert!(matches!(parse_discovery_reply(&[0, 2, 0]), Err(StreamError::Protocol(_))));
	}

	#[test]
	fn ssrcs() {
		assert_eq!(Ssrcs::from_audio(100), Ssrcs { audio: 100, video: 101, rtx: 102 });
		assert_eq!(Ssrcs::from_audio(u32::MAX).rtx, 1);
	}

	#[tokio::test]
	async fn discover() {
		let (server, address) = media_server().await;
		let transport = UdpTransport::connect(address, Ssrcs::from_audio(1234)).await.unwrap();

		let responder = tokio::spawn(async move {
			let mut buffer = [0u8; 128];
			let (len, peer) = server.recv_from(&mut buffer).await.unwrap();
			assert_eq!(len, DISCOVERY_PACKET_SIZE);
			assert_eq!(&buffer[4..8], &1234u32.to_be_bytes());
			server.send_to(&discovery_reply(2, "198.51.100.20", 40000), peer).await.unwrap();
		});

		let external = transport.discover(Duration::from_secs(2)).await.unwrap();
		responder.await.unwrap();

		assert_eq!(external, SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 20), 40000));
		assert_eq!(transport.external_address(), Some(external));
	}

	#[tokio::test]
	async fn failed_discovery_installs_nothing() {
		let (server, address) = media_server().await;
		let transport = UdpTransport::connect(address, Ssrcs::from_audio(1)).await.unwrap();

		let responder = tokio::spawn(async move {
			let mut buffer = [0u8; 128];
			let (_, peer) = server.recv_from(&mut buffer).await.unwrap();
			server.send_to(&discovery_reply(3, "198.51.100.20", 40000), peer).await.unwrap();
		});

		assert!(matches!(transport.discover(Duration::from_secs(2)).await, Err(StreamError::Protocol(_))));
		responder.await.unwrap();
		assert_eq!(transport.external_address(), None);
	}

	#[tokio::test]
	async fn nonce_increments_and_wraps() {
		let (_server, address) = media_server().await;
		let transport = UdpTransport::connect(address, Ssrcs::from_audio(1)).await.unwrap();

		assert_eq!(&transport.next_nonce()[..4], &1u32.to_be_bytes());
		assert_eq!(&transport.next_nonce()[..4], &2u32.to_be_bytes());

		transport.nonce.store(u32::MAX - 1, Ordering::Relaxed);
		assert_eq!(&transport.next_nonce()[..4], &u32::MAX.to_be_bytes());
		let nonce = transport.next_nonce();
		assert_eq!(&nonce[..4], &0u32.to_be_bytes());
		assert!(nonce[4..].iter().all(|&b| b == 0));
	}

	#[tokio::test]
	async fn seal_requires_key() {
		let (_server, address) = media_server().await;
		let transport = UdpTransport::connect(address, Ssrcs::from_audio(1)).await.unwrap();

		let mut packet = Vec::new();
		assert!(matches!(transport.seal(&mut packet, b"payload"), Err(StreamError::MissingKeys)));
		assert!(packet.is_empty());
		assert!(matches!(transport.set_ready(true), Err(StreamError::MissingKeys)));
		assert!(!transport.is_ready());
	}

	#[tokio::test]
	async fn seal_appends_ciphertext_and_nonce() {
		let (_server, address) = media_server().await;
		let transport = UdpTransport::connect(address, Ssrcs::from_audio(1)).await.unwrap();
		let key = [7u8; SECRET_KEY_SIZE];
		transport.install_key(&key).unwrap();
		transport.set_ready(true).unwrap();

		let mut packet = vec![0xAA; 12];
		transport.seal(&mut packet, b"opus frame").unwrap();

		assert_eq!(&packet[..12], &[0xAA; 12]);
		assert_eq!(&packet[packet.len() - 4..], &1u32.to_be_bytes());

		let mut nonce = [0u8; NONCE_SIZE];
		nonce[..4].copy_from_slice(&packet[packet.len() - 4..]);
		let cipher = XSalsa20Poly1305::new(Key::from_slice(&key));
		let plaintext = cipher.decrypt(Nonce::from_slice(&nonce), &packet[12..packet.len() - 4]).unwrap();
		assert_eq!(plaintext, b"opus frame");
	}

	#[tokio::test]
	async fn rejects_short_key() {
		let (_server, address) = media_server().await;
		let transport = UdpTransport::connect(address, Ssrcs::from_audio(1)).await.unwrap();
		assert!(matches!(transport.install_key(&[1, 2, 3]), Err(StreamError::Protocol(_))));
	}
}
