/// Lifecycle of a voice or stream connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	/// Waiting for both the session id and the server tokens to arrive from the gateway.
	AwaitingCredentials { has_session: bool, has_token: bool },

	/// Opening the websocket, `resuming` decides whether we resume or identify once it is open.
	Connecting { resuming: bool },

	/// Identified, waiting for the ready message and the session description.
	Identifying,

	/// Resume sent, waiting for the server to confirm.
	Resuming,

	/// Handshake complete, media can flow.
	Active,

	Closed,
}

impl Default for ConnectionState {
	fn default() -> Self {
		Self::AwaitingCredentials { has_session: false, has_token: false }
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
	SessionReceived,
	TokensReceived,
	SocketOpened,
	/// The server's heartbeat interval in milliseconds.
	Hello(u64),
	Ready,
	SessionDescription,
	Resumed,
	SocketClosed(u16),
	Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
	OpenSocket,
	CloseSocket,
	SendIdentify,
	SendResume,
	StartHeartbeat(u64),
	StopHeartbeat,
	/// Run IP discovery and select the protocol.
	Discover,
	InstallKey,
	MarkTransportReady,
	MarkTransportNotReady,
	/// Hand the transport to whoever is waiting for this connection.
	NotifyReady,
	StopTransport,
}

/// Close codes for which the session can be resumed.
pub fn is_resumable(code: u16) -> bool {
	code == 4015 || code < 4000
}

pub fn transition(state: ConnectionState, event: ConnectionEvent) -> (ConnectionState, Vec<Action>) {
	use self::{Action::*, ConnectionEvent as Event, ConnectionState as State};

	match (state, event) {
		(State::Closed, _) => (State::Closed, vec![]),

		(_, Event::Stop) => (State::Closed, vec![StopHeartbeat, CloseSocket, StopTransport]),

		(State::AwaitingCredentials { has_token, .. }, Event::SessionReceived) => credentials(true, has_token),
		(State::AwaitingCredentials { has_session, .. }, Event::TokensReceived) => credentials(has_session, true),
		(State::AwaitingCredentials { .. }, _) => (state, vec![]),

		(State::Connecting { resuming: true }, Event::SocketOpened) => (State::Resuming, vec![SendResume]),
		(State::Connecting { resuming: false }, Event::SocketOpened) => (State::Identifying, vec![SendIdentify]),

		(State::Identifying, Event::Ready) => (State::Identifying, vec![Discover]),
		(State::Identifying, Event::SessionDescription) => (State::Active, vec![InstallKey, MarkTransportReady, NotifyReady]),

		(State::Resuming, Event::Resumed) => (State::Active, vec![MarkTransportReady]),

		(State::Identifying | State::Resuming | State::Active, Event::Hello(interval)) => (state, vec![StartHeartbeat(interval)]),

		// A connection that never completed its handshake has nothing to resume, so identify again.
		(State::Connecting { resuming }, Event::SocketClosed(code)) if is_resumable(code) =>
			(State::Connecting { resuming }, vec![OpenSocket]),
		(State::Identifying, Event::SocketClosed(code)) if is_resumable(code) =>
			(State::Connecting { resuming: false }, vec![StopHeartbeat, OpenSocket]),
		(State::Active | State::Resuming, Event::SocketClosed(code)) if is_resumable(code) =>
			(State::Connecting { resuming: true }, vec![StopHeartbeat, MarkTransportNotReady, OpenSocket]),
		(_, Event::SocketClosed(_)) => (State::Closed, vec![StopHeartbeat, StopTransport]),

		// The server moved, start over with a fresh handshake.
		(_, Event::TokensReceived) =>
			(State::Connecting { resuming: false }, vec![StopHeartbeat, CloseSocket, MarkTransportNotReady, OpenSocket]),

		(state, _) => (state, vec![]),
	}
}

fn credentials(has_session: bool, has_token: bool) -> (ConnectionState, Vec<Action>) {
	if has_session && has_token {
		(ConnectionState::Connecting { resuming: false }, vec![Action::OpenSocket])
	} else {
		(ConnectionState::AwaitingCredentials { has_session, has_token }, vec![])
	}
}
