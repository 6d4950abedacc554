pub mod driver;
pub mod pool;
pub mod respond;
pub mod tunnel;

use std::io;

use crate::client::DialError;
use crate::http::ScanError;
use crate::http::parse::ParseError;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("malformed request: {0}")]
	BadRequest(ParseError),
	#[error("request smuggling defense: {0}")]
	Framing(ScanError),
	#[error("request body too large")]
	BodyTooLarge,
	#[error("method not allowed on this listener")]
	MethodNotAllowed,
	#[error("url rejected by listener pattern")]
	UrlNotAllowed,
	#[error("no service matched")]
	NoService,
	#[error("no usable backend")]
	NoBackend,
	#[error("upstream connect: {0}")]
	Upstream(#[from] DialError),
	#[error("upstream i/o: {0}")]
	UpstreamIo(io::Error),
	#[error("upstream protocol: {0}")]
	UpstreamProtocol(ParseError),
	#[error("client i/o: {0}")]
	ClientIo(io::Error),
}

impl ProxyError {
	/// The reply owed to the client, when one is owed at all. `None` means
	/// the connection is just dropped (the client vanished or the response
	/// already started).
	pub fn client_status(&self) -> Option<u16> {
		match self {
			ProxyError::BadRequest(_) | ProxyError::Framing(_) => Some(400),
			ProxyError::BodyTooLarge => Some(413),
			ProxyError::MethodNotAllowed | ProxyError::UrlNotAllowed => Some(501),
			ProxyError::NoService | ProxyError::NoBackend => Some(503),
			ProxyError::Upstream(_) => Some(503),
			ProxyError::UpstreamIo(_) | ProxyError::UpstreamProtocol(_) => Some(500),
			ProxyError::ClientIo(_) => None,
		}
	}
}
