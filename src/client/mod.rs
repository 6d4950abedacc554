pub mod dns;

use std::io;
use std::net::TcpStream;

use rustls::{ClientConnection, StreamOwned};

use crate::route::RegularTarget;
use crate::transport::stream::Conn;
use crate::transport::tls::backend_server_name;

#[derive(thiserror::Error, Debug)]
pub enum DialError {
	#[error("connect to {addr}: {err}")]
	Connect { addr: std::net::SocketAddr, err: io::Error },
	#[error("backend tls: {0}")]
	Tls(String),
	#[error("i/o: {0}")]
	Io(#[from] io::Error),
}

/// Dial a backend: bounded connect, per-exchange I/O deadline, then the
/// optional TLS handshake with the configured SNI.
pub fn connect_backend(target: &RegularTarget) -> Result<Conn, DialError> {
	let sock = TcpStream::connect_timeout(&target.addr, target.conn_to)
		.map_err(|err| DialError::Connect {
			addr: target.addr,
			err,
		})?;
	sock.set_nodelay(true)?;
	sock.set_read_timeout(Some(target.io_to))?;
	sock.set_write_timeout(Some(target.io_to))?;

	let Some(tls) = &target.tls else {
		return Ok(Conn::Plain(sock));
	};
	let name = backend_server_name(tls.sni.as_deref(), target.addr)
		.map_err(|e| DialError::Tls(e.to_string()))?;
	let conn = ClientConnection::new(tls.config.clone(), name)
		.map_err(|e| DialError::Tls(e.to_string()))?;
	let mut stream = StreamOwned::new(conn, sock);
	while stream.conn.is_handshaking() {
		stream
			.conn
			.complete_io(&mut stream.sock)
			.map_err(|e| DialError::Tls(e.to_string()))?;
	}
	Ok(Conn::ClientTls(Box::new(stream)))
}

#[cfg(test)]
mod tests {
	use std::net::TcpListener;
	use std::sync::atomic::AtomicBool;
	use std::time::Duration;

	use super::*;

	fn target(addr: std::net::SocketAddr) -> RegularTarget {
		RegularTarget {
			addr,
			host: None,
			conn_to: Duration::from_millis(500),
			io_to: Duration::from_secs(1),
			ws_to: Duration::from_secs(1),
			tls: None,
			alive: AtomicBool::new(true),
		}
	}

	#[test]
	fn dials_a_listening_socket() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let conn = connect_backend(&target(listener.local_addr().unwrap())).unwrap();
		assert!(!conn.is_tls());
	}

	#[test]
	fn refused_connection_is_an_error() {
		// bind-then-drop leaves a port nothing listens on
		let addr = {
			let l = TcpListener::bind("127.0.0.1:0").unwrap();
			l.local_addr().unwrap()
		};
		assert!(matches!(
			connect_backend(&target(addr)),
			Err(DialError::Connect { .. })
		));
	}
}
