use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::trace;

use crate::transport::stream::{Conn, wait_either};

/// Bidirectional byte tunneling after a completed WebSocket upgrade. Copies
/// whatever each side produces until one of them closes or the idle
/// timeout elapses. Returns (client→backend, backend→client) byte counts.
pub fn websocket(
	client: &mut Conn,
	upstream: &mut Conn,
	idle: Duration,
) -> io::Result<(u64, u64)> {
	let mut buf = [0u8; 8192];
	let mut sent = 0u64;
	let mut received = 0u64;
	loop {
		// decrypted bytes already sitting in a TLS layer won't show on poll
		let client_buffered = client.tls_buffered();
		let upstream_buffered = upstream.tls_buffered();
		let (client_ready, upstream_ready) = if client_buffered || upstream_buffered {
			(client_buffered, upstream_buffered)
		} else {
			match wait_either(client, upstream, idle)? {
				Some(ready) => ready,
				None => {
					trace!("websocket idle timeout");
					return Ok((sent, received));
				},
			}
		};
		if client_ready {
			let n = client.read(&mut buf)?;
			if n == 0 {
				return Ok((sent, received));
			}
			upstream.write_all(&buf[..n])?;
			upstream.flush()?;
			sent += n as u64;
		}
		if upstream_ready {
			let n = upstream.read(&mut buf)?;
			if n == 0 {
				return Ok((sent, received));
			}
			client.write_all(&buf[..n])?;
			client.flush()?;
			received += n as u64;
		}
	}
}
