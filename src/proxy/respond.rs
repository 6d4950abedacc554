use std::io::{self, Write};
use std::path::Path;

use tracing::debug;

use crate::http::{Request, status_text};
use crate::route::matcher::Submatches;
use crate::route::{Listener, Redirect};
use crate::transport::stream::Conn;

fn default_body(status: u16) -> String {
	let text = status_text(status);
	format!("<html><head><title>{text}</title></head><body><h1>{text}</h1></body></html>")
}

/// Write a locally generated reply. Generated replies always speak
/// HTTP/1.0, whatever the client sent.
pub fn write_reply(
	conn: &mut Conn,
	status: u16,
	extra_headers: &[(&str, &str)],
	content_type: &str,
	body: &str,
) -> io::Result<()> {
	let mut head = format!("HTTP/1.0 {} {}\r\n", status, status_text(status));
	head.push_str(&format!("Content-Type: {content_type}\r\n"));
	head.push_str(&format!("Content-Length: {}\r\n", body.len()));
	for (name, value) in extra_headers {
		head.push_str(&format!("{name}: {value}\r\n"));
	}
	head.push_str("\r\n");
	conn.write_all(head.as_bytes())?;
	conn.write_all(body.as_bytes())?;
	conn.flush()
}

/// Error reply using the listener's per-code body override when one is
/// configured.
pub fn error_reply(conn: &mut Conn, listener: &Listener, status: u16) -> io::Result<()> {
	let body = listener
		.err_bodies
		.get(&status)
		.cloned()
		.unwrap_or_else(|| default_body(status));
	write_reply(conn, status, &[], "text/html", &body)
}

/// Terminal REDIRECT backend: expand the target with the recorded
/// submatches, percent-encoding anything unsafe, and append the request
/// path when the target itself has none.
pub fn redirect_reply(
	conn: &mut Conn,
	req: &Request,
	redirect: &Redirect,
	subs: &Submatches,
) -> io::Result<u16> {
	let mut location = redirect.template.expand_url(req, None, subs);
	if !redirect.has_uri {
		location.push_str(&crate::http::parse::encode_url(&req.url));
	}
	let body = format!(
		"<html><head><title>Redirect</title></head><body><h1>\
		 <a href=\"{location}\">{}</a></h1></body></html>",
		status_text(redirect.status)
	);
	write_reply(
		conn,
		redirect.status,
		&[("Location", &location)],
		"text/html",
		&body,
	)?;
	Ok(redirect.status)
}

/// Terminal ACME backend: the last path segment names a challenge file
/// under the configured directory.
pub fn acme_reply(conn: &mut Conn, req: &Request, root: &Path) -> io::Result<u16> {
	let token = req.path().rsplit('/').next().unwrap_or("");
	if token.is_empty() || token == "." || token == ".." {
		write_reply(conn, 404, &[], "text/html", &default_body(404))?;
		return Ok(404);
	}
	match std::fs::read(root.join(token)) {
		Ok(contents) => {
			let head = format!(
				"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
				contents.len()
			);
			conn.write_all(head.as_bytes())?;
			conn.write_all(&contents)?;
			conn.flush()?;
			Ok(200)
		},
		Err(e) => {
			debug!(token, "acme challenge not served: {e}");
			write_reply(conn, 404, &[], "text/html", &default_body(404))?;
			Ok(404)
		},
	}
}

/// Terminal ERROR backend: fixed status and body.
pub fn error_backend_reply(conn: &mut Conn, status: u16, body: &str) -> io::Result<u16> {
	let body = if body.is_empty() {
		default_body(status)
	} else {
		body.to_string()
	};
	write_reply(conn, status, &[], "text/html", &body)?;
	Ok(status)
}
