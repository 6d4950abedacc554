use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use rustls::{ServerConnection, StreamOwned};
use tracing::{debug, info, trace, warn};

use crate::client::connect_backend;
use crate::http::parse::{
	ParseError, ReadBuf, copy_chunked, copy_exact, copy_until_eof, parse_request_line,
	parse_status_line, read_headers,
};
use crate::http::{
	Framing, HeaderKind, Method, Request, RequestMeta, Response, scan_request,
};
use crate::mgmt::{self, ControlKind};
use crate::proxy::ProxyError;
use crate::proxy::{respond, tunnel};
use crate::route::matcher::Submatches;
use crate::route::rewrite::{self, rewrite_location_value};
use crate::route::select::{record_response_session, select_backend};
use crate::route::session::SessionKind;
use crate::route::{Backend, BackendKind, Listener, Runtime, Service};
use crate::telemetry::log::AccessRecord;
use crate::telemetry::metrics::{BackendLabels, ListenerLabels};
use crate::transport::stream::Conn;
use crate::transport::tls::{cipher_name, peer_cert_info};

/// Largest POST body the driver will buffer to extract a form-parameter
/// session key.
const MAX_FORM_BUFFER: u64 = 16 * 1024;

pub struct WorkItem {
	pub stream: TcpStream,
	pub peer: SocketAddr,
	pub listener: Arc<Listener>,
}

/// One pooled upstream connection, tied to the backend it talks to.
struct Upstream {
	conn: Conn,
	rbuf: ReadBuf,
	backend: Arc<Backend>,
}

enum Flow {
	KeepAlive,
	Close,
}

/// Everything an exchange leaves behind for the access log.
#[derive(Default)]
struct LogSlot {
	has_request: bool,
	request_line: String,
	service: Option<String>,
	backend: Option<String>,
	status: u16,
	bytes: u64,
	suppress: bool,
	req: Option<Request>,
	resp: Option<Response>,
}

/// Full connection lifecycle, run on a worker thread.
pub fn handle(rt: &Arc<Runtime>, item: WorkItem) {
	rt.metrics.active_connections.inc();
	serve(rt, item);
	rt.metrics.active_connections.dec();
}

fn serve(rt: &Arc<Runtime>, item: WorkItem) {
	let WorkItem {
		stream,
		peer,
		listener,
	} = item;
	let _ = stream.set_nodelay(true);
	if stream
		.set_read_timeout(Some(listener.client_to))
		.and_then(|_| stream.set_write_timeout(Some(listener.client_to)))
		.is_err()
	{
		return;
	}

	let mut client = match &listener.tls {
		Some(tls) => {
			let conn = match ServerConnection::new(tls.config.clone()) {
				Ok(c) => c,
				Err(e) => {
					debug!(%peer, "tls setup failed: {e}");
					return;
				},
			};
			let mut s = StreamOwned::new(conn, stream);
			while s.conn.is_handshaking() {
				// handshake failures are closed without a reply
				if let Err(e) = s.conn.complete_io(&mut s.sock) {
					debug!(%peer, "tls handshake failed: {e}");
					return;
				}
			}
			Conn::Tls(Box::new(s))
		},
		None => Conn::Plain(stream),
	};

	rt.metrics
		.requests
		.get_or_create(&ListenerLabels {
			listener: listener.name.clone(),
		})
		.inc();

	let mut rbuf = ReadBuf::new();
	let mut upstream: Option<Upstream> = None;
	loop {
		let started = Instant::now();
		let mut slot = LogSlot::default();
		let flow = match run_exchange(
			rt,
			&listener,
			&mut client,
			&mut rbuf,
			peer,
			&mut upstream,
			&mut slot,
		) {
			Ok(flow) => flow,
			Err(e) => {
				match e.client_status() {
					Some(status) => {
						debug!(%peer, "request failed: {e}");
						let _ = respond::error_reply(&mut client, &listener, status);
						slot.status = status;
					},
					None => {
						trace!(%peer, "connection aborted: {e}");
					},
				}
				Flow::Close
			},
		};
		if slot.status != 0 {
			rt.metrics.observe_response(&listener.name, slot.status);
		}
		emit_log(rt, &listener, peer, &slot, started);
		match flow {
			Flow::KeepAlive => continue,
			Flow::Close => break,
		}
	}
	if let Some(up) = upstream {
		up.conn.shutdown();
	}
	client.shutdown();
}

fn emit_log(
	rt: &Arc<Runtime>,
	listener: &Listener,
	peer: SocketAddr,
	slot: &LogSlot,
	started: Instant,
) {
	if !slot.has_request || slot.suppress || listener.log_format.is_null() {
		return;
	}
	let rec = AccessRecord {
		peer,
		anonymise: rt.anonymise,
		listener: &listener.name,
		service: slot.service.as_deref(),
		backend: slot.backend.clone(),
		request_line: &slot.request_line,
		status: slot.status,
		bytes: slot.bytes,
		duration: started.elapsed(),
		when: Local::now(),
		req: slot.req.as_ref(),
		resp: slot.resp.as_ref(),
	};
	info!(target: "access", "{}", listener.log_format.render(&rec));
}

#[allow(clippy::too_many_arguments)]
fn run_exchange(
	rt: &Arc<Runtime>,
	listener: &Arc<Listener>,
	client: &mut Conn,
	rbuf: &mut ReadBuf,
	peer: SocketAddr,
	upstream: &mut Option<Upstream>,
	slot: &mut LogSlot,
) -> Result<Flow, ProxyError> {
	// request line; leading blank lines are permitted
	let mut blanks = 0;
	let line = loop {
		match rbuf.read_line(client) {
			Ok(l) if l.is_empty() => {
				blanks += 1;
				if blanks > 8 {
					return Err(ProxyError::BadRequest(ParseError::BadRequestLine));
				}
			},
			Ok(l) => break l,
			// clean close or quiet keep-alive expiry: no reply, no log
			Err(ParseError::Eof) => return Ok(Flow::Close),
			Err(e) if e.is_timeout() => return Ok(Flow::Close),
			Err(e) => return Err(ProxyError::BadRequest(e)),
		}
	};
	slot.has_request = true;
	slot.request_line = line.clone();

	let rl = parse_request_line(&line).map_err(ProxyError::BadRequest)?;
	let Some((method, group)) = Method::parse(&rl.method) else {
		return Err(ProxyError::MethodNotAllowed);
	};
	if group > listener.xhttp {
		return Err(ProxyError::MethodNotAllowed);
	}
	let headers = read_headers(rbuf, client).map_err(ProxyError::BadRequest)?;
	let decoded = crate::http::parse::percent_decode(&rl.url).map_err(ProxyError::BadRequest)?;
	let mut req = Request {
		method,
		method_token: rl.method,
		version_minor: rl.version_minor,
		url: rl.url,
		decoded,
		headers,
		basic_user: None,
		basic_pass: None,
	};

	if let Some(p) = &listener.url_pattern
		&& !p.is_match(&req.decoded)
	{
		return Err(ProxyError::UrlNotAllowed);
	}

	let meta = scan_request(&mut req).map_err(ProxyError::Framing)?;
	if listener.max_req > 0 && meta.content_length.unwrap_or(0) > listener.max_req {
		return Err(ProxyError::BodyTooLarge);
	}
	// vendor RPC streaming: method plus an in-range content length
	let rpc = req.method.is_rpc()
		&& meta
			.content_length
			.is_some_and(|n| (0x20000..0x8000_0000).contains(&n));

	let mut subs = Submatches::new();
	rewrite::apply_request(&listener.rewrite, &mut req, peer.ip(), &mut subs);

	let service = rt
		.services_for(listener)
		.find(|s| s.matches(&req, peer.ip(), &mut subs))
		.cloned()
		.ok_or(ProxyError::NoService)?;
	slot.service = Some(service.name.clone());

	rewrite::apply_request(&service.rewrite, &mut req, peer.ip(), &mut subs);

	// PARAM affinity needs the form body before the backend is chosen
	let form_body = read_form_body(&service, &req, &meta, rbuf, client)?;

	let mut attempts = backend_count(&service) + 1;
	let (backend, mut up) = loop {
		let be = select_backend(&service, &req, peer.ip(), form_body.as_deref())
			.ok_or(ProxyError::NoBackend)?;
		if be.is_terminal() {
			let status = respond_terminal(rt, listener, client, &req, &be, &subs)?;
			drain_request_body(rbuf, client, &meta, form_body.is_some())?;
			slot.backend = Some(be.label());
			slot.status = status;
			slot.suppress = service.suppresses(status);
			slot.req = Some(req);
			return Ok(continuation(listener, client, &meta, rpc, slot));
		}
		match take_or_dial(upstream, &be) {
			Ok(up) => break (be, up),
			Err(e) => {
				warn!(backend = %be.label(), "backend connect failed: {e}");
				service.kill_backend(&be);
				rt.metrics
					.backend_failures
					.get_or_create(&BackendLabels {
						backend: be.label(),
					})
					.inc();
				attempts -= 1;
				if attempts == 0 {
					return Err(ProxyError::Upstream(e));
				}
			},
		}
	};
	slot.backend = Some(backend.label());

	forward_request(listener, &service, client, &mut up, &req, peer)
		.map_err(ProxyError::UpstreamIo)?;
	match &form_body {
		Some(body) => {
			up.conn
				.write_all(body.as_bytes())
				.map_err(ProxyError::UpstreamIo)?;
		},
		None => {
			copy_request_body(rbuf, client, &mut up, &meta)?;
		},
	}
	up.conn.flush().map_err(ProxyError::UpstreamIo)?;

	// informational responses other than 101 are consumed, not forwarded
	let mut resp = loop {
		let status_line = match rbuf_read_line(&mut up) {
			Ok(l) => l,
			Err(e) => return Err(e),
		};
		let (minor, status) = parse_status_line(&status_line).map_err(ProxyError::UpstreamProtocol)?;
		let headers = read_headers(&mut up.rbuf, &mut up.conn).map_err(ProxyError::UpstreamProtocol)?;
		let r = Response {
			line: status_line,
			version_minor: minor,
			status,
			headers,
		};
		if r.status / 100 == 1 && r.status != 101 {
			continue;
		}
		break r;
	};

	let ws_complete = req.method == Method::Get
		&& meta.conn_upgrade
		&& meta.upgrade_websocket
		&& resp.status == 101
		&& response_has_upgrade(&resp);

	rewrite::apply_response(&service.resp_rewrite, &req, &mut resp, peer.ip(), &mut subs);
	rewrite::apply_response(&listener.resp_rewrite, &req, &mut resp, peer.ip(), &mut subs);
	if listener.rewr_loc > 0 {
		rewrite_locations(rt, listener, client.is_tls(), &req, &mut resp);
	}

	record_response_session(&service, &resp, &backend);

	// response head; from here on errors abort the connection silently
	let mut head = String::with_capacity(256);
	head.push_str(&resp.line);
	head.push_str("\r\n");
	for h in &resp.headers {
		head.push_str(&h.line);
		head.push_str("\r\n");
	}
	head.push_str("\r\n");
	client
		.write_all(head.as_bytes())
		.map_err(ProxyError::ClientIo)?;

	let resp_framing = response_framing(&req, &resp, rpc);
	let mut reusable = !rpc && resp.version_minor == 1 && !response_closes(&resp);
	let body_bytes = match resp_framing {
		Framing::None => 0,
		Framing::Length(n) => copy_exact(&mut up.rbuf, &mut up.conn, client, n)
			.map_err(ProxyError::ClientIo)?,
		Framing::Chunked => copy_chunked(&mut up.rbuf, &mut up.conn, client)
			.map_err(|e| ProxyError::ClientIo(std::io::Error::other(e)))?,
		Framing::UntilEof => {
			reusable = false;
			copy_until_eof(&mut up.rbuf, &mut up.conn, client).map_err(ProxyError::ClientIo)?
		},
	};
	client.flush().map_err(ProxyError::ClientIo)?;

	slot.status = resp.status;
	slot.bytes = body_bytes;
	slot.suppress = service.suppresses(resp.status);

	if ws_complete {
		// over-read bytes belong to the tunnel
		rbuf
			.drain_to(&mut up.conn)
			.map_err(ProxyError::UpstreamIo)?;
		up.rbuf.drain_to(client).map_err(ProxyError::ClientIo)?;
		let ws_to = listener.ws_to;
		client.set_io_timeout(Some(ws_to)).map_err(ProxyError::ClientIo)?;
		match tunnel::websocket(client, &mut up.conn, ws_to) {
			Ok((sent, received)) => {
				trace!(sent, received, "websocket tunnel closed");
				slot.bytes += received;
			},
			Err(e) => trace!("websocket tunnel error: {e}"),
		}
		slot.req = Some(req);
		slot.resp = Some(resp);
		up.conn.shutdown();
		return Ok(Flow::Close);
	}

	if reusable && matches!(resp_framing, Framing::None | Framing::Length(_) | Framing::Chunked) {
		*upstream = Some(up);
	} else {
		up.conn.shutdown();
	}

	let flow = {
		slot.req = Some(req);
		slot.resp = Some(resp);
		continuation(listener, client, &meta, rpc, slot)
	};
	Ok(flow)
}

fn rbuf_read_line(up: &mut Upstream) -> Result<String, ProxyError> {
	match up.rbuf.read_line(&mut up.conn) {
		Ok(l) => Ok(l),
		Err(ParseError::Io(e)) => Err(ProxyError::UpstreamIo(e)),
		Err(ParseError::Eof) => Err(ProxyError::UpstreamIo(
			std::io::ErrorKind::UnexpectedEof.into(),
		)),
		Err(e) => Err(ProxyError::UpstreamProtocol(e)),
	}
}

fn backend_count(svc: &Service) -> usize {
	let st = svc.state();
	st.normal.backends.len() + st.emergency.backends.len()
}

/// Pre-read a small POST form body when PARAM affinity needs it.
fn read_form_body(
	svc: &Service,
	req: &Request,
	meta: &RequestMeta,
	rbuf: &mut ReadBuf,
	client: &mut Conn,
) -> Result<Option<String>, ProxyError> {
	if svc.session.kind != SessionKind::Param || req.method != Method::Post {
		return Ok(None);
	}
	let Some(len) = meta.content_length else {
		return Ok(None);
	};
	if len == 0 || len > MAX_FORM_BUFFER {
		return Ok(None);
	}
	let mut buf = Vec::new();
	copy_exact(rbuf, client, &mut buf, len).map_err(ProxyError::ClientIo)?;
	Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Consume an unforwarded request body so the connection can continue.
fn drain_request_body(
	rbuf: &mut ReadBuf,
	client: &mut Conn,
	meta: &RequestMeta,
	already_read: bool,
) -> Result<(), ProxyError> {
	if already_read {
		return Ok(());
	}
	let mut sink = std::io::sink();
	match meta.framing() {
		Framing::None | Framing::UntilEof => Ok(()),
		Framing::Length(n) => copy_exact(rbuf, client, &mut sink, n)
			.map(|_| ())
			.map_err(ProxyError::ClientIo),
		// the reply is already out; a bad body can only abort the connection
		Framing::Chunked => copy_chunked(rbuf, client, &mut sink)
			.map(|_| ())
			.map_err(|e| ProxyError::ClientIo(std::io::Error::other(e))),
	}
}

fn copy_request_body(
	rbuf: &mut ReadBuf,
	client: &mut Conn,
	up: &mut Upstream,
	meta: &RequestMeta,
) -> Result<(), ProxyError> {
	match meta.framing() {
		Framing::None | Framing::UntilEof => Ok(()),
		Framing::Length(n) => copy_exact(rbuf, client, &mut up.conn, n)
			.map(|_| ())
			.map_err(ProxyError::ClientIo),
		Framing::Chunked => copy_chunked(rbuf, client, &mut up.conn)
			.map(|_| ())
			.map_err(ProxyError::BadRequest),
	}
}

/// Reuse the pooled connection when it goes to the same backend and has not
/// gone stale; otherwise dial fresh.
fn take_or_dial(
	upstream: &mut Option<Upstream>,
	be: &Arc<Backend>,
) -> Result<Upstream, crate::client::DialError> {
	if let Some(mut pooled) = upstream.take() {
		if Arc::ptr_eq(&pooled.backend, be) && !pooled.conn.readable_now() {
			trace!(backend = %be.label(), "reusing backend connection");
			return Ok(pooled);
		}
		pooled.conn.shutdown();
	}
	let target = be.target().expect("dialing a terminal backend");
	let conn = connect_backend(target)?;
	Ok(Upstream {
		conn,
		rbuf: ReadBuf::new(),
		backend: be.clone(),
	})
}

fn respond_terminal(
	rt: &Arc<Runtime>,
	listener: &Arc<Listener>,
	client: &mut Conn,
	req: &Request,
	be: &Arc<Backend>,
	subs: &Submatches,
) -> Result<u16, ProxyError> {
	let status = match &be.kind {
		BackendKind::Redirect(r) => {
			respond::redirect_reply(client, req, r, subs).map_err(ProxyError::ClientIo)?
		},
		BackendKind::Acme { root } => {
			respond::acme_reply(client, req, root).map_err(ProxyError::ClientIo)?
		},
		BackendKind::Error { status, body } => {
			respond::error_backend_reply(client, *status, body).map_err(ProxyError::ClientIo)?
		},
		BackendKind::Control => {
			let r = mgmt::handle(rt, req.method, req.path(), ControlKind::Control);
			respond::write_reply(client, r.status, &[], r.content_type, &r.body)
				.map_err(ProxyError::ClientIo)?;
			r.status
		},
		BackendKind::Metrics => {
			let r = mgmt::handle(rt, req.method, req.path(), ControlKind::Metrics);
			respond::write_reply(client, r.status, &[], r.content_type, &r.body)
				.map_err(ProxyError::ClientIo)?;
			r.status
		},
		BackendKind::Proxy(_) => unreachable!("proxy backend is not terminal"),
	};
	Ok(status)
}

/// Write the request head upstream: preserved request line and headers,
/// WebDAV Destination rewrite, configured extra headers, TLS-derived
/// headers, and the forwarded-for header.
fn forward_request(
	listener: &Arc<Listener>,
	service: &Arc<Service>,
	client: &Conn,
	up: &mut Upstream,
	req: &Request,
	peer: SocketAddr,
) -> std::io::Result<()> {
	let trusted = service
		.trusted_ips
		.as_ref()
		.is_some_and(|a| a.matches(peer.ip()));
	let mut fwd_chain: Option<String> = None;

	let mut head = String::with_capacity(512);
	head.push_str(&req.request_line());
	head.push_str("\r\n");
	for h in &req.headers {
		if h.is(&service.forwarded_for) {
			// untrusted chains are replaced; trusted ones extended
			if trusted {
				fwd_chain = Some(h.value().to_string());
			}
			continue;
		}
		if h.kind == HeaderKind::Destination
			&& listener.rewr_dest
			&& let Some(be_addr) = up.backend.addr()
			&& let Ok(mut u) = url::Url::parse(h.value())
		{
			let _ = u.set_host(Some(&be_addr.ip().to_string()));
			let _ = u.set_port(Some(be_addr.port()));
			head.push_str(&format!("Destination: {u}\r\n"));
			continue;
		}
		head.push_str(&h.line);
		head.push_str("\r\n");
	}
	for extra in &listener.extra_headers {
		head.push_str(extra);
		head.push_str("\r\n");
	}
	if let Some(tls) = client.server_tls() {
		if let Some(cipher) = cipher_name(tls) {
			head.push_str(&format!("X-SSL-Cipher: {cipher}\r\n"));
		}
		if let Some(info) = peer_cert_info(tls) {
			head.push_str(&format!("X-SSL-Subject: {}\r\n", info.subject));
			head.push_str(&format!("X-SSL-Issuer: {}\r\n", info.issuer));
			head.push_str(&format!("X-SSL-notBefore: {}\r\n", info.not_before));
			head.push_str(&format!("X-SSL-notAfter: {}\r\n", info.not_after));
			head.push_str(&format!("X-SSL-Serial: {}\r\n", info.serial));
			head.push_str(&format!("X-SSL-Certificate: {}\r\n", info.der_b64));
		}
	}
	match fwd_chain {
		Some(chain) => head.push_str(&format!(
			"{}: {}, {}\r\n",
			service.forwarded_for,
			chain,
			peer.ip()
		)),
		None => head.push_str(&format!("{}: {}\r\n", service.forwarded_for, peer.ip())),
	}
	head.push_str("\r\n");
	up.conn.write_all(head.as_bytes())
}

fn response_has_upgrade(resp: &Response) -> bool {
	let conn_upgrade = resp
		.header_value(HeaderKind::Connection)
		.is_some_and(|v| {
			v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
		});
	let upgrade_ws = resp
		.header_value(HeaderKind::Upgrade)
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	conn_upgrade && upgrade_ws
}

fn response_closes(resp: &Response) -> bool {
	resp
		.header_value(HeaderKind::Connection)
		.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
}

fn response_framing(req: &Request, resp: &Response, rpc: bool) -> Framing {
	if resp.status == 204 || resp.status == 304 || resp.status == 101 || req.method == Method::Head
	{
		return Framing::None;
	}
	if resp
		.header_value(HeaderKind::TransferEncoding)
		.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
	{
		return Framing::Chunked;
	}
	if let Some(cl) = resp.header_value(HeaderKind::ContentLength)
		&& let Ok(n) = cl.trim().parse::<u64>()
	{
		if rpc {
			return Framing::UntilEof;
		}
		return Framing::Length(n);
	}
	Framing::UntilEof
}

fn rewrite_locations(
	rt: &Arc<Runtime>,
	listener: &Arc<Listener>,
	inbound_tls: bool,
	req: &Request,
	resp: &mut Response,
) {
	for name in ["Location", "Content-Location"] {
		let Some(value) = resp.named_header_value(name).map(str::to_string) else {
			continue;
		};
		let known = |host: &str, port: u16| rt.known_authority(listener, host, port);
		if let Some(new) = rewrite_location_value(&value, req.host(), inbound_tls, &known) {
			resp.set_header(name, &new);
		}
	}
}

/// Step 22: decide whether the connection survives this exchange.
fn continuation(
	listener: &Arc<Listener>,
	client: &Conn,
	meta: &RequestMeta,
	rpc: bool,
	slot: &LogSlot,
) -> Flow {
	let http10 = slot
		.req
		.as_ref()
		.map(|r| r.version_minor == 0)
		.unwrap_or(true);
	if http10
		|| meta.conn_close
		|| rpc
		|| (listener.no_https11 && client.is_tls())
	{
		Flow::Close
	} else {
		Flow::KeepAlive
	}
}
