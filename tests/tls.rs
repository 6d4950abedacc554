use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};
use turnpike::app::Server;
use turnpike::route::session::{SessionConfig, SessionTable};
use turnpike::route::{
	Backend, BalanceAlgo, BalancerList, Listener, RegularTarget, Runtime, Service, ServiceState,
	WorkerSettings,
};
use turnpike::telemetry::log::LogFormat;
use turnpike::telemetry::metrics::Metrics;
use turnpike::transport::tls::{ClientVerify, build_server};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Accepts whatever the server presents; the assertions read the
/// certificate out of the session instead.
#[derive(Debug)]
struct TrustAnything;

impl ServerCertVerifier for TrustAnything {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer,
		_intermediates: &[CertificateDer],
		_server_name: &ServerName,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_m: &[u8],
		_c: &CertificateDer,
		_d: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_m: &[u8],
		_c: &CertificateDer,
		_d: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		vec![
			SignatureScheme::ECDSA_NISTP256_SHA256,
			SignatureScheme::ECDSA_NISTP384_SHA384,
			SignatureScheme::ED25519,
			SignatureScheme::RSA_PSS_SHA256,
			SignatureScheme::RSA_PSS_SHA384,
			SignatureScheme::RSA_PSS_SHA512,
			SignatureScheme::RSA_PKCS1_SHA256,
			SignatureScheme::RSA_PKCS1_SHA384,
			SignatureScheme::RSA_PKCS1_SHA512,
		]
	}
}

fn self_signed(names: &[&str]) -> (Vec<u8>, Vec<u8>) {
	let kp = rcgen::generate_simple_self_signed(
		names.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
	)
	.unwrap();
	(
		kp.cert.pem().into_bytes(),
		kp.key_pair.serialize_pem().into_bytes(),
	)
}

fn stub_backend() -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();
	std::thread::spawn(move || {
		for stream in listener.incoming() {
			let Ok(mut stream) = stream else { return };
			std::thread::spawn(move || {
				let mut buf = [0u8; 4096];
				let mut seen = Vec::new();
				loop {
					match stream.read(&mut buf) {
						Ok(0) | Err(_) => return,
						Ok(n) => {
							seen.extend_from_slice(&buf[..n]);
							if seen.windows(4).any(|w| w == b"\r\n\r\n") {
								let _ = stream.write_all(
									b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
								);
								return;
							}
						},
					}
				}
			});
		}
	});
	addr
}

fn tls_runtime() -> (Server, std::net::SocketAddr) {
	let be_addr = stub_backend();
	let backend = Arc::new(Backend::proxy(
		None,
		1,
		RegularTarget {
			addr: be_addr,
			host: None,
			conn_to: Duration::from_secs(2),
			io_to: Duration::from_secs(5),
			ws_to: Duration::from_secs(5),
			tls: None,
			alive: AtomicBool::new(true),
		},
	));
	let svc = Arc::new(Service {
		name: "app".into(),
		disabled: AtomicBool::new(false),
		conds: vec![],
		rewrite: vec![],
		resp_rewrite: vec![],
		session: SessionConfig::default(),
		algo: BalanceAlgo::Random,
		forwarded_for: "X-Forwarded-For".into(),
		trusted_ips: None,
		log_suppress: 0,
		state: Mutex::new(ServiceState {
			normal: BalancerList::new(vec![backend]),
			emergency: BalancerList::default(),
			sessions: SessionTable::default(),
		}),
	});

	let pairs = vec![self_signed(&["one.example.org"]), self_signed(&["*.two.example.org"])];
	let tls = build_server(&pairs, ClientVerify::None, None).unwrap();

	let listener = Arc::new(Listener {
		name: "tls".into(),
		addr: "127.0.0.1:0".parse().unwrap(),
		tls: Some(Arc::new(tls)),
		client_to: Duration::from_secs(5),
		ws_to: Duration::from_secs(5),
		url_pattern: None,
		max_req: 0,
		xhttp: 0,
		rewr_loc: 0,
		rewr_dest: false,
		no_https11: false,
		extra_headers: vec![],
		rewrite: vec![],
		resp_rewrite: vec![],
		err_bodies: HashMap::new(),
		services: vec![svc],
		log_format: Arc::new(LogFormat::resolve("null").unwrap()),
	});

	let rt = Arc::new(Runtime {
		listeners: vec![listener],
		global_services: vec![],
		worker: WorkerSettings {
			min: 2,
			max: 4,
			idle_timeout: Duration::from_secs(60),
			queue: 8,
		},
		anonymise: false,
		grace: Duration::from_secs(2),
		metrics: Arc::new(Metrics::new()),
	});
	let mut server = Server::bind(rt, vec![], None).unwrap();
	let addr = server.local_addrs()[0];
	server.start().unwrap();
	(server, addr)
}

fn handshake_and_fetch(addr: std::net::SocketAddr, sni: &str) -> (Vec<String>, String) {
	let config = rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(TrustAnything))
		.with_no_client_auth();
	let name = ServerName::try_from(sni.to_string()).unwrap();
	let conn = ClientConnection::new(Arc::new(config), name).unwrap();
	let sock = TcpStream::connect(addr).unwrap();
	sock
		.set_read_timeout(Some(Duration::from_secs(5)))
		.unwrap();
	let mut stream = StreamOwned::new(conn, sock);
	stream
		.write_all(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n")
		.unwrap();
	let mut body = String::new();
	let _ = stream.read_to_string(&mut body);

	let cert_names = stream
		.conn
		.peer_certificates()
		.and_then(|certs| certs.first())
		.map(|der| {
			let (_, cert) = X509Certificate::from_der(der).unwrap();
			turnpike::transport::tls::cert_names(&CertificateDer::from(der.as_ref().to_vec()))
				.unwrap()
				.into_iter()
				.chain(
					cert
						.subject()
						.iter_common_name()
						.filter_map(|c| c.as_str().ok().map(str::to_string)),
				)
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();
	(cert_names, body)
}

#[test]
fn sni_selects_matching_certificate() {
	let (server, addr) = tls_runtime();

	let (names, body) = handshake_and_fetch(addr, "one.example.org");
	assert!(names.iter().any(|n| n == "one.example.org"), "got {names:?}");
	assert!(body.starts_with("HTTP/1.1 200"), "got {body:?}");

	let (names, _) = handshake_and_fetch(addr, "sub.two.example.org");
	assert!(
		names.iter().any(|n| n == "*.two.example.org"),
		"got {names:?}"
	);

	// unknown SNI falls back to the first certificate
	let (names, _) = handshake_and_fetch(addr, "unknown.example.net");
	assert!(names.iter().any(|n| n == "one.example.org"), "got {names:?}");

	server.stop();
}
