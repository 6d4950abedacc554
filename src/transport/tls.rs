use std::sync::Arc;

use anyhow::{Context, anyhow};
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use rustls_pemfile::Item;
use tracing::warn;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("tls handshake error: {0}")]
	Handshake(std::io::Error),
	#[error("{0}")]
	Anyhow(#[from] anyhow::Error),
}

/// Client-certificate policy, matching verification modes 0-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientVerify {
	#[default]
	None,
	/// Verified when presented, connection allowed without one.
	Optional,
	/// Required and verified.
	Required,
	/// Requested but accepted unverified.
	Request,
}

/// Server-side TLS state for one listener.
pub struct TlsServer {
	pub config: Arc<ServerConfig>,
	pub client_verify: ClientVerify,
}

struct CertEntry {
	/// CN plus subjectAltName DNS entries; each may carry glob wildcards.
	names: Vec<String>,
	key: Arc<CertifiedKey>,
}

/// Picks the certificate whose CN/SAN glob-matches the SNI server name,
/// falling back to the first configured certificate.
struct SniResolver {
	entries: Vec<CertEntry>,
}

impl std::fmt::Debug for SniResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SniResolver")
			.field("entries", &self.entries.len())
			.finish()
	}
}

impl ResolvesServerCert for SniResolver {
	fn resolve(&self, hello: ClientHello) -> Option<Arc<CertifiedKey>> {
		if let Some(sni) = hello.server_name() {
			// CN entries first, then SANs, in configuration order
			for entry in &self.entries {
				if entry.names.iter().any(|n| glob_match(n, sni)) {
					return Some(entry.key.clone());
				}
			}
		}
		self.entries.first().map(|e| e.key.clone())
	}
}

/// Shell-style glob over hostnames: `*` spans labels, `?` is one
/// character, case-insensitive.
pub fn glob_match(pattern: &str, name: &str) -> bool {
	fn inner(p: &[u8], s: &[u8]) -> bool {
		match (p.first(), s.first()) {
			(None, None) => true,
			(Some(b'*'), _) => {
				inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..]))
			},
			(Some(b'?'), Some(_)) => inner(&p[1..], &s[1..]),
			(Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => inner(&p[1..], &s[1..]),
			_ => false,
		}
	}
	inner(pattern.as_bytes(), name.as_bytes())
}

pub fn parse_certs(mut pem: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let mut reader = std::io::BufReader::new(std::io::Cursor::new(&mut pem));
	let parsed: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
	parsed?
		.into_iter()
		.map(|p| {
			let Item::X509Certificate(der) = p else {
				return Err(anyhow!("no certificate"));
			};
			Ok(der)
		})
		.collect::<Result<Vec<_>, _>>()
}

pub fn parse_key(mut pem: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
	let mut reader = std::io::BufReader::new(std::io::Cursor::new(&mut pem));
	loop {
		match rustls_pemfile::read_one(&mut reader)? {
			Some(Item::Pkcs8Key(k)) => return Ok(PrivateKeyDer::Pkcs8(k)),
			Some(Item::Pkcs1Key(k)) => return Ok(PrivateKeyDer::Pkcs1(k)),
			Some(Item::Sec1Key(k)) => return Ok(PrivateKeyDer::Sec1(k)),
			Some(_) => continue,
			None => return Err(anyhow!("no key")),
		}
	}
}

/// DNS-usable names baked into a certificate: CN, then SAN DNS entries.
pub fn cert_names(leaf: &CertificateDer) -> anyhow::Result<Vec<String>> {
	let (_, cert) = X509Certificate::from_der(leaf)
		.map_err(|e| anyhow!("parsing certificate: {e}"))?;
	let mut names = Vec::new();
	for cn in cert.subject().iter_common_name() {
		if let Ok(s) = cn.as_str() {
			names.push(s.to_string());
		}
	}
	if let Ok(Some(san)) = cert.subject_alternative_name() {
		for g in &san.value.general_names {
			if let GeneralName::DNSName(d) = g {
				names.push((*d).to_string());
			}
		}
	}
	Ok(names)
}

/// Build the server-side TLS state for a listener from PEM pairs, in
/// configuration order. `ca_pem` supplies the verification roots for the
/// verified client-certificate modes.
pub fn build_server(
	cert_pairs: &[(Vec<u8>, Vec<u8>)],
	client_verify: ClientVerify,
	ca_pem: Option<&[u8]>,
) -> anyhow::Result<TlsServer> {
	let mut entries = Vec::new();
	for (cert_pem, key_pem) in cert_pairs {
		let chain = parse_certs(cert_pem)?;
		let leaf = chain.first().context("empty certificate chain")?;
		let names = cert_names(leaf)?;
		let key = parse_key(key_pem)?;
		let signing = provider()
			.key_provider
			.load_private_key(key)
			.map_err(|e| anyhow!("loading private key: {e}"))?;
		entries.push(CertEntry {
			names,
			key: Arc::new(CertifiedKey::new(chain, signing)),
		});
	}
	if entries.is_empty() {
		anyhow::bail!("listener has TLS enabled but no certificates");
	}

	let builder = ServerConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()?;
	let builder = match client_verify {
		ClientVerify::None => builder.with_no_client_auth(),
		ClientVerify::Request => {
			builder.with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
		},
		ClientVerify::Optional | ClientVerify::Required => {
			let ca = ca_pem.context("client-certificate verification requires a CA bundle")?;
			let mut roots = rustls::RootCertStore::empty();
			for der in parse_certs(ca)? {
				roots.add(der)?;
			}
			let mut vb = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider());
			if client_verify == ClientVerify::Optional {
				vb = vb.allow_unauthenticated();
			}
			builder.with_client_cert_verifier(vb.build()?)
		},
	};
	let config = builder.with_cert_resolver(Arc::new(SniResolver { entries }));
	Ok(TlsServer {
		config: Arc::new(config),
		client_verify,
	})
}

/// Client config for TLS backends. Backend certificates are not verified
/// (they are commonly self-signed inside the perimeter); SNI is sent only
/// when configured.
pub fn build_backend_client(send_sni: bool) -> anyhow::Result<Arc<ClientConfig>> {
	let mut config = ClientConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()?
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(NoVerifier))
		.with_no_client_auth();
	config.enable_sni = send_sni;
	Ok(Arc::new(config))
}

/// Server name for a backend handshake: the configured SNI name, else the
/// backend's IP.
pub fn backend_server_name(
	sni: Option<&str>,
	addr: std::net::SocketAddr,
) -> anyhow::Result<ServerName<'static>> {
	match sni {
		Some(name) => Ok(ServerName::try_from(name.to_string())?),
		None => Ok(ServerName::IpAddress(addr.ip().into())),
	}
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
		_message: &[u8],
		_cert: &CertificateDer,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		provider()
			.signature_verification_algorithms
			.supported_schemes()
	}
}

/// Mode 3: ask for a client certificate, accept whatever comes back.
#[derive(Debug)]
struct AcceptAnyClientCert {
	roots: Vec<DistinguishedName>,
}

impl AcceptAnyClientCert {
	fn new() -> AcceptAnyClientCert {
		AcceptAnyClientCert { roots: Vec::new() }
	}
}

impl ClientCertVerifier for AcceptAnyClientCert {
	fn root_hint_subjects(&self) -> &[DistinguishedName] {
		&self.roots
	}

	fn client_auth_mandatory(&self) -> bool {
		false
	}

	fn verify_client_cert(
		&self,
		_end_entity: &CertificateDer,
		_intermediates: &[CertificateDer],
		_now: UnixTime,
	) -> Result<ClientCertVerified, rustls::Error> {
		Ok(ClientCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		provider()
			.signature_verification_algorithms
			.supported_schemes()
	}
}

/// Fields of the verified peer certificate, exposed to backends through
/// X-SSL headers.
#[derive(Debug, Clone)]
pub struct ClientCertInfo {
	pub subject: String,
	pub issuer: String,
	pub not_before: String,
	pub not_after: String,
	pub serial: String,
	/// Base64 DER, single line.
	pub der_b64: String,
}

pub fn peer_cert_info(conn: &rustls::ServerConnection) -> Option<ClientCertInfo> {
	let der = conn.peer_certificates()?.first()?;
	match X509Certificate::from_der(der) {
		Ok((_, cert)) => Some(ClientCertInfo {
			subject: cert.subject().to_string(),
			issuer: cert.issuer().to_string(),
			not_before: cert.validity().not_before.to_string(),
			not_after: cert.validity().not_after.to_string(),
			serial: hex::encode(cert.raw_serial()),
			der_b64: base64::engine::general_purpose::STANDARD.encode(der.as_ref()),
		}),
		Err(e) => {
			warn!("invalid client certificate: {e}");
			None
		},
	}
}

pub fn cipher_name(conn: &rustls::ServerConnection) -> Option<String> {
	conn
		.negotiated_cipher_suite()
		.map(|s| format!("{:?}", s.suite()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn glob_semantics() {
		assert!(glob_match("www.example.org", "www.example.org"));
		assert!(glob_match("WWW.example.org", "www.EXAMPLE.org"));
		assert!(glob_match("*.example.org", "www.example.org"));
		assert!(glob_match("*.example.org", "a.b.example.org"));
		assert!(glob_match("www.example.?rg", "www.example.org"));
		assert!(!glob_match("*.example.org", "www.example.com"));
		assert!(!glob_match("www.example.org", "example.org"));
		assert!(glob_match("*", "anything.at.all"));
	}

	#[test]
	fn sni_selection_prefers_match_then_first() {
		let mk = |names: &[&str]| {
			let kp = rcgen::generate_simple_self_signed(
				names.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
			)
			.unwrap();
			(
				kp.cert.pem().into_bytes(),
				kp.key_pair.serialize_pem().into_bytes(),
			)
		};
		let pairs = vec![mk(&["one.example.org"]), mk(&["*.two.example.org"])];
		let srv = build_server(&pairs, ClientVerify::None, None).unwrap();
		// the resolver is private; verify indirectly through cert_names
		let names = cert_names(&parse_certs(&pairs[1].0).unwrap()[0]).unwrap();
		assert!(names.iter().any(|n| n == "*.two.example.org"));
		assert_eq!(srv.client_verify, ClientVerify::None);
	}

	#[test]
	fn pem_roundtrip() {
		let kp = rcgen::generate_simple_self_signed(vec!["x.test".into()]).unwrap();
		let certs = parse_certs(kp.cert.pem().as_bytes()).unwrap();
		assert_eq!(certs.len(), 1);
		parse_key(kp.key_pair.serialize_pem().as_bytes()).unwrap();
		let names = cert_names(&certs[0]).unwrap();
		assert!(names.iter().any(|n| n == "x.test"));
	}
}
