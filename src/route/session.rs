use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::http::Request;
use crate::http::parse::query_pairs;
use crate::route::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
	#[default]
	None,
	Ip,
	Cookie,
	Url,
	Param,
	Basic,
	Header,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
	pub kind: SessionKind,
	/// Cookie / query-parameter / form-parameter / header name, where the
	/// kind uses one.
	pub id: String,
	pub ttl: Duration,
}

impl SessionConfig {
	pub fn active(&self) -> bool {
		self.kind != SessionKind::None
	}
}

/// Derive the affinity key for a request, or None when the request carries
/// nothing to pin on. `form_body` is the pre-read POST body, supplied by the
/// driver only when the session kind needs it.
pub fn session_key(
	cfg: &SessionConfig,
	req: &Request,
	peer: IpAddr,
	form_body: Option<&str>,
) -> Option<String> {
	match cfg.kind {
		SessionKind::None => None,
		SessionKind::Ip => Some(peer.to_canonical().to_string()),
		SessionKind::Cookie => req.cookie(&cfg.id).map(str::to_string),
		SessionKind::Url => query_pairs(req.query())
			.into_iter()
			.find(|(k, _)| *k == cfg.id)
			.map(|(_, v)| v),
		SessionKind::Param => form_body.and_then(|body| {
			query_pairs(body)
				.into_iter()
				.find(|(k, _)| *k == cfg.id)
				.map(|(_, v)| v)
		}),
		SessionKind::Basic => req.basic_user.clone(),
		SessionKind::Header => req.named_header_value(&cfg.id).map(str::to_string),
	}
}

struct SessionEntry {
	backend: Arc<Backend>,
	last_used: Instant,
}

/// Affinity table for one service. All access happens under the owning
/// service's mutex; expiry is by last use, refreshed on every hit.
#[derive(Default)]
pub struct SessionTable {
	entries: HashMap<String, SessionEntry>,
}

impl SessionTable {
	pub fn lookup(&mut self, key: &str, ttl: Duration, now: Instant) -> Option<Arc<Backend>> {
		match self.entries.get_mut(key) {
			Some(e) if now.duration_since(e.last_used) <= ttl => {
				if e.backend.usable() {
					e.last_used = now;
					Some(e.backend.clone())
				} else {
					self.entries.remove(key);
					None
				}
			},
			Some(_) => {
				self.entries.remove(key);
				None
			},
			None => None,
		}
	}

	pub fn insert(&mut self, key: String, backend: Arc<Backend>, now: Instant) {
		self.entries.insert(
			key,
			SessionEntry {
				backend,
				last_used: now,
			},
		);
	}

	pub fn sweep(&mut self, ttl: Duration, now: Instant) {
		self
			.entries
			.retain(|_, e| now.duration_since(e.last_used) <= ttl && e.backend.usable());
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::{Header, Method};
	use crate::route::{Backend, BackendKind};

	fn dummy_backend() -> Arc<Backend> {
		Arc::new(Backend::terminal(
			None,
			1,
			BackendKind::Error {
				status: 503,
				body: String::new(),
			},
		))
	}

	fn request(url: &str, headers: &[&str]) -> Request {
		Request {
			method: Method::Get,
			method_token: "GET".into(),
			version_minor: 1,
			url: url.into(),
			decoded: url.into(),
			headers: headers.iter().map(|l| Header::new(l.to_string())).collect(),
			basic_user: None,
			basic_pass: None,
		}
	}

	#[test]
	fn key_derivation_per_kind() {
		let peer: IpAddr = "192.0.2.7".parse().unwrap();
		let req = request("/x?sid=42", &["Cookie: JSESSIONID=abc", "X-Sess: h1"]);

		let mk = |kind, id: &str| SessionConfig {
			kind,
			id: id.into(),
			ttl: Duration::from_secs(60),
		};
		assert_eq!(
			session_key(&mk(SessionKind::Ip, ""), &req, peer, None),
			Some("192.0.2.7".into())
		);
		assert_eq!(
			session_key(&mk(SessionKind::Cookie, "JSESSIONID"), &req, peer, None),
			Some("abc".into())
		);
		assert_eq!(
			session_key(&mk(SessionKind::Url, "sid"), &req, peer, None),
			Some("42".into())
		);
		assert_eq!(
			session_key(&mk(SessionKind::Header, "X-Sess"), &req, peer, None),
			Some("h1".into())
		);
		assert_eq!(
			session_key(
				&mk(SessionKind::Param, "user"),
				&req,
				peer,
				Some("user=u1&x=2")
			),
			Some("u1".into())
		);
		assert_eq!(session_key(&mk(SessionKind::Cookie, "other"), &req, peer, None), None);
	}

	#[test]
	fn ttl_expiry_and_refresh() {
		let ttl = Duration::from_secs(10);
		let t0 = Instant::now();
		let mut table = SessionTable::default();
		let be = dummy_backend();
		table.insert("k".into(), be.clone(), t0);

		// within ttl: hit refreshes last_used
		let t1 = t0 + Duration::from_secs(8);
		assert!(table.lookup("k", ttl, t1).is_some());
		// 8+8 > ttl from t0, but the refresh at t1 keeps it alive
		let t2 = t1 + Duration::from_secs(8);
		assert!(table.lookup("k", ttl, t2).is_some());
		// past ttl since last use: gone
		let t3 = t2 + Duration::from_secs(11);
		assert!(table.lookup("k", ttl, t3).is_none());
		assert!(table.is_empty());
	}

	#[test]
	fn sweep_evicts_expired() {
		let ttl = Duration::from_secs(10);
		let t0 = Instant::now();
		let mut table = SessionTable::default();
		table.insert("a".into(), dummy_backend(), t0);
		table.insert("b".into(), dummy_backend(), t0 + Duration::from_secs(9));
		table.sweep(ttl, t0 + Duration::from_secs(12));
		assert_eq!(table.len(), 1);
		assert!(table.lookup("b", ttl, t0 + Duration::from_secs(12)).is_some());
	}

	#[test]
	fn disabled_backend_entry_dropped() {
		let ttl = Duration::from_secs(10);
		let now = Instant::now();
		let mut table = SessionTable::default();
		let be = dummy_backend();
		table.insert("k".into(), be.clone(), now);
		be.disabled
			.store(true, std::sync::atomic::Ordering::Relaxed);
		assert!(table.lookup("k", ttl, now).is_none());
	}
}
