use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ListenerLabels {
	pub listener: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
	pub listener: String,
	/// `1xx` .. `5xx`
	pub class: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
	pub backend: String,
}

pub struct Metrics {
	registry: Registry,
	pub requests: Family<ListenerLabels, Counter>,
	pub responses: Family<StatusLabels, Counter>,
	pub backend_failures: Family<BackendLabels, Counter>,
	pub active_connections: Gauge,
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

impl Metrics {
	pub fn new() -> Metrics {
		let mut registry = Registry::with_prefix("turnpike");
		let requests = Family::<ListenerLabels, Counter>::default();
		registry.register(
			"requests",
			"Requests accepted, by listener",
			requests.clone(),
		);
		let responses = Family::<StatusLabels, Counter>::default();
		registry.register(
			"responses",
			"Responses sent, by listener and status class",
			responses.clone(),
		);
		let backend_failures = Family::<BackendLabels, Counter>::default();
		registry.register(
			"backend_failures",
			"Connect failures that marked a backend dead",
			backend_failures.clone(),
		);
		let active_connections = Gauge::default();
		registry.register(
			"active_connections",
			"Client connections currently being served",
			active_connections.clone(),
		);
		Metrics {
			registry,
			requests,
			responses,
			backend_failures,
			active_connections,
		}
	}

	pub fn observe_response(&self, listener: &str, status: u16) {
		let class = format!("{}xx", (status / 100).clamp(1, 5));
		self
			.responses
			.get_or_create(&StatusLabels {
				listener: listener.to_string(),
				class,
			})
			.inc();
	}

	/// Text exposition for the METRICS terminal backend.
	pub fn encode(&self) -> String {
		let mut out = String::new();
		if let Err(e) = prometheus_client::encoding::text::encode(&mut out, &self.registry) {
			tracing::warn!("metrics encoding failed: {e}");
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exposition_contains_counters() {
		let m = Metrics::new();
		m.requests
			.get_or_create(&ListenerLabels {
				listener: "web".into(),
			})
			.inc();
		m.observe_response("web", 204);
		m.active_connections.inc();
		let text = m.encode();
		assert!(text.contains("turnpike_requests_total"));
		assert!(text.contains("listener=\"web\""));
		assert!(text.contains("class=\"2xx\""));
		assert!(text.contains("turnpike_active_connections"));
	}
}
