use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::http::{Request, Response};

const DEFAULT_TIME_FORMAT: &str = "[%d/%b/%Y:%H:%M:%S %z]";

/// A compiled access-log format: a sequence of literal and field
/// fragments, rendered once per exchange.
#[derive(Debug, Clone, Default)]
pub struct LogFormat {
	frags: Vec<Frag>,
}

#[derive(Debug, Clone)]
enum Frag {
	Lit(String),
	ClientIp,
	RequestLine,
	Status,
	/// `%b`: body bytes, `-` when zero.
	BytesDash,
	Bytes,
	DurationMicros,
	DurationSecs,
	Time(String),
	ReqHeader(String),
	RespHeader(String),
	ServiceName,
	BackendName,
	ListenerName,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LogFormatError {
	#[error("unknown log directive %{0}")]
	UnknownDirective(char),
	#[error("unterminated %{{...}} directive")]
	Unterminated,
	#[error("unknown %{{{0}}}N selector")]
	UnknownName(String),
	#[error("unknown log format {0:?}")]
	UnknownFormat(String),
	#[error("bad time format {0:?}")]
	BadTimeFormat(String),
}

fn check_time_format(fmt: &str) -> Result<(), LogFormatError> {
	use std::fmt::Write;
	let mut buf = String::new();
	write!(buf, "{}", Local::now().format(fmt))
		.map_err(|_| LogFormatError::BadTimeFormat(fmt.to_string()))
}

/// Built-in formats selectable by name.
pub fn named_format(name: &str) -> Option<&'static str> {
	match name {
		"null" => Some(""),
		"minimal" => Some("%a \"%r\" %s"),
		"regular" => Some("%a - - %t \"%r\" %s %b"),
		"combined" => Some("%a - - %t \"%r\" %s %b \"%{Referer}i\" \"%{User-Agent}i\""),
		"extended" => Some(
			"%a - - %t \"%r\" %s %b \"%{Referer}i\" \"%{User-Agent}i\" (%{service}N -> %{backend}N) %D",
		),
		"detailed" => Some(
			"%a - - %t \"%r\" %s %b \"%{Referer}i\" \"%{User-Agent}i\" \"%{Host}i\" (%{service}N -> %{backend}N) %D",
		),
		_ => None,
	}
}

impl LogFormat {
	/// Resolve a name against the built-in table, else compile as a format
	/// string.
	pub fn resolve(spec: &str) -> Result<LogFormat, LogFormatError> {
		match named_format(spec) {
			Some(fmt) => Self::compile(fmt),
			None => Self::compile(spec),
		}
	}

	pub fn compile(fmt: &str) -> Result<LogFormat, LogFormatError> {
		let mut frags = Vec::new();
		let mut lit = String::new();
		let mut chars = fmt.chars().peekable();
		let mut push_lit = |lit: &mut String, frags: &mut Vec<Frag>| {
			if !lit.is_empty() {
				frags.push(Frag::Lit(std::mem::take(lit)));
			}
		};
		while let Some(c) = chars.next() {
			if c != '%' {
				lit.push(c);
				continue;
			}
			match chars.next() {
				Some('%') => lit.push('%'),
				Some('a') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::ClientIp);
				},
				Some('r') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::RequestLine);
				},
				Some('s') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::Status);
				},
				Some('b') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::BytesDash);
				},
				Some('B') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::Bytes);
				},
				Some('D') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::DurationMicros);
				},
				Some('T') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::DurationSecs);
				},
				Some('t') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::Time(DEFAULT_TIME_FORMAT.to_string()));
				},
				Some('v') => {
					push_lit(&mut lit, &mut frags);
					frags.push(Frag::ListenerName);
				},
				Some('{') => {
					let mut name = String::new();
					loop {
						match chars.next() {
							Some('}') => break,
							Some(c) => name.push(c),
							None => return Err(LogFormatError::Unterminated),
						}
					}
					let selector = chars.next().ok_or(LogFormatError::Unterminated)?;
					push_lit(&mut lit, &mut frags);
					match selector {
						'i' => frags.push(Frag::ReqHeader(name)),
						'o' => frags.push(Frag::RespHeader(name)),
						't' | 'T' => {
							check_time_format(&name)?;
							frags.push(Frag::Time(name));
						},
						'N' => match name.as_str() {
							"service" => frags.push(Frag::ServiceName),
							"backend" => frags.push(Frag::BackendName),
							other => return Err(LogFormatError::UnknownName(other.to_string())),
						},
						other => return Err(LogFormatError::UnknownDirective(other)),
					}
				},
				Some(other) => return Err(LogFormatError::UnknownDirective(other)),
				None => lit.push('%'),
			}
		}
		if !lit.is_empty() {
			frags.push(Frag::Lit(lit));
		}
		Ok(LogFormat { frags })
	}

	/// The `null` format: nothing is emitted at all.
	pub fn is_null(&self) -> bool {
		self.frags.is_empty()
	}

	pub fn render(&self, rec: &AccessRecord) -> String {
		let mut out = String::new();
		for frag in &self.frags {
			match frag {
				Frag::Lit(s) => out.push_str(s),
				Frag::ClientIp => {
					let ip = if rec.anonymise {
						anonymize(rec.peer.ip())
					} else {
						rec.peer.ip()
					};
					out.push_str(&ip.to_string());
				},
				Frag::RequestLine => out.push_str(rec.request_line),
				Frag::Status => out.push_str(&rec.status.to_string()),
				Frag::BytesDash => {
					if rec.bytes == 0 {
						out.push('-');
					} else {
						out.push_str(&rec.bytes.to_string());
					}
				},
				Frag::Bytes => out.push_str(&rec.bytes.to_string()),
				Frag::DurationMicros => out.push_str(&rec.duration.as_micros().to_string()),
				Frag::DurationSecs => out.push_str(&rec.duration.as_secs().to_string()),
				Frag::Time(fmt) => out.push_str(&rec.when.format(fmt).to_string()),
				Frag::ReqHeader(name) => {
					if let Some(v) = rec.req.and_then(|r| r.named_header_value(name)) {
						out.push_str(v);
					} else {
						out.push('-');
					}
				},
				Frag::RespHeader(name) => {
					if let Some(v) = rec.resp.and_then(|r| r.named_header_value(name)) {
						out.push_str(v);
					} else {
						out.push('-');
					}
				},
				Frag::ServiceName => out.push_str(rec.service.unwrap_or("-")),
				Frag::BackendName => out.push_str(rec.backend.as_deref().unwrap_or("-")),
				Frag::ListenerName => out.push_str(rec.listener),
			}
		}
		out
	}
}

/// Everything one exchange contributes to its log line.
pub struct AccessRecord<'a> {
	pub peer: SocketAddr,
	pub anonymise: bool,
	pub listener: &'a str,
	pub service: Option<&'a str>,
	pub backend: Option<String>,
	pub request_line: &'a str,
	pub status: u16,
	pub bytes: u64,
	pub duration: Duration,
	pub when: DateTime<Local>,
	pub req: Option<&'a Request>,
	pub resp: Option<&'a Response>,
}

/// Zero the host part of the address: the last octet for IPv4, the last
/// group for IPv6.
pub fn anonymize(ip: IpAddr) -> IpAddr {
	match ip {
		IpAddr::V4(v4) => {
			let mut o = v4.octets();
			o[3] = 0;
			IpAddr::V4(Ipv4Addr::from(o))
		},
		IpAddr::V6(v6) => {
			let mut s = v6.segments();
			s[7] = 0;
			IpAddr::V6(Ipv6Addr::from(s))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::{Header, Method};

	fn record<'a>(req: &'a Request, resp: &'a Response) -> AccessRecord<'a> {
		AccessRecord {
			peer: "203.0.113.9:51000".parse().unwrap(),
			anonymise: false,
			listener: "web",
			service: Some("app"),
			backend: Some("10.0.0.1:8080".to_string()),
			request_line: "GET /x HTTP/1.1",
			status: 200,
			bytes: 1234,
			duration: Duration::from_micros(2500),
			when: Local::now(),
			req: Some(req),
			resp: Some(resp),
		}
	}

	fn sample() -> (Request, Response) {
		let req = Request {
			method: Method::Get,
			method_token: "GET".into(),
			version_minor: 1,
			url: "/x".into(),
			decoded: "/x".into(),
			headers: vec![Header::new("User-Agent: curl/8".into())],
			basic_user: None,
			basic_pass: None,
		};
		let resp = Response {
			line: "HTTP/1.1 200 OK".into(),
			version_minor: 1,
			status: 200,
			headers: vec![Header::new("Content-Type: text/plain".into())],
		};
		(req, resp)
	}

	#[test]
	fn renders_fields_and_headers() {
		let (req, resp) = sample();
		let rec = record(&req, &resp);
		let f = LogFormat::compile(
			"%a \"%r\" %s %b %D (%{service}N -> %{backend}N) ua=%{User-Agent}i ct=%{Content-Type}o",
		)
		.unwrap();
		assert_eq!(
			f.render(&rec),
			"203.0.113.9 \"GET /x HTTP/1.1\" 200 1234 2500 (app -> 10.0.0.1:8080) ua=curl/8 ct=text/plain"
		);
	}

	#[test]
	fn missing_header_renders_dash() {
		let (req, resp) = sample();
		let rec = record(&req, &resp);
		let f = LogFormat::compile("%{Referer}i/%{X-None}o").unwrap();
		assert_eq!(f.render(&rec), "-/-");
	}

	#[test]
	fn bytes_dash_semantics() {
		let (req, resp) = sample();
		let mut rec = record(&req, &resp);
		rec.bytes = 0;
		let f = LogFormat::compile("%b %B").unwrap();
		assert_eq!(f.render(&rec), "- 0");
	}

	#[test]
	fn percent_escape_and_errors() {
		assert!(LogFormat::compile("100%% ok").is_ok());
		assert_eq!(
			LogFormat::compile("%q").unwrap_err(),
			LogFormatError::UnknownDirective('q')
		);
		assert_eq!(
			LogFormat::compile("%{x").unwrap_err(),
			LogFormatError::Unterminated
		);
		assert_eq!(
			LogFormat::compile("%{whoever}N").unwrap_err(),
			LogFormatError::UnknownName("whoever".into())
		);
	}

	#[test]
	fn named_formats_compile() {
		for name in ["null", "minimal", "regular", "combined", "extended", "detailed"] {
			let f = LogFormat::resolve(name).unwrap();
			assert_eq!(f.is_null(), name == "null");
		}
	}

	#[test]
	fn anonymization() {
		assert_eq!(
			anonymize("203.0.113.77".parse().unwrap()),
			"203.0.113.0".parse::<IpAddr>().unwrap()
		);
		assert_eq!(
			anonymize("2001:db8::abcd".parse().unwrap()),
			"2001:db8::".parse::<IpAddr>().unwrap()
		);
	}

	#[test]
	fn custom_time_format() {
		let (req, resp) = sample();
		let rec = record(&req, &resp);
		let f = LogFormat::compile("%{%Y}t").unwrap();
		let y: i32 = f.render(&rec).parse().unwrap();
		assert!(y >= 2024);
	}
}
