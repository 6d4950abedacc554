use std::io;
use std::io::{Read, Write};

use crate::http::Header;

/// Hard cap on a single request/status/header line.
pub const MAX_LINE: usize = 4096;
/// Hard cap on the number of headers in one message head.
pub const MAX_HEADERS: usize = 128;

const COPY_CHUNK: usize = 8192;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
	#[error("i/o: {0}")]
	Io(#[from] io::Error),
	#[error("connection closed")]
	Eof,
	#[error("line exceeds {MAX_LINE} bytes")]
	LineTooLong,
	#[error("bare carriage return")]
	BareCr,
	#[error("illegal control character")]
	IllegalChar,
	#[error("malformed request line")]
	BadRequestLine,
	#[error("malformed status line")]
	BadStatusLine,
	#[error("malformed chunked encoding")]
	BadChunk,
	#[error("too many headers")]
	TooManyHeaders,
	#[error("NUL byte in decoded url")]
	NulInUrl,
}

impl ParseError {
	pub fn is_timeout(&self) -> bool {
		matches!(
			self,
			ParseError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
		)
	}
}

/// Read buffer shared between head parsing and body copying, so bytes the
/// line reader over-read are not lost when the body starts.
pub struct ReadBuf {
	buf: Vec<u8>,
	start: usize,
	end: usize,
}

impl Default for ReadBuf {
	fn default() -> Self {
		Self::new()
	}
}

impl ReadBuf {
	pub fn new() -> ReadBuf {
		ReadBuf {
			buf: vec![0; COPY_CHUNK],
			start: 0,
			end: 0,
		}
	}

	pub fn buffered(&self) -> usize {
		self.end - self.start
	}

	fn fill(&mut self, src: &mut impl Read) -> io::Result<usize> {
		if self.start == self.end {
			self.start = 0;
			self.end = 0;
		}
		if self.end == self.buf.len() {
			self.buf.copy_within(self.start..self.end, 0);
			self.end -= self.start;
			self.start = 0;
		}
		let n = src.read(&mut self.buf[self.end..])?;
		self.end += n;
		Ok(n)
	}

	fn next_byte(&mut self, src: &mut impl Read) -> io::Result<Option<u8>> {
		if self.start == self.end && self.fill(src)? == 0 {
			return Ok(None);
		}
		let b = self.buf[self.start];
		self.start += 1;
		Ok(Some(b))
	}

	/// Read one line, terminated by LF, stripping the terminator. A CR is
	/// legal only immediately before the LF; other control characters except
	/// TAB are rejected. A line longer than [`MAX_LINE`] is discarded through
	/// the next LF and reported as such.
	pub fn read_line(&mut self, src: &mut impl Read) -> Result<String, ParseError> {
		let mut line: Vec<u8> = Vec::with_capacity(128);
		let mut pending_cr = false;
		loop {
			let Some(b) = self.next_byte(src)? else {
				if line.is_empty() && !pending_cr {
					return Err(ParseError::Eof);
				}
				return Err(ParseError::Io(io::ErrorKind::UnexpectedEof.into()));
			};
			match b {
				b'\n' => {
					return String::from_utf8(line).map_err(|_| ParseError::IllegalChar);
				},
				b'\r' => {
					if pending_cr {
						return Err(ParseError::BareCr);
					}
					pending_cr = true;
				},
				_ => {
					if pending_cr {
						return Err(ParseError::BareCr);
					}
					if (b < 0x20 && b != b'\t') || b == 0x7f {
						return Err(ParseError::IllegalChar);
					}
					line.push(b);
					if line.len() > MAX_LINE {
						self.discard_to_lf(src)?;
						return Err(ParseError::LineTooLong);
					}
				},
			}
		}
	}

	fn discard_to_lf(&mut self, src: &mut impl Read) -> Result<(), ParseError> {
		loop {
			match self.next_byte(src)? {
				None => return Ok(()),
				Some(b'\n') => return Ok(()),
				Some(_) => {},
			}
		}
	}

	/// Flush any over-read bytes to a writer. Used when a connection turns
	/// into a tunnel and parsing stops.
	pub fn drain_to(&mut self, dst: &mut impl Write) -> io::Result<usize> {
		let n = self.buffered();
		if n > 0 {
			dst.write_all(&self.buf[self.start..self.end])?;
			self.start = 0;
			self.end = 0;
		}
		Ok(n)
	}

	/// Read into `out`, draining buffered bytes before touching the socket.
	pub fn read_some(&mut self, src: &mut impl Read, out: &mut [u8]) -> io::Result<usize> {
		if self.buffered() > 0 {
			let n = self.buffered().min(out.len());
			out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
			self.start += n;
			return Ok(n);
		}
		src.read(out)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
	pub method: String,
	pub url: String,
	pub version_minor: u8,
}

pub fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
	let mut it = line.split_ascii_whitespace();
	let (Some(method), Some(url), Some(version), None) =
		(it.next(), it.next(), it.next(), it.next())
	else {
		return Err(ParseError::BadRequestLine);
	};
	let minor = match version {
		"HTTP/1.0" => 0,
		"HTTP/1.1" => 1,
		_ => return Err(ParseError::BadRequestLine),
	};
	Ok(RequestLine {
		method: method.to_string(),
		url: url.to_string(),
		version_minor: minor,
	})
}

/// Parse `HTTP/1.x NNN reason`. The reason phrase may be absent.
pub fn parse_status_line(line: &str) -> Result<(u8, u16), ParseError> {
	let rest = line
		.strip_prefix("HTTP/1.")
		.ok_or(ParseError::BadStatusLine)?;
	let (minor, rest) = rest.split_once(' ').ok_or(ParseError::BadStatusLine)?;
	let minor = match minor {
		"0" => 0,
		"1" => 1,
		_ => return Err(ParseError::BadStatusLine),
	};
	let code = rest
		.trim_start()
		.split(' ')
		.next()
		.ok_or(ParseError::BadStatusLine)?;
	let status: u16 = code.parse().map_err(|_| ParseError::BadStatusLine)?;
	if !(100..1000).contains(&status) {
		return Err(ParseError::BadStatusLine);
	}
	Ok((minor, status))
}

/// Read headers until the blank line. Syntactically invalid headers are
/// dropped silently; the rest are kept verbatim, in order.
pub fn read_headers(
	rb: &mut ReadBuf,
	src: &mut impl Read,
) -> Result<Vec<Header>, ParseError> {
	let mut headers = Vec::new();
	loop {
		let line = match rb.read_line(src) {
			Ok(l) => l,
			// EOF mid-head is not a clean close
			Err(ParseError::Eof) => {
				return Err(ParseError::Io(io::ErrorKind::UnexpectedEof.into()));
			},
			Err(e) => return Err(e),
		};
		if line.is_empty() {
			return Ok(headers);
		}
		if headers.len() >= MAX_HEADERS {
			return Err(ParseError::TooManyHeaders);
		}
		let h = Header::new(line);
		if h.kind == crate::http::HeaderKind::Illegal {
			tracing::debug!(line = %h.line, "dropping illegal header");
			continue;
		}
		headers.push(h);
	}
}

pub fn is_token(name: &str) -> bool {
	!name.is_empty()
		&& name.bytes().all(|b| {
			b.is_ascii_alphanumeric()
				|| matches!(
					b,
					b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
						| b'_' | b'`' | b'|' | b'~'
				)
		})
}

/// Percent-decode a request-target. Three-byte `%HH` sequences with valid
/// hex digits decode; malformed escapes are passed through literally. A NUL
/// byte in the decoded form marks the request malformed. Bytes that do not
/// form valid UTF-8 are replaced for matching purposes only; the raw target
/// is what gets forwarded.
pub fn percent_decode(s: &str) -> Result<String, ParseError> {
	let bytes = s.as_bytes();
	let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'%' && i + 2 < bytes.len() {
			let hi = (bytes[i + 1] as char).to_digit(16);
			let lo = (bytes[i + 2] as char).to_digit(16);
			if let (Some(hi), Some(lo)) = (hi, lo) {
				out.push((hi * 16 + lo) as u8);
				i += 3;
				continue;
			}
		}
		out.push(bytes[i]);
		i += 1;
	}
	if out.contains(&0) {
		return Err(ParseError::NulInUrl);
	}
	Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Percent-encode anything outside a conservative whitelist. Used on
/// template-expanded URL components so user-controlled submatches cannot
/// smuggle delimiters into generated URLs.
pub fn encode_url(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for b in s.bytes() {
		let safe = b.is_ascii_alphanumeric()
			|| matches!(
				b,
				b'-' | b'.' | b'_' | b'~' | b':' | b'/' | b'?' | b'&' | b'=' | b'+' | b'%' | b'@'
					| b',' | b';' | b'$' | b'!' | b'*' | b'\'' | b'(' | b')'
			);
		if safe {
			out.push(b as char);
		} else {
			out.push_str(&format!("%{b:02X}"));
		}
	}
	out
}

/// Decode a query string into (name, value) pairs. Pairs whose decoded form
/// is malformed are skipped rather than failing the whole request.
pub fn query_pairs(query: &str) -> Vec<(String, String)> {
	query
		.split('&')
		.filter(|kv| !kv.is_empty())
		.filter_map(|kv| {
			let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
			Some((percent_decode(k).ok()?, percent_decode(v).ok()?))
		})
		.collect()
}

/// Copy exactly `len` body bytes.
pub fn copy_exact(
	rb: &mut ReadBuf,
	src: &mut impl Read,
	dst: &mut impl Write,
	len: u64,
) -> io::Result<u64> {
	let mut chunk = [0u8; COPY_CHUNK];
	let mut left = len;
	while left > 0 {
		let want = chunk.len().min(left as usize);
		let n = rb.read_some(src, &mut chunk[..want])?;
		if n == 0 {
			return Err(io::ErrorKind::UnexpectedEof.into());
		}
		dst.write_all(&chunk[..n])?;
		left -= n as u64;
	}
	Ok(len)
}

/// Copy until the source closes. The slower side gates throughput through
/// the blocking writes.
pub fn copy_until_eof(
	rb: &mut ReadBuf,
	src: &mut impl Read,
	dst: &mut impl Write,
) -> io::Result<u64> {
	let mut chunk = [0u8; COPY_CHUNK];
	let mut total = 0u64;
	loop {
		let n = rb.read_some(src, &mut chunk)?;
		if n == 0 {
			return Ok(total);
		}
		dst.write_all(&chunk[..n])?;
		total += n as u64;
	}
}

/// Copy a chunked body, re-framing each chunk header on CRLF and forwarding
/// chunk data and trailers verbatim. Returns the data byte count (framing
/// overhead excluded).
pub fn copy_chunked(
	rb: &mut ReadBuf,
	src: &mut impl Read,
	dst: &mut impl Write,
) -> Result<u64, ParseError> {
	let mut total = 0u64;
	loop {
		let line = rb.read_line(src)?;
		let size_part = line.split(';').next().unwrap_or("").trim();
		let size =
			u64::from_str_radix(size_part, 16).map_err(|_| ParseError::BadChunk)?;
		dst.write_all(line.as_bytes())?;
		dst.write_all(b"\r\n")?;
		if size == 0 {
			// trailers, then the final blank line
			loop {
				let trailer = rb.read_line(src)?;
				dst.write_all(trailer.as_bytes())?;
				dst.write_all(b"\r\n")?;
				if trailer.is_empty() {
					return Ok(total);
				}
			}
		}
		copy_exact(rb, src, dst, size)?;
		total += size;
		let sep = rb.read_line(src)?;
		if !sep.is_empty() {
			return Err(ParseError::BadChunk);
		}
		dst.write_all(b"\r\n")?;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn line_of(input: &[u8]) -> Result<String, ParseError> {
		let mut rb = ReadBuf::new();
		let mut src = io::Cursor::new(input.to_vec());
		rb.read_line(&mut src)
	}

	#[test]
	fn line_crlf_and_lf() {
		assert_eq!(line_of(b"GET / HTTP/1.1\r\n").unwrap(), "GET / HTTP/1.1");
		assert_eq!(line_of(b"GET / HTTP/1.1\n").unwrap(), "GET / HTTP/1.1");
		assert_eq!(line_of(b"\r\n").unwrap(), "");
	}

	#[test]
	fn bare_cr_rejected() {
		assert!(matches!(line_of(b"a\rb\n"), Err(ParseError::BareCr)));
		assert!(matches!(line_of(b"a\r\rb\n"), Err(ParseError::BareCr)));
	}

	#[test]
	fn control_chars_rejected_tab_allowed() {
		assert!(matches!(line_of(b"a\x01b\n"), Err(ParseError::IllegalChar)));
		assert_eq!(line_of(b"a\tb\n").unwrap(), "a\tb");
	}

	#[test]
	fn eof_reported_cleanly() {
		assert!(matches!(line_of(b""), Err(ParseError::Eof)));
		assert!(matches!(line_of(b"partial"), Err(ParseError::Io(_))));
	}

	#[test]
	fn too_long_line_flushed() {
		let mut input = vec![b'a'; MAX_LINE + 10];
		input.extend_from_slice(b"\nGET / HTTP/1.0\r\n");
		let mut rb = ReadBuf::new();
		let mut src = io::Cursor::new(input);
		assert!(matches!(
			rb.read_line(&mut src),
			Err(ParseError::LineTooLong)
		));
		// the next line is readable after the flush
		assert_eq!(rb.read_line(&mut src).unwrap(), "GET / HTTP/1.0");
	}

	#[test]
	fn request_line_parses() {
		let rl = parse_request_line("GET /x?y=1 HTTP/1.1").unwrap();
		assert_eq!(rl.method, "GET");
		assert_eq!(rl.url, "/x?y=1");
		assert_eq!(rl.version_minor, 1);
		assert!(parse_request_line("GET /x").is_err());
		assert!(parse_request_line("GET /x HTTP/2.0").is_err());
		assert!(parse_request_line("GET / HTTP/1.1 extra").is_err());
	}

	#[test]
	fn status_line_parses() {
		assert_eq!(parse_status_line("HTTP/1.1 200 OK").unwrap(), (1, 200));
		assert_eq!(
			parse_status_line("HTTP/1.0 101 Switching Protocols").unwrap(),
			(0, 101)
		);
		assert_eq!(parse_status_line("HTTP/1.1 204 ").unwrap(), (1, 204));
		assert!(parse_status_line("HTTP/2 200 OK").is_err());
		assert!(parse_status_line("HTTP/1.1 20x OK").is_err());
	}

	#[test]
	fn percent_decoding() {
		assert_eq!(percent_decode("/a%20b").unwrap(), "/a b");
		assert_eq!(percent_decode("/a%2Fb").unwrap(), "/a/b");
		// malformed escapes pass through literally
		assert_eq!(percent_decode("/a%2").unwrap(), "/a%2");
		assert_eq!(percent_decode("/a%zz").unwrap(), "/a%zz");
		// NUL is a rejection, not a decode
		assert!(matches!(percent_decode("/a%00b"), Err(ParseError::NulInUrl)));
	}

	#[test]
	fn url_encoding_blocks_unsafe() {
		assert_eq!(encode_url("/a b"), "/a%20b");
		assert_eq!(encode_url("/a\"b<c>"), "/a%22b%3Cc%3E");
		assert_eq!(encode_url("/ok-._~:/?&=+@"), "/ok-._~:/?&=+@");
	}

	#[test]
	fn query_pair_parsing() {
		let pairs = query_pairs("a=1&b=%20x&flag&=v");
		assert_eq!(
			pairs,
			vec![
				("a".to_string(), "1".to_string()),
				("b".to_string(), " x".to_string()),
				("flag".to_string(), "".to_string()),
				("".to_string(), "v".to_string()),
			]
		);
	}

	#[test]
	fn headers_drop_illegal_keep_order() {
		let input = b"Host: a\r\nbad header: x\r\nX-One: 1\r\n\r\n";
		let mut rb = ReadBuf::new();
		let mut src = io::Cursor::new(input.to_vec());
		let headers = read_headers(&mut rb, &mut src).unwrap();
		let lines: Vec<_> = headers.iter().map(|h| h.line.as_str()).collect();
		assert_eq!(lines, vec!["Host: a", "X-One: 1"]);
	}

	#[test]
	fn copy_exact_spans_buffer_and_socket() {
		let mut rb = ReadBuf::new();
		let mut src = io::Cursor::new(b"hello world".to_vec());
		// pull the first line-less bytes into the buffer by reading some
		let mut first = [0u8; 5];
		rb.fill(&mut src).unwrap();
		rb.read_some(&mut src, &mut first).unwrap();
		assert_eq!(&first, b"hello");
		let mut out = Vec::new();
		copy_exact(&mut rb, &mut src, &mut out, 6).unwrap();
		assert_eq!(out, b" world");
	}

	#[test]
	fn chunked_copy_roundtrip() {
		let body = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trail: 1\r\n\r\n";
		let mut rb = ReadBuf::new();
		let mut src = io::Cursor::new(body.to_vec());
		let mut out = Vec::new();
		let n = copy_chunked(&mut rb, &mut src, &mut out).unwrap();
		assert_eq!(n, 11);
		assert_eq!(out, body);
	}

	#[test]
	fn chunked_copy_rejects_garbage() {
		let body = b"zz\r\nhello\r\n";
		let mut rb = ReadBuf::new();
		let mut src = io::Cursor::new(body.to_vec());
		let mut out = Vec::new();
		assert!(matches!(
			copy_chunked(&mut rb, &mut src, &mut out),
			Err(ParseError::BadChunk)
		));
	}
}
