use std::collections::HashMap;
use std::fs;
use std::path::Path;

use base64::Engine;
use tracing::warn;

/// An htpasswd-style credential store. Plaintext and `{SHA}` entries are
/// supported; entries in other formats are skipped at load time.
#[derive(Debug, Clone, Default)]
pub struct PasswdFile {
	entries: HashMap<String, PasswdHash>,
}

#[derive(Debug, Clone)]
enum PasswdHash {
	Plain(String),
	Sha1(Vec<u8>),
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
	#[error("reading password file: {0}")]
	Io(#[from] std::io::Error),
}

impl PasswdFile {
	pub fn load(path: &Path) -> Result<PasswdFile, AuthError> {
		let contents = fs::read_to_string(path)?;
		Ok(Self::parse(&contents, &path.display().to_string()))
	}

	pub fn parse(contents: &str, origin: &str) -> PasswdFile {
		let mut entries = HashMap::new();
		for line in contents.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let Some((user, hash)) = line.split_once(':') else {
				warn!(%origin, "skipping malformed password entry");
				continue;
			};
			let parsed = if let Some(b64) = hash.strip_prefix("{SHA}") {
				match base64::engine::general_purpose::STANDARD.decode(b64) {
					Ok(digest) => PasswdHash::Sha1(digest),
					Err(_) => {
						warn!(%origin, user, "skipping entry with bad {{SHA}} digest");
						continue;
					},
				}
			} else if hash.starts_with('$') {
				warn!(%origin, user, "crypt-format password entries are not supported");
				continue;
			} else {
				PasswdHash::Plain(hash.to_string())
			};
			entries.insert(user.to_string(), parsed);
		}
		PasswdFile { entries }
	}

	pub fn verify(&self, user: &str, password: &str) -> bool {
		match self.entries.get(user) {
			Some(PasswdHash::Plain(p)) => constant_time_eq(p.as_bytes(), password.as_bytes()),
			Some(PasswdHash::Sha1(digest)) => {
				let got =
					ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, password.as_bytes());
				constant_time_eq(digest, got.as_ref())
			},
			None => false,
		}
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plaintext_entries() {
		let pf = PasswdFile::parse("alice:secret\n# comment\n\nbob:hunter2\n", "test");
		assert!(pf.verify("alice", "secret"));
		assert!(pf.verify("bob", "hunter2"));
		assert!(!pf.verify("alice", "wrong"));
		assert!(!pf.verify("carol", "secret"));
	}

	#[test]
	fn sha_entries() {
		// {SHA} of "password"
		let pf = PasswdFile::parse("dave:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=\n", "test");
		assert!(pf.verify("dave", "password"));
		assert!(!pf.verify("dave", "Password"));
	}

	#[test]
	fn crypt_entries_skipped() {
		let pf = PasswdFile::parse("eve:$apr1$abcdefgh$012345678901234567890\n", "test");
		assert!(!pf.verify("eve", "anything"));
	}
}
