//! OpenSSH `authorized_keys` parsing.
//!
//! Each non-blank, non-comment line is `[options] algorithm base64 [comment]`.
//! The base64 blob must be a well-formed SSH wire key whose embedded
//! algorithm name matches the declared one.

use std::fmt;

use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Key algorithms accepted in `authorized_keys`.
const KEY_ALGORITHMS: &[&str] = &[
    "ssh-rsa",
    "ssh-dss",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
    "ssh-rsa-cert-v01@openssh.com",
    "ssh-dss-cert-v01@openssh.com",
    "ssh-ed25519-cert-v01@openssh.com",
    "ecdsa-sha2-nistp256-cert-v01@openssh.com",
    "ecdsa-sha2-nistp384-cert-v01@openssh.com",
    "ecdsa-sha2-nistp521-cert-v01@openssh.com",
    "sk-ssh-ed25519-cert-v01@openssh.com",
    "sk-ecdsa-sha2-nistp256-cert-v01@openssh.com",
];

/// One public key entry from an `authorized_keys` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    options: Vec<String>,
    algorithm: String,
    key_data: Vec<u8>,
    comment: String,
}

impl AuthorizedKey {
    /// Per-key options (`no-pty`, `command="..."`, ...), in file order.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Declared key algorithm.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Decoded SSH wire-format public key.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Trailing comment, empty when absent.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// OpenSSH-style SHA-256 fingerprint (`SHA256:<base64>`).
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.key_data);
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
        )
    }
}

impl fmt::Display for AuthorizedKey {
    /// Renders the key line without options.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.key_data);
        write!(f, "{} {encoded}", self.algorithm)?;
        if !self.comment.is_empty() {
            write!(f, " {}", self.comment)?;
        }
        Ok(())
    }
}

/// Why a key line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyLineError {
    /// Options or algorithm present but no key data.
    #[error("missing key data")]
    MissingKeyData,
    /// The algorithm field names no known key type.
    #[error("unknown key algorithm {0:?}")]
    UnknownAlgorithm(String),
    /// The key data is not valid base64.
    #[error("invalid base64 key data: {0}")]
    InvalidBase64(String),
    /// The decoded key blob is truncated or not SSH wire format.
    #[error("malformed key blob")]
    MalformedBlob,
    /// The blob encodes a different algorithm than the line declares.
    #[error("declared algorithm {declared} does not match key algorithm {embedded}")]
    AlgorithmMismatch {
        /// Algorithm named on the line.
        declared: String,
        /// Algorithm encoded in the blob.
        embedded: String,
    },
    /// An option value opened a quote that never closed.
    #[error("unterminated quote in options")]
    UnterminatedQuote,
}

/// A parse failure with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authorized_keys line {line}: {reason}")]
pub struct AuthorizedKeysError {
    /// 1-based line number.
    pub line: usize,
    /// What was wrong with the line.
    pub reason: KeyLineError,
}

/// Parse an `authorized_keys` document.
///
/// Blank lines and `#` comments are skipped; an empty document yields an
/// empty list. The first malformed line fails the whole document.
///
/// # Errors
///
/// Returns [`AuthorizedKeysError`] for the first line that does not parse.
pub fn parse_authorized_keys(content: &str) -> Result<Vec<AuthorizedKey>, AuthorizedKeysError> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                None
            } else {
                Some((index.saturating_add(1), line))
            }
        })
        .map(|(line_no, line)| {
            parse_line(line).map_err(|reason| AuthorizedKeysError {
                line: line_no,
                reason,
            })
        })
        .collect()
}

fn parse_line(line: &str) -> Result<AuthorizedKey, KeyLineError> {
    let (first, _) = split_token(line);
    let (options, rest) = if is_known_algorithm(first) {
        (Vec::new(), line)
    } else {
        split_options(line)?
    };

    let (algorithm, rest) = split_token(rest);
    if algorithm.is_empty() {
        return Err(KeyLineError::MissingKeyData);
    }
    if !is_known_algorithm(algorithm) {
        return Err(KeyLineError::UnknownAlgorithm(algorithm.to_owned()));
    }

    let (encoded, comment) = split_token(rest);
    if encoded.is_empty() {
        return Err(KeyLineError::MissingKeyData);
    }

    let key_data = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| KeyLineError::InvalidBase64(e.to_string()))?;

    let embedded = embedded_algorithm(&key_data).ok_or(KeyLineError::MalformedBlob)?;
    if embedded != algorithm {
        return Err(KeyLineError::AlgorithmMismatch {
            declared: algorithm.to_owned(),
            embedded: embedded.to_owned(),
        });
    }

    Ok(AuthorizedKey {
        options,
        algorithm: algorithm.to_owned(),
        key_data,
        comment: comment.trim().to_owned(),
    })
}

fn is_known_algorithm(candidate: &str) -> bool {
    KEY_ALGORITHMS.contains(&candidate)
}

/// Split off the first whitespace-delimited token.
fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => {
            let (token, rest) = s.split_at(end);
            (token, rest.trim_start())
        }
        None => (s, ""),
    }
}

/// Split the leading options field (which may contain quoted whitespace)
/// from the rest of the line.
fn split_options(line: &str) -> Result<(Vec<String>, &str), KeyLineError> {
    let mut in_quotes = false;
    let mut escaped = false;

    for (index, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                let (options, rest) = line.split_at(index);
                return Ok((split_option_list(options), rest));
            }
            _ => {}
        }
    }

    if in_quotes {
        Err(KeyLineError::UnterminatedQuote)
    } else {
        Err(KeyLineError::MissingKeyData)
    }
}

/// Split a comma-separated option list, keeping commas inside quotes.
fn split_option_list(options: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in options.chars() {
        if escaped {
            escaped = false;
            current.push(c);
            continue;
        }
        match c {
            '\\' if in_quotes => {
                escaped = true;
                current.push(c);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts.retain(|part| !part.is_empty());
    parts
}

/// Algorithm name encoded at the start of an SSH wire-format key blob.
fn embedded_algorithm(blob: &[u8]) -> Option<&str> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = usize::try_from(u32::from_be_bytes(len_bytes)).ok()?;
    let end = len.checked_add(4)?;
    std::str::from_utf8(blob.get(4..end)?).ok()
}
