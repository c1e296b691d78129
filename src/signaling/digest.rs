//! HTTP digest authentication for SIP (RFC 2617 / RFC 8760).

use md5::Md5;
use sha2::{Digest, Sha256};

use super::sip::header_param;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha256,
}

impl Algorithm {
    fn hash(self, input: &str) -> String {
        match self {
            Algorithm::Md5 => hex(&Md5::digest(input.as_bytes())),
            Algorithm::Sha256 => hex(&Sha256::digest(input.as_bytes())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Sha256 => "SHA-256",
        }
    }
}

/// A parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Algorithm,
    pub qop_auth: bool,
    pub opaque: Option<String>,
}

impl Challenge {
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Digest")?.trim();
        let mut realm = None;
        let mut nonce = None;
        let mut algorithm = Algorithm::Md5;
        let mut qop_auth = false;
        let mut opaque = None;

        for (key, value) in split_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => {
                    algorithm = match value.to_ascii_uppercase().as_str() {
                        "MD5" => Algorithm::Md5,
                        "SHA-256" => Algorithm::Sha256,
                        other => {
                            tracing::warn!("Unsupported digest algorithm: {}", other);
                            return None;
                        }
                    }
                }
                "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            algorithm,
            qop_auth,
            opaque,
        })
    }

    /// Build the `Authorization` header value answering this challenge.
    pub fn authorize(&self, username: &str, password: &str, method: &str, uri: &str, nc: u32) -> String {
        let cnonce = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        self.authorize_with_cnonce(username, password, method, uri, nc, &cnonce)
    }

    fn authorize_with_cnonce(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let alg = self.algorithm;
        let ha1 = alg.hash(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = alg.hash(&format!("{}:{}", method, uri));
        let nc = format!("{:08x}", nc);

        let response = if self.qop_auth {
            alg.hash(&format!("{}:{}:{}:{}:auth:{}", ha1, self.nonce, nc, cnonce, ha2))
        } else {
            alg.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut out = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            username,
            self.realm,
            self.nonce,
            uri,
            response,
            alg.name()
        );
        if self.qop_auth {
            out.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            out.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        out
    }
}

/// Split `k=v, k="v, with comma"` pairs.
fn split_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = rest[eq + 1..].trim_start();
        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        rest = rest.trim_start().trim_start_matches(',').trim_start();
        out.push((key, value));
    }
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Whether a response's `Authentication-Info` or challenge is stale.
pub fn is_stale(header: &str) -> bool {
    header_param(&header.replace(',', ";"), "stale")
        .map(|v| v.trim_matches('"').eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
