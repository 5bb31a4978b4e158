use anyhow::{anyhow, Result};

/// Nonce count for the single response we send per challenge.
pub const NONCE_COUNT: &str = "00000001";

/// Parameters of a `WWW-Authenticate` / `Proxy-Authenticate: Digest ...` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let params = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => return Err(anyhow!("unsupported auth scheme: {}", header)),
        };

        let mut challenge = DigestChallenge::default();
        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "nonce" => challenge.nonce = value,
                "qop" => challenge.qop = Some(value),
                "opaque" => challenge.opaque = Some(value),
                "algorithm" => challenge.algorithm = Some(value),
                "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        if challenge.nonce.is_empty() {
            return Err(anyhow!("digest challenge without nonce"));
        }
        if let Some(algorithm) = &challenge.algorithm {
            if !algorithm.eq_ignore_ascii_case("md5") {
                return Err(anyhow!("unsupported digest algorithm: {}", algorithm));
            }
        }
        Ok(challenge)
    }

    /// True when the server offers `qop=auth` (possibly among other options).
    pub fn offers_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .map(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Split `a="x, y", b=z` on commas outside quotes.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ',' if !quoted => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

pub fn generate_cnonce() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// The values that go into an `Authorization` header.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

impl DigestResponse {
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            self.username, self.realm, self.nonce, self.uri, self.response
        );
        if let (Some(qop), Some(cnonce)) = (&self.qop, &self.cnonce) {
            value.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, NONCE_COUNT, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        value
    }
}

/// RFC 2617 MD5 digest. `cnonce` is only used when the challenge offers `qop=auth`.
pub fn compute_response(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    if challenge.offers_auth_qop() {
        md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, challenge.nonce, NONCE_COUNT, cnonce, ha2
        ))
    } else {
        md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    }
}

pub fn authorize_with_cnonce(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    cnonce: &str,
) -> DigestResponse {
    let with_qop = challenge.offers_auth_qop();
    DigestResponse {
        username: username.to_string(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: uri.to_string(),
        response: compute_response(challenge, username, password, method, uri, cnonce),
        qop: with_qop.then(|| "auth".to_string()),
        cnonce: with_qop.then(|| cnonce.to_string()),
        opaque: challenge.opaque.clone(),
    }
}

pub fn authorize(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
) -> DigestResponse {
    authorize_with_cnonce(challenge, username, password, method, uri, &generate_cnonce())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(qop: Option<&str>) -> DigestChallenge {
        DigestChallenge {
            realm: "sip.example.com".to_string(),
            nonce: "abc123".to_string(),
            qop: qop.map(|q| q.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_md5_hex_parts() {
        assert_eq!(
            md5_hex("alice:sip.example.com:secret"),
            "a0bbf6034b8565747c15ee9850d9215a"
        );
        assert_eq!(
            md5_hex("REGISTER:sip:sip.example.com"),
            "f5a9c05d4ad57c53aaa1a7b89507efaa"
        );
    }

    #[test]
    fn test_response_without_qop() {
        let response = compute_response(
            &challenge(None),
            "alice",
            "secret",
            "REGISTER",
            "sip:sip.example.com",
            "ignored",
        );
        assert_eq!(response, "6658ff255cae496732516470a4a20dc9");
    }

    #[test]
    fn test_response_with_qop_auth() {
        let response = compute_response(
            &challenge(Some("auth,auth-int")),
            "alice",
            "secret",
            "REGISTER",
            "sip:sip.example.com",
            "0a4f113b",
        );
        assert_eq!(response, "11c9668ed2c1aa352c2a758f5d7c5cc1");
    }

    #[test]
    fn test_parse_challenge() {
        let parsed = DigestChallenge::parse(
            "Digest realm=\"sip.example.com\", nonce=\"abc123\", qop=\"auth,auth-int\", opaque=\"xyz\", algorithm=MD5, stale=TRUE",
        )
        .unwrap();
        assert_eq!(parsed.realm, "sip.example.com");
        assert_eq!(parsed.nonce, "abc123");
        assert_eq!(parsed.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(parsed.opaque.as_deref(), Some("xyz"));
        assert!(parsed.stale);
        assert!(parsed.offers_auth_qop());
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(DigestChallenge::parse("Basic realm=\"x\"").is_err());
        assert!(DigestChallenge::parse("Digest realm=\"x\"").is_err());
        assert!(DigestChallenge::parse("Digest realm=\"x\", nonce=\"n\", algorithm=SHA-256").is_err());
    }

    #[test]
    fn test_authorization_header() {
        let mut c = challenge(Some("auth"));
        c.opaque = Some("op".to_string());
        let auth = authorize_with_cnonce(&c, "alice", "secret", "REGISTER", "sip:sip.example.com", "0a4f113b");
        assert_eq!(
            auth.to_header_value(),
            "Digest username=\"alice\", realm=\"sip.example.com\", nonce=\"abc123\", \
             uri=\"sip:sip.example.com\", response=\"11c9668ed2c1aa352c2a758f5d7c5cc1\", \
             algorithm=MD5, qop=auth, nc=00000001, cnonce=\"0a4f113b\", opaque=\"op\""
        );

        let plain = authorize(&challenge(None), "alice", "secret", "REGISTER", "sip:sip.example.com");
        assert!(plain.qop.is_none());
        assert!(!plain.to_header_value().contains("cnonce"));
    }

    #[test]
    fn test_cnonce_is_random_hex() {
        let a = generate_cnonce();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, generate_cnonce());
    }
}
