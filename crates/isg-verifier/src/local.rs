use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use isg_core::{split_display_name, VerifiedIdentity};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Local signature verification: a keyed HMAC-SHA256 check over
/// header.payload token segments, then claim validation.
pub struct LocalVerifier {
    secret: String,
    issuer: Option<String>,
    audience: Option<String>,
}

impl LocalVerifier {
    pub fn new(secret: impl Into<String>, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer,
            audience,
        }
    }

    pub fn verify(&self, credential: &str) -> Option<VerifiedIdentity> {
        self.verify_at(credential, Utc::now())
    }

    fn verify_at(&self, credential: &str, now: DateTime<Utc>) -> Option<VerifiedIdentity> {
        let segments: Vec<&str> = credential.split('.').collect();
        let [header, payload, signature] = segments.as_slice() else {
            debug!("credential rejected: expected 3 segments");
            return None;
        };

        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        // Constant-time comparison; length mismatch also rejects.
        if mac.verify_slice(&signature).is_err() {
            debug!("credential rejected: signature mismatch");
            return None;
        }

        let payload = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let claims: Value = serde_json::from_slice(&payload).ok()?;

        if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
            // Valid strictly while now < exp.
            if now.timestamp() >= exp {
                debug!("credential rejected: expired");
                return None;
            }
        }

        if let Some(expected) = self.issuer.as_deref() {
            if claims.get("iss").and_then(Value::as_str) != Some(expected) {
                debug!("credential rejected: issuer mismatch");
                return None;
            }
        }

        if let Some(expected) = self.audience.as_deref() {
            let matched = match claims.get("aud") {
                Some(Value::String(audience)) => audience == expected,
                Some(Value::Array(audiences)) => audiences
                    .iter()
                    .any(|audience| audience.as_str() == Some(expected)),
                _ => false,
            };
            if !matched {
                debug!("credential rejected: audience mismatch");
                return None;
            }
        }

        let Some(subject) = claims.get("sub").and_then(Value::as_str) else {
            debug!("credential rejected: missing subject");
            return None;
        };

        let (first_name, last_name) = claim_names(&claims);
        let email = claims
            .get("email")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(VerifiedIdentity {
            external_id: subject.to_string(),
            first_name,
            last_name,
            email,
            claims,
        })
    }
}

fn claim_names(claims: &Value) -> (Option<String>, Option<String>) {
    let given = claims
        .get("given_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let family = claims
        .get("family_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty());

    if given.is_some() || family.is_some() {
        return (given.map(str::to_string), family.map(str::to_string));
    }

    match claims.get("name").and_then(Value::as_str) {
        Some(name) => split_display_name(name),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn mint(secret: &str, claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("mac key");
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{header}.{payload}.{signature}")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn verifier() -> LocalVerifier {
        LocalVerifier::new(SECRET, None, None)
    }

    #[test]
    fn valid_token_yields_identity() {
        let token = mint(SECRET, &json!({"sub": "ext-42", "name": "Ana Lopez"}));
        let identity = verifier().verify_at(&token, now()).expect("verified");
        assert_eq!(identity.external_id, "ext-42");
        assert_eq!(identity.first_name.as_deref(), Some("Ana"));
        assert_eq!(identity.last_name.as_deref(), Some("Lopez"));
    }

    #[test]
    fn explicit_name_claims_win_over_display_name() {
        let token = mint(
            SECRET,
            &json!({
                "sub": "ext-42",
                "given_name": "Ana",
                "family_name": "Lopez",
                "name": "Someone Else",
                "email": "ana@example.com",
            }),
        );
        let identity = verifier().verify_at(&token, now()).expect("verified");
        assert_eq!(identity.first_name.as_deref(), Some("Ana"));
        assert_eq!(identity.last_name.as_deref(), Some("Lopez"));
        assert_eq!(identity.email.as_deref(), Some("ana@example.com"));
    }

    #[test]
    fn tampered_signature_rejects() {
        let token = mint(SECRET, &json!({"sub": "ext-42"}));
        let mut bytes = token.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).expect("utf8");
        assert!(verifier().verify_at(&tampered, now()).is_none());
    }

    #[test]
    fn wrong_secret_rejects() {
        let token = mint("other-secret", &json!({"sub": "ext-42"}));
        assert!(verifier().verify_at(&token, now()).is_none());
    }

    #[test]
    fn segment_count_must_be_exactly_three() {
        assert!(verifier().verify_at("onlyonesegment", now()).is_none());
        assert!(verifier().verify_at("two.segments", now()).is_none());
        assert!(verifier().verify_at("a.b.c.d", now()).is_none());
    }

    #[test]
    fn expiry_boundary_is_strict_less_than() {
        let at = now();
        let expired = mint(SECRET, &json!({"sub": "s", "exp": at.timestamp() - 1}));
        assert!(verifier().verify_at(&expired, at).is_none());

        let exact = mint(SECRET, &json!({"sub": "s", "exp": at.timestamp()}));
        assert!(verifier().verify_at(&exact, at).is_none());

        let live = mint(SECRET, &json!({"sub": "s", "exp": at.timestamp() + 1}));
        assert!(verifier().verify_at(&live, at).is_some());
    }

    #[test]
    fn issuer_constraint_must_match() {
        let verifier = LocalVerifier::new(SECRET, Some("issuer-a".to_string()), None);
        let good = mint(SECRET, &json!({"sub": "s", "iss": "issuer-a"}));
        let bad = mint(SECRET, &json!({"sub": "s", "iss": "issuer-b"}));
        let missing = mint(SECRET, &json!({"sub": "s"}));
        assert!(verifier.verify_at(&good, now()).is_some());
        assert!(verifier.verify_at(&bad, now()).is_none());
        assert!(verifier.verify_at(&missing, now()).is_none());
    }

    #[test]
    fn audience_accepts_single_value_or_list() {
        let verifier = LocalVerifier::new(SECRET, None, Some("gate".to_string()));
        let single = mint(SECRET, &json!({"sub": "s", "aud": "gate"}));
        let listed = mint(SECRET, &json!({"sub": "s", "aud": ["other", "gate"]}));
        let wrong = mint(SECRET, &json!({"sub": "s", "aud": ["other"]}));
        let missing = mint(SECRET, &json!({"sub": "s"}));
        assert!(verifier.verify_at(&single, now()).is_some());
        assert!(verifier.verify_at(&listed, now()).is_some());
        assert!(verifier.verify_at(&wrong, now()).is_none());
        assert!(verifier.verify_at(&missing, now()).is_none());
    }

    #[test]
    fn missing_subject_rejects() {
        let token = mint(SECRET, &json!({"name": "Ana Lopez"}));
        assert!(verifier().verify_at(&token, now()).is_none());
    }

    #[test]
    fn malformed_payload_encoding_rejects() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload = "!!not-base64!!";
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).expect("mac key");
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        let token = format!("{header}.{payload}.{signature}");
        assert!(verifier().verify_at(&token, now()).is_none());
    }
}
