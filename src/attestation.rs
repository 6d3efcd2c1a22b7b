//! Checking that a node runs inside a trusted execution environment.
//!
//! Nodes attach an attestation to their handshake answer: a hardware report
//! whose report data commits to the client's challenge and a set of node
//! facts, signed by a vendor key.
use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::debug;

use crate::{error::AttestationError, protocol::NodeUrl};

pub const SEV_SNP: &str = "AMD_SEV_SNP";

/// The report data field of a SEV-SNP report.
const REPORT_DATA: std::ops::Range<usize> = 0x50..0x90;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttestation {
    #[serde(rename = "type")]
    pub kind: String,
    /// Hex encoded challenge the report commits to.
    pub noonce: String,
    /// Base64 encoded node facts, such as `RELEASE_ID`.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Base64 encoded signatures over the report.
    #[serde(default)]
    pub signatures: Vec<String>,
    /// Base64 encoded hardware report.
    pub report: String,
}

impl NodeAttestation {
    /// The bytes the report data must be the hash of.
    pub fn expected_report_data(&self) -> Result<[u8; 64], AttestationError> {
        let noonce = hex::decode(&self.noonce)
            .map_err(|e| AttestationError::Malformed(format!("noonce: {}", e)))?;
        let mut hasher = Sha512::new();
        hasher.update(b"noonce");
        hasher.update(&noonce);
        hasher.update(b"data");
        for (k, v) in &self.data {
            let v = BASE64
                .decode(v)
                .map_err(|e| AttestationError::Malformed(format!("data {}: {}", k, e)))?;
            hasher.update(k.as_bytes());
            hasher.update(&v);
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&hasher.finalize());
        Ok(out)
    }

    fn release_id(&self) -> Result<Option<String>, AttestationError> {
        let Some(raw) = self.data.get("RELEASE_ID") else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(raw)
            .map_err(|e| AttestationError::Malformed(format!("RELEASE_ID: {}", e)))?;
        let release = String::from_utf8(bytes)
            .map_err(|_| AttestationError::Malformed("RELEASE_ID is not utf8".to_string()))?;
        if release.len() != 64 {
            return Err(AttestationError::Malformed(format!(
                "RELEASE_ID has length {}, expected 64",
                release.len()
            )));
        }
        Ok(Some(release))
    }
}

/// Decides whether a node's attestation is acceptable.
pub trait AttestationVerifier: Send + Sync {
    fn verify(
        &self,
        attestation: &NodeAttestation,
        challenge: &str,
        url: &NodeUrl,
    ) -> Result<(), AttestationError>;
}

/// Verifies SEV-SNP style reports against a vendor signing key.
#[derive(Debug, Clone)]
pub struct ReportVerifier {
    vendor_key: VerifyingKey,
    allowed_subnets: Option<BTreeSet<String>>,
}

impl ReportVerifier {
    pub fn new(vendor_key: VerifyingKey) -> Self {
        Self {
            vendor_key,
            allowed_subnets: None,
        }
    }

    /// Only accept releases whose subnet id (the part before `-`) is listed.
    pub fn with_allowed_subnets(mut self, subnets: impl IntoIterator<Item = String>) -> Self {
        self.allowed_subnets = Some(subnets.into_iter().collect());
        self
    }
}

impl AttestationVerifier for ReportVerifier {
    fn verify(
        &self,
        attestation: &NodeAttestation,
        challenge: &str,
        url: &NodeUrl,
    ) -> Result<(), AttestationError> {
        if attestation.kind != SEV_SNP {
            return Err(AttestationError::UnsupportedType(attestation.kind.clone()));
        }
        if !attestation.noonce.eq_ignore_ascii_case(challenge) {
            return Err(AttestationError::ChallengeMismatch);
        }

        let report = BASE64
            .decode(&attestation.report)
            .map_err(|e| AttestationError::Malformed(format!("report: {}", e)))?;
        if report.len() < REPORT_DATA.end {
            return Err(AttestationError::Malformed(format!(
                "report is only {} bytes",
                report.len()
            )));
        }
        let expected = attestation.expected_report_data()?;
        if report[REPORT_DATA] != expected[..] {
            return Err(AttestationError::ReportDataMismatch);
        }

        let signature = attestation
            .signatures
            .first()
            .ok_or_else(|| AttestationError::BadSignature("no signature".to_string()))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|e| AttestationError::BadSignature(e.to_string()))?;
        let signature = Signature::from_slice(&signature)
            .map_err(|e| AttestationError::BadSignature(e.to_string()))?;
        self.vendor_key
            .verify(&report, &signature)
            .map_err(|e| AttestationError::BadSignature(e.to_string()))?;

        if let Some(release) = attestation.release_id()? {
            let subnet = release.split('-').next().unwrap_or_default();
            if let Some(allowed) = &self.allowed_subnets {
                if !allowed.contains(subnet) {
                    return Err(AttestationError::UnknownRelease(release));
                }
            }
        }
        debug!(%url, "node attestation verified");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use p256::ecdsa::{signature::Signer, SigningKey};
    use rand_core::OsRng;

    use super::*;

    /// Produce a report the way a node would, signed by `vendor`.
    pub(crate) fn attest(vendor: &SigningKey, challenge: &str, release: &str) -> NodeAttestation {
        let mut attestation = NodeAttestation {
            kind: SEV_SNP.to_string(),
            noonce: challenge.to_string(),
            data: BTreeMap::from([
                ("INSTANCE_ID".to_string(), BASE64.encode("i-1234")),
                ("RELEASE_ID".to_string(), BASE64.encode(release)),
            ]),
            signatures: vec![],
            report: String::new(),
        };
        let mut report = vec![0u8; 0x4a0];
        report[REPORT_DATA].copy_from_slice(&attestation.expected_report_data().unwrap());
        let signature: Signature = vendor.sign(&report);
        attestation.signatures = vec![BASE64.encode(signature.to_bytes())];
        attestation.report = BASE64.encode(&report);
        attestation
    }

    fn release() -> String {
        format!("{:-<64}", "subnet01-")
    }

    #[test]
    fn test_valid_attestation() {
        let vendor = SigningKey::random(&mut OsRng);
        let verifier = ReportVerifier::new(VerifyingKey::from(&vendor))
            .with_allowed_subnets(["subnet01".to_string()]);
        let a = attest(&vendor, "abcd", &release());
        assert!(verifier.verify(&a, "abcd", &NodeUrl::from("http://n1")).is_ok());
    }

    #[test]
    fn test_wrong_challenge() {
        let vendor = SigningKey::random(&mut OsRng);
        let verifier = ReportVerifier::new(VerifyingKey::from(&vendor));
        let a = attest(&vendor, "abcd", &release());
        assert!(matches!(
            verifier.verify(&a, "beef", &NodeUrl::from("http://n1")),
            Err(AttestationError::ChallengeMismatch)
        ));
    }

    #[test]
    fn test_wrong_vendor() {
        let vendor = SigningKey::random(&mut OsRng);
        let other = SigningKey::random(&mut OsRng);
        let verifier = ReportVerifier::new(VerifyingKey::from(&other));
        let a = attest(&vendor, "abcd", &release());
        assert!(matches!(
            verifier.verify(&a, "abcd", &NodeUrl::from("http://n1")),
            Err(AttestationError::BadSignature(_))
        ));
    }

    #[test]
    fn test_tampered_data() {
        let vendor = SigningKey::random(&mut OsRng);
        let verifier = ReportVerifier::new(VerifyingKey::from(&vendor));
        let mut a = attest(&vendor, "abcd", &release());
        a.data.insert("INSTANCE_ID".to_string(), BASE64.encode("i-9999"));
        assert!(matches!(
            verifier.verify(&a, "abcd", &NodeUrl::from("http://n1")),
            Err(AttestationError::ReportDataMismatch)
        ));
    }

    #[test]
    fn test_unknown_subnet() {
        let vendor = SigningKey::random(&mut OsRng);
        let verifier = ReportVerifier::new(VerifyingKey::from(&vendor))
            .with_allowed_subnets(["other".to_string()]);
        let a = attest(&vendor, "abcd", &release());
        assert!(matches!(
            verifier.verify(&a, "abcd", &NodeUrl::from("http://n1")),
            Err(AttestationError::UnknownRelease(_))
        ));
    }
}
