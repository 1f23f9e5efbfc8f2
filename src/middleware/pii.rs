//! PII middleware
//!
//! Detects emails, phone numbers, SSNs, credit cards, API keys and user
//! file paths in request content. Depending on the configured action the
//! matches are replaced by restorable placeholders, one-way hashes, only
//! logged, or the request is rejected. Placeholders are substituted back
//! in the response body.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{PiiAction, PiiConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::context::RequestContext;
use crate::proxy::request::{MessageContent, ProxyRequest, ProxyResponse};
use crate::store::PiiLogger;

static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_.+-]+@[A-Za-z0-9-]+\.[A-Za-z0-9-.]+").unwrap());
static RE_PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+[1-9]\d{7,14}\b|\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b").unwrap()
});
static RE_SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static RE_CREDIT_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").unwrap());
static RE_API_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\bsk-[A-Za-z0-9_-]{16,}\b|\bAKIA[0-9A-Z]{16}\b|\bghp_[A-Za-z0-9]{36}\b|\bglpat-[A-Za-z0-9_-]{20}\b|\bkey-[A-Za-z0-9]{16,}\b",
    )
    .unwrap()
});
static RE_FILE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:/(?:home|Users)/[A-Za-z0-9._-]+(?:/[A-Za-z0-9._~-]+)*|[A-Za-z]:\\Users\\[^\\\s]+(?:\\[^\\\s]+)*)")
        .unwrap()
});
static RE_HIGH_ENTROPY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9+/=_-]{24,}\b").unwrap());

/// SSN area must not be 000, 666 or 9xx; group not 00; serial not 0000.
fn ssn_valid(candidate: &str) -> bool {
    let mut parts = candidate.split('-');
    let (Some(area), Some(group), Some(serial)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if area == "000" || area == "666" || area.starts_with('9') {
        return false;
    }
    group != "00" && serial != "0000"
}

/// Luhn checksum over 13–19 stripped digits.
fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Shannon entropy in bits per character.
fn shannon_entropy(candidate: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in candidate.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let len = candidate.chars().count() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn entropy_high(candidate: &str) -> bool {
    shannon_entropy(candidate) > 3.5
}

struct Detector {
    pii_type: &'static str,
    regex: &'static Lazy<Regex>,
    validator: Option<fn(&str) -> bool>,
}

static DETECTORS: &[Detector] = &[
    Detector {
        pii_type: "EMAIL",
        regex: &RE_EMAIL,
        validator: None,
    },
    Detector {
        pii_type: "PHONE",
        regex: &RE_PHONE,
        validator: None,
    },
    Detector {
        pii_type: "SSN",
        regex: &RE_SSN,
        validator: Some(ssn_valid),
    },
    Detector {
        pii_type: "CREDIT_CARD",
        regex: &RE_CREDIT_CARD,
        validator: Some(luhn_valid),
    },
    Detector {
        pii_type: "API_KEY",
        regex: &RE_API_KEY,
        validator: None,
    },
    Detector {
        pii_type: "FILE_PATH",
        regex: &RE_FILE_PATH,
        validator: None,
    },
    Detector {
        pii_type: "API_KEY",
        regex: &RE_HIGH_ENTROPY,
        validator: Some(entropy_high),
    },
];

/// Per-request placeholder bookkeeping, stored in
/// `metadata["pii_mapping"]`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PiiMapping {
    pub forward: HashMap<String, String>,
    pub reverse: HashMap<String, String>,
    pub counters: HashMap<String, u32>,
}

impl PiiMapping {
    /// Stable placeholder for an original value; repeats reuse the same
    /// placeholder.
    fn placeholder_for(&mut self, pii_type: &str, original: &str) -> String {
        if let Some(existing) = self.forward.get(original) {
            return existing.clone();
        }
        let counter = self.counters.entry(pii_type.to_string()).or_insert(0);
        *counter += 1;
        let placeholder = format!("[{}_{}]", pii_type, counter);
        self.forward
            .insert(original.to_string(), placeholder.clone());
        self.reverse
            .insert(placeholder.clone(), original.to_string());
        placeholder
    }
}

/// Keep the first and last two characters, star the rest. Short values
/// are fully starred.
fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let mut out: String = chars[..2].iter().collect();
    out.push_str(&"*".repeat(chars.len() - 4));
    out.extend(&chars[chars.len() - 2..]);
    out
}

#[derive(Debug, Clone, Serialize)]
struct Detection {
    #[serde(rename = "type")]
    pii_type: String,
    value: String,
    field: String,
}

pub struct PiiMiddleware {
    config: PiiConfig,
    logger: Option<Arc<dyn PiiLogger>>,
}

impl PiiMiddleware {
    pub fn new(config: PiiConfig, logger: Option<Arc<dyn PiiLogger>>) -> Self {
        PiiMiddleware { config, logger }
    }

    pub fn name(&self) -> &'static str {
        "pii"
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn action_name(&self) -> &'static str {
        match self.config.action {
            PiiAction::Redact => "redact",
            PiiAction::Hash => "hash",
            PiiAction::Log => "log",
            PiiAction::Block => "block",
        }
    }

    /// Scan one text field, returning the rewritten text.
    fn scan_field(
        &self,
        text: &str,
        field: &str,
        mapping: &mut PiiMapping,
        detections: &mut Vec<Detection>,
        detected_types: &mut Vec<String>,
    ) -> String {
        let mut current = text.to_string();
        for detector in DETECTORS {
            if !detector.regex.is_match(&current) {
                continue;
            }
            let rewritten = detector.regex.replace_all(&current, |caps: &regex::Captures| {
                let matched = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                if self.config.allowlist.iter().any(|allow| allow == matched) {
                    return matched.to_string();
                }
                if let Some(validate) = detector.validator {
                    if !validate(matched) {
                        return matched.to_string();
                    }
                }
                detections.push(Detection {
                    pii_type: detector.pii_type.to_string(),
                    value: mask_value(matched),
                    field: field.to_string(),
                });
                if !detected_types.iter().any(|t| t == detector.pii_type) {
                    detected_types.push(detector.pii_type.to_string());
                }
                match self.config.action {
                    PiiAction::Redact => mapping.placeholder_for(detector.pii_type, matched),
                    PiiAction::Hash => {
                        let mut hasher = Sha256::new();
                        hasher.update(matched.as_bytes());
                        let digest = format!("{:x}", hasher.finalize());
                        format!("[{}_HASH_{}]", detector.pii_type, &digest[..8])
                    }
                    PiiAction::Log | PiiAction::Block => matched.to_string(),
                }
            });
            current = rewritten.into_owned();
        }
        current
    }

    pub async fn process_request(
        &self,
        ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<()> {
        let mut mapping = PiiMapping::default();
        let mut detections = Vec::new();
        let mut detected_types = Vec::new();

        if !req.system.is_empty() {
            let system = req.system.clone();
            req.system = self.scan_field(
                &system,
                "system",
                &mut mapping,
                &mut detections,
                &mut detected_types,
            );
        }
        for (i, block) in req.system_blocks.iter_mut().enumerate() {
            if let Some(text) = block.text.take() {
                let field = format!("system_blocks[{}]", i);
                block.text = Some(self.scan_field(
                    &text,
                    &field,
                    &mut mapping,
                    &mut detections,
                    &mut detected_types,
                ));
            }
        }
        for (i, message) in req.messages.iter_mut().enumerate() {
            match &mut message.content {
                MessageContent::Text(text) => {
                    let field = format!("messages[{}]", i);
                    let scanned = self.scan_field(
                        text,
                        &field,
                        &mut mapping,
                        &mut detections,
                        &mut detected_types,
                    );
                    *text = scanned;
                }
                MessageContent::Blocks(blocks) => {
                    for (j, block) in blocks.iter_mut().enumerate() {
                        let field = format!("messages[{}].content[{}]", i, j);
                        if let Some(text) = block.text.take() {
                            block.text = Some(self.scan_field(
                                &text,
                                &field,
                                &mut mapping,
                                &mut detections,
                                &mut detected_types,
                            ));
                        }
                        match block.content.take() {
                            Some(Value::String(text)) => {
                                block.content = Some(Value::String(self.scan_field(
                                    &text,
                                    &field,
                                    &mut mapping,
                                    &mut detections,
                                    &mut detected_types,
                                )));
                            }
                            other => block.content = other,
                        }
                    }
                }
            }
        }

        if !detections.is_empty() {
            if let Some(logger) = &self.logger {
                for d in &detections {
                    logger.log_pii(
                        &req.id,
                        &d.pii_type,
                        self.action_name(),
                        &d.field,
                        &d.value,
                        &ctx.project,
                    );
                }
            }
            req.metadata.insert(
                "pii_detections".to_string(),
                serde_json::to_value(&detections).unwrap_or(Value::Null),
            );
        }
        if self.config.action == PiiAction::Redact && !mapping.forward.is_empty() {
            req.metadata.insert(
                "pii_mapping".to_string(),
                serde_json::to_value(&mapping).unwrap_or(Value::Null),
            );
        }

        if self.config.action == PiiAction::Block && !detected_types.is_empty() {
            detected_types.sort();
            return Err(ProxyError::PiiDetected {
                types: detected_types,
            });
        }
        Ok(())
    }

    /// Redact action only: substitute every placeholder in the response
    /// body with its original value.
    pub async fn process_response(
        &self,
        _ctx: &mut RequestContext,
        req: &ProxyRequest,
        resp: &mut ProxyResponse,
    ) -> ProxyResult<()> {
        if self.config.action != PiiAction::Redact {
            return Ok(());
        }
        let Some(mapping_value) = req.metadata.get("pii_mapping") else {
            return Ok(());
        };
        let Ok(mapping) = serde_json::from_value::<PiiMapping>(mapping_value.clone()) else {
            return Ok(());
        };
        if mapping.reverse.is_empty() {
            return Ok(());
        }
        let Ok(mut body) = String::from_utf8(std::mem::take(&mut resp.body)) else {
            return Ok(());
        };
        for (placeholder, original) in &mapping.reverse {
            if body.contains(placeholder.as_str()) {
                body = body.replace(placeholder.as_str(), original);
            }
        }
        resp.body = body.into_bytes();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::request::parse;
    use std::collections::HashMap as StdHashMap;

    fn request_with_text(text: &str) -> ProxyRequest {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": text}]
        });
        parse(
            "/v1/chat/completions",
            &serde_json::to_vec(&body).unwrap(),
            StdHashMap::new(),
        )
        .unwrap()
    }

    fn redacting() -> PiiMiddleware {
        PiiMiddleware::new(PiiConfig::default(), None)
    }

    #[tokio::test]
    async fn email_roundtrip_through_response() {
        let mw = redacting();
        let mut ctx = RequestContext::new();
        let mut req = request_with_text("Email me at secret@example.com with the info");
        mw.process_request(&mut ctx, &mut req).await.unwrap();

        let content = req.messages[0].content.flat_text();
        assert!(!content.contains("secret@example.com"));
        assert!(content.contains("[EMAIL_1]"));

        let mut resp = ProxyResponse {
            body: b"The email is [EMAIL_1]".to_vec(),
            ..Default::default()
        };
        mw.process_response(&mut ctx, &req, &mut resp).await.unwrap();
        let body = String::from_utf8(resp.body).unwrap();
        assert!(body.contains("secret@example.com"));
        assert!(!body.contains("[EMAIL_1]"));
    }

    #[tokio::test]
    async fn block_action_rejects_with_types() {
        let mw = PiiMiddleware::new(
            PiiConfig {
                enabled: true,
                action: PiiAction::Block,
                allowlist: Vec::new(),
            },
            None,
        );
        let mut req = request_with_text("my ssn is 123-45-6789");
        let err = mw
            .process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap_err();
        match err {
            ProxyError::PiiDetected { types } => assert_eq!(types, vec!["SSN".to_string()]),
            other => panic!("unexpected error {other:?}"),
        }
        // block leaves content unchanged
        assert!(req.messages[0].content.flat_text().contains("123-45-6789"));
    }

    #[tokio::test]
    async fn allowlist_bypasses_detection() {
        let mw = PiiMiddleware::new(
            PiiConfig {
                enabled: true,
                action: PiiAction::Redact,
                allowlist: vec!["noreply@example.com".to_string()],
            },
            None,
        );
        let mut req = request_with_text("contact noreply@example.com");
        mw.process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap();
        assert!(req.messages[0]
            .content
            .flat_text()
            .contains("noreply@example.com"));
    }

    #[tokio::test]
    async fn hash_action_is_one_way() {
        let mw = PiiMiddleware::new(
            PiiConfig {
                enabled: true,
                action: PiiAction::Hash,
                allowlist: Vec::new(),
            },
            None,
        );
        let mut ctx = RequestContext::new();
        let mut req = request_with_text("reach me at a@b.io");
        mw.process_request(&mut ctx, &mut req).await.unwrap();
        let content = req.messages[0].content.flat_text();
        assert!(content.contains("[EMAIL_HASH_"));

        let mut resp = ProxyResponse {
            body: content.clone().into_bytes(),
            ..Default::default()
        };
        mw.process_response(&mut ctx, &req, &mut resp).await.unwrap();
        assert_eq!(resp.body, content.into_bytes());
    }

    #[test]
    fn ssn_validator_rejects_reserved_areas() {
        assert!(ssn_valid("123-45-6789"));
        assert!(!ssn_valid("000-45-6789"));
        assert!(!ssn_valid("666-45-6789"));
        assert!(!ssn_valid("923-45-6789"));
        assert!(!ssn_valid("123-00-6789"));
        assert!(!ssn_valid("123-45-0000"));
    }

    #[test]
    fn luhn_accepts_test_visa() {
        assert!(luhn_valid("4111 1111 1111 1111"));
        assert!(!luhn_valid("4111 1111 1111 1112"));
        assert!(!luhn_valid("1234"));
    }

    #[test]
    fn entropy_flags_random_strings_only() {
        assert!(entropy_high("x9Ko2mPqL7vRt4WnB8sYd3Fz"));
        assert!(!entropy_high("aaaaaaaaaaaaaaaaaaaaaaaa"));
    }

    #[test]
    fn masking_keeps_edges() {
        assert_eq!(mask_value("secret@example.com"), "se**************om");
        assert_eq!(mask_value("abcd"), "****");
    }

    #[tokio::test]
    async fn detections_recorded_even_in_log_mode() {
        let mw = PiiMiddleware::new(
            PiiConfig {
                enabled: true,
                action: PiiAction::Log,
                allowlist: Vec::new(),
            },
            None,
        );
        let mut req = request_with_text("api key sk-abcdefghijklmnop1234");
        mw.process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap();
        assert!(req.messages[0].content.flat_text().contains("sk-abc"));
        let detections = req.metadata.get("pii_detections").unwrap();
        assert_eq!(detections[0]["type"], "API_KEY");
    }

    #[tokio::test]
    async fn detections_are_logged_with_the_request_project() {
        let store = Arc::new(crate::store::MemoryStore::new());
        let mw = PiiMiddleware::new(PiiConfig::default(), Some(store.clone()));
        let mut ctx = RequestContext::new();
        ctx.project = "acme".to_string();
        let mut req = request_with_text("write to audit@example.com");
        mw.process_request(&mut ctx, &mut req).await.unwrap();

        let rows = store.pii_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, req.id);
        assert_eq!(rows[0].1, "messages[0]");
        assert_eq!(rows[0].2, "acme");
    }

    #[tokio::test]
    async fn repeated_value_reuses_placeholder() {
        let mw = redacting();
        let mut req =
            request_with_text("write to dup@example.com and again dup@example.com please");
        mw.process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap();
        let content = req.messages[0].content.flat_text();
        assert_eq!(content.matches("[EMAIL_1]").count(), 2);
        assert!(!content.contains("[EMAIL_2]"));
    }
}
