use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::corpus::{CorpusId, Section, normalize_section_name};
use crate::hebrew;

/// One leaf of the upstream nested text array, already cleaned.
///
/// `path` records the 0-based descent into the nested array; leaf
/// reference strings render the same descent 1-based, the way the
/// provider numbers sub-sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub fragment_ref: String,
    pub path: Vec<usize>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Canonical ref as the provider returned it; may differ textually
    /// from the requested ref and is what gets stored.
    pub provider_ref: String,
    pub fragments: Vec<Fragment>,
    /// Uncleaned leaf strings in the same pre-order as `fragments`.
    pub raw_he: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TextProvider {
    client: reqwest::Client,
    base_url: String,
}

impl TextProvider {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build text provider http client")?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { client, base_url })
    }

    /// Fetch the Hebrew text for a ref and flatten the nested array into
    /// ordered leaves.
    pub async fn fetch_fragments(&self, ref_str: &str) -> anyhow::Result<FetchResult> {
        let url = format!(
            "{}/v3/texts/{}?lang=he&context=0",
            self.base_url,
            percent_encode_rfc3986(ref_str)
        );
        let body = self.get_json(&url).await.with_context(|| format!("fetch text: {ref_str}"))?;

        let provider_ref = body
            .get("ref")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("text response missing ref: {ref_str}"))?
            .to_owned();

        let he = match body.get("he") {
            Some(he) if !he.is_null() => he.clone(),
            _ => hebrew_version_text(&body)
                .ok_or_else(|| anyhow::anyhow!("text response missing he: {ref_str}"))?,
        };

        let mut fragments = Vec::new();
        let mut raw_he = Vec::new();
        flatten_leaves(&he, &mut Vec::new(), &mut |path, raw| {
            let text = hebrew::clean_fragment_text(raw);
            if text.is_empty() {
                return;
            }
            raw_he.push(raw.to_owned());
            fragments.push(Fragment {
                fragment_ref: leaf_ref(&provider_ref, path),
                path: path.to_vec(),
                text,
            });
        });

        Ok(FetchResult {
            provider_ref,
            fragments,
            raw_he,
        })
    }

    /// Collect the reference strings linked to `ref_str`, filtered to the
    /// two secondary corpora within `section`.
    pub async fn fetch_linked_refs(
        &self,
        ref_str: &str,
        section: Section,
    ) -> anyhow::Result<LinkedRefs> {
        let url = format!(
            "{}/links/{}",
            self.base_url,
            percent_encode_rfc3986(ref_str)
        );
        let body = self
            .get_json(&url)
            .await
            .with_context(|| format!("fetch links: {ref_str}"))?;

        let links = match &body {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map
                .get("links")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let mut candidates = Vec::new();
        for link in &links {
            collect_link_ref_strings(link, &mut candidates);
        }

        let mut out = LinkedRefs::default();
        for candidate in candidates {
            if ref_matches_corpus(&candidate, CorpusId::Tur, section) {
                push_unique(&mut out.tur_refs, candidate);
            } else if ref_matches_corpus(&candidate, CorpusId::BeitYosef, section) {
                push_unique(&mut out.beit_yosef_refs, candidate);
            }
        }
        Ok(out)
    }

    /// Chapter count for a corpus section, from the index schema's first
    /// dimension.
    pub async fn fetch_chapter_count(
        &self,
        corpus: CorpusId,
        section: Section,
    ) -> anyhow::Result<usize> {
        let book = if corpus.section_qualified() {
            format!("{}, {}", corpus.provider_prefix(), section.provider_name())
        } else {
            corpus.provider_prefix().to_owned()
        };
        let url = format!(
            "{}/v2/index/{}",
            self.base_url,
            percent_encode_rfc3986(&book)
        );
        let body = self
            .get_json(&url)
            .await
            .with_context(|| format!("fetch index: {book}"))?;

        body.pointer("/schema/lengths/0")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| anyhow::anyhow!("index response missing schema.lengths: {book}"))
    }

    async fn get_json(&self, url: &str) -> anyhow::Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("upstream returned {} for {url}", resp.status());
        }
        resp.json().await.with_context(|| format!("parse json: {url}"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkedRefs {
    pub tur_refs: Vec<String>,
    pub beit_yosef_refs: Vec<String>,
}

fn hebrew_version_text(body: &Value) -> Option<Value> {
    let versions = body.get("versions")?.as_array()?;
    versions
        .iter()
        .find(|v| v.get("language").and_then(Value::as_str) == Some("he"))
        .and_then(|v| v.get("text"))
        .cloned()
}

/// Pre-order traversal over the nested text value; `visit` receives the
/// 0-based descent path of each string leaf.
fn flatten_leaves(value: &Value, path: &mut Vec<usize>, visit: &mut impl FnMut(&[usize], &str)) {
    match value {
        Value::String(s) => visit(path, s),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                path.push(idx);
                flatten_leaves(item, path, visit);
                path.pop();
            }
        }
        _ => {}
    }
}

fn leaf_ref(provider_ref: &str, path: &[usize]) -> String {
    if path.is_empty() {
        return provider_ref.to_owned();
    }
    let mut out = provider_ref.to_owned();
    for segment in path {
        out.push(':');
        out.push_str(&(segment + 1).to_string());
    }
    out
}

/// Candidate fields the provider scatters ref strings across.
fn collect_link_ref_strings(link: &Value, out: &mut Vec<String>) {
    const ARRAY_FIELDS: [&str; 4] = ["refs", "expandedRefs0", "expandedRefs1", "expandedRefs"];
    const SCALAR_FIELDS: [&str; 3] = ["ref", "anchorRef", "sourceRef"];

    for field in ARRAY_FIELDS {
        if let Some(items) = link.get(field).and_then(Value::as_array) {
            for item in items {
                if let Some(s) = item.as_str() {
                    out.push(s.to_owned());
                }
            }
        }
    }
    for field in SCALAR_FIELDS {
        if let Some(s) = link.get(field).and_then(Value::as_str) {
            out.push(s.to_owned());
        }
    }
}

/// Prefix match under section-name normalization, so "Orach Chaim" link
/// refs still match an "Orach Chayim" corpus section.
pub fn ref_matches_corpus(candidate: &str, corpus: CorpusId, section: Section) -> bool {
    let prefix = if corpus.section_qualified() {
        format!("{}, {}", corpus.provider_prefix(), section.provider_name())
    } else {
        if let Some(only) = corpus.only_section()
            && only != section
        {
            return false;
        }
        corpus.provider_prefix().to_owned()
    };
    normalize_section_name(candidate).starts_with(&normalize_section_name(&prefix))
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.iter().any(|existing| existing == &value) {
        list.push(value);
    }
}

fn percent_encode_rfc3986(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        let is_unreserved = matches!(
            b,
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~'
        );
        if is_unreserved {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{b:02X}"));
        }
    }
    out
}
