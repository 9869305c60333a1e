use case_flow::{Capability, CapabilityError};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Longest full-text body handed to the per-article analysis, in characters.
const MAX_FULL_TEXT_CHARS: usize = 20_000;

/// Article detail lookups against the PubMed E-utilities.
#[derive(Clone)]
pub struct PubMedClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct LinkResponse {
    #[serde(default)]
    linksets: Vec<LinkSet>,
}

#[derive(Debug, Deserialize)]
struct LinkSet {
    #[serde(default)]
    linksetdbs: Vec<LinkSetDb>,
}

#[derive(Debug, Deserialize)]
struct LinkSetDb {
    linkname: String,
    #[serde(default)]
    links: Vec<String>,
}

impl PubMedClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Abstract text of `pmid`, or `None` when PubMed has no abstract for it.
    pub async fn fetch_abstract(&self, pmid: &str) -> Result<Option<String>, CapabilityError> {
        let fetch_url = format!(
            "{}/efetch.fcgi?db=pubmed&id={}&retmode=xml",
            self.base_url,
            urlencoding::encode(pmid)
        );
        debug!(%pmid, "Fetching article detail from PubMed");

        let xml_content = self.get_text(&fetch_url).await?;
        let abstract_text = parse_abstract(&xml_content);
        info!(
            %pmid,
            found = abstract_text.is_some(),
            "PubMed article detail fetched"
        );
        Ok(abstract_text)
    }

    /// Open-access body text from PubMed Central, or `None` when `pmid` has no PMC record.
    pub async fn fetch_full_text(&self, pmid: &str) -> Result<Option<String>, CapabilityError> {
        let link_url = format!(
            "{}/elink.fcgi?dbfrom=pubmed&db=pmc&id={}&retmode=json",
            self.base_url,
            urlencoding::encode(pmid)
        );
        let links: LinkResponse = serde_json::from_str(&self.get_text(&link_url).await?)
            .map_err(|e| {
                CapabilityError::invalid(Capability::Search, format!("Failed to parse PMC link response: {e}"))
            })?;

        let Some(pmc_id) = pmc_link(&links) else {
            debug!(%pmid, "No PMC record linked");
            return Ok(None);
        };

        let fetch_url = format!(
            "{}/efetch.fcgi?db=pmc&id={}&retmode=xml",
            self.base_url,
            urlencoding::encode(pmc_id)
        );
        let body = parse_body(&self.get_text(&fetch_url).await?);
        info!(%pmid, %pmc_id, found = body.is_some(), "PMC full text fetched");
        Ok(body)
    }

    async fn get_text(&self, url: &str) -> Result<String, CapabilityError> {
        let response = self.http.get(url).send().await.map_err(|e| {
            CapabilityError::request(Capability::Search, format!("PubMed request failed: {e}"))
        })?;

        if !response.status().is_success() {
            return Err(CapabilityError::request(
                Capability::Search,
                format!("PubMed returned HTTP {}", response.status()),
            ));
        }

        response.text().await.map_err(|e| {
            CapabilityError::invalid(
                Capability::Search,
                format!("Failed to get PubMed response text: {e}"),
            )
        })
    }
}

fn pmc_link(links: &LinkResponse) -> Option<&str> {
    links
        .linksets
        .iter()
        .flat_map(|set| &set.linksetdbs)
        .find(|db| db.linkname == "pubmed_pmc")
        .and_then(|db| db.links.first())
        .map(String::as_str)
}

/// Joins every `AbstractText` section of an efetch document, prefixing labelled
/// sections with their label.
fn parse_abstract(xml: &str) -> Option<String> {
    let sections = element_texts(xml, b"AbstractText", None);
    let sections: Vec<String> = sections
        .into_iter()
        .map(|(label, text)| match label {
            Some(label) => format!("{label}: {text}"),
            None => text,
        })
        .collect();
    (!sections.is_empty()).then(|| sections.join("\n"))
}

/// Paragraphs of a PMC article `<body>`, capped at `MAX_FULL_TEXT_CHARS`.
fn parse_body(xml: &str) -> Option<String> {
    let paragraphs: Vec<String> = element_texts(xml, b"p", Some(b"body".as_slice()))
        .into_iter()
        .map(|(_, text)| text)
        .collect();
    if paragraphs.is_empty() {
        return None;
    }
    let body = paragraphs.join("\n");
    Some(match body.char_indices().nth(MAX_FULL_TEXT_CHARS) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body,
    })
}

/// Text of every `tag` element, optionally only those inside `scope`.
///
/// Inline markup is flattened, entities and character references are decoded and
/// whitespace is collapsed. Each entry carries the element's `Label` attribute.
/// A malformed document yields the sections read before the error.
fn element_texts(xml: &str, tag: &[u8], scope: Option<&[u8]>) -> Vec<(Option<String>, String)> {
    let mut reader = Reader::from_str(xml);
    let mut sections = Vec::new();
    let mut scope_depth = 0usize;
    // (label, text, nested `tag` depth)
    let mut open: Option<(Option<String>, String, usize)> = None;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, position = reader.buffer_position(), "Malformed PubMed XML");
                break;
            }
        };
        match event {
            Event::Start(e) => {
                let name = e.name();
                if scope == Some(name.as_ref()) {
                    scope_depth += 1;
                }
                if name.as_ref() == tag {
                    if let Some((_, _, nested)) = open.as_mut() {
                        *nested += 1;
                    } else if scope.is_none() || scope_depth > 0 {
                        open = Some((label(&e), String::new(), 0));
                    }
                }
            }
            Event::End(e) => {
                let name = e.name();
                if name.as_ref() == tag {
                    if matches!(open, Some((_, _, 0))) {
                        if let Some((label, text, _)) = open.take() {
                            let text = collapse_whitespace(&text);
                            if !text.is_empty() {
                                sections.push((label, text));
                            }
                        }
                    } else if let Some((_, text, nested)) = open.as_mut() {
                        *nested -= 1;
                        text.push(' ');
                    }
                }
                if scope == Some(name.as_ref()) {
                    scope_depth = scope_depth.saturating_sub(1);
                }
            }
            Event::Text(t) => {
                if let Some((_, text, _)) = open.as_mut() {
                    match t.unescape() {
                        Ok(decoded) => text.push_str(&decoded),
                        Err(e) => {
                            debug!(error = %e, "Keeping undecodable text as-is");
                            text.push_str(&String::from_utf8_lossy(&t));
                        }
                    }
                }
            }
            Event::CData(c) => {
                if let Some((_, text, _)) = open.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    sections
}

fn label(start: &BytesStart<'_>) -> Option<String> {
    start
        .try_get_attribute("Label")
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.into_owned())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_abstract() {
        let xml = r#"<PubmedArticle><MedlineCitation><PMID Version="1">38012345</PMID>
            <Abstract>
              <AbstractText Label="BACKGROUND" NlmCategory="BACKGROUND">Relapsed <i>ALL</i> remains hard to treat.</AbstractText>
              <AbstractText Label="RESULTS">CR rate was 45% &amp; OS improved.</AbstractText>
            </Abstract></MedlineCitation></PubmedArticle>"#;
        assert_eq!(
            parse_abstract(xml).unwrap(),
            "BACKGROUND: Relapsed ALL remains hard to treat.\nRESULTS: CR rate was 45% & OS improved."
        );
    }

    #[test]
    fn parses_plain_abstract() {
        let xml = "<Abstract><AbstractText>\n  A single paragraph.\n</AbstractText></Abstract>";
        assert_eq!(parse_abstract(xml).unwrap(), "A single paragraph.");
    }

    #[test]
    fn decodes_character_references() {
        let xml = "<Abstract><AbstractText Label=\"METHODS\">Patients aged &#x2265;18 years and &#8804;65 were enrolled.</AbstractText></Abstract>";
        assert_eq!(
            parse_abstract(xml).unwrap(),
            "METHODS: Patients aged \u{2265}18 years and \u{2264}65 were enrolled."
        );
    }

    #[test]
    fn missing_abstract_is_none() {
        assert!(parse_abstract("<PubmedArticle><PMID>1</PMID></PubmedArticle>").is_none());
        assert!(parse_abstract("<AbstractText>unterminated").is_none());
    }

    #[test]
    fn body_paragraphs_skip_front_matter() {
        let xml = r#"<pmc-articleset><article>
            <front><abstract><p>Abstract paragraph.</p></abstract></front>
            <body>
              <sec><title>Introduction</title><p>Relapse occurs in <italic>15%</italic> of cases.</p></sec>
              <sec><p>Outcomes were &lt;5% worse.</p></sec>
            </body>
            <back><ref-list><p>Reference note.</p></ref-list></back>
        </article></pmc-articleset>"#;
        assert_eq!(
            parse_body(xml).unwrap(),
            "Relapse occurs in 15% of cases.\nOutcomes were <5% worse."
        );
        assert!(parse_body("<article><front><p>only front</p></front></article>").is_none());
    }

    #[test]
    fn finds_pmc_link() {
        let links: LinkResponse = serde_json::from_str(
            r#"{"linksets": [{"dbfrom": "pubmed", "ids": ["38012345"], "linksetdbs": [
                {"dbto": "pmc", "linkname": "pubmed_pmc_refs", "links": ["111"]},
                {"dbto": "pmc", "linkname": "pubmed_pmc", "links": ["10654321"]}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(pmc_link(&links), Some("10654321"));

        let empty: LinkResponse = serde_json::from_str(r#"{"linksets": [{"dbfrom": "pubmed"}]}"#).unwrap();
        assert_eq!(pmc_link(&empty), None);
    }
}
