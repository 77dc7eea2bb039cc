use async_trait::async_trait;
use litwatch_schemas::{RawRecord, Record, ResearchTrends};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::config::{LLMConfig, LLMProvider};
use crate::error::GenerationError;

/// Records handed to a single summary prompt
pub const MAX_SUMMARY_RECORDS: usize = 50;

/// Records handed to a single trend prompt
pub const MAX_TREND_RECORDS: usize = 100;

/// Character budget for the record digest inside a trend prompt
const TREND_DIGEST_CHARS: usize = 4000;

/// Text-generation collaborator. Every call may fail; callers decide how
/// to degrade.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Short structured analysis of one record
    async fn analyze(&self, record: &RawRecord) -> Result<String, GenerationError>;

    /// Candidate index terms for one record
    async fn extract_terms(&self, record: &RawRecord) -> Result<Vec<String>, GenerationError>;

    /// Narrative summary over `records`, written in `language`
    async fn summarize(&self, records: &[Record], language: &str)
        -> Result<String, GenerationError>;

    /// Fold `new_records` into an existing summary
    async fn merge_summary(
        &self,
        existing: &str,
        new_records: &[Record],
        language: &str,
    ) -> Result<String, GenerationError>;

    async fn extract_trends(&self, records: &[Record]) -> Result<ResearchTrends, GenerationError>;
}

/// Chat-completion backed generator speaking either the Ollama or the
/// OpenAI-compatible API
pub struct LLMGenerator {
    config: LLMConfig,
    client: Client,
}

impl LLMGenerator {
    pub fn new(config: LLMConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LLMConfig {
        &self.config
    }

    async fn complete(&self, request: Completion<'_>) -> Result<String, GenerationError> {
        let text = match self.config.provider {
            LLMProvider::Ollama => self.call_ollama(&request).await?,
            LLMProvider::OpenAI => self.call_openai(&request).await?,
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(GenerationError::EmptyResponse(self.config.provider.name()));
        }
        Ok(text.to_string())
    }

    /// Call Ollama API
    async fn call_ollama(&self, request: &Completion<'_>) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.config.base_url);

        let mut request_body = json!({
            "model": self.config.model,
            "system": request.system,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        });
        if request.json {
            request_body["format"] = json!("json");
        }

        debug!("Calling Ollama at {}", url);

        let response = self.client.post(&url).json(&request_body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                provider: "Ollama",
                status,
                body,
            });
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let ollama_response: OllamaResponse = response.json().await?;
        Ok(ollama_response.response)
    }

    /// Call OpenAI-compatible API
    async fn call_openai(&self, request: &Completion<'_>) -> Result<String, GenerationError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let mut request_body = json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": request.system
                },
                {
                    "role": "user",
                    "content": request.prompt
                }
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json {
            request_body["response_format"] = json!({ "type": "json_object" });
        }

        debug!("Calling OpenAI at {}", url);

        let mut http_request = self.client.post(&url).json(&request_body);

        if let Some(ref api_key) = self.config.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                provider: "OpenAI",
                status,
                body,
            });
        }

        #[derive(Deserialize)]
        struct OpenAIResponse {
            choices: Vec<OpenAIChoice>,
        }

        #[derive(Deserialize)]
        struct OpenAIChoice {
            message: OpenAIMessage,
        }

        #[derive(Deserialize)]
        struct OpenAIMessage {
            content: Option<String>,
        }

        let openai_response: OpenAIResponse = response.json().await?;

        openai_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(GenerationError::EmptyResponse("OpenAI"))
    }
}

struct Completion<'a> {
    system: &'a str,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
    json: bool,
}

const ANALYST_SYSTEM: &str =
    "You are a biomedical research analyst. Be precise and concise, and never invent data.";

#[async_trait]
impl TextGenerator for LLMGenerator {
    async fn analyze(&self, record: &RawRecord) -> Result<String, GenerationError> {
        self.complete(Completion {
            system: ANALYST_SYSTEM,
            prompt: build_analysis_prompt(record),
            max_tokens: 600,
            temperature: 0.3,
            json: false,
        })
        .await
    }

    async fn extract_terms(&self, record: &RawRecord) -> Result<Vec<String>, GenerationError> {
        let text = self
            .complete(Completion {
                system: ANALYST_SYSTEM,
                prompt: build_terms_prompt(record),
                max_tokens: 200,
                temperature: 0.1,
                json: false,
            })
            .await?;
        Ok(parse_terms(&text))
    }

    async fn summarize(
        &self,
        records: &[Record],
        language: &str,
    ) -> Result<String, GenerationError> {
        self.complete(Completion {
            system: ANALYST_SYSTEM,
            prompt: build_summary_prompt(records, language),
            max_tokens: 3000,
            temperature: 0.3,
            json: false,
        })
        .await
    }

    async fn merge_summary(
        &self,
        existing: &str,
        new_records: &[Record],
        language: &str,
    ) -> Result<String, GenerationError> {
        self.complete(Completion {
            system: ANALYST_SYSTEM,
            prompt: build_merge_prompt(existing, new_records, language),
            max_tokens: 3000,
            temperature: 0.3,
            json: false,
        })
        .await
    }

    async fn extract_trends(&self, records: &[Record]) -> Result<ResearchTrends, GenerationError> {
        let text = self
            .complete(Completion {
                system: ANALYST_SYSTEM,
                prompt: build_trends_prompt(records),
                max_tokens: 1000,
                temperature: 0.2,
                json: true,
            })
            .await?;
        parse_trends(&text)
    }
}

// ========== PROMPTS ==========

/// Output-language instruction appended to generation prompts.
/// Unknown languages fall back to English.
pub fn language_instruction(language: &str) -> &'static str {
    match language {
        "fr" => "Rédigez toute la réponse en français, en conservant la terminologie médicale précise.",
        "ru" => "Напишите весь ответ на русском языке, сохраняя точную медицинскую терминологию.",
        _ => "Write the entire response in English, keeping precise medical terminology.",
    }
}

pub fn build_analysis_prompt(record: &RawRecord) -> String {
    format!(
        r#"Analyze this research article and answer in a few short sections:

Title: {}
Publication type: {}
Abstract: {}

1. MAIN FINDINGS: the key results in 2-3 sentences
2. METHODOLOGY: study design and population
3. CLINICAL RELEVANCE: implications for treatment or prognosis
4. LIMITATIONS: notable caveats, if stated

Only use information present in the abstract."#,
        record.title, record.article_type, record.abstract_text
    )
}

pub fn build_terms_prompt(record: &RawRecord) -> String {
    format!(
        r#"List the most specific scientific terms in this article: genes, proteins, drugs,
mechanisms, techniques and clinical classifications. Skip generic words such as
"cancer", "patients" or "treatment". Return at most 8 terms as a JSON array of strings.

Title: {}
Abstract: {}"#,
        record.title, record.abstract_text
    )
}

#[derive(Serialize)]
struct RecordDigest<'a> {
    title: &'a str,
    date: String,
    #[serde(rename = "type")]
    article_type: &'a str,
    findings: &'a str,
}

fn digest(records: &[Record], limit: usize) -> String {
    let digests: Vec<RecordDigest> = records
        .iter()
        .take(limit)
        .map(|r| RecordDigest {
            title: &r.title,
            date: r.published_date.to_string(),
            article_type: &r.article_type,
            findings: r
                .analysis
                .as_deref()
                .filter(|a| !a.is_empty())
                .unwrap_or(&r.abstract_text),
        })
        .collect();

    serde_json::to_string_pretty(&digests).unwrap_or_default()
}

pub fn build_summary_prompt(records: &[Record], language: &str) -> String {
    format!(
        r#"Based on these {} research articles, write a comprehensive summary of the field.

Articles:
{}

Structure the summary as:
1. KEY DEVELOPMENTS
2. THERAPEUTIC ADVANCES
3. PROGNOSTIC FACTORS
4. EMERGING TRENDS
5. OPEN QUESTIONS

{}"#,
        records.len(),
        digest(records, MAX_SUMMARY_RECORDS),
        language_instruction(language)
    )
}

pub fn build_merge_prompt(existing: &str, new_records: &[Record], language: &str) -> String {
    format!(
        r#"Here is the current research summary:

{}

{} new articles were published since it was written:
{}

Update the summary so it incorporates the new findings. Keep the existing structure,
revise statements the new work contradicts, and do not drop earlier content that
still holds.

{}"#,
        existing,
        new_records.len(),
        digest(new_records, MAX_SUMMARY_RECORDS),
        language_instruction(language)
    )
}

pub fn build_trends_prompt(records: &[Record]) -> String {
    let mut digest_text = String::new();
    for record in records.iter().take(MAX_TREND_RECORDS) {
        let line = format!(
            "- {} ({}): {}\n",
            record.title,
            record.published_date,
            record.analysis.as_deref().unwrap_or(&record.abstract_text)
        );
        if digest_text.len() + line.len() > TREND_DIGEST_CHARS {
            break;
        }
        digest_text.push_str(&line);
    }

    format!(
        r#"Identify research trends across these articles:

{}

Return a JSON object with exactly these keys, each a list of short strings:
{{"key_trends": [], "therapeutic_targets": [], "prognostic_markers": [], "research_gaps": [], "methodology_trends": []}}"#,
        digest_text
    )
}

// ========== OUTPUT PARSING ==========

/// Remove a surrounding markdown code fence, if any
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string (```json)
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse a trend object out of generated text, tolerating code fences,
/// surrounding prose and missing keys
pub fn parse_trends(text: &str) -> Result<ResearchTrends, GenerationError> {
    let body = strip_code_fence(text);
    let json = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => return Err(GenerationError::Parse("no JSON object in trend output".to_string())),
    };

    serde_json::from_str(json).map_err(|e| GenerationError::Parse(e.to_string()))
}

/// Parse a term list from generated text: a JSON array when possible,
/// otherwise comma, semicolon or line separated
pub fn parse_terms(text: &str) -> Vec<String> {
    let body = strip_code_fence(text);

    if let (Some(start), Some(end)) = (body.find('['), body.rfind(']')) {
        if start < end {
            if let Ok(terms) = serde_json::from_str::<Vec<String>>(&body[start..=end]) {
                return clean_terms(terms);
            }
        }
    }

    let marker = list_marker();
    clean_terms(
        body.split(|c| c == ',' || c == ';' || c == '\n')
            .map(|t| marker.replace(t.trim(), "").into_owned())
            .collect(),
    )
}

/// Leading bullet or enumeration ("- ", "* ", "2. ", "3) "). Requires the
/// trailing space so names like "5-azacytidine" stay intact.
fn list_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"^(?:[-*•]|\d+[.)])\s+").unwrap())
}

fn clean_terms(terms: Vec<String>) -> Vec<String> {
    terms
        .into_iter()
        .map(|t| t.trim().trim_matches('"').trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use litwatch_schemas::RecordId;

    fn record(title: &str, analysis: Option<&str>) -> Record {
        Record {
            id: RecordId(1),
            external_id: "R1".to_string(),
            title: title.to_string(),
            abstract_text: format!("Abstract of {}", title),
            published_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            article_type: "Journal Article".to_string(),
            authors: vec![],
            venue: "Blood".to_string(),
            reference_count: None,
            analysis: analysis.map(str::to_string),
            terms: vec![],
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_language_instruction() {
        assert!(language_instruction("fr").contains("français"));
        assert!(language_instruction("ru").contains("русском"));
        assert!(language_instruction("de").contains("English"));
    }

    #[test]
    fn test_summary_prompt_uses_analysis_and_language() {
        let records = vec![
            record("Venetoclax in TP53 AML", Some("Low response rates")),
            record("Eprenetapopt trial", None),
        ];
        let prompt = build_summary_prompt(&records, "fr");
        assert!(prompt.contains("Low response rates"));
        assert!(prompt.contains("Abstract of Eprenetapopt trial"));
        assert!(prompt.contains("en français"));
    }

    #[test]
    fn test_summary_prompt_caps_records() {
        let records: Vec<Record> = (0..MAX_SUMMARY_RECORDS + 5)
            .map(|i| record(&format!("Paper {i}"), None))
            .collect();
        let prompt = build_summary_prompt(&records, "en");
        assert!(prompt.contains("Paper 0\""));
        assert!(!prompt.contains(&format!("Paper {}\"", MAX_SUMMARY_RECORDS)));
    }

    #[test]
    fn test_parse_trends_with_fence() {
        let text = "```json\n{\"key_trends\": [\"menin inhibition\"], \"research_gaps\": [\"elderly patients\"]}\n```";
        let trends = parse_trends(text).unwrap();
        assert_eq!(trends.key_trends, vec!["menin inhibition".to_string()]);
        assert_eq!(trends.research_gaps, vec!["elderly patients".to_string()]);
        assert!(trends.therapeutic_targets.is_empty());
    }

    #[test]
    fn test_parse_trends_with_prose() {
        let text = "Here you go: {\"prognostic_markers\": [\"TP53 VAF\"]} Hope this helps.";
        let trends = parse_trends(text).unwrap();
        assert_eq!(trends.prognostic_markers, vec!["TP53 VAF".to_string()]);
    }

    #[test]
    fn test_parse_trends_rejects_garbage() {
        assert!(matches!(parse_trends("no json here"), Err(GenerationError::Parse(_))));
        assert!(parse_trends("{not: valid}").is_err());
    }

    #[test]
    fn test_parse_terms() {
        assert_eq!(
            parse_terms("```json\n[\"TP53\", \"venetoclax\", \"\"]\n```"),
            vec!["TP53".to_string(), "venetoclax".to_string()]
        );
        assert_eq!(
            parse_terms("TP53, MDM2; azacitidine"),
            vec!["TP53".to_string(), "MDM2".to_string(), "azacitidine".to_string()]
        );
        assert_eq!(
            parse_terms("1. FLT3\n2. NPM1\n- CEBPA"),
            vec!["FLT3".to_string(), "NPM1".to_string(), "CEBPA".to_string()]
        );
    }

    #[test]
    fn test_parse_terms_keeps_numeric_prefixes() {
        assert_eq!(
            parse_terms("5-azacytidine, 53BP1, 17-AAG"),
            vec!["5-azacytidine".to_string(), "53BP1".to_string(), "17-AAG".to_string()]
        );
        assert_eq!(
            parse_terms("1) 5-azacytidine\n2) 53BP1\n* p21"),
            vec!["5-azacytidine".to_string(), "53BP1".to_string(), "p21".to_string()]
        );
    }

    #[test]
    fn test_generator_construction() {
        let generator = LLMGenerator::new(LLMConfig::default()).unwrap();
        assert_eq!(generator.config().provider, LLMProvider::Ollama);
    }
}
