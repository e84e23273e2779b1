//! Query decomposer — turns one vague query into several targeted ones.
//!
//! Semantic search fails on queries like "who am i?": nothing in the archive
//! literally says that. The decomposer first classifies the query's intent,
//! then asks a (typically smaller) LM for 5–7 short paraphrases tuned to that
//! intent — for identity, things like "my name is" and "I am a" that match
//! how the information was originally phrased.
//!
//! The original query is always kept as the first sub-query, and every
//! failure path degrades to exactly that single query. Decomposition never
//! raises.

use canopy_core::{ChatMessage, Provider, ProviderRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Classified intent of a user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryIntent {
    /// Questions about the user themself (name, occupation, studies).
    Identity,
    /// Questions about likes and dislikes.
    Preference,
    /// Questions about past conversation topics.
    Discussion,
    /// Questions about facts or information shared earlier.
    Factual,
    #[default]
    General,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Preference => "preference",
            Self::Discussion => "discussion",
            Self::Factual => "factual",
            Self::General => "general",
        }
    }

    fn parse(reply: &str) -> Option<Self> {
        let reply = reply.to_lowercase();
        // First intent word found wins; replies are expected to be one word.
        for intent in [
            Self::Identity,
            Self::Preference,
            Self::Discussion,
            Self::Factual,
            Self::General,
        ] {
            if reply.contains(intent.as_str()) {
                return Some(intent);
            }
        }
        None
    }

    /// Prompt fragments driving sub-query generation for this intent.
    fn template(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::Identity => (
                "user identity/introduction",
                "Focus on phrasings like: 'my name is', 'I am a', 'I work as', 'I study'",
                r#"["my name is", "I am a student", "I work as", "I study", "about myself"]"#,
            ),
            Self::Preference => (
                "user preferences/likes",
                "Focus on phrasings like: 'my favorite', 'I like', 'I love', 'I prefer', 'I hate'",
                r#"["my favorite", "I like", "I love", "I prefer", "I enjoy"]"#,
            ),
            Self::Discussion => (
                "past conversation topics",
                "Focus on: key topics, entities, concepts",
                r#"["python programming", "snake facts", "decorators", "async"]"#,
            ),
            Self::Factual => (
                "factual information",
                "Break down into: concepts, entities, related topics",
                r#"["capital france", "paris location", "french capital", "france geography"]"#,
            ),
            Self::General => (
                "general information",
                "Extract: key entities, topics, concepts",
                r#"["user data", "personal info", "account details"]"#,
            ),
        }
    }
}

impl std::fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decomposer's output: the classified intent and 1–7 sub-queries, the
/// original always first.
#[derive(Debug, Clone)]
pub struct DecomposedQuery {
    pub intent: QueryIntent,
    pub sub_queries: Vec<String>,
}

/// Maximum sub-queries handed to retrieval.
const MAX_SUB_QUERIES: usize = 7;

pub struct QueryDecomposer {
    provider: Arc<dyn Provider>,
    model: String,
    timeout: Duration,
}

impl QueryDecomposer {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout,
        }
    }

    /// Classify the query's intent. Any failure defaults to `General`.
    pub async fn classify_intent(&self, query: &str) -> QueryIntent {
        let prompt = format!(
            "Classify the intent of this query into exactly one of: \
             identity, preference, discussion, factual, general.\n\
             Query: \"{query}\"\n\
             Respond with only the single intent word."
        );
        let request = ProviderRequest {
            temperature: 0.0,
            max_tokens: Some(10),
            ..ProviderRequest::new(self.model.clone(), vec![ChatMessage::user(prompt)])
        };

        match tokio::time::timeout(self.timeout, self.provider.complete(request)).await {
            Ok(Ok(response)) => QueryIntent::parse(&response.content).unwrap_or_default(),
            Ok(Err(e)) => {
                warn!(error = %e, "Intent classification failed, defaulting to general");
                QueryIntent::General
            }
            Err(_) => {
                warn!("Intent classification timed out, defaulting to general");
                QueryIntent::General
            }
        }
    }

    /// Decompose a query into intent-guided sub-queries.
    ///
    /// On LM failure the result is exactly `[query]`.
    pub async fn decompose(&self, query: &str) -> DecomposedQuery {
        let intent = self.classify_intent(query).await;
        let (description, focus, example) = intent.template();

        let prompt = format!(
            "Given query: \"{query}\"\n\
             Intent: {description}\n\n\
             Generate 5-7 SHORT, SPECIFIC search queries. {focus}\n\n\
             Return ONLY a JSON array of strings: [\"query1\", \"query2\", ...]\n\n\
             Example: {example}"
        );
        let request = ProviderRequest {
            temperature: 0.3,
            max_tokens: Some(200),
            ..ProviderRequest::new(
                self.model.clone(),
                vec![
                    ChatMessage::system(
                        "Generate focused search query arrays. Output ONLY JSON string arrays: \
                         [\"q1\", \"q2\"]. No objects, no extra text.",
                    ),
                    ChatMessage::user(prompt),
                ],
            )
        };

        let generated = match tokio::time::timeout(self.timeout, self.provider.complete(request))
            .await
        {
            Ok(Ok(response)) => parse_sub_queries(&response.content).unwrap_or_default(),
            Ok(Err(e)) => {
                warn!(error = %e, "Sub-query generation failed, falling back to original query");
                Vec::new()
            }
            Err(_) => {
                warn!("Sub-query generation timed out, falling back to original query");
                Vec::new()
            }
        };

        // Original query first, then generated paraphrases, deduplicated
        // case-insensitively, capped at 7.
        let mut seen = std::collections::HashSet::new();
        let mut sub_queries = Vec::new();
        for candidate in std::iter::once(query.to_string()).chain(generated) {
            let trimmed = candidate.trim().to_string();
            if trimmed.is_empty() {
                continue;
            }
            if seen.insert(trimmed.to_lowercase()) {
                sub_queries.push(trimmed);
            }
            if sub_queries.len() == MAX_SUB_QUERIES {
                break;
            }
        }

        debug!(
            intent = %intent,
            count = sub_queries.len(),
            "Decomposed query"
        );
        DecomposedQuery {
            intent,
            sub_queries,
        }
    }
}

/// Extract a JSON string array from an LM reply, tolerating code fences and
/// surrounding prose. Objects with a "query" field are accepted too.
fn parse_sub_queries(raw: &str) -> Option<Vec<String>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }

    let values: Vec<serde_json::Value> = serde_json::from_str(&raw[start..=end]).ok()?;
    let queries: Vec<String> = values
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Object(map) => map
                .get("query")
                .and_then(|q| q.as_str())
                .map(String::from),
            _ => None,
        })
        .collect();

    if queries.is_empty() {
        None
    } else {
        Some(queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{ProviderError, ProviderResponse};
    use std::sync::Mutex;

    /// Mock provider returning a scripted sequence of replies.
    struct ScriptedProvider {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                panic!("ScriptedProvider: no more replies");
            }
            replies.remove(0).map(|content| ProviderResponse {
                content,
                usage: None,
                model: "mock".into(),
            })
        }
    }

    fn decomposer(replies: Vec<Result<String, ProviderError>>) -> QueryDecomposer {
        QueryDecomposer::new(
            Arc::new(ScriptedProvider::new(replies)),
            "mock",
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn success_yields_five_to_seven_distinct_queries() {
        let d = decomposer(vec![
            Ok("identity".into()),
            Ok(r#"["my name is", "I am a", "I work as", "I study", "about myself", "My Name Is"]"#
                .into()),
        ]);

        let result = d.decompose("who am i?").await;
        assert_eq!(result.intent, QueryIntent::Identity);
        assert!(
            (5..=7).contains(&result.sub_queries.len()),
            "got {} sub-queries",
            result.sub_queries.len()
        );
        assert_eq!(result.sub_queries[0], "who am i?");

        // Case-insensitive dedup removed the repeated "my name is".
        let lowered: Vec<String> = result
            .sub_queries
            .iter()
            .map(|q| q.to_lowercase())
            .collect();
        let mut unique = lowered.clone();
        unique.dedup();
        assert_eq!(lowered.len(), unique.len());
    }

    #[tokio::test]
    async fn generation_failure_falls_back_to_original() {
        let d = decomposer(vec![
            Ok("identity".into()),
            Err(ProviderError::Network("down".into())),
        ]);

        let result = d.decompose("who am i?").await;
        assert_eq!(result.sub_queries, vec!["who am i?"]);
    }

    #[tokio::test]
    async fn classification_failure_defaults_to_general() {
        let d = decomposer(vec![
            Err(ProviderError::Timeout("slow".into())),
            Ok(r#"["a", "b", "c", "d", "e"]"#.into()),
        ]);

        let result = d.decompose("anything").await;
        assert_eq!(result.intent, QueryIntent::General);
        assert_eq!(result.sub_queries.len(), 6);
    }

    #[tokio::test]
    async fn never_more_than_seven() {
        let d = decomposer(vec![
            Ok("factual".into()),
            Ok(r#"["a","b","c","d","e","f","g","h","i","j"]"#.into()),
        ]);

        let result = d.decompose("what is rust?").await;
        assert_eq!(result.sub_queries.len(), 7);
        assert_eq!(result.sub_queries[0], "what is rust?");
    }

    #[tokio::test]
    async fn unparseable_generation_falls_back_to_original() {
        let d = decomposer(vec![
            Ok("general".into()),
            Ok("Sure! Here are some queries you could try.".into()),
        ]);

        let result = d.decompose("hello").await;
        assert_eq!(result.sub_queries, vec!["hello"]);
    }

    #[test]
    fn parse_handles_fences_and_objects() {
        let fenced = "```json\n[\"a\", \"b\"]\n```";
        assert_eq!(
            parse_sub_queries(fenced).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );

        let objects = r#"[{"query": "x"}, "y"]"#;
        assert_eq!(
            parse_sub_queries(objects).unwrap(),
            vec!["x".to_string(), "y".to_string()]
        );

        assert!(parse_sub_queries("no array here").is_none());
        assert!(parse_sub_queries("[1, 2, 3]").is_none());
    }

    #[test]
    fn intent_parse_priority() {
        assert_eq!(QueryIntent::parse("identity"), Some(QueryIntent::Identity));
        assert_eq!(
            QueryIntent::parse("The intent is: preference."),
            Some(QueryIntent::Preference)
        );
        assert_eq!(QueryIntent::parse("dunno"), None);
    }
}
