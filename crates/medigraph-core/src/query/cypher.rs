use anyhow::{Result, anyhow};
use std::sync::Arc;
use crate::llm::LLMClient;

pub const SYSTEM_PROMPT: &str = "You are an expert Neo4j Cypher generator.";

pub const SCHEMA_HINT: &str = r#"You are generating Cypher for Neo4j AuraDB with this schema:

Node labels and key properties:
- Patient(id, first_name, last_name, full_name, sex, age, zip)
- Encounter(id, start_time, end_time, provider_npi, encounter_type)
- Condition(code, name)
- Medication(code, name)
- Provider(id, name, specialty, state, zip)
- Observation(id, description, value, unit, category, code, obs_datetime)
- Guideline(id, title, source, text)

Relationships:
- (p:Patient)-[:HAS_ENCOUNTER]->(e:Encounter)
- (p:Patient)-[:HAS_CONDITION]->(c:Condition)
- (p:Patient)-[:TAKES_MEDICATION]->(m:Medication)
- (p:Patient)-[:HAS_OBSERVATION]->(o:Observation)
- (p:Patient)-[:HAS_PROVIDER]->(pr:Provider)
- (e:Encounter)-[:HAS_CONDITION]->(c:Condition)
- (e:Encounter)-[:HAS_MEDICATION]->(m:Medication)
- (e:Encounter)-[:HAS_PROVIDER]->(pr:Provider)
- (e:Encounter)-[:HAS_OBSERVATION]->(o:Observation)
- (g:Guideline)-[:MENTIONS_CONDITION|TARGETS_CONDITION|CONTRAINDICATED_FOR]->(c:Condition)
- (g:Guideline)-[:MENTIONS_MEDICATION|RECOMMENDS]->(m:Medication)

Rules:
- Always use the properties shown above (id, full_name, code, name, etc.).
- Prefer LOWER CASE functions like toLower() in WHERE filters.
- Return tabular results (no graph-returning queries).
- DO NOT use APOC.
- DO NOT include comments, explanations, or markdown; ONLY return pure Cypher."#;

pub fn build_prompt(question: &str) -> String {
    format!(
        "{}\n\nUser question:\n\"\"\"{}\"\"\"\n\nYou must respond with a SINGLE valid Cypher query only.\nDo NOT wrap it in ``` or any other markdown.\n",
        SCHEMA_HINT,
        question.trim()
    )
}

/// Removes markdown fences and a leading `cypher` language tag.
pub fn strip_fences(reply: &str) -> String {
    let mut text = reply.trim();
    if text.starts_with("```") {
        text = text.trim_matches('`').trim();
        if text.get(..6).is_some_and(|tag| tag.eq_ignore_ascii_case("cypher")) {
            text = text.get(6..).unwrap_or_default().trim();
        }
    }
    text.to_string()
}

/// Turns questions into Cypher through the generation API.
#[derive(Clone)]
pub struct CypherGenerator {
    llm: Arc<dyn LLMClient>,
}

impl CypherGenerator {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self { llm }
    }

    pub fn model(&self) -> &str {
        self.llm.model()
    }

    pub async fn generate(&self, question: &str) -> Result<String> {
        if question.trim().is_empty() {
            return Err(anyhow!("Question is empty"));
        }

        let response = self.llm.chat(SYSTEM_PROMPT, &build_prompt(question)).await?;
        tracing::debug!(
            "Cypher generated by {} ({} tokens)",
            self.llm.model(),
            response.usage.total_tokens
        );

        let cypher = strip_fences(&response.data);
        if cypher.is_empty() {
            return Err(anyhow!("Model returned an empty query"));
        }
        Ok(cypher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```cypher\nMATCH (n) RETURN n\n```"), "MATCH (n) RETURN n");
        assert_eq!(strip_fences("```CYPHER MATCH (n) RETURN n```"), "MATCH (n) RETURN n");
        assert_eq!(strip_fences("```\nRETURN 1\n```"), "RETURN 1");
        assert_eq!(strip_fences("  MATCH (p:Patient) RETURN count(p)  "), "MATCH (p:Patient) RETURN count(p)");
        assert_eq!(strip_fences("```\n```"), "");
    }

    #[test]
    fn test_prompt_embeds_question_and_schema() {
        let prompt = build_prompt("  How many patients?  ");
        assert!(prompt.starts_with("You are generating Cypher"));
        assert!(prompt.contains("\"\"\"How many patients?\"\"\""));
        assert!(prompt.contains("(p:Patient)-[:TAKES_MEDICATION]->(m:Medication)"));
    }
}
