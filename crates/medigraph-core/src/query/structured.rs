use medigraph_common::Properties;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_JOURNEY_LIMIT: usize = 150;
const RESULT_LIMIT: usize = 50;

pub const HELP_TEXT: &str = "Right now I support questions like:\n\
- `show patients with diabetes`\n\
- `show patients with hypertension`\n\
- `show medications for diabetes`\n\
- `show medications for patient P001`";

fn default_journey_limit() -> usize {
    DEFAULT_JOURNEY_LIMIT
}

/// Parameterised questions with a fixed statement and result shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredQuery {
    /// Patients whose condition name contains `term`, case-insensitively.
    PatientsWithCondition { term: String },
    /// Medications taken by patients with a matching condition, most used first.
    MedicationsForCondition { term: String },
    MedicationsForPatient { patient_id: String },
    /// Direct neighbourhood of one patient.
    PatientJourney {
        patient_id: String,
        #[serde(default = "default_journey_limit")]
        limit: usize,
    },
}

impl StructuredQuery {
    pub fn cypher(&self) -> &'static str {
        match self {
            StructuredQuery::PatientsWithCondition { .. } => {
                "MATCH (p:Patient)-[:HAS_CONDITION]->(c:Condition) \
                 WHERE toLower(c.name) CONTAINS toLower($term) \
                 RETURN p.id AS patient_id, p.full_name AS full_name, p.sex AS sex, p.age AS age, c.name AS condition \
                 ORDER BY patient_id LIMIT $limit"
            }
            StructuredQuery::MedicationsForCondition { .. } => {
                "MATCH (p:Patient)-[:HAS_CONDITION]->(c:Condition), (p)-[:TAKES_MEDICATION]->(m:Medication) \
                 WHERE toLower(c.name) CONTAINS toLower($term) \
                 RETURN m.code AS rxnorm, m.name AS medication, COUNT(DISTINCT p) AS patients_on_med \
                 ORDER BY patients_on_med DESC, rxnorm LIMIT $limit"
            }
            StructuredQuery::MedicationsForPatient { .. } => {
                "MATCH (p:Patient {id: $pid})-[:TAKES_MEDICATION]->(m:Medication) \
                 RETURN p.id AS patient_id, p.full_name AS full_name, m.code AS rxnorm, m.name AS medication \
                 ORDER BY rxnorm LIMIT $limit"
            }
            StructuredQuery::PatientJourney { .. } => {
                "MATCH (p:Patient {id: $pid})-[r]-(n) \
                 RETURN p.id AS patient_id, type(r) AS relationship_type, labels(n)[0] AS neighbor_label, \
                 coalesce(toString(n.id), toString(n.code)) AS neighbor_id \
                 LIMIT $limit"
            }
        }
    }

    pub fn params(&self) -> Properties {
        let mut params = Properties::new();
        match self {
            StructuredQuery::PatientsWithCondition { term } | StructuredQuery::MedicationsForCondition { term } => {
                params.insert("term".into(), json!(term.trim()));
                params.insert("limit".into(), json!(RESULT_LIMIT));
            }
            StructuredQuery::MedicationsForPatient { patient_id } => {
                params.insert("pid".into(), json!(patient_id.trim()));
                params.insert("limit".into(), json!(RESULT_LIMIT));
            }
            StructuredQuery::PatientJourney { patient_id, limit } => {
                params.insert("pid".into(), json!(patient_id.trim()));
                params.insert("limit".into(), json!(limit));
            }
        }
        params
    }

    /// Result columns, in the order both graph backends return them.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            StructuredQuery::PatientsWithCondition { .. } => &["patient_id", "full_name", "sex", "age", "condition"],
            StructuredQuery::MedicationsForCondition { .. } => &["rxnorm", "medication", "patients_on_med"],
            StructuredQuery::MedicationsForPatient { .. } => &["patient_id", "full_name", "rxnorm", "medication"],
            StructuredQuery::PatientJourney { .. } => &["patient_id", "relationship_type", "neighbor_label", "neighbor_id"],
        }
    }

    pub fn limit(&self) -> usize {
        match self {
            StructuredQuery::PatientJourney { limit, .. } => *limit,
            _ => RESULT_LIMIT,
        }
    }

    /// Heading shown above a non-empty result.
    pub fn title(&self) -> String {
        match self {
            StructuredQuery::PatientsWithCondition { term } => {
                format!("Patients with conditions matching '{}':", term.trim())
            }
            StructuredQuery::MedicationsForCondition { term } => {
                format!("Medications used by patients with conditions matching '{}':", term.trim())
            }
            StructuredQuery::MedicationsForPatient { patient_id } => {
                format!("Medications for patient {}:", patient_id.trim())
            }
            StructuredQuery::PatientJourney { patient_id, .. } => {
                format!("Journey of patient {}:", patient_id.trim())
            }
        }
    }

    pub fn empty_message(&self) -> String {
        match self {
            StructuredQuery::PatientsWithCondition { term } => {
                format!("I couldn't find patients with conditions matching '{}'.", term.trim())
            }
            StructuredQuery::MedicationsForCondition { term } => {
                format!("I couldn't find medications for conditions matching '{}'.", term.trim())
            }
            StructuredQuery::MedicationsForPatient { patient_id } => {
                format!("I couldn't find medications for patient {}.", patient_id.trim())
            }
            StructuredQuery::PatientJourney { patient_id, .. } => {
                format!("No graph found for patient {}.", patient_id.trim())
            }
        }
    }
}

fn after<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.find(marker).map(|idx| &text[idx + marker.len()..])
}

fn clean_term(raw: &str) -> String {
    let term = raw
        .trim()
        .trim_end_matches(['?', '.', '!'])
        .trim_start_matches("who have")
        .trim();
    if term.is_empty() {
        "diabetes".to_string()
    } else {
        term.to_string()
    }
}

/// Maps a few fixed phrasings onto structured queries.
///
/// Used when no generation API is configured. Returns `None` for anything
/// else; callers answer with [`HELP_TEXT`].
pub fn route_question(question: &str) -> Option<StructuredQuery> {
    let q = question.trim().to_lowercase();

    if let Some(rest) = after(&q, "medications for patient") {
        let pid = rest.trim().trim_end_matches(['?', '.', '!']).trim().to_uppercase();
        if pid.is_empty() {
            return None;
        }
        return Some(StructuredQuery::MedicationsForPatient { patient_id: pid });
    }

    if let Some(rest) = after(&q, "medications for").or_else(|| after(&q, "medication for")) {
        return Some(StructuredQuery::MedicationsForCondition { term: clean_term(rest) });
    }

    if let Some(rest) = after(&q, "patients with") {
        return Some(StructuredQuery::PatientsWithCondition { term: clean_term(rest) });
    }
    if let Some(rest) = q.strip_prefix("show patients").or_else(|| q.strip_prefix("list patients")) {
        return Some(StructuredQuery::PatientsWithCondition { term: clean_term(rest) });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_patients_with_condition() {
        assert_eq!(
            route_question("Show patients with Hypertension?"),
            Some(StructuredQuery::PatientsWithCondition { term: "hypertension".into() })
        );
        assert_eq!(
            route_question("list patients who have asthma"),
            Some(StructuredQuery::PatientsWithCondition { term: "asthma".into() })
        );
        assert_eq!(
            route_question("show patients"),
            Some(StructuredQuery::PatientsWithCondition { term: "diabetes".into() })
        );
    }

    #[test]
    fn test_route_medications() {
        assert_eq!(
            route_question("show medications for patient p001"),
            Some(StructuredQuery::MedicationsForPatient { patient_id: "P001".into() })
        );
        assert_eq!(
            route_question("show medications for diabetes"),
            Some(StructuredQuery::MedicationsForCondition { term: "diabetes".into() })
        );
        assert_eq!(route_question("show medications for patient "), None);
    }

    #[test]
    fn test_route_unknown() {
        assert_eq!(route_question("what is the average age?"), None);
    }

    #[test]
    fn test_params_and_columns_agree_with_cypher() {
        let q = StructuredQuery::PatientJourney { patient_id: " P001 ".into(), limit: 20 };
        let params = q.params();
        assert_eq!(params["pid"], json!("P001"));
        assert_eq!(params["limit"], json!(20));
        for column in q.columns() {
            assert!(q.cypher().contains(&format!("AS {}", column)));
        }

        let q = StructuredQuery::MedicationsForCondition { term: "diabetes".into() };
        for column in q.columns() {
            assert!(q.cypher().contains(&format!("AS {}", column)));
        }
    }

    #[test]
    fn test_deserialize_tagged() {
        let q: StructuredQuery = serde_json::from_str(r#"{"kind":"patient_journey","patient_id":"P002"}"#).unwrap();
        assert_eq!(q, StructuredQuery::PatientJourney { patient_id: "P002".into(), limit: DEFAULT_JOURNEY_LIMIT });
    }
}
