//! Tipos de dados trafegados entre o worker e o record store HTTP.
//!
//! Os campos seguem o formato camelCase usado pelo store. Os tipos de domínio
//! (definições, runs, registros de dispatch) vivem em `state_machine` e são
//! reaproveitados diretamente; aqui ficam apenas os envelopes de requisição e
//! resposta.

use serde::{Deserialize, Serialize};

use crate::state_machine::AdditionalContext;

/// Resposta de `GET /definitions/{id}/parent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentResponse {
    #[serde(default)]
    pub parent_job_definition_id: Option<String>,
}

/// Resposta de `GET /definitions/{id}/unintegrated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnintegratedResponse {
    #[serde(default)]
    pub children: Vec<String>,
}

/// Corpo de `POST /dispatch`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchBody<'a> {
    pub job_definition_id: &'a str,
    pub message: &'a str,
    pub additional_context: &'a AdditionalContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_job_definition_id: Option<&'a str>,
}

/// Resposta de `POST /dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub new_run_id: String,
}

/// Corpo de `POST /claims`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody<'a> {
    pub parent_job_definition_id: &'a str,
    pub child_job_definition_id: &'a str,
}

/// Resposta de `POST /claims`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub allowed: bool,
    #[serde(default)]
    pub claimed_by: Option<String>,
}

/// Corpo de erro opcional devolvido pelo store.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_body_uses_camel_case() {
        let ctx = AdditionalContext::default();
        let body = DispatchBody {
            job_definition_id: "job-1",
            message: "hello",
            additional_context: &ctx,
            source_job_definition_id: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains(r#""jobDefinitionId":"job-1""#));
        assert!(json.contains("additionalContext"));
        assert!(!json.contains("sourceJobDefinitionId"));
    }

    #[test]
    fn claim_response_without_owner() {
        let resp: ClaimResponse = serde_json::from_str(r#"{"allowed":true}"#).unwrap();
        assert!(resp.allowed);
        assert!(resp.claimed_by.is_none());
    }

    #[test]
    fn parent_response_null() {
        let resp: ParentResponse =
            serde_json::from_str(r#"{"parentJobDefinitionId":null}"#).unwrap();
        assert!(resp.parent_job_definition_id.is_none());
    }
}
