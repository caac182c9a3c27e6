use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, RoutingKey, SessionKey, TerminalId};

/// Patient-encounter event pushed by the clinical information system.
///
/// The fabric only requires the routing-key fields; `item_data` is carried
/// through unchanged and never interpreted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalEvent {
    pub system_id: String,
    pub scene_type: String,
    #[serde(default)]
    pub state: String,
    pub pat_no: String,
    #[serde(default)]
    pub pat_name: String,
    pub adm_id: String,
    #[serde(default)]
    pub visit_type: String,
    pub dept_code: Option<String>,
    pub dept_desc: Option<String>,
    pub hosp_code: Option<String>,
    pub hosp_desc: Option<String>,
    #[serde(default)]
    pub user_ip: String,
    pub user_code: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub msg_time: String,
    #[serde(default)]
    pub remark: String,
    /// Opaque encounter payload, passed through to the terminal unchanged.
    pub item_data: serde_json::Value,
}

impl ClinicalEvent {
    /// Resolve the routing key from the event's addressing fields.
    /// Returns None when the department code is absent.
    pub fn routing_key(&self) -> Option<RoutingKey> {
        let dept = self.dept_code.as_deref()?;
        if dept.is_empty() || self.user_code.is_empty() {
            return None;
        }
        Some(RoutingKey::new(dept, &self.user_code))
    }
}

/// Terminal-originated request for recommendations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendRequest {
    pub request_id: RequestId,
    pub terminal_id: TerminalId,
    pub patient_id: String,
    pub encounter_id: String,
}

/// One normalized recommendation item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub check_item_name: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub cautions: String,
}

/// Normalized result returned to the requesting terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendResponse {
    pub request_id: RequestId,
    pub session_key: SessionKey,
    pub recommendations: Vec<Recommendation>,
    pub upstream_latency_ms: u64,
}
