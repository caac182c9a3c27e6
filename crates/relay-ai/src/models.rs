use serde::Serialize;
use serde_json::Value;

use relay_core::event::{ClinicalEvent, Recommendation};

/// Request body for the recommendation upstream. Field names match the
/// upstream contract (snake_case, unlike the terminal-facing wire format).
#[derive(Clone, Debug, Serialize)]
pub struct UpstreamRequest {
    pub session_id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub department: String,
    pub source: String,
    pub patient_sex: String,
    pub patient_age: String,
    pub abstract_history: String,
    pub clinic_info: String,
    pub recommend_count: u32,
    pub diagnose_name: String,
}

impl UpstreamRequest {
    /// Build the upstream payload from a clinical event. The encounter id
    /// doubles as the upstream session id.
    pub fn from_event(event: &ClinicalEvent, source: &str, recommend_count: u32) -> Self {
        let patient_sex = item_str(&event.item_data, "patientSex");
        let patient_age = item_str(&event.item_data, "patientAge");
        let abstract_history = item_str(&event.item_data, "abstractHistory");
        let clinic_info = item_str(&event.item_data, "clinicInfo");
        let diagnose_name = infer_diagnose_name(&abstract_history, &clinic_info);

        Self {
            session_id: event.adm_id.clone(),
            patient_id: event.pat_no.clone(),
            doctor_id: event.user_code.clone(),
            department: event
                .dept_code
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            source: source.to_string(),
            patient_sex,
            patient_age,
            abstract_history,
            clinic_info,
            recommend_count,
            diagnose_name,
        }
    }
}

fn item_str(item_data: &Value, key: &str) -> String {
    match item_data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Derive a short working-diagnosis label from the history or chief
/// complaint when the event carries no explicit diagnosis.
fn infer_diagnose_name(abstract_history: &str, clinic_info: &str) -> String {
    let text = if !abstract_history.trim().is_empty() {
        abstract_history
    } else {
        clinic_info
    };
    text.trim()
        .replace('\n', " ")
        .chars()
        .take(25)
        .collect()
}

/// Extract recommendation items from a plain JSON response body. The
/// upstream varies the envelope shape, so several container keys are tried:
/// a top-level `data` array, an object under `data` holding one of
/// `recommendations`/`items`/`results`/`list`, or a top-level
/// `recommendations` array.
pub fn extract_recommendations(body: &Value) -> Vec<Recommendation> {
    let candidates: &[Value] = match body.get("data") {
        Some(Value::Array(arr)) => arr,
        Some(Value::Object(map)) => {
            let mut found: &[Value] = &[];
            for key in ["recommendations", "items", "results", "list"] {
                if let Some(Value::Array(arr)) = map.get(key) {
                    found = arr;
                    break;
                }
            }
            found
        }
        _ => match body.get("recommendations") {
            Some(Value::Array(arr)) => arr,
            _ => &[],
        },
    };

    candidates.iter().filter_map(item_to_recommendation).collect()
}

fn item_to_recommendation(item: &Value) -> Option<Recommendation> {
    let obj = item.as_object()?;
    let name = obj
        .get("check_item_name")
        .or_else(|| obj.get("checkItemName"))
        .and_then(Value::as_str)?
        .trim();
    if name.is_empty() {
        return None;
    }
    Some(Recommendation {
        check_item_name: name.to_string(),
        reason: str_field(obj, "reason"),
        cautions: str_field(obj, "cautions"),
    })
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Parse an event-stream body. Items arrive as fragments keyed by
/// `check_item_name`; `reason` and `cautions` accumulate across fragments
/// for the same item, and a `finish` marker ends the stream. Item order
/// follows first appearance.
pub fn parse_event_stream(body: &str) -> Vec<Recommendation> {
    let mut order: Vec<String> = Vec::new();
    let mut acc: std::collections::HashMap<String, (String, String)> =
        std::collections::HashMap::new();

    for line in body.lines() {
        let line = line.trim_start();
        let data_str = if let Some(rest) = line.strip_prefix("data:") {
            rest.trim()
        } else if line.starts_with('{') {
            line
        } else {
            continue;
        };
        if data_str.is_empty() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(data_str) else {
            continue;
        };

        if is_finish_marker(&data) {
            break;
        }

        let payload = match &data {
            Value::Object(map) if map.get("code").and_then(Value::as_i64) == Some(0) => {
                match map.get("data") {
                    Some(Value::Object(inner)) => inner,
                    _ => continue,
                }
            }
            Value::Object(map)
                if map.contains_key("check_item_name")
                    || map.contains_key("reason")
                    || map.contains_key("cautions") =>
            {
                map
            }
            _ => continue,
        };

        let Some(name) = payload
            .get("check_item_name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };

        let entry = acc.entry(name.to_string()).or_insert_with(|| {
            order.push(name.to_string());
            (String::new(), String::new())
        });
        if let Some(reason) = payload.get("reason").and_then(Value::as_str) {
            entry.0.push_str(reason);
        }
        if let Some(cautions) = payload.get("cautions").and_then(Value::as_str) {
            entry.1.push_str(cautions);
        }
    }

    order
        .into_iter()
        .filter_map(|name| {
            let (reason, cautions) = acc.remove(&name)?;
            Some(Recommendation {
                check_item_name: name,
                reason: reason.trim().to_string(),
                cautions: cautions.trim().to_string(),
            })
        })
        .collect()
}

fn is_finish_marker(data: &Value) -> bool {
    match data.get("finish") {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> ClinicalEvent {
        serde_json::from_value(serde_json::json!({
            "systemId": "HIS01",
            "sceneType": "EXAM001",
            "patNo": "P001",
            "admId": "ADM42",
            "deptCode": "CARD",
            "userCode": "D1001",
            "itemData": {
                "patientAge": "54",
                "patientSex": "F",
                "clinicInfo": "chest pain for two days",
                "abstractHistory": "hypertension, 10 years\nno surgery"
            }
        }))
        .unwrap()
    }

    #[test]
    fn upstream_request_from_event() {
        let req = UpstreamRequest::from_event(&sample_event(), "lip", 3);
        assert_eq!(req.session_id, "ADM42");
        assert_eq!(req.patient_id, "P001");
        assert_eq!(req.doctor_id, "D1001");
        assert_eq!(req.department, "CARD");
        assert_eq!(req.source, "lip");
        assert_eq!(req.patient_age, "54");
        assert_eq!(req.recommend_count, 3);
        // newline flattened, capped at 25 chars
        assert_eq!(req.diagnose_name, "hypertension, 10 years no");
    }

    #[test]
    fn missing_department_becomes_unknown() {
        let mut event = sample_event();
        event.dept_code = None;
        let req = UpstreamRequest::from_event(&event, "lip", 3);
        assert_eq!(req.department, "unknown");
    }

    #[test]
    fn diagnose_falls_back_to_clinic_info() {
        let mut event = sample_event();
        event.item_data["abstractHistory"] = serde_json::json!("");
        let req = UpstreamRequest::from_event(&event, "lip", 3);
        assert_eq!(req.diagnose_name, "chest pain for two days");
    }

    #[test]
    fn extract_from_data_array() {
        let body = serde_json::json!({
            "code": 0,
            "data": [
                {"check_item_name": "Chest CT", "reason": "persistent pain", "cautions": ""},
                {"checkItemName": "ECG", "reason": "baseline"},
                {"check_item_name": "", "reason": "dropped"},
                {"reason": "no name, dropped"}
            ]
        });
        let recs = extract_recommendations(&body);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].check_item_name, "Chest CT");
        assert_eq!(recs[1].check_item_name, "ECG");
    }

    #[test]
    fn extract_from_nested_container_keys() {
        for key in ["recommendations", "items", "results", "list"] {
            let body = serde_json::json!({
                "data": { key: [{"check_item_name": "Chest CT"}] }
            });
            let recs = extract_recommendations(&body);
            assert_eq!(recs.len(), 1, "container key {key}");
        }
    }

    #[test]
    fn extract_from_top_level_recommendations() {
        let body = serde_json::json!({
            "recommendations": [{"check_item_name": "Chest CT", "reason": "r"}]
        });
        assert_eq!(extract_recommendations(&body).len(), 1);
    }

    #[test]
    fn extract_empty_when_shape_unknown() {
        let body = serde_json::json!({"message": "no results"});
        assert!(extract_recommendations(&body).is_empty());
    }

    #[test]
    fn stream_accumulates_fragments_per_item() {
        let body = concat!(
            "data: {\"code\":0,\"data\":{\"check_item_name\":\"Chest CT\",\"reason\":\"persistent \",\"cautions\":\"\"}}\n",
            "\n",
            "data: {\"code\":0,\"data\":{\"check_item_name\":\"Chest CT\",\"reason\":\"cough\",\"cautions\":\"contrast allergy\"}}\n",
            "data: {\"code\":0,\"data\":{\"check_item_name\":\"ECG\",\"reason\":\"baseline\"}}\n",
            "data: {\"finish\":1}\n",
            "data: {\"code\":0,\"data\":{\"check_item_name\":\"ignored after finish\"}}\n",
        );
        let recs = parse_event_stream(body);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].check_item_name, "Chest CT");
        assert_eq!(recs[0].reason, "persistent cough");
        assert_eq!(recs[0].cautions, "contrast allergy");
        assert_eq!(recs[1].check_item_name, "ECG");
    }

    #[test]
    fn stream_tolerates_bare_json_and_garbage_lines() {
        let body = concat!(
            ": comment line\n",
            "not json\n",
            "{\"check_item_name\":\"MRI\",\"reason\":\"follow-up\"}\n",
            "data: {\"finish\":true}\n",
        );
        let recs = parse_event_stream(body);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].check_item_name, "MRI");
    }

    #[test]
    fn finish_marker_variants() {
        assert!(is_finish_marker(&serde_json::json!({"finish": 1})));
        assert!(is_finish_marker(&serde_json::json!({"finish": true})));
        assert!(is_finish_marker(&serde_json::json!({"finish": "true"})));
        assert!(!is_finish_marker(&serde_json::json!({"finish": 0})));
        assert!(!is_finish_marker(&serde_json::json!({"code": 0})));
    }
}
