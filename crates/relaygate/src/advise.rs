//! Repository advice: turns a scorecard and hotspot list into a chat call
//! with a mode-specific system prompt.
//!
//! Advice calls go through the same transport pipeline as `/v1/chat`, so they
//! are admitted, health-checked and metered like any other call.

use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use relaygate_protocol::{ChatRequestBody, Message, Role};
use serde::Deserialize;

use crate::config::StreamingSettings;
use crate::error::GatewayError;
use crate::llm::ChatRequest;
use crate::transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviseMode {
    /// Executive summary and focus areas.
    Exec,
    /// Code health and refactoring plan.
    Code,
    /// Delivery performance and pipeline practices.
    Ops,
    /// Contributor growth and project visibility.
    Community,
}

impl AdviseMode {
    pub const ALL: [AdviseMode; 4] = [
        AdviseMode::Exec,
        AdviseMode::Code,
        AdviseMode::Ops,
        AdviseMode::Community,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AdviseMode::Exec => "exec",
            AdviseMode::Code => "code",
            AdviseMode::Ops => "ops",
            AdviseMode::Community => "community",
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            AdviseMode::Exec => {
                r#"You are a precise repository analyst. Base every statement on the provided scorecard JSON only; do not speculate.
Reply with strict JSON of this shape:
{"summary":{"grade":"A|B|C|D|E","chi":0-100,"lead_time_p95_hours":number,"deploys_per_week":number},
"top_focus":[{"title":string,"why":string,"kpi":string,"target":string,"confidence":0..1}],
"quick_wins":[{"action":string,"effort":"S|M|L","expected_gain":string}],
"risks":[{"risk":string,"mitigation":string}],
"call_to_action":string}"#
            }
            AdviseMode::Code => {
                r#"You are a senior code-quality advisor. Improve the code health index with the least disruption.
Reply with strict JSON of this shape:
{"chi_now":number,
"drivers":[{"metric":"mi|duplication_pct|cyclomatic_avg","value":number,"impact":"high|med|low"}],
"refactor_plan":[{"step":number,"theme":"duplication|complexity|tests","actions":[string],"kpi":string,"target":string}],
"guardrails":[string],
"milestones":[{"in_days":number,"goal":string}]}"#
            }
            AdviseMode::Ops => {
                r#"You are a pragmatic delivery coach. Use only the provided data.
Reply with strict JSON of this shape:
{"lead_time_p95_hours":number,"deployment_frequency_per_week":number,"change_fail_rate_pct":number,"mttr_hours":number,
"bottlenecks":[{"area":"review|pipeline|batch_size|release","evidence":string}],
"playbook":[{"name":string,"policy":string,"expected_effect":string}],
"experiments":[{"hypothesis":string,"metric":"lead_time_p95|cfr|mttr","duration_days":number}]}"#
            }
            AdviseMode::Community => {
                r#"You are a community growth advisor. Keep suggestions concrete and low-friction.
Reply with strict JSON of this shape:
{"bus_factor":number,"onboarding_p50_days":number|null,
"roadmap":[{"item":string,"why":string,"success_metric":string}],
"visibility":[{"asset":string,"kpi":string,"effort":"S|M|L"}]}"#
            }
        }
    }
}

impl fmt::Display for AdviseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdviseMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AdviseMode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GatewayError::validation(mode_hint(s)))
    }
}

fn mode_hint(got: &str) -> String {
    let modes: Vec<_> = AdviseMode::ALL.iter().map(|m| m.as_str()).collect();
    if got.trim().is_empty() {
        format!("mode is required: {}", modes.join("|"))
    } else {
        format!("unknown mode '{}': expected {}", got, modes.join("|"))
    }
}

/// Body of `POST /v1/advise`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdviseRequestBody {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub scorecard: serde_json::Value,
    #[serde(default)]
    pub hotspots: Vec<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Build the chat request for an advice call.
pub fn build_request(
    mode: AdviseMode,
    body: AdviseRequestBody,
    headers: &HeaderMap,
    streaming: &StreamingSettings,
) -> Result<ChatRequest, GatewayError> {
    let user = user_prompt(&body.scorecard, &body.hotspots)?;

    let mut meta = serde_json::Map::new();
    meta.insert("advise_mode".to_string(), mode.as_str().into());

    let chat = ChatRequestBody {
        provider: body.provider,
        model: body.model,
        messages: vec![
            Message::new(Role::System, mode.system_prompt()),
            Message::new(Role::User, user),
        ],
        temperature: body.temperature,
        stream: true,
        meta,
        headers: Default::default(),
    };
    transport::build_request(chat, headers, streaming)
}

fn user_prompt(scorecard: &serde_json::Value, hotspots: &[String]) -> Result<String, GatewayError> {
    let invalid = |e: serde_json::Error| GatewayError::validation(format!("invalid scorecard: {e}"));
    let scorecard = serde_json::to_string_pretty(scorecard).map_err(invalid)?;
    let hotspots = serde_json::to_string_pretty(hotspots).map_err(invalid)?;
    Ok(format!(
        "Scorecard results for a software repository:\n```json\n{scorecard}\n```\n\n\
         Hotspots that may need attention:\n```json\n{hotspots}\n```\n\n\
         Using only the data above, give specific, actionable advice to improve the repository. \
         Prioritize the most impactful recommendations and keep it concise."
    ))
}
