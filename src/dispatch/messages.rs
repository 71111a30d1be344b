//! Per-channel message rendering

use crate::fusion_core::types::{join_modalities, AlertLevel, Decision};

pub fn subject(decision: &Decision) -> &'static str {
    match decision.alert_level {
        AlertLevel::Urgent => "🚨 EMERGENCY ALERT - Immediate Attention Required",
        AlertLevel::Concerning => "⚠️ LifeWatch Alert - Please Check In",
        AlertLevel::Normal => "✅ Normal Activity Confirmed",
    }
}

/// Plain-text body for push notifications
pub fn push_body(decision: &Decision) -> String {
    format!(
        "Alert Level: {} ({})\nTimestamp: {}\nRequires Immediate Response: {}\n\n{}\n\n{}\n\nEvent: {}\nSources: {}",
        decision.alert_level.as_u8(),
        decision.alert_level.label(),
        decision.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        if decision.alert_level == AlertLevel::Urgent { "Yes" } else { "No" },
        decision.brief_description,
        decision.full_description,
        decision.event_id,
        join_modalities(&decision.contributing_modalities),
    )
}

/// HTML text for the chat bot (`parse_mode = HTML`)
pub fn chat_html(decision: &Decision) -> String {
    format!(
        "<b>{}</b>\n\n{}\n\n<i>{}</i>\n<code>{}</code>",
        escape_html(subject(decision)),
        escape_html(&decision.brief_description),
        decision.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        escape_html(&decision.event_id),
    )
}

/// Short spoken text for voice synthesis
pub fn speech_text(decision: &Decision) -> &'static str {
    match decision.alert_level {
        AlertLevel::Urgent => {
            "Emergency alert! Immediate attention required. Please check on the elderly person immediately."
        }
        AlertLevel::Concerning => {
            "Unusual activity detected. Please check on the elderly person when convenient."
        }
        AlertLevel::Normal => "Normal activity confirmed. Everything appears to be fine.",
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
