use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Header-name fragments that mark a column as holding a phone or group
/// identifier. Matched case-insensitively against the lowercased field name;
/// covers the Latin and Devanagari headers seen in uploaded sheets.
const PHONE_FIELD_HINTS: &[&str] = &[
    "phone", "mobile", "number", "contact", "whatsapp", "cell", "फोन", "मोबाइल", "नंबर", "संपर्क",
];

/// Header-name fragments that mark a column as holding the contact's name.
const NAME_FIELD_HINTS: &[&str] = &["name", "नाम"];

/// Display name used when no name column or name-like value exists, so
/// `Hi {name}` still reads naturally.
pub const FALLBACK_DISPLAY_NAME: &str = "there";

/// Identifiers this short are junk (serial numbers, row ids) and the row
/// carrying them is dropped.
const MIN_IDENTIFIER_CHARS: usize = 6;

/// Digit-count window a bare cell value must fall in to be accepted as an
/// identifier when no header matched.
const FALLBACK_DIGITS_MIN: usize = 9;
const FALLBACK_DIGITS_MAX: usize = 14;

/// One addressable target for an outbound message. `identifier` is the raw
/// string handed to the gateway (individual number or group id); identity is
/// the string itself, trimmed but otherwise unnormalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub identifier: String,
    pub display_name: String,
}

impl RecipientRecord {
    pub fn new(identifier: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
        }
    }

    /// Label used in the audit log.
    pub fn label(&self) -> String {
        if self.display_name.is_empty() || self.display_name == FALLBACK_DISPLAY_NAME {
            self.identifier.clone()
        } else {
            self.display_name.clone()
        }
    }
}

/// Infer a recipient list from already-decoded tabular rows.
///
/// Rows arrive as JSON objects whose field order tracks the source columns
/// (serde_json is built with `preserve_order`), so "first matching field" is
/// deterministic for any order-stable decoder. Rows that yield no usable
/// identifier are dropped; duplicates are kept as independent entries and
/// output order matches input order. An empty result is a normal return
/// value — the caller decides how to surface it.
pub fn infer_recipients(rows: &[Map<String, Value>]) -> Vec<RecipientRecord> {
    let mut recipients = Vec::new();

    for row in rows {
        if let Some(record) = infer_row(row) {
            recipients.push(record);
        }
    }

    log::debug!(
        "roster inference: {} of {} rows usable",
        recipients.len(),
        rows.len()
    );
    recipients
}

fn infer_row(row: &Map<String, Value>) -> Option<RecipientRecord> {
    let mut identifier: Option<String> = None;
    // Raw cell text the identifier came from, so the display-name fallback
    // can skip that cell.
    let mut identifier_cell: Option<String> = None;
    let mut display_name: Option<String> = None;

    for (field, value) in row {
        let Some(text) = cell_text(value) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        let field_lc = field.to_lowercase();

        if identifier.is_none() && PHONE_FIELD_HINTS.iter().any(|h| field_lc.contains(h)) {
            identifier = Some(text.clone());
            identifier_cell = Some(text.clone());
        }
        if display_name.is_none() && NAME_FIELD_HINTS.iter().any(|h| field_lc.contains(h)) {
            display_name = Some(text);
        }
    }

    // No header gave an identifier: fall back to whatever cell looks like a
    // phone number once punctuation is stripped.
    if identifier.is_none() {
        for (_, value) in row {
            let Some(text) = cell_text(value) else {
                continue;
            };
            let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
            if (FALLBACK_DIGITS_MIN..=FALLBACK_DIGITS_MAX).contains(&digits.len()) {
                identifier = Some(digits);
                identifier_cell = Some(text);
                break;
            }
        }

        if display_name.is_none() {
            for (_, value) in row {
                let Some(text) = cell_text(value) else {
                    continue;
                };
                if text.chars().count() > 2
                    && text.chars().any(|c| c.is_alphabetic())
                    && identifier_cell.as_deref() != Some(text.as_str())
                {
                    display_name = Some(text);
                    break;
                }
            }
        }
    }

    let identifier = identifier?;
    let identifier = identifier.trim().to_string();
    if identifier.chars().count() < MIN_IDENTIFIER_CHARS {
        return None;
    }

    Some(RecipientRecord {
        identifier,
        display_name: display_name.unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_string()),
    })
}

/// Cell values come out of spreadsheet decoders as strings or bare numbers;
/// anything else carries no contact data.
fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
