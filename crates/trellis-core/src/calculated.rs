//! # Declarative Calculated Properties
//!
//! Calculated properties that a schema document can declare without code:
//! - `template`: a format string over arguments, where a dotted placeholder
//!   such as `{organism.scientific_name}` embeds the linked item and reads
//!   the field from its object view
//! - `count`: the length of a list-valued argument (typically a reverse
//!   collection)
//!
//! Any placeholder that does not resolve makes the whole template `Missing`.

use crate::registry::CalculatedProperty;
use crate::render::CalcCall;
use crate::TrellisError;
use serde::Deserialize;
use serde_json::Value;

/// Serialized declaration of a calculated property.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalculatedDocument {
    /// Format string over arguments and linked fields.
    Template {
        /// Property name.
        name: String,
        /// Format string, e.g. `"{label} ({organism.scientific_name})"`.
        template: String,
        /// Only compute when this attribute resolves.
        #[serde(default)]
        requires: Option<String>,
        /// Hide from rendered views.
        #[serde(default)]
        define_only: bool,
    },
    /// Length of a list-valued argument.
    Count {
        /// Property name.
        name: String,
        /// The list-valued attribute to count.
        of: String,
        /// Only compute when this attribute resolves.
        #[serde(default)]
        requires: Option<String>,
        /// Hide from rendered views.
        #[serde(default)]
        define_only: bool,
    },
}

impl CalculatedDocument {
    /// Compile into a registry definition owned by `owner`.
    pub fn compile(&self, owner: &str) -> Result<CalculatedProperty, TrellisError> {
        let (def, requires, define_only) = match self {
            Self::Template {
                name,
                template,
                requires,
                define_only,
            } => {
                let parsed = Template::parse(template)?;
                let args = parsed.arguments();
                let def = CalculatedProperty::new(owner, name.as_str(), move |call| {
                    parsed.render(call)
                })
                .args(args);
                (def, requires, *define_only)
            }
            Self::Count {
                name,
                of,
                requires,
                define_only,
            } => {
                let source = of.clone();
                let def = CalculatedProperty::new(owner, name.as_str(), move |call| {
                    Ok(call
                        .arg(&source)
                        .and_then(Value::as_array)
                        .map(|items| Value::from(items.len())))
                })
                .args([of.as_str()]);
                (def, requires, *define_only)
            }
        };

        let def = match requires {
            Some(name) => def.requires(name.as_str()),
            None => def,
        };
        Ok(if define_only { def.define_only() } else { def })
    }
}

// =============================================================================
// TEMPLATE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Field(Vec<String>),
}

/// A parsed format string.
///
/// `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    /// Parse a format string.
    pub fn parse(source: &str) -> Result<Self, TrellisError> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut field = String::new();
                    let mut closed = false;
                    for f in chars.by_ref() {
                        if f == '}' {
                            closed = true;
                            break;
                        }
                        field.push(f);
                    }
                    let segments: Vec<String> =
                        field.split('.').map(|s| s.trim().to_string()).collect();
                    if !closed || segments.iter().any(String::is_empty) {
                        return Err(TrellisError::InvalidSchema(format!(
                            "malformed placeholder in template {:?}",
                            source
                        )));
                    }
                    if !text.is_empty() {
                        parts.push(Part::Text(std::mem::take(&mut text)));
                    }
                    parts.push(Part::Field(segments));
                }
                '}' => {
                    return Err(TrellisError::InvalidSchema(format!(
                        "unmatched }} in template {:?}",
                        source
                    )));
                }
                other => text.push(other),
            }
        }
        if !text.is_empty() {
            parts.push(Part::Text(text));
        }
        Ok(Self { parts })
    }

    /// Argument names the template reads, in first-use order.
    #[must_use]
    pub fn arguments(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for part in &self.parts {
            if let Part::Field(path) = part
                && let Some(head) = path.first()
                && !out.contains(head)
            {
                out.push(head.clone());
            }
        }
        out
    }

    /// Render against resolved arguments, embedding links on dotted paths.
    pub fn render(&self, call: &mut CalcCall<'_, '_>) -> Result<Option<Value>, TrellisError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Field(path) => match follow(call, path)? {
                    Some(value) => out.push_str(&display(&value)),
                    None => return Ok(None),
                },
            }
        }
        Ok(Some(Value::String(out)))
    }
}

/// Walk a dotted path from an argument, embedding link paths on the way.
fn follow(call: &mut CalcCall<'_, '_>, path: &[String]) -> Result<Option<Value>, TrellisError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(None);
    };
    let Some(mut value) = call.arg(head).cloned() else {
        return Ok(None);
    };
    for segment in rest {
        if let Value::String(link) = &value {
            match call.embed_optional(link)? {
                Some(embedded) => value = Value::clone(&embedded),
                None => return Ok(None),
            }
        }
        match value.get(segment.as_str()) {
            Some(next) => value = next.clone(),
            None => return Ok(None),
        }
    }
    Ok(match value {
        Value::Null => None,
        other => Some(other),
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
