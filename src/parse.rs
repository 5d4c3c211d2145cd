//! Model reply parsing and validation.
//!
//! Turns raw model text into a [`ModelTurn`]. The reply may be bare JSON or
//! JSON inside a fenced code block, and the action may be either a
//! `{"name", "args"}` object or a `name(arg, ...)` call string. Both encodings
//! go through the same arity and type checks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::action::{lookup, Action, ActionSpec, ArgKind, ModelTurn, ScrollDirection, TargetRef};
use crate::error::ParseError;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9_-]*)\s*(.*?)\s*```").expect("valid fence regex"));

static CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)([A-Za-z_]\w*)\s*\((.*)\)").expect("valid call regex"));

/// Keys accepted in place of `targetId` when lenient.
const TARGET_ALIASES: &[&str] = &["elementId", "element_id", "target_id"];

/// How much structural slack the parser tolerates.
///
/// `Lenient` keeps a few recoveries for loosely-structured replies: aliased
/// target keys, bare zero-argument action names, and inferring `click` from a
/// top-level numeric `target_id` when `action` is absent. `Strict` rejects all
/// of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParseMode {
    #[default]
    Lenient,
    Strict,
}

impl ParseMode {
    /// `PAGEPILOT_STRICT_PARSE=1` (or `true`) selects [`ParseMode::Strict`].
    pub fn from_env() -> Self {
        match std::env::var("PAGEPILOT_STRICT_PARSE").as_deref() {
            Ok("1") | Ok("true") => ParseMode::Strict,
            _ => ParseMode::Lenient,
        }
    }
}

/// Parse with the default (lenient) policy.
pub fn parse(raw: &str) -> Result<ModelTurn, ParseError> {
    parse_with_mode(raw, ParseMode::default())
}

pub fn parse_with_mode(raw: &str, mode: ParseMode) -> Result<ModelTurn, ParseError> {
    let object = decode_object(raw)?;

    let thought = match object.get("thought") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => return Err(ParseError::MissingThought),
    };

    let action = match object.get("action") {
        Some(Value::String(call)) => parse_call_string(call, mode)?,
        Some(Value::Object(obj)) => parse_action_object(obj, mode)?,
        Some(Value::Null) | None => match mode {
            ParseMode::Lenient => infer_action(&object).ok_or(ParseError::MissingAction)?,
            ParseMode::Strict => return Err(ParseError::MissingAction),
        },
        Some(_) => return Err(ParseError::MissingAction),
    };

    Ok(ModelTurn { thought, action })
}

fn decode_object(raw: &str) -> Result<Map<String, Value>, ParseError> {
    let value = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(v) => v,
        Err(_) => extract_fenced_blocks(raw)
            .into_iter()
            .find_map(|block| serde_json::from_str::<Value>(block).ok())
            .ok_or(ParseError::InvalidJson)?,
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::NotAnObject),
    }
}

/// Contents of triple-backtick blocks that look like JSON objects, in order.
pub fn extract_fenced_blocks(text: &str) -> Vec<&str> {
    FENCED_BLOCK
        .captures_iter(text)
        .filter_map(|caps| caps.get(2))
        .map(|m| m.as_str())
        .filter(|body| body.starts_with('{'))
        .collect()
}

fn parse_call_string(call: &str, mode: ParseMode) -> Result<Action, ParseError> {
    let (name, args) = match CALL.captures(call) {
        Some(caps) => {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let inner = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            (name.to_string(), tokenize_args(inner)?)
        }
        None => {
            let bare = call.trim();
            match (mode, lookup(bare)) {
                (ParseMode::Lenient, Some(spec)) if spec.params.is_empty() => (bare.to_string(), Vec::new()),
                _ if lookup(bare).is_none() && is_identifier(bare) => {
                    return Err(ParseError::InvalidAction(bare.to_string()))
                }
                _ => return Err(ParseError::MalformedCall(call.to_string())),
            }
        }
    };
    let spec = lookup(&name).ok_or_else(|| ParseError::InvalidAction(name.clone()))?;
    bind_positional(spec, args)
}

fn parse_action_object(obj: &Map<String, Value>, mode: ParseMode) -> Result<Action, ParseError> {
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::MalformedCall("action object has no name".into()))?;
    let spec = lookup(name).ok_or_else(|| ParseError::InvalidAction(name.to_string()))?;
    match obj.get("args") {
        None | Some(Value::Null) => bind_named(spec, &Map::new(), mode),
        Some(Value::Object(args)) => bind_named(spec, args, mode),
        Some(Value::Array(args)) => bind_positional(spec, args.clone()),
        Some(_) => Err(ParseError::MalformedCall(format!("{name}: args must be an object"))),
    }
}

fn infer_action(object: &Map<String, Value>) -> Option<Action> {
    let id = ["target_id", "targetId", "elementId"]
        .iter()
        .find_map(|k| object.get(*k))?;
    let target = match id {
        Value::Number(n) => n.as_u64().map(TargetRef::from)?,
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => TargetRef::new(s.as_str()),
        _ => return None,
    };
    debug!(target = %target, "inferred click from bare target id");
    Some(Action::Click { target_id: target })
}

fn bind_named(spec: &ActionSpec, args: &Map<String, Value>, mode: ParseMode) -> Result<Action, ParseError> {
    let mut positional = Vec::with_capacity(spec.params.len());
    let mut consumed = 0usize;
    for param in spec.params {
        let mut found = args.get(param.name);
        if found.is_none() && mode == ParseMode::Lenient && param.kind == ArgKind::Target {
            found = TARGET_ALIASES.iter().find_map(|k| args.get(*k));
        }
        match found {
            Some(v) => {
                consumed += 1;
                positional.push(v.clone());
            }
            None => {
                return Err(ParseError::MissingArgument {
                    action: spec.name.to_string(),
                    arg: param.name.to_string(),
                })
            }
        }
    }
    if consumed != args.len() {
        let known = |k: &str| {
            spec.params.iter().any(|p| p.name == k)
                || (mode == ParseMode::Lenient
                    && TARGET_ALIASES.contains(&k)
                    && spec.params.iter().any(|p| p.kind == ArgKind::Target))
        };
        let extra = args.keys().find(|k| !known(k)).cloned().unwrap_or_default();
        return Err(ParseError::UnexpectedArgument {
            action: spec.name.to_string(),
            arg: extra,
        });
    }
    bind_positional(spec, positional)
}

fn bind_positional(spec: &ActionSpec, args: Vec<Value>) -> Result<Action, ParseError> {
    if args.len() != spec.params.len() {
        return Err(ParseError::ArityMismatch {
            action: spec.name.to_string(),
            expected: spec.params.len(),
            found: args.len(),
        });
    }
    let mut target = None;
    let mut strings = Vec::new();
    let mut direction = None;
    for (param, value) in spec.params.iter().zip(args) {
        let invalid = |reason: &str| ParseError::InvalidArgument {
            action: spec.name.to_string(),
            arg: param.name.to_string(),
            reason: reason.to_string(),
        };
        match param.kind {
            ArgKind::Target => {
                target = Some(match value {
                    Value::String(s) if !s.is_empty() => TargetRef::new(s),
                    Value::Number(n) if n.is_u64() || n.is_i64() => TargetRef::new(n.to_string()),
                    _ => return Err(invalid("must be a non-empty string or an integer")),
                });
            }
            ArgKind::String => match value {
                Value::String(s) => strings.push(s),
                _ => return Err(invalid("must be a string")),
            },
            ArgKind::Direction => {
                direction = Some(
                    value
                        .as_str()
                        .and_then(ScrollDirection::parse)
                        .ok_or_else(|| invalid("must be one of up, down, top, bottom"))?,
                );
            }
        }
    }

    let mut strings = strings.into_iter();
    let missing = || ParseError::MissingArgument {
        action: spec.name.to_string(),
        arg: String::new(),
    };
    let action = match spec.name {
        "click" => Action::Click {
            target_id: target.ok_or_else(missing)?,
        },
        "setValue" => Action::SetValue {
            target_id: target.ok_or_else(missing)?,
            value: strings.next().ok_or_else(missing)?,
        },
        "setValueAndEnter" => Action::SetValueAndEnter {
            target_id: target.ok_or_else(missing)?,
            value: strings.next().ok_or_else(missing)?,
        },
        "navigate" => Action::Navigate {
            url: strings.next().ok_or_else(missing)?,
        },
        "scroll" => Action::Scroll {
            direction: direction.ok_or_else(missing)?,
        },
        "wait" => Action::Wait,
        "finish" => Action::Finish,
        "fail" => Action::Fail,
        other => return Err(ParseError::InvalidAction(other.to_string())),
    };
    Ok(action)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Extract string and number literals from the inside of a call's parens.
///
/// Anything that is not a literal (identifiers, braces, colons, commas) is
/// skipped, so `click({targetId: '4'})` and `click('4')` both yield `["4"]`.
pub(crate) fn tokenize_args(input: &str) -> Result<Vec<Value>, ParseError> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '"' | '\'' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('r') => s.push('\r'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        },
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => s.push(ch),
                    }
                }
                if !closed {
                    return Err(ParseError::MalformedCall(format!("unterminated string in `{input}`")));
                }
                out.push(Value::String(s));
            }
            '0'..='9' | '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if num == "-" {
                    continue;
                }
                let value = serde_json::from_str::<Value>(&num)
                    .map_err(|_| ParseError::MalformedCall(format!("bad number `{num}`")))?;
                out.push(value);
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '$' {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            _ => {
                chars.next();
            }
        }
    }
    Ok(out)
}
