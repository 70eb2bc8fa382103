//! Summarization parameter validation.
//!
//! Client parameters are checked against a fixed table of generation
//! options. Unknown keys are dropped, wrongly typed or out-of-range values
//! fall back to the default, and each correction is reported as a warning
//! under the offending key. Defaults are then merged in, so the resulting
//! effective parameters are what identities are computed over.

use serde_json::Value;

use crate::models::{add_warning, Params, Warnings};

#[derive(Debug, Clone, Copy)]
enum Kind {
    Float { min: f64, max: f64 },
    Int { min: i64, max: i64 },
    Bool,
}

#[derive(Debug, Clone, Copy)]
enum Fallback {
    Float(f64),
    Int(i64),
    Bool(bool),
    Unset,
}

impl Fallback {
    fn to_value(self) -> Option<Value> {
        match self {
            Fallback::Float(v) => Some(Value::from(v)),
            Fallback::Int(v) => Some(Value::from(v)),
            Fallback::Bool(v) => Some(Value::from(v)),
            Fallback::Unset => None,
        }
    }
}

struct ParamSpec {
    name: &'static str,
    kind: Kind,
    default: Fallback,
}

const GENERATION_PARAMS: &[ParamSpec] = &[
    ParamSpec {
        name: "relative_max_length",
        kind: Kind::Float { min: 0.0, max: 1.0 },
        default: Fallback::Float(0.4),
    },
    ParamSpec {
        name: "relative_min_length",
        kind: Kind::Float { min: 0.0, max: 1.0 },
        default: Fallback::Float(0.1),
    },
    ParamSpec {
        name: "do_sample",
        kind: Kind::Bool,
        default: Fallback::Bool(true),
    },
    ParamSpec {
        name: "early_stopping",
        kind: Kind::Bool,
        default: Fallback::Unset,
    },
    ParamSpec {
        name: "num_beams",
        kind: Kind::Int { min: 1, max: 64 },
        default: Fallback::Int(4),
    },
    ParamSpec {
        name: "temperature",
        kind: Kind::Float {
            min: 0.0,
            max: 100.0,
        },
        default: Fallback::Unset,
    },
    ParamSpec {
        name: "top_k",
        kind: Kind::Int {
            min: 0,
            max: 10_000,
        },
        default: Fallback::Unset,
    },
    ParamSpec {
        name: "top_p",
        kind: Kind::Float { min: 0.0, max: 1.0 },
        default: Fallback::Unset,
    },
    ParamSpec {
        name: "repetition_penalty",
        kind: Kind::Float {
            min: 1.0,
            max: 100.0,
        },
        default: Fallback::Unset,
    },
    ParamSpec {
        name: "length_penalty",
        kind: Kind::Float {
            min: -100.0,
            max: 100.0,
        },
        default: Fallback::Unset,
    },
    ParamSpec {
        name: "no_repeat_ngram_size",
        kind: Kind::Int { min: 0, max: 64 },
        default: Fallback::Int(4),
    },
];

/// Effective parameters plus the warnings produced while deriving them.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedParams {
    pub params: Params,
    pub warnings: Warnings,
}

/// Validate client parameters and merge in defaults.
pub fn validate_params(raw: &Params) -> ValidatedParams {
    let mut params = Params::new();
    let mut warnings = Warnings::new();

    for (key, value) in raw {
        let Some(spec) = GENERATION_PARAMS.iter().find(|s| s.name == key.as_str()) else {
            add_warning(&mut warnings, key, "unknown parameter; ignored");
            continue;
        };
        if value.is_null() {
            continue;
        }
        match check(spec.kind, value) {
            Ok(v) => {
                params.insert(key.clone(), v);
            }
            Err(expected) => {
                let fallback = match spec.default.to_value() {
                    Some(d) => format!("using default {}", d),
                    None => "ignored".to_string(),
                };
                add_warning(
                    &mut warnings,
                    key,
                    format!("expected {}, got {}; {}", expected, value, fallback),
                );
            }
        }
    }

    for spec in GENERATION_PARAMS {
        if let Some(default) = spec.default.to_value() {
            params.entry(spec.name.to_string()).or_insert(default);
        }
    }

    let min = param_f64(&params, "relative_min_length", 0.1);
    let max = param_f64(&params, "relative_max_length", 0.4);
    if min > max {
        add_warning(
            &mut warnings,
            "relative_min_length",
            format!(
                "relative_min_length ({}) exceeds relative_max_length ({}); using defaults for both",
                min, max
            ),
        );
        params.insert("relative_min_length".to_string(), Value::from(0.1));
        params.insert("relative_max_length".to_string(), Value::from(0.4));
    }

    ValidatedParams { params, warnings }
}

/// Read a float parameter, falling back to `default`.
pub fn param_f64(params: &Params, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Read an integer parameter, falling back to `default`.
pub fn param_i64(params: &Params, key: &str, default: i64) -> i64 {
    params.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn check(kind: Kind, value: &Value) -> Result<Value, String> {
    match kind {
        Kind::Float { min, max } => match value.as_f64() {
            Some(v) if (min..=max).contains(&v) => Ok(Value::from(v)),
            _ => Err(format!("a number in [{}, {}]", min, max)),
        },
        Kind::Int { min, max } => match value.as_i64() {
            Some(v) if (min..=max).contains(&v) => Ok(Value::from(v)),
            _ => Err(format!("an integer in [{}, {}]", min, max)),
        },
        Kind::Bool => match value.as_bool() {
            Some(v) => Ok(Value::from(v)),
            None => Err("a boolean".to_string()),
        },
    }
}
