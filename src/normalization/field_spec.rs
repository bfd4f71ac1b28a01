//! Field-mapping expressions and their evaluation against a scraped record.
//!
//! Specs are parsed once when a mapping is loaded ([`FieldSpec::parse`]); evaluation
//! ([`FieldSpec::resolve`]) never fails and yields `None` when nothing usable was found,
//! letting callers fall through to defaults or legacy heuristics.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::text::{clamp_to_chars, sanitize_sentinel, slugify, strip_html};

#[derive(Debug, Error, PartialEq)]
#[error("invalid field spec at {at}: {reason}")]
pub struct SpecError {
    pub at: String,
    pub reason: String,
}

impl SpecError {
    fn new(at: &str, reason: impl Into<String>) -> Self {
        Self {
            at: at.to_string(),
            reason: reason.into(),
        }
    }
}

/// Which part of the record a path is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    /// `result.`: the whole record.
    Whole,
    /// `item.`: the core item (`product` or `item` object).
    Item,
    /// `variant.`: the variant item bound by the variant writer.
    Variant,
    /// `meta.`: the top-level structured metadata block.
    Meta,
    /// No prefix: core item first, then the whole record.
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathRef {
    pub root: Root,
    pub segments: Vec<String>,
}

impl PathRef {
    pub fn parse(raw: &str) -> Self {
        let mut segments: Vec<String> = raw
            .split('.')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let root = match segments.first().map(String::as_str) {
            Some("result") => Root::Whole,
            Some("item") => Root::Item,
            Some("variant") => Root::Variant,
            Some("meta") => Root::Meta,
            _ => Root::Default,
        };
        if root != Root::Default {
            segments.remove(0);
        }
        Self { root, segments }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Trim,
    Replace { find: String, replace: String },
    StripHtml,
    Truncate { len: usize },
    Slugify,
}

impl Transform {
    fn parse(raw: &Value, at: &str) -> Result<Self, SpecError> {
        match raw {
            Value::String(op) => Self::from_op(op, &Value::Null, at),
            Value::Object(map) => {
                if let Some(Value::String(op)) = map.get("op") {
                    return Self::from_op(op, raw, at);
                }
                // `{"replace": {...}}` / `{"truncate": {...}}` shorthand
                if map.len() == 1 {
                    if let Some((op, args)) = map.iter().next() {
                        return Self::from_op(op, args, at);
                    }
                }
                Err(SpecError::new(at, "transform object needs an `op`"))
            }
            _ => Err(SpecError::new(at, "transform must be a string or object")),
        }
    }

    fn from_op(op: &str, args: &Value, at: &str) -> Result<Self, SpecError> {
        match op {
            "trim" => Ok(Self::Trim),
            "strip_html" => Ok(Self::StripHtml),
            "slugify" => Ok(Self::Slugify),
            "replace" => {
                let find = args
                    .get("find")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SpecError::new(at, "replace needs a string `find`"))?;
                let replace = args.get("replace").and_then(Value::as_str).unwrap_or("");
                Ok(Self::Replace {
                    find: find.to_string(),
                    replace: replace.to_string(),
                })
            }
            "truncate" => {
                let len = args
                    .get("len")
                    .and_then(Value::as_u64)
                    .or_else(|| args.as_u64())
                    .ok_or_else(|| SpecError::new(at, "truncate needs a numeric `len`"))?;
                Ok(Self::Truncate { len: len as usize })
            }
            other => Err(SpecError::new(at, format!("unknown transform `{other}`"))),
        }
    }

    pub fn apply(&self, input: String) -> String {
        match self {
            Self::Trim => input.trim().to_string(),
            Self::Replace { find, replace } if !find.is_empty() => input.replace(find, replace),
            Self::Replace { .. } => input,
            Self::StripHtml => strip_html(&input),
            Self::Truncate { len } => clamp_to_chars(&input, *len),
            Self::Slugify => slugify(&input),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldSpec {
    /// `""` or `null`: the column is not mapped.
    #[default]
    Unset,
    /// `"=constant"`, `{ "const": .. }` or a bare JSON number/bool.
    Literal(Value),
    Path(PathRef),
    /// First non-empty alternative wins; later ones are not evaluated.
    Alternatives(Vec<FieldSpec>),
    Transformed {
        source: Box<FieldSpec>,
        transforms: Vec<Transform>,
    },
}

/// What a spec is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    pub record: &'a Value,
    pub variant: Option<&'a Value>,
}

impl<'a> Source<'a> {
    pub fn new(record: &'a Value) -> Self {
        Self {
            record,
            variant: None,
        }
    }

    pub fn with_variant(self, variant: &'a Value) -> Self {
        Self {
            variant: Some(variant),
            ..self
        }
    }

    /// The core item: `product`, then `item`, then the record itself.
    pub fn item(&self) -> &'a Value {
        self.record
            .get("product")
            .filter(|v| v.is_object())
            .or_else(|| self.record.get("item").filter(|v| v.is_object()))
            .unwrap_or(self.record)
    }

    pub fn meta(&self) -> Option<&'a Value> {
        ["meta", "structured", "metadata"]
            .iter()
            .find_map(|k| self.record.get(*k).filter(|v| v.is_object()))
    }

    fn lookup(&self, path: &PathRef) -> Option<&'a Value> {
        match path.root {
            Root::Whole => walk(self.record, &path.segments),
            Root::Item => walk(self.item(), &path.segments),
            Root::Variant => self.variant.and_then(|v| walk(v, &path.segments)),
            Root::Meta => self.meta().and_then(|m| walk(m, &path.segments)),
            Root::Default => walk(self.item(), &path.segments)
                .filter(|v| !is_empty(v))
                .or_else(|| walk(self.record, &path.segments)),
        }
    }
}

fn walk<'v>(mut cur: &'v Value, segments: &[String]) -> Option<&'v Value> {
    for seg in segments {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Absent-equivalent values: null, blank strings, empty arrays/objects.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn sanitize(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let clean = sanitize_sentinel(&s);
            if clean.len() == s.len() {
                Value::String(s)
            } else {
                Value::String(String::new())
            }
        }
        other => other,
    }
}

/// Scalar rendering used by transforms and string columns.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        other => other.to_string(),
    }
}

impl FieldSpec {
    pub fn parse(raw: &Value) -> Result<Self, SpecError> {
        Self::parse_at(raw, "$")
    }

    fn parse_at(raw: &Value, at: &str) -> Result<Self, SpecError> {
        match raw {
            Value::Null => Ok(Self::Unset),
            Value::Bool(_) | Value::Number(_) => Ok(Self::Literal(raw.clone())),
            Value::String(s) => {
                if s.is_empty() {
                    Ok(Self::Unset)
                } else if let Some(constant) = s.strip_prefix('=') {
                    Ok(Self::Literal(Value::String(constant.to_string())))
                } else {
                    Ok(Self::Path(PathRef::parse(s)))
                }
            }
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| Self::parse_at(item, &format!("{at}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Alternatives),
            Value::Object(map) => {
                let source = if let Some(c) = map.get("const").or_else(|| map.get("value")) {
                    Self::Literal(c.clone())
                } else if let Some(p) = map.get("path") {
                    let p = p
                        .as_str()
                        .ok_or_else(|| SpecError::new(at, "`path` must be a string"))?;
                    Self::Path(PathRef::parse(p))
                } else if let Some(ps) = map.get("paths") {
                    let list = ps
                        .as_array()
                        .ok_or_else(|| SpecError::new(at, "`paths` must be an array"))?;
                    let mut alts = Vec::with_capacity(list.len());
                    for (i, p) in list.iter().enumerate() {
                        let p = p.as_str().ok_or_else(|| {
                            SpecError::new(&format!("{at}.paths[{i}]"), "path must be a string")
                        })?;
                        alts.push(Self::Path(PathRef::parse(p)));
                    }
                    Self::Alternatives(alts)
                } else {
                    return Err(SpecError::new(at, "object spec needs `const`, `value`, `path` or `paths`"));
                };

                let transforms = match map.get("transforms") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(list)) => list
                        .iter()
                        .enumerate()
                        .map(|(i, t)| Transform::parse(t, &format!("{at}.transforms[{i}]")))
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(_) => return Err(SpecError::new(at, "`transforms` must be an array")),
                };
                if transforms.is_empty() {
                    Ok(source)
                } else {
                    Ok(Self::Transformed {
                        source: Box::new(source),
                        transforms,
                    })
                }
            }
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Evaluate against a source. Never fails; `None` means "nothing usable".
    pub fn resolve(&self, src: &Source<'_>) -> Option<Value> {
        match self {
            Self::Unset => None,
            Self::Literal(v) => Some(sanitize(v.clone())),
            Self::Path(p) => src.lookup(p).cloned().map(sanitize),
            Self::Alternatives(alts) => alts
                .iter()
                .find_map(|alt| alt.resolve(src).filter(|v| !is_empty(v))),
            Self::Transformed { source, transforms } => {
                let base = source.resolve(src)?;
                let text = transforms
                    .iter()
                    .fold(render(&base), |acc, t| t.apply(acc));
                Some(sanitize(Value::String(text)))
            }
        }
    }

    /// Resolve and render as a string; blank results count as unresolved.
    pub fn resolve_string(&self, src: &Source<'_>) -> Option<String> {
        self.resolve(src)
            .map(|v| render(&v))
            .filter(|s| !s.trim().is_empty())
    }
}

impl<'de> Deserialize<'de> for FieldSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        FieldSpec::parse(&raw).map_err(de::Error::custom)
    }
}
