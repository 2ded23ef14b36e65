//! Parameter templates.
//!
//! A template string is parsed once into segments: literal text, seed
//! variables (`$org`, `$lat`, ...) and step references. Step references are
//! written `$ref.key.field` in bundle documents and `{key.field}` by planners;
//! both parse to the same [`Segment::StepRef`], whose `raw` text is always the
//! normalized `{key.field}` form.

use indexmap::IndexMap;
use serde_json::{Number, Value};

/// Read access to what a template may reference.
pub trait ReferenceScope {
    fn seed(&self, name: &str) -> Option<&Value>;
    fn result(&self, key: &str) -> Option<&Value>;
}

/// Scope with no seeds and no results; every reference stays unresolved.
pub struct EmptyScope;

impl ReferenceScope for EmptyScope {
    fn seed(&self, _name: &str) -> Option<&Value> {
        None
    }

    fn result(&self, _key: &str) -> Option<&Value> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    ContextVar { name: String },
    StepRef { key: String, path: Vec<String> },
}

impl Segment {
    fn raw(&self) -> String {
        match self {
            Segment::Literal(text) => text.clone(),
            Segment::ContextVar { name } => format!("${name}"),
            Segment::StepRef { key, path } => {
                let mut raw = format!("{{{key}");
                for part in path {
                    raw.push('.');
                    raw.push_str(part);
                }
                raw.push('}');
                raw
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(input: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = input;

        while let Some(ch) = rest.chars().next() {
            let parsed = match ch {
                '$' => parse_dollar(&rest[1..]).map(|(seg, used)| (seg, used + 1)),
                '{' => parse_brace(rest),
                _ => None,
            };
            match parsed {
                Some((segment, used)) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                    rest = &rest[used..];
                }
                None => {
                    literal.push(ch);
                    rest = &rest[ch.len_utf8()..];
                }
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True when the template has no seed variables or step references.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Normalized source text: `$ref.a.b` is written back as `{a.b}`.
    pub fn raw(&self) -> String {
        self.segments.iter().map(Segment::raw).collect()
    }

    /// Replaces seed variables present in `seeds`; everything else is kept.
    /// A null seed counts as absent, the same as in [`Template::render`].
    pub fn bind_seeds(&self, seeds: &IndexMap<String, Value>) -> Template {
        let mut segments: Vec<Segment> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let bound = match segment {
                Segment::ContextVar { name } => match seeds.get(name).filter(|v| !v.is_null()) {
                    Some(value) => Segment::Literal(scalar_text(value)),
                    None => segment.clone(),
                },
                other => other.clone(),
            };
            if let (Segment::Literal(next), Some(Segment::Literal(prev))) =
                (&bound, segments.last_mut())
            {
                prev.push_str(next);
            } else {
                segments.push(bound);
            }
        }
        Template { segments }
    }

    /// Evaluates the template. A template consisting of one reference yields
    /// the referenced value itself; otherwise segments are concatenated.
    /// Numeric-looking results are coerced to numbers.
    pub fn render(&self, scope: &dyn ReferenceScope) -> Value {
        if let [single] = self.segments.as_slice()
            && !matches!(single, Segment::Literal(_))
        {
            return match resolve_segment(single, scope) {
                Some(Value::String(text)) => coerce_numeric(text.clone()),
                Some(value) => value.clone(),
                None => Value::String(single.raw()),
            };
        }

        let mut out = String::new();
        for segment in &self.segments {
            match resolve_segment(segment, scope) {
                Some(value) => out.push_str(&scalar_text(value)),
                None => out.push_str(&segment.raw()),
            }
        }
        coerce_numeric(out)
    }
}

fn resolve_segment<'a>(segment: &Segment, scope: &'a dyn ReferenceScope) -> Option<&'a Value> {
    match segment {
        Segment::Literal(_) => None,
        Segment::ContextVar { name } => scope.seed(name).filter(|v| !v.is_null()),
        Segment::StepRef { key, path } => {
            let mut current = scope.result(key)?;
            for part in path {
                if let Value::Array(items) = current {
                    current = items.first()?;
                }
                current = current.as_object()?.get(part)?;
            }
            (!current.is_null()).then_some(current)
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn take_ident(s: &str) -> Option<&str> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if is_ident_start(c) => {}
        _ => return None,
    }
    let end = chars
        .find(|&(_, c)| !is_ident_char(c))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    Some(&s[..end])
}

/// Dotted identifier path (`a.b.c`). A trailing dot is not consumed.
fn take_path(s: &str) -> Option<(Vec<String>, usize)> {
    let first = take_ident(s)?;
    let mut parts = vec![first.to_string()];
    let mut used = first.len();
    while s[used..].starts_with('.') {
        match take_ident(&s[used + 1..]) {
            Some(part) => {
                parts.push(part.to_string());
                used += 1 + part.len();
            }
            None => break,
        }
    }
    Some((parts, used))
}

fn parse_dollar(s: &str) -> Option<(Segment, usize)> {
    if let Some(after) = s.strip_prefix("ref.")
        && let Some((mut parts, used)) = take_path(after)
    {
        let key = parts.remove(0);
        return Some((Segment::StepRef { key, path: parts }, 4 + used));
    }
    let name = take_ident(s)?;
    Some((
        Segment::ContextVar {
            name: name.to_string(),
        },
        name.len(),
    ))
}

fn parse_brace(s: &str) -> Option<(Segment, usize)> {
    let (mut parts, used) = take_path(&s[1..])?;
    if !s[1 + used..].starts_with('}') {
        return None;
    }
    let key = parts.remove(0);
    Some((Segment::StepRef { key, path: parts }, used + 2))
}

/// Text form of a value when spliced into a larger string.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Converts a whole string of the form `-?\d+(\.\d+)?` into a JSON number.
/// Integers with a leading zero (`"007"`) and integers beyond `i64` stay text.
pub fn coerce_numeric(text: String) -> Value {
    let digits = text.strip_prefix('-').unwrap_or(&text);
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || frac_part.is_some_and(|f| !all_digits(f)) {
        return Value::String(text);
    }

    match frac_part {
        None => {
            if int_part.len() > 1 && int_part.starts_with('0') {
                return Value::String(text);
            }
            match text.parse::<i64>() {
                Ok(n) => Value::Number(n.into()),
                Err(_) => Value::String(text),
            }
        }
        Some(_) => match text.parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(text),
        },
    }
}

/// Parameter tree with every string parsed into a [`Template`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(Number),
    Text(Template),
    List(Vec<ParamValue>),
    Map(IndexMap<String, ParamValue>),
}

impl ParamValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ParamValue::Null,
            Value::Bool(b) => ParamValue::Bool(*b),
            Value::Number(n) => ParamValue::Number(n.clone()),
            Value::String(s) => ParamValue::Text(Template::parse(s)),
            Value::Array(items) => ParamValue::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => ParamValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn bind_seeds(&self, seeds: &IndexMap<String, Value>) -> Self {
        match self {
            ParamValue::Text(t) => ParamValue::Text(t.bind_seeds(seeds)),
            ParamValue::List(items) => {
                ParamValue::List(items.iter().map(|v| v.bind_seeds(seeds)).collect())
            }
            ParamValue::Map(map) => ParamValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.bind_seeds(seeds)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Pure evaluation against `scope`; unresolved references keep their text.
    pub fn substitute(&self, scope: &dyn ReferenceScope) -> Value {
        match self {
            ParamValue::Null => Value::Null,
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Number(n) => Value::Number(n.clone()),
            ParamValue::Text(t) => t.render(scope),
            ParamValue::List(items) => {
                Value::Array(items.iter().map(|v| v.substitute(scope)).collect())
            }
            ParamValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.substitute(scope)))
                    .collect(),
            ),
        }
    }

    /// Source form with references normalized, without evaluating anything.
    pub fn to_raw_json(&self) -> Value {
        match self {
            ParamValue::Text(t) => Value::String(t.raw()),
            ParamValue::List(items) => Value::Array(items.iter().map(Self::to_raw_json).collect()),
            ParamValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_raw_json()))
                    .collect(),
            ),
            other => other.substitute(&EmptyScope),
        }
    }
}
