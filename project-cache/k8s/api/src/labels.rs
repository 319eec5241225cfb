use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of namespaces by their labels.
///
/// The default selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector contains an empty requirement")]
    EmptyRequirement,

    #[error("invalid label key {0:?}")]
    InvalidKey(String),

    #[error("invalid label value {0:?}")]
    InvalidValue(String),

    #[error("selector has unbalanced parentheses")]
    Unbalanced,

    #[error("unable to parse requirement {0:?}")]
    InvalidRequirement(String),
}

// === Selector ===

impl Selector {
    /// A selector that matches all label sets.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn is_everything(&self) -> bool {
        self.match_labels.iter().all(|m| m.is_empty())
            && self.match_expressions.iter().all(|e| e.is_empty())
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

/// Parses the string form of a label selector, e.g. `env=prod,tier in (web,api),!legacy`.
///
/// An empty string selects everything.
impl std::str::FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::everything());
        }

        split_requirements(s)?
            .into_iter()
            .map(Expression::parse)
            .collect::<Result<Expressions, _>>()
            .map(Self::from_expressions)
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

/// Splits a selector on commas that are not enclosed in a value set.
fn split_requirements(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut reqs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or(SelectorError::Unbalanced)?,
            ',' if depth == 0 => {
                reqs.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced);
    }
    reqs.push(&s[start..]);
    Ok(reqs)
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => match labels.get(&self.key) {
                Some(v) => self.values.contains(v),
                None => false,
            },
            Operator::NotIn => match labels.get(&self.key) {
                Some(v) => !self.values.contains(v),
                None => true,
            },
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }

    fn parse(req: &str) -> Result<Self, SelectorError> {
        let req = req.trim();
        if req.is_empty() {
            return Err(SelectorError::EmptyRequirement);
        }

        if let Some(key) = req.strip_prefix('!') {
            let key = validate_key(key.trim())?;
            return Ok(Self::new(key, Operator::DoesNotExist, None::<String>));
        }

        if let Some((key, value)) = req.split_once("!=") {
            let key = validate_key(key.trim())?;
            let value = validate_value(value.trim())?;
            return Ok(Self::new(key, Operator::NotIn, Some(value)));
        }

        if let Some((key, value)) = req.split_once('=') {
            // Handles both `=` and `==`.
            let value = value.strip_prefix('=').unwrap_or(value);
            let key = validate_key(key.trim())?;
            let value = validate_value(value.trim())?;
            return Ok(Self::new(key, Operator::In, Some(value)));
        }

        let Some((key, rest)) = req.split_once(char::is_whitespace) else {
            let key = validate_key(req)?;
            return Ok(Self::new(key, Operator::Exists, None::<String>));
        };

        let key = validate_key(key.trim())?;
        let rest = rest.trim_start();
        let (operator, set) = if let Some(set) = rest.strip_prefix("notin") {
            (Operator::NotIn, set)
        } else if let Some(set) = rest.strip_prefix("in") {
            (Operator::In, set)
        } else {
            return Err(SelectorError::InvalidRequirement(req.to_string()));
        };

        let values = set
            .trim()
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| SelectorError::InvalidRequirement(req.to_string()))?;
        let values = values
            .split(',')
            .map(|v| match v.trim() {
                "" => Err(SelectorError::InvalidValue(String::new())),
                v => validate_value(v),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(key, operator, values))
    }
}

fn validate_key(key: &str) -> Result<&str, SelectorError> {
    let valid = !key.is_empty()
        && key.len() <= 317
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(key)
    } else {
        Err(SelectorError::InvalidKey(key.to_string()))
    }
}

fn validate_value(value: &str) -> Result<&str, SelectorError> {
    let valid = value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(value)
    } else {
        Err(SelectorError::InvalidValue(value.to_string()))
    }
}
