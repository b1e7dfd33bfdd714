use crate::Error;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects objects by their labels. Every requirement must hold.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

// === Selector ===

impl Selector {
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

    /// Returns true if the selector has no requirements, i.e. it selects everything.
    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().map_or(true, Map::is_empty)
            && self.match_expressions.as_ref().map_or(true, Vec::is_empty)
    }

    pub fn matches(&self, labels: &Map) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

/// Parses the label selector query syntax, e.g. `app=web,tier!=db,env in (a,b),!legacy`.
impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut exprs = Expressions::new();
        for term in split_terms(s)? {
            exprs.push(term.parse()?);
        }
        Ok(Self::from_expressions(exprs))
    }
}

impl TryFrom<&metav1::LabelSelector> for Selector {
    type Error = Error;

    fn try_from(sel: &metav1::LabelSelector) -> Result<Self, Self::Error> {
        let match_expressions = sel
            .match_expressions
            .iter()
            .flatten()
            .map(Expression::try_from)
            .collect::<Result<Expressions, _>>()?;
        Ok(Self {
            match_labels: sel.match_labels.clone(),
            match_expressions: Some(match_expressions),
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            if !std::mem::take(&mut first) {
                f.write_str(",")?;
            }
            Ok(())
        };
        for (k, v) in self.match_labels.iter().flatten() {
            sep(f)?;
            write!(f, "{k}={v}")?;
        }
        for expr in self.match_expressions.iter().flatten() {
            sep(f)?;
            write!(f, "{expr}")?;
        }
        Ok(())
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

// === Expression ===

impl Expression {
    pub fn new(
        key: impl ToString,
        operator: Operator,
        values: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.into_iter().map(|v| v.to_string()).collect(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map_or(false, |v| self.values.contains(v)),
            Operator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl FromStr for Expression {
    type Err = Error;

    fn from_str(term: &str) -> Result<Self, Self::Err> {
        let term = term.trim();
        let invalid = || Error::InvalidSelector(format!("invalid label requirement: {term:?}"));

        if let Some(key) = term.strip_prefix('!') {
            let key = valid_token(key.trim()).ok_or_else(invalid)?;
            return Ok(Self::new(key, Operator::DoesNotExist, None::<&str>));
        }

        if let Some(open) = term.find('(') {
            let list = term[open + 1..].strip_suffix(')').ok_or_else(invalid)?;
            let mut head = term[..open].split_whitespace();
            let key = head.next().and_then(valid_token).ok_or_else(invalid)?;
            let operator = match head.next() {
                Some("in") => Operator::In,
                Some("notin") => Operator::NotIn,
                _ => return Err(invalid()),
            };
            if head.next().is_some() {
                return Err(invalid());
            }
            let values = list
                .split(',')
                .map(|v| valid_value(v.trim()).ok_or_else(invalid))
                .collect::<Result<BTreeSet<_>, _>>()?;
            return Ok(Self {
                key: key.to_string(),
                operator,
                values: values.into_iter().map(String::from).collect(),
            });
        }

        let (key, operator, value) = if let Some((k, v)) = term.split_once("!=") {
            (k, Operator::NotIn, v)
        } else if let Some((k, v)) = term.split_once("==") {
            (k, Operator::In, v)
        } else if let Some((k, v)) = term.split_once('=') {
            (k, Operator::In, v)
        } else {
            let key = valid_token(term).ok_or_else(invalid)?;
            return Ok(Self::new(key, Operator::Exists, None::<&str>));
        };
        let key = valid_token(key.trim()).ok_or_else(invalid)?;
        let value = valid_value(value.trim()).ok_or_else(invalid)?;
        Ok(Self::new(key, operator, Some(value)))
    }
}

impl TryFrom<&metav1::LabelSelectorRequirement> for Expression {
    type Error = Error;

    fn try_from(req: &metav1::LabelSelectorRequirement) -> Result<Self, Self::Error> {
        let operator = match req.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            op => {
                return Err(Error::InvalidSelector(format!(
                    "unsupported operator {op:?} for key {:?}",
                    req.key
                )))
            }
        };
        Ok(Self::new(&req.key, operator, req.values.iter().flatten()))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In => write!(f, "{} in ({})", self.key, values()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Splits a selector on the commas that are not inside a value list.
fn split_terms(s: &str) -> Result<Vec<&str>, Error> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    Error::InvalidSelector(format!("unbalanced parentheses in {s:?}"))
                })?
            }
            ',' if depth == 0 => {
                terms.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::InvalidSelector(format!(
            "unbalanced parentheses in {s:?}"
        )));
    }
    terms.push(&s[start..]);

    // An empty selector selects everything.
    if terms.len() == 1 && terms[0].trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(terms)
}

fn valid_token(s: &str) -> Option<&str> {
    let ok = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    ok.then_some(s)
}

fn valid_value(s: &str) -> Option<&str> {
    if s.is_empty() {
        return Some(s);
    }
    valid_token(s)
}
