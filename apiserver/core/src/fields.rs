use crate::Error;
use std::{fmt, str::FromStr};

/// Selects objects by the values of resolvable fields, e.g. `metadata.name=a,spec.nodeName!=n`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    path: String,
    operator: Operator,
    value: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
}

// === impl Selector ===

impl Selector {
    pub fn new(requirements: impl IntoIterator<Item = Requirement>) -> Self {
        Self {
            requirements: requirements.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Returns the field paths this selector refers to.
    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.requirements.iter().map(|r| r.path.as_str())
    }

    /// Evaluates the selector, resolving each field through `resolve`.
    ///
    /// A field that cannot be resolved never satisfies a requirement.
    pub fn matches<'a, F>(&self, mut resolve: F) -> bool
    where
        F: FnMut(&str) -> Option<std::borrow::Cow<'a, str>>,
    {
        self.requirements.iter().all(|r| match resolve(&r.path) {
            Some(value) => match r.operator {
                Operator::Equals => *value == r.value,
                Operator::NotEquals => *value != r.value,
            },
            None => false,
        })
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        s.split(',')
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

// === impl Requirement ===

impl Requirement {
    pub fn new(path: impl ToString, operator: Operator, value: impl ToString) -> Self {
        Self {
            path: path.to_string(),
            operator,
            value: value.to_string(),
        }
    }
}

impl FromStr for Requirement {
    type Err = Error;

    fn from_str(term: &str) -> Result<Self, Self::Err> {
        let (path, operator, value) = if let Some((p, v)) = term.split_once("!=") {
            (p, Operator::NotEquals, v)
        } else if let Some((p, v)) = term.split_once("==") {
            (p, Operator::Equals, v)
        } else if let Some((p, v)) = term.split_once('=') {
            (p, Operator::Equals, v)
        } else {
            return Err(Error::InvalidSelector(format!(
                "invalid field requirement: {term:?}"
            )));
        };

        let path = path.trim();
        if path.is_empty() || path.starts_with('.') || path.ends_with('.') {
            return Err(Error::InvalidSelector(format!(
                "invalid field path in {term:?}"
            )));
        }
        Ok(Self::new(path, operator, value.trim()))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operator {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
        };
        write!(f, "{}{}{}", self.path, op, self.value)
    }
}
