//! Client side parameter binding
//!
//! Placeholders are replaced with SQL literals according to the configured
//! paramstyle. Placeholders inside quoted strings, quoted identifiers and
//! comments are left alone.

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::CharIndices;

use crate::config::ParamStyle;

/// A bindable value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Render as a SQL literal
    pub fn to_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(true) => "TRUE".to_string(),
            Self::Bool(false) => "FALSE".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) if f.is_finite() => f.to_string(),
            Self::Float(f) => format!("'{}'", f),
            Self::Text(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Parameters for one query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParams {
    Positional(Vec<SqlValue>),
    Named(BTreeMap<String, SqlValue>),
}

impl QueryParams {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Self::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SqlValue>,
    {
        Self::Named(values.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Errors raised while binding parameters
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("Query has {expected} positional placeholders but {given} parameters were given")]
    CountMismatch { expected: usize, given: usize },

    #[error("Missing value for named parameter '{0}'")]
    MissingNamed(String),

    #[error("Placeholder style '{placeholder}' needs {expected} parameters")]
    WrongShape {
        placeholder: &'static str,
        expected: &'static str,
    },

    #[error("Placeholder :{0} is out of range")]
    OutOfRange(usize),

    #[error("Unterminated named placeholder at offset {0}")]
    Unterminated(usize),
}

/// Substitute `params` into `sql`; without params the text is returned as is
pub fn bind_parameters(
    sql: &str,
    params: Option<&QueryParams>,
    style: ParamStyle,
) -> Result<String, ParamError> {
    let Some(params) = params else {
        return Ok(sql.to_string());
    };

    let mut binder = Binder {
        params,
        out: String::with_capacity(sql.len()),
        next_positional: 0,
    };
    let mut chars = sql.char_indices().peekable();
    let mut skip: Option<Skip> = None;

    while let Some((offset, c)) = chars.next() {
        if let Some(region) = skip {
            binder.out.push(c);
            match (region, c) {
                // backslash escapes the next character inside string literals
                (Skip::Quoted('\''), '\\') => {
                    if let Some((_, escaped)) = chars.next() {
                        binder.out.push(escaped);
                    }
                }
                (Skip::Quoted(open), _) if c == open => skip = None,
                (Skip::LineComment, '\n') => skip = None,
                (Skip::BlockComment, '*') if chars.peek().is_some_and(|&(_, n)| n == '/') => {
                    chars.next();
                    binder.out.push('/');
                    skip = None;
                }
                _ => {}
            }
            continue;
        }

        match (style, c) {
            (_, '\'' | '"') => {
                skip = Some(Skip::Quoted(c));
                binder.out.push(c);
            }
            (_, '-') if chars.peek().is_some_and(|&(_, n)| n == '-') => {
                skip = Some(Skip::LineComment);
                binder.out.push(c);
            }
            (_, '/') if chars.peek().is_some_and(|&(_, n)| n == '*') => {
                chars.next();
                skip = Some(Skip::BlockComment);
                binder.out.push_str("/*");
            }
            (ParamStyle::Pyformat, '%') => binder.pyformat(offset, &mut chars, sql)?,
            (ParamStyle::Qmark, '?') => binder.next_positional("?")?,
            (ParamStyle::Numeric, ':') => binder.numeric(&mut chars)?,
            _ => binder.out.push(c),
        }
    }

    binder.finish()
}

/// Text copied through without looking for placeholders
#[derive(Debug, Clone, Copy)]
enum Skip {
    Quoted(char),
    LineComment,
    BlockComment,
}

struct Binder<'p> {
    params: &'p QueryParams,
    out: String,
    next_positional: usize,
}

impl<'p> Binder<'p> {
    fn positional(&self, placeholder: &'static str) -> Result<&'p [SqlValue], ParamError> {
        match self.params {
            QueryParams::Positional(values) => Ok(values),
            QueryParams::Named(_) => Err(ParamError::WrongShape {
                placeholder,
                expected: "positional",
            }),
        }
    }

    fn next_positional(&mut self, placeholder: &'static str) -> Result<(), ParamError> {
        let values = self.positional(placeholder)?;
        let index = self.next_positional;
        let value = values.get(index).ok_or(ParamError::CountMismatch {
            expected: index + 1,
            given: values.len(),
        })?;
        self.out.push_str(&value.to_literal());
        self.next_positional += 1;
        Ok(())
    }

    fn pyformat(
        &mut self,
        offset: usize,
        chars: &mut Peekable<CharIndices<'_>>,
        sql: &str,
    ) -> Result<(), ParamError> {
        match chars.peek().map(|&(_, c)| c) {
            Some('%') => {
                chars.next();
                self.out.push('%');
            }
            Some('s') => {
                chars.next();
                self.next_positional("%s")?;
            }
            Some('(') => {
                chars.next();
                let start = offset + 2;
                let mut end = None;
                for (i, c) in chars.by_ref() {
                    if c == ')' {
                        end = Some(i);
                        break;
                    }
                }
                let end = end.ok_or(ParamError::Unterminated(offset))?;
                if chars.next().map(|(_, c)| c) != Some('s') {
                    return Err(ParamError::Unterminated(offset));
                }

                let QueryParams::Named(values) = self.params else {
                    return Err(ParamError::WrongShape {
                        placeholder: "%(name)s",
                        expected: "named",
                    });
                };
                let name = &sql[start..end];
                let value = values
                    .get(name)
                    .ok_or_else(|| ParamError::MissingNamed(name.to_string()))?;
                self.out.push_str(&value.to_literal());
            }
            _ => self.out.push('%'),
        }
        Ok(())
    }

    fn numeric(&mut self, chars: &mut Peekable<CharIndices<'_>>) -> Result<(), ParamError> {
        // `::` is a cast, not a placeholder
        if let Some(&(_, ':')) = chars.peek() {
            chars.next();
            self.out.push_str("::");
            return Ok(());
        }

        let mut digits = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            digits.push(c);
            chars.next();
        }

        if digits.is_empty() {
            self.out.push(':');
            return Ok(());
        }

        let position: usize = digits
            .parse()
            .map_err(|_| ParamError::OutOfRange(usize::MAX))?;
        let values = self.positional(":N")?;
        let value = position
            .checked_sub(1)
            .and_then(|index| values.get(index))
            .ok_or(ParamError::OutOfRange(position))?;
        self.out.push_str(&value.to_literal());
        Ok(())
    }

    fn finish(self) -> Result<String, ParamError> {
        if let QueryParams::Positional(values) = self.params {
            if self.next_positional > 0 && self.next_positional != values.len() {
                return Err(ParamError::CountMismatch {
                    expected: self.next_positional,
                    given: values.len(),
                });
            }
        }
        Ok(self.out)
    }
}
