//! Client-side parameter binding.
//!
//! Parameters are formatted as SQL literals and spliced into the query text before it is sent.
//! Positional parameters replace `?` markers in order, named parameters replace `@name` markers.
//! Markers inside quoted literals, quoted identifiers and comments are left alone.
use crate::native::convert::ToRow;
use crate::native::values::Value;
use crate::{Error, Result};

/// A single query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Positional(Value),
    Named(String, Value),
}

impl Param {
    pub fn value(&self) -> &Value {
        match self {
            Param::Positional(value) | Param::Named(_, value) => value,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Param::Positional(_) => None,
            Param::Named(name, _) => Some(name),
        }
    }
}

/// The parameters of one query, either all positional or all named.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(pub Vec<Param>);

impl Params {
    /// Positional parameters from any row shaped value, such as a tuple.
    ///
    /// # Errors
    /// Fails when a field cannot be converted into a cell.
    pub fn from_row(row: impl ToRow) -> Result<Self> {
        Ok(row.to_row()?.into())
    }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &Param> { self.0.iter() }

    /// Splices the parameters into `query`.
    ///
    /// # Errors
    /// [`Error::Bind`] when named and positional parameters are mixed, when the number of `?`
    /// markers differs from the number of parameters, when a named marker has no parameter, or
    /// when a value has no literal form.
    pub fn bind(&self, query: &str) -> Result<String> {
        if self.0.is_empty() {
            return Ok(query.to_string());
        }

        let named = self.0.iter().filter(|p| p.name().is_some()).count();
        match named {
            0 => bind_positional(query, &self.0),
            n if n == self.0.len() => bind_named(query, &self.0),
            _ => Err(Error::Bind("mixed named and positional parameters".into())),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self { Params(values.into_iter().map(Param::Positional).collect()) }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Params(iter.into_iter().map(|(k, v)| Param::Named(k.into(), v)).collect())
    }
}

/// Formats a cell as a SQL literal.
///
/// # Errors
/// [`Error::Bind`] for aggregate states, which have no literal form.
pub fn format_value(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => u8::from(*b).to_string(),
        Value::Float32(f) => format_float(f64::from(*f)),
        Value::Float64(f) => format_float(*f),
        Value::String(s) => quote(s),
        Value::Sketch(_) => return Err(Error::Bind("aggregate states cannot be bound".into())),
        other => other.to_string(),
    })
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f.is_sign_positive() { "inf".into() } else { "-inf".into() }
    } else {
        f.to_string()
    }
}

fn quote(bytes: &[u8]) -> String {
    let raw = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('\'');
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// A piece of query text as seen by the marker scanner.
enum Token<'a> {
    Text(&'a str),
    Positional,
    Named(&'a str),
}

/// Splits `query` into literal text and parameter markers.
fn tokenize(query: &str) -> Vec<Token<'_>> {
    let bytes = query.as_bytes();
    let mut tokens = Vec::new();
    let (mut i, mut start) = (0, 0);

    let skip_quoted = |mut i: usize, quote: u8| {
        i += 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b if b == quote => return i + 1,
                _ => i += 1,
            }
        }
        bytes.len()
    };

    while i < bytes.len() {
        match bytes[i] {
            q @ (b'\'' | b'"' | b'`') => i = skip_quoted(i, q),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = query[i..].find('\n').map_or(bytes.len(), |n| i + n);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = query[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
            }
            b'?' => {
                tokens.push(Token::Text(&query[start..i]));
                tokens.push(Token::Positional);
                i += 1;
                start = i;
            }
            b'@' => {
                let len = bytes[i + 1..]
                    .iter()
                    .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                    .count();
                if len == 0 {
                    i += 1;
                    continue;
                }
                tokens.push(Token::Text(&query[start..i]));
                tokens.push(Token::Named(&query[i + 1..i + 1 + len]));
                i += 1 + len;
                start = i;
            }
            _ => i += 1,
        }
    }
    tokens.push(Token::Text(&query[start.min(bytes.len())..]));
    tokens
}

fn bind_positional(query: &str, params: &[Param]) -> Result<String> {
    let tokens = tokenize(query);
    let markers = tokens.iter().filter(|t| matches!(t, Token::Positional)).count();
    if markers != params.len() {
        return Err(Error::Bind(format!("have {} arguments, want {markers}", params.len())));
    }

    let mut params = params.iter();
    let mut out = String::with_capacity(query.len());
    for token in tokens {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Named(name) => {
                out.push('@');
                out.push_str(name);
            }
            Token::Positional => {
                let param = params.next().ok_or_else(|| Error::Bind("missing argument".into()))?;
                out.push_str(&format_value(param.value())?);
            }
        }
    }
    Ok(out)
}

fn bind_named(query: &str, params: &[Param]) -> Result<String> {
    let mut out = String::with_capacity(query.len());
    for token in tokenize(query) {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Positional => out.push('?'),
            Token::Named(name) => {
                let param = params
                    .iter()
                    .find(|p| p.name() == Some(name))
                    .ok_or_else(|| Error::Bind(format!("missing named argument @{name}")))?;
                out.push_str(&format_value(param.value())?);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::values::Decimal;

    #[test]
    fn test_positional_binding() {
        let params = Params::from(vec![Value::Int32(1), Value::String(b"it's".to_vec())]);
        assert_eq!(
            params.bind("SELECT * FROM t WHERE a = ? AND b = ?").unwrap(),
            "SELECT * FROM t WHERE a = 1 AND b = 'it\\'s'"
        );
    }

    #[test]
    fn test_markers_in_literals_are_ignored() {
        let params = Params::from(vec![Value::UInt8(5)]);
        assert_eq!(
            params.bind("SELECT '?', `a?`, ? -- trailing ?\n").unwrap(),
            "SELECT '?', `a?`, 5 -- trailing ?\n"
        );
        assert_eq!(params.bind("SELECT /* ? */ ?").unwrap(), "SELECT /* ? */ 5");
    }

    #[test]
    fn test_arity_errors() {
        let params = Params::from(vec![Value::Int8(1)]);
        assert!(matches!(params.bind("SELECT ?, ?"), Err(Error::Bind(_))));
        assert!(matches!(params.bind("SELECT 1"), Err(Error::Bind(_))));
    }

    #[test]
    fn test_named_binding() {
        let params: Params = [("id", Value::UInt64(7)), ("price", Value::Decimal(Decimal::new(1999, 2)))]
            .into_iter()
            .collect();
        assert_eq!(
            params.bind("SELECT @price, @id, @id, 'x@y.z'").unwrap(),
            "SELECT 19.99, 7, 7, 'x@y.z'"
        );
        assert!(matches!(params.bind("SELECT @missing"), Err(Error::Bind(_))));
    }

    #[test]
    fn test_mixed_rejected() {
        let params = Params(vec![
            Param::Positional(Value::Int8(1)),
            Param::Named("a".into(), Value::Int8(2)),
        ]);
        assert!(matches!(params.bind("SELECT ?, @a"), Err(Error::Bind(_))));
    }

    #[test]
    fn test_literals() {
        assert_eq!(format_value(&Value::Null).unwrap(), "NULL");
        assert_eq!(format_value(&Value::Bool(true)).unwrap(), "1");
        assert_eq!(format_value(&Value::Float64(f64::NEG_INFINITY)).unwrap(), "-inf");
        assert_eq!(format_value(&Value::String(b"a\\b\n".to_vec())).unwrap(), "'a\\\\b\\n'");
        assert_eq!(Params::from_row((1_i32, "x")).unwrap().len(), 2);
        assert!(Params::default().bind("SELECT ?").is_ok());
    }
}
