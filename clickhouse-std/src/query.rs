use std::fmt;

use uuid::Uuid;

/// An internal representation of a query id, meant to reduce costs when tracing, passing around,
/// and converting to strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Qid(Uuid);

impl Default for Qid {
    fn default() -> Self { Self::new() }
}

impl Qid {
    /// Generate a new `v4` [`Uuid`]
    pub fn new() -> Self { Self(Uuid::new_v4()) }

    /// Take the inner [`Uuid`]
    pub fn into_inner(self) -> Uuid { self.0 }
}

impl<T: Into<Qid>> From<Option<T>> for Qid {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Qid::default(),
        }
    }
}

impl From<Uuid> for Qid {
    fn from(id: Uuid) -> Self { Self(id) }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 32 char hex, as the server logs it
        write!(f, "{}", self.0.as_simple())
    }
}

/// Whether `query` is an `INSERT` statement.
pub(crate) fn is_insert(query: &str) -> bool {
    query.trim_start().get(..6).is_some_and(|head| head.eq_ignore_ascii_case("insert"))
}

/// Normalizes an insert statement so the server waits for a data block.
///
/// Statements without a `VALUES` clause or a `FORMAT` clause get ` VALUES` appended, trailing
/// semicolons are dropped.
pub(crate) fn insert_statement(query: &str) -> String {
    let query = query.trim().trim_end_matches(';').trim_end();
    let upper = query.to_ascii_uppercase();
    if upper.ends_with(" VALUES") || upper.contains(" FORMAT ") {
        query.to_string()
    } else {
        format!("{query} VALUES")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qid_display_is_simple_hex() {
        let qid = Qid::new();
        let id = qid.to_string();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(Qid::from(None::<Uuid>).to_string().len(), 32);
        assert_eq!(Qid::from(qid.into_inner()), qid);
    }

    #[test]
    fn test_insert_detection() {
        assert!(is_insert("  insert INTO t VALUES"));
        assert!(is_insert("INSERT INTO t"));
        assert!(!is_insert("SELECT 1"));
        assert!(!is_insert("ins"));
    }

    #[test]
    fn test_insert_statement_normalization() {
        assert_eq!(insert_statement("INSERT INTO t (a, b)"), "INSERT INTO t (a, b) VALUES");
        assert_eq!(insert_statement("INSERT INTO t VALUES;"), "INSERT INTO t VALUES");
        assert_eq!(insert_statement("insert into t values"), "insert into t values");
        assert_eq!(insert_statement("INSERT INTO t FORMAT Native"), "INSERT INTO t FORMAT Native");
    }
}
