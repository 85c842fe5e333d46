use clickhouse_std::prelude::*;
use clickhouse_std::test_utils::{MockPacket, MockServer, init_tracing};
use clickhouse_std::Block;

pub const TRACING_DIRECTIVES: &[(&str, &str)] = &[("clickhouse_std", "debug")];

pub const SEP: &str = "\n-------------------------------\n";

/// Little helper function to print headers for tests
pub fn header(msg: impl AsRef<str>) {
    eprintln!("{SEP} {} {SEP}", msg.as_ref());
}

/// Initialize tracing and start a mock server answering with `handler`
pub fn init(handler: impl Fn(&str) -> Vec<MockPacket> + Send + Sync + 'static) -> MockServer {
    init_tracing(Some(TRACING_DIRECTIVES));
    MockServer::new(move |query| handler(&query.text))
}

pub fn str_value(s: &str) -> Value { Value::String(s.as_bytes().to_vec()) }

/// `n` rows of `(id UInt64, name String)`, ids starting at `first`.
pub fn id_name_block(first: u64, n: u64) -> Block {
    let ids = (first..first + n).map(Value::UInt64).collect();
    let names = (first..first + n).map(|i| str_value(&format!("row-{i}"))).collect();
    Block::try_from_values([("id", "UInt64", ids), ("name", "String", names)])
        .expect("valid block")
}

/// The `(id UInt64, name String)` header an insert into the test table answers with.
pub fn insert_header() -> Block {
    Block::try_from_values([("id", "UInt64", vec![]), ("name", "String", vec![])])
        .expect("valid header")
}

/// Reads every remaining row.
pub async fn collect(rows: &mut Rows<'_>) -> Vec<Vec<Value>> {
    let mut out = vec![];
    loop {
        let mut dest = vec![Value::Null; rows.columns()];
        if !rows.next(&mut dest).await.expect("next") {
            return out;
        }
        out.push(dest);
    }
}
