use std::fmt::Debug;

use bytes::{Buf, BytesMut};

use super::{Column, ScanType, out_of_bounds, split_args, type_args};
use crate::errors::unexpected_type;
use crate::native::sketch::DDSketch;
use crate::native::values::Value;
use crate::{Error, Result};

/// The intermediate state of an aggregate function, serialized with its own binary codec.
pub trait AggregateState: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Function names, as they appear in the column type, whose state this is.
    const FUNCTIONS: &'static [&'static str];

    /// An empty state for the function's parameters.
    ///
    /// # Errors
    /// [`Error::UnsupportedType`] when the parameters are invalid.
    fn empty(params: &[&str]) -> Result<Self>;

    /// # Errors
    /// [`Error::UnexpectedEof`] on short input.
    fn decode(reader: &mut dyn Buf) -> Result<Self>;

    fn encode(&self, writer: &mut BytesMut);

    fn into_value(self) -> Value;

    /// Extracts a state from the accepted cell shapes.
    fn from_value(value: Value) -> Option<Self>;

    fn accepts(value: &Value) -> bool;
}

impl AggregateState for DDSketch {
    const FUNCTIONS: &'static [&'static str] = &["quantileDD", "quantilesDD"];

    fn empty(params: &[&str]) -> Result<Self> {
        let accuracy = params
            .first()
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| Error::UnsupportedType(format!("quantileDD({})", params.join(", "))))?;
        DDSketch::new(accuracy)
            .map_err(|_| Error::UnsupportedType(format!("quantileDD relative accuracy {accuracy}")))
    }

    fn decode(reader: &mut dyn Buf) -> Result<Self> { DDSketch::decode(reader) }

    fn encode(&self, writer: &mut BytesMut) { DDSketch::encode(self, writer); }

    fn into_value(self) -> Value { Value::Sketch(Box::new(self)) }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Sketch(sketch) => Some(*sketch),
            _ => None,
        }
    }

    fn accepts(value: &Value) -> bool { matches!(value, Value::Sketch(_)) }
}

/// `AggregateFunction(f(params), T)`: one opaque state per row.
#[derive(Debug, Clone)]
pub struct AggregateFunction<S: AggregateState> {
    name:      String,
    type_name: String,
    empty:     S,
    data:      Vec<S>,
}

/// Column of `quantileDD` states.
pub type AggregateFunctionDD = AggregateFunction<DDSketch>;

impl<S: AggregateState> AggregateFunction<S> {
    /// # Errors
    /// See [`AggregateState::empty`].
    pub fn new(name: &str, type_name: &str, params: &[&str]) -> Result<Self> {
        Ok(Self {
            name:      name.to_string(),
            type_name: type_name.to_string(),
            empty:     S::empty(params)?,
            data:      Vec::new(),
        })
    }

    pub fn get(&self, row: usize) -> Option<&S> { self.data.get(row) }

    /// Appends states directly, skipping the cell conversion.
    pub fn append_states(&mut self, states: impl IntoIterator<Item = S>) {
        self.data.extend(states);
    }
}

impl<S: AggregateState> Column for AggregateFunction<S> {
    fn name(&self) -> &str { &self.name }

    fn declared_type(&self) -> &str { &self.type_name }

    fn rows(&self) -> usize { self.data.len() }

    fn reset(&mut self) { self.data.clear(); }

    fn scan_type(&self) -> ScanType { ScanType::of::<S>() }

    fn row(&self, row: usize, _indirect: bool) -> Result<Value> {
        self.data
            .get(row)
            .map(|state| state.clone().into_value())
            .ok_or_else(|| out_of_bounds(row, self.data.len()))
    }

    fn check_value(&self, value: &Value) -> Result<()> {
        if S::accepts(value) { Ok(()) } else { Err(unexpected_type(value.kind(), &self.type_name)) }
    }

    fn append_row(&mut self, value: Value) -> Result<()> {
        let kind = value.kind();
        let state = S::from_value(value).ok_or_else(|| unexpected_type(kind, &self.type_name))?;
        self.data.push(state);
        Ok(())
    }

    fn append_default(&mut self) { self.data.push(self.empty.clone()); }

    fn decode(&mut self, reader: &mut dyn Buf, rows: usize) -> Result<()> {
        self.data.reserve(rows);
        for _ in 0..rows {
            self.data.push(S::decode(reader)?);
        }
        Ok(())
    }

    fn encode(&self, writer: &mut BytesMut) {
        for state in &self.data {
            state.encode(writer);
        }
    }
}

/// Builds an aggregate state column from the arguments of `AggregateFunction(...)`.
pub(super) fn from_type_args(name: &str, type_name: &str, args: &str) -> Result<Box<dyn Column>> {
    let unsupported = || Error::UnsupportedType(type_name.to_string());
    let args = split_args(args);
    let function = args.first().ok_or_else(unsupported)?;
    let (function_name, params) = match function.find('(') {
        Some(i) => {
            let function_name = &function[..i];
            let params = type_args(function, function_name).ok_or_else(unsupported)?;
            (function_name, split_args(params))
        }
        None => (*function, Vec::new()),
    };

    if DDSketch::FUNCTIONS.contains(&function_name) {
        return Ok(Box::new(AggregateFunctionDD::new(name, type_name, &params)?));
    }
    Err(unsupported())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::from_type_name;

    const TYPE: &str = "AggregateFunction(quantileDD(0.01, 0.5), Float64)";

    fn sketch(values: &[f64]) -> DDSketch {
        let mut sketch = DDSketch::new(0.01).unwrap();
        values.iter().for_each(|v| sketch.add(*v));
        sketch
    }

    #[test]
    fn test_states_survive_encode_decode() {
        let states = vec![sketch(&[1.0, 2.0, 3.0]), sketch(&[]), sketch(&[-7.5, 0.0])];
        let mut column = AggregateFunctionDD::new("s", TYPE, &["0.01", "0.5"]).unwrap();
        column.append(states.iter().cloned().map(AggregateState::into_value).collect()).unwrap();

        let mut buf = BytesMut::new();
        column.encode(&mut buf);
        let mut decoded = from_type_name("s", TYPE).unwrap();
        decoded.decode(&mut &buf[..], states.len()).unwrap();

        for (i, expected) in states.iter().enumerate() {
            let mut got = DDSketch::new(0.5).unwrap();
            decoded.scan_row(&mut got, i).unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[test]
    fn test_reset_then_empty_decode_matches_fresh_column() {
        let mut column = AggregateFunctionDD::new("s", TYPE, &["0.01"]).unwrap();
        column.append_states([sketch(&[1.0])]);
        column.reset();
        column.decode(&mut &[0u8; 0][..], 0).unwrap();

        let fresh = AggregateFunctionDD::new("s", TYPE, &["0.01"]).unwrap();
        assert_eq!(column.rows(), fresh.rows());
        assert_eq!(column.declared_type(), fresh.declared_type());
        assert_eq!(column.scan_type(), fresh.scan_type());
        let (mut a, mut b) = (BytesMut::new(), BytesMut::new());
        column.encode(&mut a);
        fresh.encode(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_accepted_shapes() {
        let mut column = AggregateFunctionDD::new("s", TYPE, &["0.01"]).unwrap();
        assert!(column.append_row(Value::Float64(1.0)).is_err());
        assert!(column.append(vec![sketch(&[1.0]).into_value(), Value::Null]).is_err());
        assert_eq!(column.rows(), 0);

        column.append_row(sketch(&[2.0]).into_value()).unwrap();
        let dyn_column: &dyn Column = &column;
        let mut optional: Option<DDSketch> = None;
        dyn_column.scan_row(&mut optional, 0).unwrap();
        assert!(optional.is_some());
        let mut boxed = Box::new(sketch(&[]));
        dyn_column.scan_row(&mut boxed, 0).unwrap();
        assert!((boxed.count() - 1.0).abs() < f64::EPSILON);
        let mut wrong = 0f64;
        assert!(dyn_column.scan_row(&mut wrong, 0).is_err());
    }

    #[test]
    fn test_function_parsing() {
        assert!(from_type_name("s", "AggregateFunction(quantilesDD(0.001, 0.5, 0.9), Int64)").is_ok());
        assert!(matches!(
            from_type_name("s", "AggregateFunction(quantileDD(2), Float64)"),
            Err(Error::UnsupportedType(_))
        ));
        assert!(matches!(
            from_type_name("s", "AggregateFunction(uniq, UInt64)"),
            Err(Error::UnsupportedType(_))
        ));
    }
}
