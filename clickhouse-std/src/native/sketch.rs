//! A `DDSketch` quantile sketch, the intermediate state of `ClickHouse`'s `quantileDD`.
//!
//! The sketch maps positive and negative values onto logarithmically sized buckets so that any
//! quantile is answered within the configured relative accuracy. The binary layout matches the
//! server's `AggregateFunction(quantileDD, ...)` state serialization:
//!
//! ```text
//! 0x02 gamma:f64 index_offset:f64            index mapping
//! 0x01 store                                 positive values
//! 0x03 store                                 negative values
//! 0x04 zero_count:f64
//!
//! store := 0x0C num_bins:var_uint min_index:var_int index_delta:var_int counts:f64*num_bins
//! ```
use bytes::{BufMut, BytesMut};

use crate::io::{ClickHouseBytesRead, ClickHouseBytesWrite};
use crate::{Error, Result};

const FLAG_INDEX_MAPPING_BASE_LOGARITHMIC: u8 = 0x02;
const FLAG_POSITIVE_STORE: u8 = 0x01;
const FLAG_NEGATIVE_STORE: u8 = 0x03;
const FLAG_ZERO_COUNT: u8 = 0x04;
const BIN_ENCODING_CONTIGUOUS_COUNTS: u8 = 3 << 2;

/// Guards against hostile bin counts while decoding.
const MAX_BINS: u64 = 1 << 24;

/// Maps values to bucket indexes with `index = ceil(ln(v) / ln(gamma)) + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogarithmicMapping {
    gamma:        f64,
    index_offset: f64,
    multiplier:   f64,
}

impl LogarithmicMapping {
    /// # Errors
    /// Fails unless `0 < relative_accuracy < 1`.
    pub fn new(relative_accuracy: f64) -> Result<Self> {
        if !(relative_accuracy > 0.0 && relative_accuracy < 1.0) {
            return Err(Error::Usage("relative accuracy must be between 0 and 1"));
        }
        let gamma = (1.0 + relative_accuracy) / (1.0 - relative_accuracy);
        Self::with_gamma(gamma, 0.0)
    }

    fn with_gamma(gamma: f64, index_offset: f64) -> Result<Self> {
        if !(gamma > 1.0) || !gamma.is_finite() || !index_offset.is_finite() {
            return Err(Error::Protocol(format!("invalid sketch mapping gamma {gamma}")));
        }
        Ok(Self { gamma, index_offset, multiplier: 1.0 / gamma.ln() })
    }

    pub fn gamma(&self) -> f64 { self.gamma }

    pub fn relative_accuracy(&self) -> f64 { (self.gamma - 1.0) / (self.gamma + 1.0) }

    /// Bucket of a positive `value`, `None` when it falls outside the `i32` index range.
    #[expect(clippy::cast_possible_truncation)]
    fn index(&self, value: f64) -> Option<i32> {
        let index = (value.ln() * self.multiplier).ceil() + self.index_offset;
        (index.is_finite() && index >= f64::from(i32::MIN) && index <= f64::from(i32::MAX))
            .then_some(index as i32)
    }

    fn value(&self, index: i32) -> f64 {
        ((f64::from(index) - self.index_offset) / self.multiplier).exp() * 2.0 / (1.0 + self.gamma)
    }

    /// Smallest magnitude that gets its own bucket; anything below counts as zero.
    fn min_indexable(&self) -> f64 { f64::MIN_POSITIVE * self.gamma }

    /// Largest magnitude whose bucket value stays finite.
    fn max_indexable(&self) -> f64 { f64::MAX / self.gamma }
}

/// Contiguous bucket counts starting at `min_index`.
#[derive(Debug, Clone, Default, PartialEq)]
struct DenseStore {
    bins:      Vec<f64>,
    min_index: i32,
}

impl DenseStore {
    fn is_empty(&self) -> bool { self.bins.is_empty() }

    fn count(&self) -> f64 { self.bins.iter().sum() }

    #[expect(clippy::cast_possible_wrap)]
    fn max_index(&self) -> i64 { i64::from(self.min_index) + self.bins.len() as i64 - 1 }

    #[expect(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn add(&mut self, index: i32, count: f64) {
        if self.bins.is_empty() {
            self.bins.push(count);
            self.min_index = index;
            return;
        }
        let wide = i64::from(index);
        if index < self.min_index {
            let grow = (i64::from(self.min_index) - wide) as usize;
            let _ = self.bins.splice(0..0, std::iter::repeat_n(0.0, grow));
            self.min_index = index;
        } else if wide > self.max_index() {
            let grow = (wide - self.max_index()) as usize;
            self.bins.extend(std::iter::repeat_n(0.0, grow));
        }
        self.bins[(wide - i64::from(self.min_index)) as usize] += count;
    }

    fn merge(&mut self, other: &DenseStore) {
        for (index, count) in other.iter() {
            self.add(index, count);
        }
    }

    #[expect(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    fn iter(&self) -> impl DoubleEndedIterator<Item = (i32, f64)> + '_ {
        self.bins
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0.0)
            .map(|(i, c)| (self.min_index + i as i32, *c))
    }

    fn encode(&self, writer: &mut BytesMut) {
        writer.put_u8(BIN_ENCODING_CONTIGUOUS_COUNTS);
        writer.put_var_uint(self.bins.len() as u64);
        writer.put_var_int(i64::from(self.min_index));
        writer.put_var_int(1);
        for count in &self.bins {
            writer.put_f64_le(*count);
        }
    }

    fn decode(reader: &mut dyn bytes::Buf) -> Result<Self> {
        let encoding = reader.try_read_u8()?;
        if encoding != BIN_ENCODING_CONTIGUOUS_COUNTS {
            return Err(Error::Protocol(format!("unsupported sketch bin encoding {encoding:#x}")));
        }
        let num_bins = reader.try_get_var_uint()?;
        if num_bins > MAX_BINS {
            return Err(Error::Protocol(format!("sketch bin count too large: {num_bins}")));
        }
        let min_index = i32::try_from(reader.try_get_var_int()?)
            .map_err(|_| Error::Protocol("sketch index out of range".into()))?;
        let delta = reader.try_get_var_int()?;
        if delta != 1 {
            return Err(Error::Protocol(format!("unsupported sketch index delta {delta}")));
        }
        #[expect(clippy::cast_possible_wrap)]
        let max_index = i64::from(min_index) + num_bins as i64 - 1;
        if max_index > i64::from(i32::MAX) {
            return Err(Error::Protocol("sketch index out of range".into()));
        }
        #[expect(clippy::cast_possible_truncation)]
        let mut bins = Vec::with_capacity(num_bins as usize);
        for _ in 0..num_bins {
            bins.push(reader.try_read_f64_le()?);
        }
        Ok(Self { bins, min_index })
    }
}

/// A `DDSketch`: relative-error quantile sketch with dense positive and negative stores.
#[derive(Debug, Clone, PartialEq)]
pub struct DDSketch {
    mapping:    LogarithmicMapping,
    positive:   DenseStore,
    negative:   DenseStore,
    zero_count: f64,
}

impl DDSketch {
    /// Creates an empty sketch answering quantiles within `relative_accuracy`.
    ///
    /// # Errors
    /// Fails unless `0 < relative_accuracy < 1`.
    pub fn new(relative_accuracy: f64) -> Result<Self> {
        Ok(Self::with_mapping(LogarithmicMapping::new(relative_accuracy)?))
    }

    pub(crate) fn with_mapping(mapping: LogarithmicMapping) -> Self {
        Self {
            mapping,
            positive: DenseStore::default(),
            negative: DenseStore::default(),
            zero_count: 0.0,
        }
    }

    pub fn mapping(&self) -> &LogarithmicMapping { &self.mapping }

    pub fn relative_accuracy(&self) -> f64 { self.mapping.relative_accuracy() }

    /// Records one occurrence of `value`. `NaN`, infinities and magnitudes too large to bucket
    /// are ignored.
    pub fn add(&mut self, value: f64) { self.add_with_count(value, 1.0); }

    pub fn add_with_count(&mut self, value: f64, count: f64) {
        if !value.is_finite() || value.abs() > self.mapping.max_indexable() || !(count > 0.0) {
            return;
        }
        let min = self.mapping.min_indexable();
        if value > min {
            if let Some(index) = self.mapping.index(value) {
                self.positive.add(index, count);
            }
        } else if value < -min {
            if let Some(index) = self.mapping.index(-value) {
                self.negative.add(index, count);
            }
        } else {
            self.zero_count += count;
        }
    }

    /// Total weight recorded.
    pub fn count(&self) -> f64 { self.negative.count() + self.zero_count + self.positive.count() }

    pub fn is_empty(&self) -> bool {
        self.zero_count == 0.0 && self.positive.is_empty() && self.negative.is_empty()
    }

    /// Estimates the `q`-quantile. Returns `None` for an empty sketch or `q` outside `[0, 1]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if !(0.0..=1.0).contains(&q) || self.is_empty() {
            return None;
        }
        let rank = q * (self.count() - 1.0);

        let mut seen = 0.0;
        for (index, count) in self.negative.iter().rev() {
            seen += count;
            if seen > rank {
                return Some(-self.mapping.value(index));
            }
        }
        seen += self.zero_count;
        if seen > rank {
            return Some(0.0);
        }
        for (index, count) in self.positive.iter() {
            seen += count;
            if seen > rank {
                return Some(self.mapping.value(index));
            }
        }
        self.positive.iter().next_back().map(|(index, _)| self.mapping.value(index))
    }

    /// Folds `other` into `self`.
    ///
    /// # Errors
    /// Both sketches must share the same index mapping.
    pub fn merge(&mut self, other: &DDSketch) -> Result<()> {
        if self.mapping != other.mapping {
            return Err(Error::Usage("cannot merge sketches with different index mappings"));
        }
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
        self.zero_count += other.zero_count;
        Ok(())
    }

    /// Writes the state in the server's binary layout.
    pub fn encode(&self, writer: &mut BytesMut) {
        writer.put_u8(FLAG_INDEX_MAPPING_BASE_LOGARITHMIC);
        writer.put_f64_le(self.mapping.gamma);
        writer.put_f64_le(self.mapping.index_offset);
        writer.put_u8(FLAG_POSITIVE_STORE);
        self.positive.encode(writer);
        writer.put_u8(FLAG_NEGATIVE_STORE);
        self.negative.encode(writer);
        writer.put_u8(FLAG_ZERO_COUNT);
        writer.put_f64_le(self.zero_count);
    }

    /// Reads one state. The mapping section must come first; the remaining sections may appear in
    /// any order and are all required.
    ///
    /// # Errors
    /// [`Error::UnexpectedEof`] on short input, [`Error::Protocol`] on malformed input.
    pub fn decode(reader: &mut dyn bytes::Buf) -> Result<Self> {
        let flag = reader.try_read_u8()?;
        if flag != FLAG_INDEX_MAPPING_BASE_LOGARITHMIC {
            return Err(Error::Protocol(format!("expected sketch index mapping, got {flag:#x}")));
        }
        let gamma = reader.try_read_f64_le()?;
        let index_offset = reader.try_read_f64_le()?;
        let mut sketch = Self::with_mapping(LogarithmicMapping::with_gamma(gamma, index_offset)?);

        let (mut positive, mut negative, mut zero) = (false, false, false);
        while !(positive && negative && zero) {
            match reader.try_read_u8()? {
                FLAG_POSITIVE_STORE if !positive => {
                    sketch.positive = DenseStore::decode(reader)?;
                    positive = true;
                }
                FLAG_NEGATIVE_STORE if !negative => {
                    sketch.negative = DenseStore::decode(reader)?;
                    negative = true;
                }
                FLAG_ZERO_COUNT if !zero => {
                    sketch.zero_count = reader.try_read_f64_le()?;
                    zero = true;
                }
                flag => {
                    return Err(Error::Protocol(format!("unexpected sketch flag {flag:#x}")));
                }
            }
        }
        Ok(sketch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch_of(values: impl IntoIterator<Item = f64>) -> DDSketch {
        let mut sketch = DDSketch::new(0.01).unwrap();
        for v in values {
            sketch.add(v);
        }
        sketch
    }

    #[test]
    fn test_quantiles_within_relative_accuracy() {
        let sketch = sketch_of((1..=1000).map(f64::from));
        assert!((sketch.count() - 1000.0).abs() < f64::EPSILON);
        for (q, expected) in [(0.0, 1.0), (0.5, 500.0), (0.99, 990.0), (1.0, 1000.0)] {
            let got = sketch.quantile(q).unwrap();
            assert!((got - expected).abs() <= expected * 0.011, "q={q} got={got}");
        }
        assert_eq!(sketch.quantile(1.5), None);
        assert_eq!(DDSketch::new(0.01).unwrap().quantile(0.5), None);
    }

    #[test]
    fn test_negative_and_zero_values() {
        let sketch = sketch_of([-10.0, -1.0, 0.0, 0.0, 5.0]);
        assert!((sketch.quantile(0.0).unwrap() + 10.0).abs() < 0.2);
        assert!(sketch.quantile(0.5).unwrap().abs() < f64::EPSILON);
        assert!((sketch.quantile(1.0).unwrap() - 5.0).abs() < 0.1);
    }

    #[test]
    fn test_encode_decode_preserves_state() {
        let sketch = sketch_of([-3.5, 0.0, 1.0, 2.0, 2.0, 1e9]);
        let mut buf = BytesMut::new();
        sketch.encode(&mut buf);
        let mut reader = &buf[..];
        let decoded = DDSketch::decode(&mut reader).unwrap();
        assert!(reader.is_empty());
        assert_eq!(decoded, sketch);

        let empty = DDSketch::new(0.05).unwrap();
        let mut buf = BytesMut::new();
        empty.encode(&mut buf);
        assert_eq!(DDSketch::decode(&mut &buf[..]).unwrap(), empty);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(DDSketch::decode(&mut &[0x07u8][..]), Err(Error::Protocol(_))));
        let mut buf = BytesMut::new();
        sketch_of([1.0]).encode(&mut buf);
        let truncated = &buf[..buf.len() - 3];
        assert!(matches!(DDSketch::decode(&mut &truncated[..]), Err(Error::UnexpectedEof)));
    }

    #[test]
    fn test_unbucketable_values_ignored() {
        let mut sketch = sketch_of([1.0, 2.0]);
        for v in [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NAN, f64::MAX] {
            sketch.add(v);
        }
        sketch.add_with_count(3.0, f64::NAN);
        assert!((sketch.count() - 2.0).abs() < f64::EPSILON);
        assert!((sketch.quantile(1.0).unwrap() - 2.0).abs() < 0.05);

        // Extremes that still bucket span the whole store without overflow
        sketch.add(f64::MAX / 2.0);
        sketch.add(-f64::MAX / 2.0);
        sketch.add(f64::MIN_POSITIVE * 4.0);
        assert!((sketch.count() - 5.0).abs() < f64::EPSILON);
        assert!(sketch.quantile(1.0).unwrap().is_finite());

        // A tiny accuracy pushes large values past the index range
        let mut fine = DDSketch::new(1e-12).unwrap();
        fine.add(1e300);
        fine.add(1.0);
        assert!((fine.count() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decode_rejects_index_overflow() {
        let mut buf = BytesMut::new();
        buf.put_u8(FLAG_INDEX_MAPPING_BASE_LOGARITHMIC);
        buf.put_f64_le(1.02);
        buf.put_f64_le(0.0);
        buf.put_u8(FLAG_POSITIVE_STORE);
        buf.put_u8(BIN_ENCODING_CONTIGUOUS_COUNTS);
        buf.put_var_uint(2);
        buf.put_var_int(i64::from(i32::MAX));
        buf.put_var_int(1);
        buf.put_f64_le(1.0);
        buf.put_f64_le(1.0);
        assert!(matches!(DDSketch::decode(&mut &buf[..]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_merge() {
        let mut a = sketch_of([1.0, 2.0]);
        let b = sketch_of([3.0, -4.0]);
        a.merge(&b).unwrap();
        assert!((a.count() - 4.0).abs() < f64::EPSILON);
        assert!(a.merge(&DDSketch::new(0.2).unwrap()).is_err());
    }
}
