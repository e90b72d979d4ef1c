//! Mergeable duration histogram
//!
//! Wraps an auto-resizing HdrHistogram with two significant digits. Merging
//! is structural (bucket counts are added), so merging the histograms of
//! disjoint intervals equals recording every underlying sample once.

use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use hdrhistogram::Histogram;
use strata_store::EncodedHistogram;

use crate::error::{Result, RollupError};

const SIGNIFICANT_DIGITS: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct DurationHistogram {
    inner: Option<Histogram<u64>>,
}

impl DurationHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner_mut(&mut self) -> Result<&mut Histogram<u64>> {
        if self.inner.is_none() {
            let h = Histogram::<u64>::new(SIGNIFICANT_DIGITS)
                .map_err(|e| RollupError::Histogram(format!("{e:?}")))?;
            self.inner = Some(h);
        }
        self.inner
            .as_mut()
            .ok_or_else(|| RollupError::Histogram("histogram not initialised".to_string()))
    }

    pub fn record(&mut self, nanos: u64) -> Result<()> {
        self.inner_mut()?
            .record(nanos)
            .map_err(|e| RollupError::Histogram(format!("{e:?}")))
    }

    pub fn merge(&mut self, other: &DurationHistogram) -> Result<()> {
        let Some(source) = &other.inner else {
            return Ok(());
        };
        match &mut self.inner {
            Some(h) => h
                .add(source)
                .map_err(|e| RollupError::Histogram(format!("{e:?}"))),
            None => {
                let mut h = source.clone();
                h.auto(true);
                self.inner = Some(h);
                Ok(())
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.as_ref().map_or(0, |h| h.len())
    }

    /// Value at `percentile` (0..=100); 0 when empty.
    pub fn value_at_percentile(&self, percentile: f64) -> u64 {
        self.inner
            .as_ref()
            .filter(|h| h.len() > 0)
            .map_or(0, |h| h.value_at_percentile(percentile))
    }

    pub fn encode(&self) -> Result<EncodedHistogram> {
        let Some(h) = &self.inner else {
            return Ok(EncodedHistogram::default());
        };
        let mut buf = Vec::new();
        V2Serializer::new()
            .serialize(h, &mut buf)
            .map_err(|e| RollupError::Histogram(format!("{e:?}")))?;
        Ok(EncodedHistogram(buf))
    }

    pub fn decode(encoded: &EncodedHistogram) -> Result<Self> {
        if encoded.is_empty() {
            return Ok(Self::default());
        }
        let mut reader: &[u8] = &encoded.0;
        let mut h: Histogram<u64> = Deserializer::new()
            .deserialize(&mut reader)
            .map_err(|e| RollupError::corrupt("duration histogram", format!("{e:?}")))?;
        h.auto(true);
        Ok(Self { inner: Some(h) })
    }
}
