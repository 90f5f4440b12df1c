//! Credit-paced outbound body queue.

use std::collections::VecDeque;

use crate::{CreditLedger, FlowError};

/// One queued body, partially sent.
#[derive(Debug)]
struct Segment {
    data: Vec<u8>,
    /// Bytes already sent.
    pos: usize,
}

/// Outbound bodies waiting for credits.
///
/// Each pushed body ends with a chunk whose `more` flag is false; every
/// earlier chunk of it has `more` set.
#[derive(Debug, Default)]
pub(crate) struct Pump {
    queue: VecDeque<Segment>,
}

impl Pump {
    /// Queues a body for sending.
    pub(crate) fn push(&mut self, data: Vec<u8>) {
        self.queue.push_back(Segment { data, pos: 0 });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Takes every chunk the current credits allow, debiting as it goes.
    ///
    /// Each chunk is `(bytes, more)`. Stops at the first body that cannot
    /// make progress; an empty body is always released since it costs
    /// nothing.
    pub(crate) fn drain(
        &mut self,
        credits: &mut CreditLedger,
    ) -> Result<Vec<(Vec<u8>, bool)>, FlowError> {
        let mut chunks = Vec::new();
        while let Some(seg) = self.queue.front_mut() {
            let remaining = seg.data.len() - seg.pos;
            let budget = credits.reserve(remaining as u64);
            if budget == 0 && remaining > 0 {
                break;
            }
            // budget <= remaining, which is a usize
            let take = usize::try_from(budget).unwrap_or(remaining);
            let chunk = seg.data[seg.pos..seg.pos + take].to_vec();
            credits.debit(budget)?;
            seg.pos += take;
            let more = seg.pos < seg.data.len();
            if !more {
                self.queue.pop_front();
            }
            chunks.push((chunk, more));
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_by_credit() {
        let mut credits = CreditLedger::new(0, false);
        let mut pump = Pump::default();
        pump.push(b"abcdefghij".to_vec());

        assert!(pump.drain(&mut credits).unwrap().is_empty());

        credits.grant(4);
        assert_eq!(pump.drain(&mut credits).unwrap(), vec![(b"abcd".to_vec(), true)]);
        assert_eq!(credits.remote(), 0);

        credits.grant(100);
        assert_eq!(pump.drain(&mut credits).unwrap(), vec![(b"efghij".to_vec(), false)]);
        assert_eq!(credits.remote(), 94);
        assert!(pump.is_empty());
    }

    #[test]
    fn releases_empty_body_without_credit() {
        let mut credits = CreditLedger::new(0, false);
        let mut pump = Pump::default();
        pump.push(Vec::new());
        assert_eq!(pump.drain(&mut credits).unwrap(), vec![(Vec::new(), false)]);
    }

    #[test]
    fn bodies_stay_separate() {
        let mut credits = CreditLedger::new(0, false);
        credits.grant(5);
        let mut pump = Pump::default();
        pump.push(b"abc".to_vec());
        pump.push(b"def".to_vec());

        let chunks = pump.drain(&mut credits).unwrap();
        assert_eq!(
            chunks,
            vec![(b"abc".to_vec(), false), (b"de".to_vec(), true)]
        );
        credits.grant(10);
        assert_eq!(pump.drain(&mut credits).unwrap(), vec![(b"f".to_vec(), false)]);
        assert!(pump.is_empty());
    }
}
