//! Serial-number arithmetic (RFC 1982) for RTP sequence numbers and timestamps
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


/// True if `seq` comes after `prev` within half the 16-bit space
pub fn is_newer_sequence_number(seq: u16, prev: u16) -> bool {
    let diff = seq.wrapping_sub(prev);
    if diff == 0x8000 {
        // Exactly half the space apart: break the tie on raw value
        return seq > prev;
    }
    diff != 0 && diff < 0x8000
}

/// True if `ts` comes after `prev` within half the 32-bit space
pub fn is_newer_timestamp(ts: u32, prev: u32) -> bool {
    let diff = ts.wrapping_sub(prev);
    if diff == 0x8000_0000 {
        return ts > prev;
    }
    diff != 0 && diff < 0x8000_0000
}

pub fn latest_sequence_number(a: u16, b: u16) -> u16 {
    if is_newer_sequence_number(a, b) {
        a
    } else {
        b
    }
}

pub fn latest_timestamp(a: u32, b: u32) -> u32 {
    if is_newer_timestamp(a, b) {
        a
    } else {
        b
    }
}

/// Signed forward distance from `prev` to `seq`
pub fn sequence_number_diff(seq: u16, prev: u16) -> i32 {
    i32::from(seq.wrapping_sub(prev) as i16)
}

/// Signed forward distance from `prev` to `ts`
pub fn timestamp_diff(ts: u32, prev: u32) -> i64 {
    i64::from(ts.wrapping_sub(prev) as i32)
}

/// Maps wrapping 16-bit sequence numbers onto a monotonic 64-bit axis
#[derive(Debug, Default, Clone)]
pub struct SequenceNumberUnwrapper {
    last: Option<i64>,
}

impl SequenceNumberUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unwrap without updating the reference point
    pub fn peek(&self, seq: u16) -> i64 {
        match self.last {
            None => i64::from(seq),
            Some(last) => last + i64::from(sequence_number_diff(seq, last as u16)),
        }
    }

    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let unwrapped = self.peek(seq);
        self.last = Some(unwrapped);
        unwrapped
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Maps wrapping 32-bit RTP timestamps onto a monotonic 64-bit axis
#[derive(Debug, Default, Clone)]
pub struct TimestampUnwrapper {
    last: Option<i64>,
}

impl TimestampUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self, ts: u32) -> i64 {
        match self.last {
            None => i64::from(ts),
            Some(last) => last + timestamp_diff(ts, last as u32),
        }
    }

    pub fn unwrap(&mut self, ts: u32) -> i64 {
        let unwrapped = self.peek(ts);
        self.last = Some(unwrapped);
        unwrapped
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_sequence_number_across_wrap() {
        assert!(is_newer_sequence_number(1, 0));
        assert!(is_newer_sequence_number(0, 65535));
        assert!(is_newer_sequence_number(5, 65530));
        assert!(!is_newer_sequence_number(65530, 5));
        assert!(!is_newer_sequence_number(7, 7));
    }

    #[test]
    fn test_newer_sequence_number_half_range() {
        assert!(is_newer_sequence_number(0x8000, 0));
        assert!(!is_newer_sequence_number(0, 0x8000));
    }

    #[test]
    fn test_newer_timestamp_across_wrap() {
        assert!(is_newer_timestamp(100, u32::MAX - 100));
        assert!(!is_newer_timestamp(u32::MAX - 100, 100));
        assert_eq!(latest_timestamp(10, u32::MAX), 10);
    }

    #[test]
    fn test_sequence_number_diff_signed() {
        assert_eq!(sequence_number_diff(2, 65534), 4);
        assert_eq!(sequence_number_diff(65534, 2), -4);
        assert_eq!(latest_sequence_number(65535, 1), 1);
    }

    #[test]
    fn test_unwrapper_is_monotonic_over_wrap() {
        let mut unwrapper = SequenceNumberUnwrapper::new();
        assert_eq!(unwrapper.unwrap(65534), 65534);
        assert_eq!(unwrapper.unwrap(65535), 65535);
        assert_eq!(unwrapper.unwrap(0), 65536);
        assert_eq!(unwrapper.unwrap(3), 65539);
        // Reordered packet from before the wrap
        assert_eq!(unwrapper.unwrap(65533), 65533);
    }

    #[test]
    fn test_timestamp_unwrapper_over_wrap() {
        let mut unwrapper = TimestampUnwrapper::new();
        unwrapper.unwrap(u32::MAX - 1499);
        assert_eq!(unwrapper.unwrap(1500), i64::from(u32::MAX) + 1501);
    }
}
