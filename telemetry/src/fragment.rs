//! Fragments, the decoded form of one sensor datagram.
//!
//! Field units speak a small line protocol. Each datagram looks like:
//!
//! ```text
//! DEV1<sendVal 0=23.5;1=NaN;2=19.1>CHK
//! ```
//!
//! The text before the first `<` is the device id, the bracketed content holds `;`-separated
//! channel assignments behind a `sendVal` marker, and the token after the closing `>` is a
//! checksum that is recorded but never verified.
//!
//! A datagram whose bracketed content holds no usable assignments (`DEV1<sendVal >CHK`) ends the
//! device's current transmission. The protocol has no separate end marker, so a datagram whose
//! assignments are all unparseable is indistinguishable from a real terminator and is treated as
//! one.

use std::collections::BTreeMap;
use std::num::ParseFloatError;
use std::str::{self, Utf8Error};

const FRAME_START: char = '<';
const FRAME_END: char = '>';
const MARKER: &str = "sendVal";
const ASSIGNMENT_SEPARATOR: char = ';';
const ASSIGNMENT_OPERATOR: char = '=';
const NOT_A_NUMBER: &str = "NaN";

/// Channel values keyed by the channel index as the device wrote it.
///
/// `None` is an explicit `NaN` reading from the device.
pub type Channels = BTreeMap<String, Option<f64>>;

/// One decoded datagram.
///
/// # Examples
///
/// ```
/// use telemetry::Fragment;
/// let fragment = Fragment::new(b"DEV1<sendVal 0=23.5;1=NaN;2=19.1>CHK").unwrap();
/// assert_eq!("DEV1", fragment.device_id());
/// assert_eq!(Some(&Some(23.5)), fragment.channels().get("0"));
/// assert_eq!(Some(&None), fragment.channels().get("1"));
/// assert!(!fragment.is_terminator());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Fragment {
    device_id: String,
    channels: Channels,
    raw_text: String,
    checksum: String,
    is_terminator: bool,
}

/// An error returned when a datagram cannot be decoded.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum Error {
    /// The payload is not valid UTF-8.
    #[fail(display = "payload is not valid utf-8: {}", _0)]
    Encoding(Utf8Error),

    /// A structural delimiter is missing from the frame.
    #[fail(display = "malformed frame, missing '{}'", _0)]
    MalformedFrame(char),
}

impl Fragment {
    /// Decodes a fragment from the raw bytes of a datagram.
    ///
    /// Channel values that cannot be parsed are logged and left out of the fragment, and
    /// assignments without an `=` are skipped. Neither fails the whole datagram. Channel indices
    /// are kept exactly as written, so `=2` assigns channel `""` and `2 =1` assigns channel `"2 "`.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetry::Fragment;
    /// let fragment = Fragment::new(b"DEV1<sendVal >CHK").unwrap();
    /// assert!(fragment.is_terminator());
    /// assert!(fragment.channels().is_empty());
    /// assert!(Fragment::new(b"no delimiters here").is_err());
    /// ```
    pub fn new(bytes: &[u8]) -> Result<Fragment, Error> {
        let text = str::from_utf8(bytes).map_err(Error::Encoding)?;
        let start = text
            .find(FRAME_START)
            .ok_or(Error::MalformedFrame(FRAME_START))?;
        let device_id = &text[..start];
        let remainder = &text[start + FRAME_START.len_utf8()..];
        let end = remainder
            .find(FRAME_END)
            .ok_or(Error::MalformedFrame(FRAME_END))?;
        let content = &remainder[..end];
        let checksum = remainder
            .rfind(FRAME_END)
            .map(|n| &remainder[n + FRAME_END.len_utf8()..])
            .unwrap_or("");
        let body = if content.contains(MARKER) {
            content.replace(MARKER, "")
        } else {
            content.to_string()
        };
        let channels = parse_channels(device_id, body.trim());
        Ok(Fragment {
            device_id: device_id.to_string(),
            is_terminator: channels.is_empty(),
            channels: channels,
            raw_text: text.to_string(),
            checksum: checksum.to_string(),
        })
    }

    /// Returns the device id declared by the sender.
    ///
    /// Nothing checks this against the datagram's source address.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns this fragment's channel values.
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Returns the decoded text of the whole datagram.
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// Returns the token after the closing `>`.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetry::Fragment;
    /// let fragment = Fragment::new(b"DEV1<sendVal 0=1>A7F3").unwrap();
    /// assert_eq!("A7F3", fragment.checksum());
    /// ```
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Returns true if this fragment ends its device's transmission.
    ///
    /// True exactly when the fragment has no channel values.
    pub fn is_terminator(&self) -> bool {
        self.is_terminator
    }
}

fn parse_channels(device_id: &str, body: &str) -> Channels {
    let mut channels = Channels::new();
    for token in body.split(ASSIGNMENT_SEPARATOR) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let mut parts = token.splitn(2, ASSIGNMENT_OPERATOR);
        let index = parts.next().unwrap_or("");
        let value = match parts.next() {
            Some(value) => value,
            None => continue,
        };
        match parse_value(value) {
            Ok(value) => {
                channels.insert(index.to_string(), value);
            }
            Err(err) => warn!(
                "could not parse value for channel {} from {}: {:?} ({})",
                index, device_id, value, err
            ),
        }
    }
    channels
}

fn parse_value(s: &str) -> Result<Option<f64>, ParseFloatError> {
    let s = s.trim();
    if s == NOT_A_NUMBER {
        Ok(None)
    } else {
        s.parse().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_fragment() {
        let fragment = Fragment::new(b"DEV1<sendVal 0=23.5;1=NaN;2=19.1>CHK").unwrap();
        assert_eq!("DEV1", fragment.device_id());
        assert_eq!("CHK", fragment.checksum());
        assert_eq!("DEV1<sendVal 0=23.5;1=NaN;2=19.1>CHK", fragment.raw_text());
        assert!(!fragment.is_terminator());
        let mut expected = Channels::new();
        expected.insert("0".to_string(), Some(23.5));
        expected.insert("1".to_string(), None);
        expected.insert("2".to_string(), Some(19.1));
        assert_eq!(&expected, fragment.channels());
    }

    #[test]
    fn terminator() {
        let payloads: [&[u8]; 4] = [
            b"DEV1<sendVal >CHK",
            b"DEV1<sendVal>CHK",
            b"DEV1<>",
            b"DEV1<  sendVal  ;; >CHK",
        ];
        for bytes in payloads.iter() {
            let fragment = Fragment::new(bytes).unwrap();
            assert_eq!("DEV1", fragment.device_id());
            assert!(fragment.is_terminator());
            assert!(fragment.channels().is_empty());
        }
    }

    #[test]
    fn malformed() {
        assert_eq!(
            Error::MalformedFrame('<'),
            Fragment::new(b"DEV1 sendVal 0=1").unwrap_err()
        );
        assert_eq!(
            Error::MalformedFrame('>'),
            Fragment::new(b"DEV1<sendVal 0=1").unwrap_err()
        );
        assert_eq!(Error::MalformedFrame('<'), Fragment::new(b"").unwrap_err());
    }

    #[test]
    fn encoding() {
        match Fragment::new(b"DEV1<sendVal 0=\xff>CHK") {
            Err(Error::Encoding(_)) => {}
            other => panic!("expected an encoding error, got {:?}", other),
        }
    }

    #[test]
    fn deterministic() {
        let bytes = b"DEV9<sendVal 4=1e3;x=oops;5=-0.25>";
        assert_eq!(Fragment::new(bytes), Fragment::new(bytes));
        let bytes = b"DEV9 no frame";
        assert_eq!(Fragment::new(bytes), Fragment::new(bytes));
    }

    #[test]
    fn bad_value_drops_only_that_channel() {
        let fragment = Fragment::new(b"DEV1<sendVal 0=1.5;1=bogus;2=nan?;3=NaN>CHK").unwrap();
        assert_eq!(2, fragment.channels().len());
        assert_eq!(Some(&Some(1.5)), fragment.channels().get("0"));
        assert_eq!(None, fragment.channels().get("1"));
        assert_eq!(None, fragment.channels().get("2"));
        assert_eq!(Some(&None), fragment.channels().get("3"));
    }

    #[test]
    fn nan_is_case_sensitive_and_trimmed() {
        let fragment = Fragment::new(b"DEV1<sendVal 0= NaN ;1=NAN>").unwrap();
        assert_eq!(Some(&None), fragment.channels().get("0"));
        assert_ne!(Some(&None), fragment.channels().get("1"));
    }

    #[test]
    fn assignments_without_operator_are_skipped() {
        let fragment = Fragment::new(b"DEV1<sendVal 0=1;garbage;1=2;>CHK").unwrap();
        assert_eq!(2, fragment.channels().len());
        assert_eq!(Some(&Some(1.0)), fragment.channels().get("0"));
        assert_eq!(Some(&Some(2.0)), fragment.channels().get("1"));
    }

    #[test]
    fn empty_index_is_a_channel() {
        let fragment = Fragment::new(b"DEV1<sendVal =2>CHK").unwrap();
        assert!(!fragment.is_terminator());
        assert_eq!(Some(&Some(2.0)), fragment.channels().get(""));
    }

    #[test]
    fn only_first_operator_splits() {
        let fragment = Fragment::new(b"DEV1<sendVal 0=1=2;1=3>").unwrap();
        assert_eq!(None, fragment.channels().get("0"));
        assert_eq!(Some(&Some(3.0)), fragment.channels().get("1"));
    }

    #[test]
    fn unparseable_assignments_terminate() {
        let fragment = Fragment::new(b"DEV1<sendVal 0=bogus>CHK").unwrap();
        assert!(fragment.is_terminator());
    }

    #[test]
    fn no_marker() {
        let fragment = Fragment::new(b"DEV1<0=1;1=2>").unwrap();
        assert_eq!(2, fragment.channels().len());
        assert!(!fragment.is_terminator());
        assert_eq!("", fragment.checksum());
    }

    #[test]
    fn checksum_follows_last_delimiter() {
        let fragment = Fragment::new(b"DEV1<sendVal 0=1>junk>CS").unwrap();
        assert_eq!("CS", fragment.checksum());
        assert_eq!(Some(&Some(1.0)), fragment.channels().get("0"));
    }

    #[test]
    fn channel_indices_are_kept_as_written() {
        let fragment = Fragment::new(b"DEV1<sendVal 10=1; 2 =2;a=3>").unwrap();
        let keys: Vec<&str> = fragment.channels().keys().map(|k| k.as_str()).collect();
        assert_eq!(vec!["10", "2 ", "a"], keys);
    }

    #[test]
    fn padded_indices_do_not_collide() {
        let fragment = Fragment::new(b"DEV1<sendVal 0 =1;0=2>").unwrap();
        assert_eq!(Some(&Some(1.0)), fragment.channels().get("0 "));
        assert_eq!(Some(&Some(2.0)), fragment.channels().get("0"));
    }
}
