//! Data Channels
//!
//! A channel is the ordered sequence of value tuples flowing between
//! processes: each row of a process's input channel becomes one job, and
//! the rendered outputs of its jobs form the channel consumed by dependent
//! processes.

use serde::{Deserialize, Serialize};

/// A single input value: a scalar string or a list of strings.
///
/// `var` and `file` inputs expect [`ChannelValue::Str`]; `files` inputs
/// expect [`ChannelValue::List`]. The job rejects mismatched shapes during
/// input preparation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Str(String),
    List(Vec<String>),
}

impl ChannelValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ChannelValue::Str(s) => Some(s),
            ChannelValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ChannelValue::Str(_) => None,
            ChannelValue::List(items) => Some(items),
        }
    }
}

impl From<&str> for ChannelValue {
    fn from(s: &str) -> Self {
        ChannelValue::Str(s.to_string())
    }
}

impl From<String> for ChannelValue {
    fn from(s: String) -> Self {
        ChannelValue::Str(s)
    }
}

impl From<Vec<String>> for ChannelValue {
    fn from(items: Vec<String>) -> Self {
        ChannelValue::List(items)
    }
}

/// An ordered sequence of value tuples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    rows: Vec<Vec<ChannelValue>>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a single-column channel from scalar values.
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ChannelValue>,
    {
        Self {
            rows: values.into_iter().map(|v| vec![v.into()]).collect(),
        }
    }

    /// Builds a channel from explicit rows.
    pub fn from_rows(rows: Vec<Vec<ChannelValue>>) -> Self {
        Self { rows }
    }

    /// Number of rows; defines the job count of the consuming process.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of columns, taken from the first row.
    pub fn width(&self) -> usize {
        self.rows.first().map_or(0, |row| row.len())
    }

    pub fn rows(&self) -> &[Vec<ChannelValue>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&[ChannelValue]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    /// Appends one row.
    pub fn push_row(&mut self, row: Vec<ChannelValue>) {
        self.rows.push(row);
    }

    /// Joins channels column-wise: row i of the result is the concatenation
    /// of row i from every source. All non-empty sources must agree on the
    /// row count; the error text names the offending sizes.
    pub fn cbind(channels: &[&Channel]) -> Result<Channel, String> {
        let sources: Vec<&&Channel> = channels.iter().filter(|c| !c.is_empty()).collect();
        let Some(first) = sources.first() else {
            return Ok(Channel::new());
        };

        let nrows = first.len();
        for chan in &sources {
            if chan.len() != nrows {
                return Err(format!(
                    "cannot join channels with different lengths: {} vs {}",
                    nrows,
                    chan.len()
                ));
            }
        }

        let mut rows = Vec::with_capacity(nrows);
        for i in 0..nrows {
            let mut row = Vec::new();
            for chan in &sources {
                row.extend(chan.rows[i].iter().cloned());
            }
            rows.push(row);
        }
        Ok(Channel { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_values() {
        let chan = Channel::from_values(["a", "b", "c"]);
        assert_eq!(chan.len(), 3);
        assert_eq!(chan.width(), 1);
        assert_eq!(chan.row(0).unwrap()[0], ChannelValue::Str("a".to_string()));
    }

    #[test]
    fn test_from_rows_width() {
        let chan = Channel::from_rows(vec![
            vec!["a".into(), "x".into()],
            vec!["b".into(), "y".into()],
        ]);
        assert_eq!(chan.len(), 2);
        assert_eq!(chan.width(), 2);
    }

    #[test]
    fn test_list_value() {
        let value = ChannelValue::List(vec!["f1".to_string(), "f2".to_string()]);
        assert!(value.as_str().is_none());
        assert_eq!(value.as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_cbind_matching() {
        let left = Channel::from_values(["a", "b"]);
        let right = Channel::from_values(["x", "y"]);
        let joined = Channel::cbind(&[&left, &right]).unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.width(), 2);
        assert_eq!(
            joined.row(1).unwrap(),
            &[
                ChannelValue::Str("b".to_string()),
                ChannelValue::Str("y".to_string())
            ]
        );
    }

    #[test]
    fn test_cbind_size_mismatch() {
        let left = Channel::from_values(["a", "b"]);
        let right = Channel::from_values(["x"]);
        let err = Channel::cbind(&[&left, &right]).unwrap_err();
        assert!(err.contains("different lengths"));
    }

    #[test]
    fn test_cbind_skips_empty() {
        let left = Channel::from_values(["a", "b"]);
        let empty = Channel::new();
        let joined = Channel::cbind(&[&left, &empty]).unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.width(), 1);
    }

    #[test]
    fn test_cbind_all_empty() {
        let joined = Channel::cbind(&[&Channel::new()]).unwrap();
        assert!(joined.is_empty());
    }
}
