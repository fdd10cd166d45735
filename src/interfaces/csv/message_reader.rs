use crate::domain::message::{Body, Message};
use crate::error::{Result, RouteError};
use std::collections::BTreeMap;
use std::io::Read;

/// One row of the input: a message destined for a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub channel: String,
    pub body: Body,
    pub headers: BTreeMap<String, String>,
}

impl Submission {
    pub fn into_message(self) -> (String, Message) {
        (self.channel, Message::with_headers(self.body, self.headers))
    }
}

/// Reads submissions from a CSV source.
///
/// The header row must contain `channel` and `body`; any other column becomes
/// a message header of the same name. Empty cells are skipped, so rows may
/// carry different header sets. Whitespace is trimmed and short rows are
/// accepted.
pub struct MessageReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> MessageReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily parses rows, yielding one result per record.
    pub fn submissions(mut self) -> Result<impl Iterator<Item = Result<Submission>>> {
        let columns: Vec<String> = self.reader.headers()?.iter().map(str::to_string).collect();
        let channel_column = column(&columns, "channel")?;
        let body_column = column(&columns, "body")?;

        Ok(self.reader.into_records().map(move |record| {
            let record = record?;
            let channel = record
                .get(channel_column)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| {
                    RouteError::ValidationError(format!(
                        "row {} has no channel",
                        record.position().map_or(0, |p| p.line())
                    ))
                })?
                .to_string();
            let body = Body::parse_text(record.get(body_column).unwrap_or_default());
            let headers = columns
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != channel_column && *i != body_column)
                .filter_map(|(i, name)| {
                    record
                        .get(i)
                        .filter(|v| !v.is_empty())
                        .map(|v| (name.clone(), v.to_string()))
                })
                .collect();
            Ok(Submission {
                channel,
                body,
                headers,
            })
        }))
    }
}

fn column(columns: &[String], name: &str) -> Result<usize> {
    columns.iter().position(|c| c == name).ok_or_else(|| {
        RouteError::ValidationError(format!("input is missing the '{}' column", name))
    })
}
