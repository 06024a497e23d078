//! Batch runner
//!
//! Reads newline-delimited expressions from a file and sends them to the
//! server one at a time, reporting one line of output per expression.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::calculator;
use crate::network::{Client, ClientError, ClientResult, Outcome, Transport};

/// Read every line of `path`; each one is sent as-is, blank lines included
pub fn read_expressions(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.lines().map(str::to_string).collect())
}

/// What happened to one expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineResult {
    Answer(String),
    Invalid,
    TimedOut,
    Broken,
}

/// Result for one input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineReport {
    /// Zero-based line number
    pub line: usize,
    pub expression: String,
    pub result: LineResult,
}

impl fmt::Display for LineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            LineResult::Answer(value) => match calculator::tokenize(&self.expression).as_slice() {
                [op, a, b, ..] => write!(f, "The result of {} {} {} is {}.", a, op, b, value),
                _ => write!(f, "The result of {} is {}.", self.expression.trim(), value),
            },
            LineResult::Invalid => write!(f, "Request invalid: there was an error."),
            LineResult::TimedOut => write!(f, "Timeout exceeded for this operation."),
            LineResult::Broken => write!(f, "Connection broken."),
        }
    }
}

/// Totals over a batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub answered: usize,
    pub invalid: usize,
    pub timed_out: usize,
    pub broken: usize,
}

impl BatchSummary {
    fn record(&mut self, result: &LineResult) {
        match result {
            LineResult::Answer(_) => self.answered += 1,
            LineResult::Invalid => self.invalid += 1,
            LineResult::TimedOut => self.timed_out += 1,
            LineResult::Broken => self.broken += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.answered + self.invalid + self.timed_out + self.broken
    }
}

/// Send each expression in order, pausing `delay` between them
///
/// Timeouts and invalid replies are reported and the batch moves on. A
/// broken UDP exchange is reported the same way, but a broken TCP
/// connection ends the batch with [`ClientError::TransportBroken`].
pub async fn run_batch<T, F>(
    client: &mut Client<T>,
    expressions: &[String],
    delay: Duration,
    mut report: F,
) -> ClientResult<BatchSummary>
where
    T: Transport,
    F: FnMut(&LineReport),
{
    let mut summary = BatchSummary::default();

    for (line, expression) in expressions.iter().enumerate() {
        if line > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        tracing::debug!("Reading line #{}: {:?}", line, expression);

        let result = match client.evaluate(expression).await {
            Ok(exchange) => match exchange.outcome {
                Outcome::Success(value) => LineResult::Answer(value),
                Outcome::Invalid(rejection) => {
                    tracing::debug!("Reply rejected: {:?}", rejection);
                    LineResult::Invalid
                }
            },
            Err(ClientError::TimedOut { .. }) => LineResult::TimedOut,
            Err(ClientError::TransportBroken) if !client.is_connection_oriented() => LineResult::Broken,
            Err(e) => return Err(e),
        };

        summary.record(&result);
        report(&LineReport {
            line,
            expression: expression.clone(),
            result,
        });
    }

    Ok(summary)
}
