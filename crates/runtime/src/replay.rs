//! Trade journal export in CSV form.

use std::io::{self, Write};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use core_sim::Trade;

use crate::logging::{RunLogEvent, RunLogEventKind, RunLogWriter};

pub const TRADE_JOURNAL_HEADER: &str =
    "id,symbol,direction,open_time,close_time,entry_price,exit_price,size,profit,commission,net_profit\n";

pub struct TradeJournalWriter<W: Write> {
    writer: W,
}

impl<W: Write> TradeJournalWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        self.writer.write_all(TRADE_JOURNAL_HEADER.as_bytes())
    }

    pub fn append_trades(&mut self, trades: &[Trade]) -> io::Result<()> {
        for trade in trades {
            let symbol = escape_csv_field(&trade.symbol);
            writeln!(
                self.writer,
                "{},{symbol},{},{},{},{},{},{},{},{},{}",
                trade.id,
                trade.direction.as_str(),
                format_timestamp(trade.open_timestamp),
                format_timestamp(trade.close_timestamp),
                trade.entry_price,
                trade.exit_price,
                trade.size,
                trade.profit,
                trade.commission,
                trade.net_profit(),
            )?;
        }
        Ok(())
    }

    /// Writes the full journal, flushes, and only then records the write.
    pub fn write_journal_and_log(
        &mut self,
        trades: &[Trade],
        timestamp: i64,
        run_log_writer: &mut dyn RunLogWriter,
    ) -> io::Result<()> {
        self.write_header()?;
        self.append_trades(trades)?;
        self.writer.flush()?;
        run_log_writer.write(RunLogEvent::new(
            timestamp,
            RunLogEventKind::JournalWritten,
            None,
            format!("{} trades", trades.len()),
        ));
        Ok(())
    }
}

pub fn trades_to_csv(trades: &[Trade]) -> io::Result<String> {
    let mut output = Vec::new();
    let mut writer = TradeJournalWriter::new(&mut output);
    writer.write_header()?;
    writer.append_trades(trades)?;
    String::from_utf8(output).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// RFC 3339 for representable instants, raw milliseconds otherwise.
fn format_timestamp(timestamp_ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_ms) * 1_000_000)
        .ok()
        .and_then(|instant| instant.format(&Rfc3339).ok())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn escape_csv_field(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|ch| matches!(ch, ',' | '"' | '\n' | '\r'));
    if !needs_quotes {
        return value.to_string();
    }

    let escaped = value.replace('"', "\"\"");
    format!("\"{escaped}\"")
}
