use std::io::{self, Write};

use serde::Serialize;

use crate::sync::SyncReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &SyncReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
