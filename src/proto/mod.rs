//! Wire-level building blocks: command kinds, frame codec, unique ids.

mod command;
mod packet;
mod unique;

pub use command::{Command, Priority};
pub use packet::{decode, Decoded, Magic, Packet, HEADER_LEN};
pub use unique::{UniqueId, UNIQUE_MAX_LEN};

use crate::error::Error;

/// Prefix `name` with the client's namespace, when one is set.
///
/// Applied to function and reducer names at packet-build time; unique ids
/// and server-issued job handles are never prefixed.
pub(crate) fn namespaced(namespace: Option<&[u8]>, name: &[u8]) -> Vec<u8> {
    match namespace {
        Some(ns) if !ns.is_empty() => {
            let mut out = Vec::with_capacity(ns.len() + name.len());
            out.extend_from_slice(ns);
            out.extend_from_slice(name);
            out
        }
        _ => name.to_vec(),
    }
}

/// Calendar schedule for [`Command::SubmitJobSched`], cron-field style.
///
/// Each field is transmitted as decimal ASCII; an unset field is sent as an
/// empty argument, which the server reads as "any".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Minute of the hour, 0–59.
    pub minute: Option<u8>,
    /// Hour of the day, 0–23.
    pub hour: Option<u8>,
    /// Day of the month, 1–31.
    pub day: Option<u8>,
    /// Month, 1–12.
    pub month: Option<u8>,
    /// Day of the week, 0–6 with 0 = Sunday.
    pub weekday: Option<u8>,
}

impl Schedule {
    pub(crate) fn wire_args(&self) -> Result<[Vec<u8>; 5], Error> {
        fn field(value: Option<u8>, max: u8, what: &str) -> Result<Vec<u8>, Error> {
            match value {
                None => Ok(Vec::new()),
                Some(v) if v <= max => Ok(v.to_string().into_bytes()),
                Some(v) => Err(Error::invalid(format!("{} {} out of range", what, v))),
            }
        }
        let day = match self.day {
            Some(0) => return Err(Error::invalid("day 0 out of range")),
            d => field(d, 31, "day")?,
        };
        let month = match self.month {
            Some(0) => return Err(Error::invalid("month 0 out of range")),
            m => field(m, 12, "month")?,
        };
        Ok([
            field(self.minute, 59, "minute")?,
            field(self.hour, 23, "hour")?,
            day,
            month,
            field(self.weekday, 6, "weekday")?,
        ])
    }
}
