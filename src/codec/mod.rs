mod bundle;
mod names;

pub use bundle::{BundleCodec, CheckFailure};
pub use names::{FileStringIndex, MemoryStringIndex, StringIndex};

use std::fmt;

use tracing::warn;

/// Per-category policy for soft decode/check diagnostics, parsed from a
/// string of single-character flags:
///
/// - `m` - a mixin whose name indices no longer resolve is logged and
///   skipped instead of failing the decode.
/// - `b` - a binary value whose blob id no longer resolves is logged and
///   kept instead of being reported as a consistency error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorHandling {
    ignore_missing_names: bool,
    ignore_missing_blobs: bool,
}

impl ErrorHandling {
    pub fn parse(flags: &str) -> Self {
        let mut handling = Self::default();
        for flag in flags.chars() {
            match flag {
                'm' => handling.ignore_missing_names = true,
                'b' => handling.ignore_missing_blobs = true,
                flag if flag.is_whitespace() => {}
                flag => warn!("ignoring unknown error handling flag '{flag}'"),
            }
        }
        handling
    }

    pub fn ignore_missing_names(&self) -> bool {
        self.ignore_missing_names
    }

    pub fn ignore_missing_blobs(&self) -> bool {
        self.ignore_missing_blobs
    }
}

impl fmt::Display for ErrorHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ignore_missing_names {
            f.write_str("m")?;
        }
        if self.ignore_missing_blobs {
            f.write_str("b")?;
        }
        Ok(())
    }
}
