// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for error messages: a wrapper around `pretty-hex`
//! that caps the output so a malformed megabyte-sized message doesn't
//! flood the error text.

use pretty_hex::PrettyHex;

pub struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let omitted = self.inner.len().checked_sub(self.max_bytes);
        let print = if omitted.is_some() {
            &self.inner[..self.max_bytes]
        } else {
            self.inner
        };
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        writeln!(
            f,
            "{:#?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(o) = omitted {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", o)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn truncates() {
        let out = format!("{:?}", LimitedHex::new(&[0u8; 80], 64));
        assert!(out.contains("Length: 80"));
        assert!(out.contains("16 (0x10) bytes not shown"));
    }

    #[test]
    fn printable_column() {
        let out = format!("{:?}", LimitedHex::new(b"RTSP/1.0\xff", 64));
        assert!(out.contains("RTSP/1.0."));
    }
}
