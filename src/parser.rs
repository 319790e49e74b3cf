//! Wire-level tokenizing for meta-protocol response headers, as a manual
//! byte-slice scan: a blocking socket can always guarantee a full header
//! line is buffered before parsing starts, so a streaming/`Incomplete`
//! parser combinator buys nothing here.

use crate::flags::{Response, ResponseFlags};
use crate::key::ServerVersion;

/// Splits a header line (without the trailing CRLF) into space-separated
/// tokens.
fn tokens(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&b| b == b' ')
        .filter(|t| !t.is_empty())
        .collect()
}

fn parse_u32(buf: &[u8]) -> Option<u32> {
    btoi::btoi(buf).ok()
}

fn parse_u64(buf: &[u8]) -> Option<u64> {
    btoi::btoi(buf).ok()
}

fn parse_i64(buf: &[u8]) -> Option<i64> {
    btoi::btoi(buf).ok()
}

/// Decodes the flag tokens following the status code / size into a
/// [`ResponseFlags`].
fn decode_flags(tokens: &[&[u8]]) -> Result<ResponseFlags, String> {
    let mut flags = ResponseFlags::default();
    for tok in tokens {
        if tok.is_empty() {
            continue;
        }
        let (code, rest) = (tok[0], &tok[1..]);
        match code {
            b'c' => flags.cas_token = Some(parse_u64(rest).ok_or("bad c flag")?),
            b'f' => flags.client_flag = Some(parse_u32(rest).ok_or("bad f flag")?),
            b't' => flags.ttl = Some(parse_i64(rest).ok_or("bad t flag")?),
            b'l' => flags.last_access = Some(parse_u32(rest).ok_or("bad l flag")?),
            b'h' => flags.fetched = rest == b"1" || rest.is_empty(),
            b'W' => flags.win = true,
            b'X' => flags.stale = true,
            b'Z' => {} // already-won recache marker on losers; no state to track
            b'O' => flags.opaque = Some(String::from_utf8_lossy(rest).into_owned()),
            // b/q/S/k and other request-only echoes are ignored on responses.
            _ => {}
        }
    }
    Ok(flags)
}

/// Result of parsing one response header: how many bytes (including the
/// trailing CRLF) the header occupied, and the parsed response. For `Value`
/// headers, the caller still owes a `get_value` call to consume the payload.
pub struct ParsedHeader {
    pub header_len: usize,
    pub response: Response,
}

/// Parses exactly one response header out of `line` (the bytes up to but not
/// including the CRLF) plus the 2-byte CRLF itself, given the success code
/// this server's negotiated [`ServerVersion`] uses for stores/deletes/touches.
pub fn parse_header(line: &[u8], version: ServerVersion) -> Result<ParsedHeader, String> {
    let header_len = line.len() + 2;
    let toks = tokens(line);
    let Some(&code) = toks.first() else {
        return Err("empty response header".to_string());
    };

    let success_code: &[u8] = match version {
        ServerVersion::Stable => b"HD",
        ServerVersion::Aws166 => b"OK",
    };

    let response = if code == b"VA" {
        let size = toks
            .get(1)
            .and_then(|s| parse_u32(s))
            .ok_or_else(|| "VA response missing size".to_string())?;
        let flags = decode_flags(&toks[2..])?;
        Response::Value {
            size,
            data: None,
            flags,
        }
    } else if code == success_code {
        Response::Success(decode_flags(&toks[1..])?)
    } else if code == b"NS" {
        Response::NotStored
    } else if code == b"EX" {
        Response::Conflict(decode_flags(&toks[1..])?)
    } else if code == b"EN" || code == b"NF" {
        Response::Miss
    } else {
        return Err(format!(
            "unexpected response code {:?}",
            String::from_utf8_lossy(code)
        ));
    };

    Ok(ParsedHeader {
        header_len,
        response,
    })
}

/// Whether a header line's status code is the no-op barrier's `MN`.
pub fn is_noop(line: &[u8]) -> bool {
    tokens(line).first() == Some(&&b"MN"[..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stable_success() {
        let parsed = parse_header(b"HD", ServerVersion::Stable).unwrap();
        assert!(matches!(parsed.response, Response::Success(_)));
        assert_eq!(parsed.header_len, 2 + 2);
    }

    #[test]
    fn parses_aws_success() {
        let parsed = parse_header(b"OK", ServerVersion::Aws166).unwrap();
        assert!(matches!(parsed.response, Response::Success(_)));
    }

    #[test]
    fn parses_value_header_with_flags() {
        let parsed = parse_header(b"VA 11 c123 f0", ServerVersion::Stable).unwrap();
        match parsed.response {
            Response::Value { size, flags, .. } => {
                assert_eq!(size, 11);
                assert_eq!(flags.cas_token, Some(123));
                assert_eq!(flags.client_flag, Some(0));
            }
            _ => panic!("expected Value"),
        }
    }

    #[test]
    fn parses_miss_variants() {
        assert!(matches!(
            parse_header(b"EN", ServerVersion::Stable).unwrap().response,
            Response::Miss
        ));
        assert!(matches!(
            parse_header(b"NF", ServerVersion::Stable).unwrap().response,
            Response::Miss
        ));
    }

    #[test]
    fn parses_win_and_stale_flags() {
        let parsed = parse_header(b"VA 0 W c123 X", ServerVersion::Stable).unwrap();
        match parsed.response {
            Response::Value { flags, .. } => {
                assert!(flags.win);
                assert!(flags.stale);
                assert_eq!(flags.cas_token, Some(123));
            }
            _ => panic!("expected Value"),
        }
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(parse_header(b"ZZ", ServerVersion::Stable).is_err());
    }

    #[test]
    fn is_noop_detects_mn() {
        assert!(is_noop(b"MN"));
        assert!(!is_noop(b"HD"));
    }
}
