//! SMTP reply parsing for the outbound client.

use super::error::{ClientError, Result};

/// One complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Scan an EHLO reply for a capability keyword.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(capability))
        })
    }

    /// Try to take one complete reply off the front of `buffer`. Returns
    /// the reply and the number of bytes consumed, or `None` when more
    /// input is needed.
    ///
    /// # Errors
    /// Returns a parse error on malformed reply lines or a code change
    /// inside a multi-line reply.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let text = std::str::from_utf8(buffer)
            .map_err(|e| ClientError::Parse(format!("reply is not UTF-8: {e}")))?;

        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut code = None;

        loop {
            let rest = &text[consumed..];
            let Some(end) = rest.find("\r\n") else {
                return Ok(None);
            };
            let line = &rest[..end];
            consumed += end + 2;

            // the code is read off the raw bytes: a reply starting with a
            // multi-byte character must parse-error, not split the string
            // mid-character
            let code_bytes = line.as_bytes().get(..3);
            let line_code = match code_bytes {
                Some(digits) if digits.iter().all(u8::is_ascii_digit) => {
                    u16::from(digits[0] - b'0') * 100
                        + u16::from(digits[1] - b'0') * 10
                        + u16::from(digits[2] - b'0')
                }
                _ => {
                    return Err(ClientError::Parse(format!(
                        "invalid reply code in {line:?}"
                    )));
                }
            };

            match code {
                None => code = Some(line_code),
                Some(expected) if expected != line_code => {
                    return Err(ClientError::Parse(format!(
                        "reply code changed mid-reply: {expected} then {line_code}"
                    )));
                }
                Some(_) => {}
            }

            let (last, message) = match line.as_bytes().get(3) {
                None => (true, ""),
                Some(b' ') => (true, &line[4..]),
                Some(b'-') => (false, &line[4..]),
                Some(other) => {
                    return Err(ClientError::Parse(format!(
                        "invalid reply separator {:?} in {line:?}",
                        *other as char
                    )));
                }
            };

            lines.push(message.to_string());
            if last {
                return Ok(Some((
                    Self {
                        code: code.unwrap_or(0),
                        lines,
                    },
                    consumed,
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply() {
        let (response, consumed) = Response::parse(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["OK"]);
        assert_eq!(consumed, 8);
        assert!(response.is_success());
    }

    #[test]
    fn multi_line_reply() {
        let data = b"250-mail.example.com\r\n250-SIZE 26214400\r\n250-STARTTLS\r\n250 HELP\r\n";
        let (response, consumed) = Response::parse(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines.len(), 4);
        assert_eq!(consumed, data.len());
        assert!(response.has_capability("STARTTLS"));
        assert!(response.has_capability("starttls"));
        assert!(response.has_capability("SIZE"));
        assert!(!response.has_capability("CHUNKING"));
    }

    #[test]
    fn incomplete_reply_waits_for_more() {
        assert!(Response::parse(b"250-mail.example.com\r\n250-SIZ").unwrap().is_none());
        assert!(Response::parse(b"25").unwrap().is_none());
    }

    #[test]
    fn code_change_is_an_error() {
        assert!(Response::parse(b"250-a\r\n421 b\r\n").is_err());
    }

    #[test]
    fn non_ascii_reply_lines_error_instead_of_panicking() {
        // a banner starting with a multi-byte character
        assert!(Response::parse("héllo there\r\n".as_bytes()).is_err());
        // fullwidth digit inside the code position
        assert!(Response::parse("2５0 OK\r\n".as_bytes()).is_err());
        // multi-byte character in the separator position
        assert!(Response::parse("250é OK\r\n".as_bytes()).is_err());
    }

    #[test]
    fn bare_code_reply() {
        let (response, _) = Response::parse(b"354\r\n").unwrap().unwrap();
        assert_eq!(response.code, 354);
        assert!(response.is_intermediate());
    }
}
