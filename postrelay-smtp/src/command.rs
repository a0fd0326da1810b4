use core::fmt::{self, Display, Formatter};
use std::collections::HashMap;

use mailparse::MailAddr;

/// ESMTP parameters on the MAIL FROM command (RFC 5321 section 3.3).
/// Keys are normalized to uppercase; `SIZE` gets extra validation because
/// the server enforces it against the configured message cap.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: HashMap<String, Option<String>>,
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `KEY=VALUE` and bare-flag tokens.
    ///
    /// # Errors
    /// Returns a human-readable reason when a parameter repeats or SIZE is
    /// not a positive integer.
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::new();

        for token in params_str.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key.to_ascii_uppercase(), Some(value.to_string())),
                None => (token.to_ascii_uppercase(), None),
            };

            if params.params.contains_key(&key) {
                return Err(format!("duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" {
                match value.as_deref().and_then(|v| v.parse::<u64>().ok()) {
                    Some(0) | None => {
                        return Err(format!(
                            "invalid SIZE value: {}",
                            value.as_deref().unwrap_or("")
                        ))
                    }
                    Some(_) => {}
                }
            }

            params.params.insert(key, value);
        }

        Ok(params)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params
            .insert(key.into().to_ascii_uppercase(), Some(value.into()));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_uppercase())?.as_deref()
    }

    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.params {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match v {
                None => f.write_str(k)?,
                Some(val) => write!(f, "{k}={val}")?,
            }
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Hash, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Debug)]
pub enum Command {
    Helo(HeloVariant),
    /// `AUTH <mechanism> [initial-response]`. The payload stays base64 here;
    /// the session decodes it when it runs the SASL exchange.
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// `None` is the null reverse-path (`MAIL FROM:<>`) from RFC 5321.
    MailFrom(Option<String>, MailParameters),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Invalid(String),
}

/// Extract the bare `local@domain` form from an address argument.
fn parse_address(raw: &str) -> Result<String, String> {
    let parsed = mailparse::addrparse(raw).map_err(|e| e.to_string())?;
    match parsed.first() {
        Some(MailAddr::Single(single)) => Ok(single.addr.clone()),
        Some(MailAddr::Group(_)) => Err("group addresses are not accepted".to_string()),
        None => Err("missing address".to_string()),
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v @ (HeloVariant::Ehlo(id) | HeloVariant::Helo(id))) => {
                write!(fmt, "{v} {id}")
            }
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::MailFrom(sender, params) => {
                let addr = sender.as_deref().unwrap_or("");
                if params.is_empty() {
                    write!(fmt, "MAIL FROM:<{addr}>")
                } else {
                    write!(fmt, "MAIL FROM:<{addr}> {params}")
                }
            }
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

/// Case-insensitive keyword match on the raw bytes. Byte offsets into a
/// client-supplied line are not char boundaries, so the comparison never
/// slices the string; once an ASCII keyword matches, indexing past it is
/// safe.
fn has_keyword(line: &str, keyword: &str) -> bool {
    line.as_bytes()
        .get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword.as_bytes()))
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if has_keyword(trimmed, "MAIL FROM:") {
            let rest = trimmed[10..].trim();
            if rest.is_empty() {
                return Err(Self::Invalid(command.to_owned()));
            }

            let (addr, params_str) = match rest.split_once(char::is_whitespace) {
                Some((addr, params)) => (addr, Some(params)),
                None => (rest, None),
            };

            let params = match params_str {
                Some(params) => MailParameters::from_params_str(params).map_err(Self::Invalid)?,
                None => MailParameters::new(),
            };

            // The null reverse-path is legal and means "no bounces".
            if addr == "<>" {
                return Ok(Self::MailFrom(None, params));
            }

            parse_address(addr)
                .map(|sender| Self::MailFrom(Some(sender), params))
                .map_err(Self::Invalid)
        } else if has_keyword(trimmed, "RCPT TO:") {
            let rest = trimmed[8..].trim();
            if rest.is_empty() {
                return Err(Self::Invalid(command.to_owned()));
            }
            parse_address(rest).map(Self::RcptTo).map_err(Self::Invalid)
        } else if has_keyword(trimmed, "AUTH")
            && (trimmed.len() == 4 || trimmed.as_bytes()[4] == b' ')
        {
            let mut parts = trimmed.split_whitespace();
            parts.next();
            match parts.next() {
                None => Err(Self::Invalid("AUTH requires a mechanism".to_string())),
                Some(mechanism) => Ok(Self::Auth {
                    mechanism: mechanism.to_ascii_uppercase(),
                    initial: parts.next().map(str::to_string),
                }),
            }
        } else if has_keyword(trimmed, "EHLO") || has_keyword(trimmed, "HELO") {
            match trimmed.split_once(' ') {
                None => Err(Self::Invalid(format!("expected hostname in {trimmed}"))),
                Some((cmd, host)) if cmd.eq_ignore_ascii_case("HELO") => {
                    Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                }
                Some((cmd, host)) if cmd.eq_ignore_ascii_case("EHLO") => {
                    Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string())))
                }
                Some(_) => Err(Self::Invalid(command.to_owned())),
            }
        } else if trimmed.eq_ignore_ascii_case("DATA") {
            Ok(Self::Data)
        } else if trimmed.eq_ignore_ascii_case("RSET") {
            Ok(Self::Rset)
        } else if trimmed.eq_ignore_ascii_case("NOOP") {
            Ok(Self::Noop)
        } else if trimmed.eq_ignore_ascii_case("QUIT") {
            Ok(Self::Quit)
        } else if trimmed.eq_ignore_ascii_case("STARTTLS") {
            Ok(Self::StartTls)
        } else {
            Err(Self::Invalid(command.to_owned()))
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}
