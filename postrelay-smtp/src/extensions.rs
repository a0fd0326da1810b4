use core::fmt::{self, Display};

/// Extensions advertised in the EHLO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    Size(usize),
    AuthPlain,
    StartTls,
    SmtpUtf8,
    EightBitMime,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Size(limit) => write!(fmt, "SIZE {limit}"),
            Self::AuthPlain => fmt.write_str("AUTH PLAIN"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::SmtpUtf8 => fmt.write_str("SMTPUTF8"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
        }
    }
}

/// The capability set for one EHLO reply. STARTTLS is only offered while
/// the transport is still cleartext and material is configured.
pub fn advertised(max_msg_size: usize, offer_starttls: bool) -> Vec<Extension> {
    let mut extensions = vec![Extension::Size(max_msg_size), Extension::AuthPlain];
    if offer_starttls {
        extensions.push(Extension::StartTls);
    }
    extensions.push(Extension::SmtpUtf8);
    extensions.push(Extension::EightBitMime);
    extensions
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starttls_is_conditional() {
        let with = advertised(1024, true);
        assert!(with.contains(&Extension::StartTls));

        let without = advertised(1024, false);
        assert!(!without.contains(&Extension::StartTls));
        assert!(without.contains(&Extension::AuthPlain));
        assert!(without.contains(&Extension::EightBitMime));
    }

    #[test]
    fn size_renders_with_limit() {
        assert_eq!(Extension::Size(26214400).to_string(), "SIZE 26214400");
    }
}
